use std::time::Duration;

use once_cell::sync::Lazy;

/// One shared client for all outbound provider calls: reqwest pools
/// connections per host internally, so a single client gives every pipeline
/// the "one connection pool per upstream host" behavior of spec §5 without
/// each `HttpProviderModule` instance paying for its own pool.
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_max_idle_per_host(32)
        .timeout(Duration::from_secs(300))
        .build()
        .expect("failed to build shared HTTP client")
});

pub fn shared_client() -> reqwest::Client {
    CLIENT.clone()
}
