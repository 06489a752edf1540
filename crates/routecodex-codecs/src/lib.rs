//! Protocol conversion codecs for RouteCodex: Anthropic, Responses and Chat
//! dialects, the shared tool-normalization stage, and the SSE/JSON bridge.
//! Pure transforms only — no I/O, no shared mutable state (spec §4.3, §5).

pub mod anthropic_chat;
pub mod module;
pub mod responses_chat;
pub mod sse;
pub mod tooling;

pub use module::default_factories;
