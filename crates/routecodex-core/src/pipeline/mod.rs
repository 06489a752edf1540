mod assembler;
pub mod provider;
mod runtime;

use std::sync::Arc;

use async_trait::async_trait;

use crate::dto::{RequestDto, ResponseDto};
use crate::error::Result;

pub use assembler::{assemble, ModuleFactories, ModuleFactory};
pub use provider::{HttpProviderModule, ProviderModule, ProviderOutcome};
pub use runtime::{run, RuntimeOutcome};

/// Lifecycle readiness of a module, checked by the assembler after
/// `initialize()` (spec §4.4 invariant: "all four modules report Ready").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

/// The single shape implemented by all four pipeline modules (spec §4.5,
/// §9 "duck-typed module interface" redesign note): explicit trait instead
/// of shape-based duck typing, registered by name through a factory table
/// rather than runtime subclassing.
///
/// Modules are re-entrant: instances are shared read-only across all
/// concurrently in-flight requests, so implementations must not hold
/// per-request mutable state outside the DTO itself.
#[async_trait]
pub trait PipelineModule: Send + Sync {
    fn module_type(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn process_incoming(&self, req: RequestDto) -> Result<RequestDto>;

    async fn process_outgoing(&self, resp: ResponseDto) -> Result<ResponseDto>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn readiness(&self) -> Readiness {
        Readiness::Ready
    }
}

/// One assembled pipeline: four module instances pre-wired at assembly time
/// (spec §3 PipelineConfig, §4.4). Shared read-only by every request that
/// selects it.
pub struct Pipeline {
    pub id: String,
    pub target: crate::config::RouteTarget,
    pub llm_switch: Arc<dyn PipelineModule>,
    pub workflow: Arc<dyn PipelineModule>,
    pub compatibility: Arc<dyn PipelineModule>,
    pub provider: Arc<dyn ProviderModule>,
}

impl Pipeline {
    pub async fn all_ready(&self) -> bool {
        self.llm_switch.readiness() == Readiness::Ready
            && self.workflow.readiness() == Readiness::Ready
            && self.compatibility.readiness() == Readiness::Ready
            && self.provider.readiness() == Readiness::Ready
    }
}
