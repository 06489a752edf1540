use crate::auth::CredentialResolver;
use crate::dto::{RequestClock, RequestDto, ResponseDto, StageDirection};
use crate::error::Result;

use super::provider::ProviderOutcome;
use super::Pipeline;

/// What a full pipeline traversal yields (spec §4.5 step 3): a fully
/// buffered response, or the raw upstream stream for the caller's SSE
/// engine to re-emit in the client's dialect.
pub enum RuntimeOutcome {
    Buffered(ResponseDto),
    Streaming { response: reqwest::Response, pipeline_id: String },
}

/// Executes one request through the four modules in the order of spec
/// §4.5: LLMSwitch → Workflow → Compatibility → Provider, then — for a
/// buffered outcome — back in reverse. Any module error short-circuits the
/// remaining stages; a streaming outcome skips reverse traversal here and
/// is wrapped downstream by the SSE engine instead (§4.5 step 4, §9 "SSE
/// readers as async iterators").
pub async fn run(
    pipeline: &Pipeline,
    mut req: RequestDto,
    credential: &dyn CredentialResolver,
) -> Result<RuntimeOutcome> {
    let clock = RequestClock::start();
    let request_id = req.route.request_id.clone();

    req = pipeline.llm_switch.process_incoming(req).await?;
    req.record_stage(pipeline.llm_switch.module_type(), StageDirection::Incoming);

    req = pipeline.workflow.process_incoming(req).await?;
    req.record_stage(pipeline.workflow.module_type(), StageDirection::Incoming);

    req = pipeline.compatibility.process_incoming(req).await?;
    req.record_stage(pipeline.compatibility.module_type(), StageDirection::Incoming);

    let stages = req.debug.stages.clone();
    let bearer = credential.bearer_token().await?;
    let outcome = pipeline.provider.execute(&req, &bearer, credential).await?;

    match outcome {
        ProviderOutcome::Streaming { response, pipeline_id } => {
            Ok(RuntimeOutcome::Streaming { response, pipeline_id })
        }
        ProviderOutcome::Buffered(mut resp) => {
            resp.metadata.pipeline_id = pipeline.id.clone();
            resp.metadata.request_id = request_id;
            resp.metadata.stages = stages;

            resp = pipeline.compatibility.process_outgoing(resp).await?;
            resp = pipeline.workflow.process_outgoing(resp).await?;
            resp = pipeline.llm_switch.process_outgoing(resp).await?;

            resp.metadata.processing_time_ms = clock.elapsed_ms();
            Ok(RuntimeOutcome::Buffered(resp))
        }
    }
}
