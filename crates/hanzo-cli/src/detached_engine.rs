//! Engine stand-in used when no agent engine is attached to the gateway.

use std::sync::Arc;

use async_trait::async_trait;

use hanzo_events::{
    AgentEngine, AgentEngineError, AgentEvent, AgentEventBus, AgentRunCompletion, AgentRunRequest,
    RunLifecyclePhase,
};

/// Resolves every run with no payloads, so chat callers receive the
/// configured no-response fallback until a real engine is wired in.
pub(crate) struct DetachedAgentEngine {
    bus: Arc<AgentEventBus>,
}

impl DetachedAgentEngine {
    pub(crate) fn new(bus: Arc<AgentEventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl AgentEngine for DetachedAgentEngine {
    async fn run_agent(
        &self,
        request: AgentRunRequest,
    ) -> Result<AgentRunCompletion, AgentEngineError> {
        self.bus.publish(AgentEvent::lifecycle(
            request.run_id.clone(),
            RunLifecyclePhase::Start,
        ));
        self.bus.publish(AgentEvent::lifecycle(
            request.run_id,
            RunLifecyclePhase::End,
        ));
        Ok(AgentRunCompletion::default())
    }
}
