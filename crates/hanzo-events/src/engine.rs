//! Contract between the gateway and the external agent execution engine.
//!
//! The engine owns prompt execution; while a run is in flight it publishes
//! lifecycle and assistant-delta events to the run-event bus, then resolves
//! with the final payload texts and token usage for the run.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentEngineError {
    #[error("agent engine failure: {0}")]
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single engine invocation keyed by a gateway-minted run id.
pub struct AgentRunRequest {
    pub run_id: String,
    pub agent_id: String,
    pub session_key: String,
    pub prompt: String,
    pub extra_system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Token accounting reported by the engine for a completed run.
pub struct AgentRunUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
}

impl AgentRunUsage {
    /// True when any token counter is non-zero; gates usage reporting.
    pub fn has_token_activity(&self) -> bool {
        self.input_tokens > 0
            || self.output_tokens > 0
            || self.cache_read_tokens > 0
            || self.cache_write_tokens > 0
    }
}

#[derive(Debug, Clone, Default)]
/// Final state of a run once the engine resolves.
pub struct AgentRunCompletion {
    pub payload_texts: Vec<String>,
    pub usage: AgentRunUsage,
    pub duration_ms: Option<u64>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

#[async_trait]
/// Trait contract for agent-engine implementations driven by the gateway.
pub trait AgentEngine: Send + Sync {
    async fn run_agent(
        &self,
        request: AgentRunRequest,
    ) -> Result<AgentRunCompletion, AgentEngineError>;
}
