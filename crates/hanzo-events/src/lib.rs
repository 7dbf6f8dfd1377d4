//! Agent run-event vocabulary, the in-process run-event bus, and the
//! agent-engine contract consumed by the gateway.
//!
//! The bus fans events out by run id: subscribers see every event whose run
//! id matches, events for run ids with no live subscriber are dropped, and
//! terminal lifecycle events are the signal for subscribers to detach.

pub mod bus;
pub mod engine;

pub use bus::{AgentEventBus, AgentEventSubscription};
pub use engine::{
    AgentEngine, AgentEngineError, AgentRunCompletion, AgentRunRequest, AgentRunUsage,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Lifecycle phases emitted by the agent engine for a run.
pub enum RunLifecyclePhase {
    Start,
    End,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
/// Event body variants carried on the run-event bus.
pub enum AgentEventBody {
    Lifecycle {
        phase: RunLifecyclePhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "assistant")]
    AssistantDelta {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single event correlated to a run id.
pub struct AgentEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub body: AgentEventBody,
}

impl AgentEvent {
    pub fn lifecycle(run_id: impl Into<String>, phase: RunLifecyclePhase) -> Self {
        Self {
            run_id: run_id.into(),
            body: AgentEventBody::Lifecycle {
                phase,
                message: None,
            },
        }
    }

    pub fn lifecycle_error(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            body: AgentEventBody::Lifecycle {
                phase: RunLifecyclePhase::Error,
                message: Some(message.into()),
            },
        }
    }

    pub fn assistant_delta(run_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            body: AgentEventBody::AssistantDelta { text: text.into() },
        }
    }

    /// Terminal events end the subscriber's interest in the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.body,
            AgentEventBody::Lifecycle {
                phase: RunLifecyclePhase::End | RunLifecyclePhase::Error,
                ..
            }
        )
    }
}
