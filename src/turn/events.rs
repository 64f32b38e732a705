//! Events emitted while a turn runs, suitable for re-broadcasting to a UI.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::TurnOutcome;
use crate::session::{Part, Usage};

/// High-level turn events mirroring the processor's state transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // -- Lifecycle --
    TurnStart {
        session_id: String,
        message_id: String,
    },
    TurnEnd {
        message_id: String,
        outcome: TurnOutcome,
        finish: String,
    },

    // -- Round-trips --
    StepStart {
        step: usize,
    },
    StepFinish {
        step: usize,
        usage: Usage,
        cost: f64,
    },

    // -- Parts --
    PartUpdated {
        part: Part,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },

    // -- Tool execution --
    ToolExecutionStart {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolExecutionEnd {
        call_id: String,
        tool_name: String,
        status: String,
    },

    // -- Failures --
    Retry {
        attempt: u32,
        message: String,
        next: i64,
    },
    Error {
        error: String,
    },
}

/// Callback used for streaming turn events.
pub type AgentEventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct EventEmitter {
    sink: Option<AgentEventSink>,
}

impl EventEmitter {
    pub(crate) fn new(sink: Option<AgentEventSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }
}
