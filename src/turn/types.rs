//! Turn request, settings and result types.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::doom_loop::DEFAULT_THRESHOLD;
use super::events::AgentEventSink;
use super::retry::RetryPolicy;
use crate::id::{self, IdPrefix};
use crate::model::ModelMessage;
use crate::session::AssistantMessage;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TurnOutcome {
    /// The model finished without requesting more tools.
    Stop,
    /// A permission or question was rejected.
    Blocked,
    /// The context window is full; the caller should compact and continue.
    Compact,
    Error,
}

/// Limits applied to every turn a processor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSettings {
    /// Maximum model round-trips per turn.
    pub max_steps: usize,
    pub doom_loop_threshold: usize,
    /// Context size (tokens) above which the turn ends in [`TurnOutcome::Compact`].
    pub context_limit: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_steps: 20,
            doom_loop_threshold: DEFAULT_THRESHOLD,
            context_limit: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Request payload to run one turn.
#[derive(Clone)]
pub struct TurnRequest {
    pub session_id: String,
    /// Id of the assistant message the turn writes into.
    pub message_id: String,
    pub parent_id: Option<String>,
    pub messages: Vec<ModelMessage>,
    pub event_sink: Option<AgentEventSink>,
}

impl std::fmt::Debug for TurnRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRequest")
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("parent_id", &self.parent_id)
            .field("messages", &self.messages.len())
            .finish_non_exhaustive()
    }
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, messages: Vec<ModelMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: id::ascending(IdPrefix::Message),
            parent_id: None,
            messages,
            event_sink: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_event_sink(mut self, sink: AgentEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

/// Final state of a turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    /// The assistant message as last persisted.
    pub message: AssistantMessage,
    /// Model round-trips started, retries excluded.
    pub steps: usize,
}

impl TurnResult {
    pub fn is_blocked(&self) -> bool {
        self.outcome == TurnOutcome::Blocked
    }
}
