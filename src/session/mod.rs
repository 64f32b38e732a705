//! Assistant message and part model, plus the session store the turn engine
//! persists through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bus::{events, EventBus};
use crate::error::{ErrorCategory, KilnError, Result};
use crate::storage::Storage;

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

impl TimeSpan {
    pub fn starting_now() -> Self {
        Self {
            start: now_millis(),
            end: None,
        }
    }
}

/// File or image returned alongside a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Lifecycle of a tool call: `pending -> running -> completed | error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        input: Value,
        /// Raw argument text streamed so far.
        #[serde(default)]
        raw: String,
    },
    Running {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        time: TimeSpan,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        metadata: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        time: TimeSpan,
    },
    Error {
        input: Value,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        time: TimeSpan,
    },
}

impl ToolState {
    pub fn pending() -> Self {
        Self::Pending {
            input: json!({}),
            raw: String::new(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    pub fn input(&self) -> &Value {
        match self {
            Self::Pending { input, .. }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input,
        }
    }

    /// `pending -> running` with the finalized input.
    pub fn start(&mut self, input: Value) -> Result<()> {
        match self {
            Self::Pending { .. } => {
                *self = Self::Running {
                    input,
                    title: None,
                    metadata: None,
                    time: TimeSpan::starting_now(),
                };
                Ok(())
            }
            other => Err(invalid_transition(other, "running")),
        }
    }

    /// `running -> completed`.
    pub fn complete(
        &mut self,
        output: String,
        title: String,
        metadata: Value,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        match self {
            Self::Running { input, time, .. } => {
                *self = Self::Completed {
                    input: std::mem::take(input),
                    output,
                    title,
                    metadata,
                    attachments,
                    time: TimeSpan {
                        start: time.start,
                        end: Some(now_millis()),
                    },
                };
                Ok(())
            }
            other => Err(invalid_transition(other, "completed")),
        }
    }

    /// `pending | running -> error`.
    pub fn fail(&mut self, error: impl Into<String>, metadata: Option<Value>) -> Result<()> {
        let now = now_millis();
        match self {
            Self::Pending { input, .. } => {
                *self = Self::Error {
                    input: std::mem::take(input),
                    error: error.into(),
                    metadata,
                    time: TimeSpan {
                        start: now,
                        end: Some(now),
                    },
                };
                Ok(())
            }
            Self::Running { input, time, .. } => {
                *self = Self::Error {
                    input: std::mem::take(input),
                    error: error.into(),
                    metadata,
                    time: TimeSpan {
                        start: time.start,
                        end: Some(now),
                    },
                };
                Ok(())
            }
            other => Err(invalid_transition(other, "error")),
        }
    }
}

fn invalid_transition(state: &ToolState, target: &str) -> KilnError {
    KilnError::InvalidState(format!(
        "tool part cannot move from {} to {target}",
        state.status()
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartKind {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<TimeSpan>,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        time: TimeSpan,
    },
    Tool {
        call_id: String,
        tool: String,
        state: ToolState,
    },
}

/// One increment of assistant output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    pub fn tool_state(&self) -> Option<&ToolState> {
        match &self.kind {
            PartKind::Tool { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn tool_state_mut(&mut self) -> Option<&mut ToolState> {
        match &mut self.kind {
            PartKind::Tool { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Tool { tool, .. } => Some(tool),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Text { text, .. } | PartKind::Reasoning { text, .. } => Some(text),
            PartKind::Tool { .. } => None,
        }
    }
}

/// Token accounting for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    /// Tokens occupying the context window.
    pub fn context_tokens(&self) -> u64 {
        self.input + self.output + self.cache_read
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    pub kind: ErrorCategory,
    pub message: String,
}

impl From<&KilnError> for MessageError {
    fn from(err: &KilnError) -> Self {
        Self {
            kind: err.category(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub cost: f64,
}

impl AssistantMessage {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            parent_id: None,
            time: MessageTime {
                created: now_millis(),
                completed: None,
            },
            finish: None,
            error: None,
            usage: Usage::default(),
            cost: 0.0,
        }
    }
}

/// Session activity published on `session.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry {
        attempt: u32,
        message: String,
        /// Unix millis of the next attempt.
        next: i64,
    },
}

pub fn publish_status(bus: &EventBus, session_id: &str, status: &SessionStatus) {
    let published = serde_json::to_value(status)
        .map_err(KilnError::from)
        .and_then(|status| {
            bus.publish(
                events::SESSION_STATUS,
                json!({ "session_id": session_id, "status": status }),
            )
        });
    if let Err(err) = published {
        tracing::warn!(session_id, error = %err, "failed to publish session status");
    }
}

/// Upserts for parts and messages; implementations notify observers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist `part`; `delta` carries the text appended since the last update.
    async fn update_part(&self, part: &Part, delta: Option<&str>) -> Result<()>;

    async fn update_message(&self, message: &AssistantMessage) -> Result<()>;

    /// Parts of a message ordered by id.
    async fn parts(&self, message_id: &str) -> Result<Vec<Part>>;

    async fn message(&self, session_id: &str, message_id: &str) -> Result<AssistantMessage>;
}

/// [`SessionStore`] over [`Storage`], publishing update events on the bus.
#[derive(Debug, Clone)]
pub struct StorageSessionStore {
    storage: Storage,
    bus: EventBus,
}

impl StorageSessionStore {
    pub fn new(storage: Storage, bus: EventBus) -> Self {
        Self { storage, bus }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

#[async_trait]
impl SessionStore for StorageSessionStore {
    async fn update_part(&self, part: &Part, delta: Option<&str>) -> Result<()> {
        self.storage
            .write(&["part", &part.message_id, &part.id], part)
            .await?;
        let mut properties = json!({ "part": part });
        if let Some(delta) = delta {
            properties["delta"] = json!(delta);
        }
        self.bus.publish(events::MESSAGE_PART_UPDATED, properties)
    }

    async fn update_message(&self, message: &AssistantMessage) -> Result<()> {
        self.storage
            .write(&["message", &message.session_id, &message.id], message)
            .await?;
        self.bus
            .publish(events::MESSAGE_UPDATED, json!({ "info": message }))
    }

    async fn parts(&self, message_id: &str) -> Result<Vec<Part>> {
        let keys = self.storage.list(&["part", message_id]).await?;
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            parts.push(self.storage.read::<Part>(&key).await?);
        }
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(parts)
    }

    async fn message(&self, session_id: &str, message_id: &str) -> Result<AssistantMessage> {
        self.storage.read(&["message", session_id, message_id]).await
    }
}
