//! Shared test harness: a replayed model, file-backed store and a few tools.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use kiln::bus::EventBus;
use kiln::model::{FinishReason, ReplayModel, ReplayStep, StreamEvent};
use kiln::permission::{PermissionEngine, Ruleset};
use kiln::session::{Part, SessionStore, StorageSessionStore, Usage};
use kiln::storage::Storage;
use kiln::error::Result;
use kiln::tools::{
    ApplyPatchTool, BatchTool, FunctionTool, ToolArguments, ToolContext, ToolOutput, ToolParameters, ToolRegistry, Truncator,
};
use kiln::turn::{AgentEvent, AgentEventSink, RetryPolicy, TurnProcessor, TurnSettings};

pub const SESSION: &str = "ses_test";

pub struct Harness {
    pub dir: TempDir,
    pub bus: EventBus,
    pub model: Arc<ReplayModel>,
    pub store: Arc<StorageSessionStore>,
    pub permissions: Arc<PermissionEngine>,
    pub registry: Arc<ToolRegistry>,
}

impl Harness {
    pub fn new(rounds: Vec<Vec<ReplayStep>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = Arc::new(StorageSessionStore::new(Storage::new(dir.path()), bus.clone()));
        let permissions = Arc::new(PermissionEngine::new(bus.clone()));
        let registry = Arc::new(registry(dir.path()));
        Self {
            dir,
            bus,
            model: Arc::new(ReplayModel::new(rounds)),
            store,
            permissions,
            registry,
        }
    }

    pub fn processor(&self, ruleset: Ruleset) -> TurnProcessor {
        TurnProcessor::new(
            self.model.clone(),
            self.registry.clone(),
            self.permissions.clone(),
            self.store.clone(),
        )
        .with_ruleset(ruleset)
        .with_settings(fast_settings())
    }

    /// Directory `apply_patch` edits.
    pub fn workspace(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub async fn parts(&self, message_id: &str) -> Vec<Part> {
        self.store.parts(message_id).await.unwrap()
    }
}

/// Defaults with millisecond-scale retry backoff.
pub fn fast_settings() -> TurnSettings {
    TurnSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_jitter: Duration::ZERO,
        },
        ..TurnSettings::default()
    }
}

async fn echo(args: ToolArguments, _ctx: ToolContext) -> Result<ToolOutput> {
    Ok(ToolOutput::new("echo", args.get_str("text")?))
}

async fn read(args: ToolArguments, _ctx: ToolContext) -> Result<ToolOutput> {
    let path = args.get_str("path")?;
    Ok(ToolOutput::new(path, format!("contents of {path}")))
}

async fn bash(args: ToolArguments, _ctx: ToolContext) -> Result<ToolOutput> {
    Ok(ToolOutput::new("bash", format!("ran {}", args.get_str("command")?)))
}

fn registry(dir: &Path) -> ToolRegistry {
    let string_param = |name: &str, description: &str| ToolParameters::object().string(name, description, true).build();
    ToolRegistry::new(Truncator::new(dir))
        .with_tool(Arc::new(FunctionTool::new("echo", "Echo text back", string_param("text", "Text to echo"), echo)))
        .with_tool(Arc::new(FunctionTool::new("read", "Read a file", string_param("path", "File path"), read)))
        .with_tool(Arc::new(FunctionTool::new("bash", "Run a shell command", string_param("command", "Command line"), bash)))
        .with_tool(Arc::new(BatchTool::default()))
        .with_tool(Arc::new(ApplyPatchTool::new(dir.join("work"))))
}

/// Collects agent events in emission order.
pub fn recorder() -> (AgentEventSink, Arc<Mutex<Vec<AgentEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: AgentEventSink = Arc::new(move |event: AgentEvent| sink_events.lock().unwrap().push(event));
    (sink, events)
}

pub fn text(id: &str, chunks: &[&str]) -> Vec<ReplayStep> {
    let mut steps = vec![StreamEvent::TextStart { id: id.into() }.into()];
    steps.extend(chunks.iter().map(|chunk| {
        ReplayStep::from(StreamEvent::TextDelta {
            id: id.into(),
            text: chunk.to_string(),
        })
    }));
    steps.push(StreamEvent::TextEnd { id: id.into() }.into());
    steps
}

pub fn tool_call(call_id: &str, tool: &str, input: Value) -> ReplayStep {
    StreamEvent::ToolCall {
        call_id: call_id.into(),
        tool_name: tool.into(),
        input,
        provider_executed: false,
    }
    .into()
}

pub fn finish(reason: FinishReason) -> ReplayStep {
    finish_with(reason, Usage::default())
}

pub fn finish_with(reason: FinishReason, usage: Usage) -> ReplayStep {
    StreamEvent::FinishStep {
        usage,
        cost: 0.0,
        finish_reason: Some(reason),
    }
    .into()
}

/// A round that only answers with text.
pub fn answer(chunks: &[&str]) -> Vec<ReplayStep> {
    let mut steps = text("answer", chunks);
    steps.push(finish(FinishReason::Stop));
    steps
}

/// A round that calls one tool.
pub fn call_round(call_id: &str, tool: &str, input: Value) -> Vec<ReplayStep> {
    vec![tool_call(call_id, tool, input), finish(FinishReason::ToolCalls)]
}

pub fn read_round(call_id: &str, path: &str) -> Vec<ReplayStep> {
    call_round(call_id, "read", json!({ "path": path }))
}
