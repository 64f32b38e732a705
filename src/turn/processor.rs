//! Turn state machine: consume model streams, materialize parts, dispatch
//! tools and settle the assistant message.
//!
//! One call to [`TurnProcessor::process`] drives a single assistant message
//! across as many round-trips as the model needs. Each round-trip opens a
//! stream, applies its events in arrival order and either ends the turn or
//! feeds tool results into the next round-trip. Transient provider failures
//! restart the round-trip after a backoff; everything else settles the
//! message. Whatever happens, no tool part is left `pending` or `running`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::doom_loop;
use super::events::{AgentEvent, EventEmitter};
use super::retry;
use super::types::{TurnOutcome, TurnRequest, TurnResult, TurnSettings};
use crate::bus::events as bus_events;
use crate::error::{KilnError, Result};
use crate::id::{self, IdPrefix};
use crate::model::{ContentPart, ModelMessage, ModelRequest, ModelStream, Role, StreamEvent, ToolCallContent};
use crate::permission::{self, PermissionEngine, Ruleset};
use crate::session::{
    now_millis, publish_status, AssistantMessage, MessageError, Part, PartKind, SessionStatus, SessionStore,
    TimeSpan, ToolState,
};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

pub const INTERRUPTED: &str = "execution interrupted";

/// Runs turns against one model, tool registry and policy.
pub struct TurnProcessor {
    model: Arc<dyn ModelStream>,
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionEngine>,
    store: Arc<dyn SessionStore>,
    ruleset: Arc<Ruleset>,
    settings: TurnSettings,
}

impl std::fmt::Debug for TurnProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnProcessor")
            .field("model", &self.model.model_id())
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TurnProcessor {
    pub fn new(
        model: Arc<dyn ModelStream>,
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionEngine>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            model,
            registry,
            permissions,
            store,
            ruleset: Arc::new(Vec::new()),
            settings: TurnSettings::default(),
        }
    }

    pub fn with_ruleset(mut self, ruleset: Ruleset) -> Self {
        self.ruleset = Arc::new(ruleset);
        self
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    /// Run one turn to completion. Never fails: errors are recorded on the
    /// returned message and reflected in the outcome.
    pub async fn process(&self, request: TurnRequest, cancel: CancellationToken) -> TurnResult {
        let mut message = AssistantMessage::new(request.message_id.clone(), request.session_id.clone());
        message.parent_id = request.parent_id.clone();
        let mut run = Run {
            processor: self,
            emitter: EventEmitter::new(request.event_sink.clone()),
            cancel,
            message,
            parts: Vec::new(),
            streams: HashMap::new(),
            calls: HashMap::new(),
            step: 0,
            blocked: false,
            compact: false,
        };
        run.execute(request.messages).await
    }
}

/// What one round-trip produced for the conversation.
#[derive(Default)]
struct RoundTrip {
    text: String,
    calls: Vec<ToolCallContent>,
    results: Vec<ModelMessage>,
}

struct Run<'a> {
    processor: &'a TurnProcessor,
    emitter: EventEmitter,
    cancel: CancellationToken,
    message: AssistantMessage,
    parts: Vec<Part>,
    /// Open text/reasoning parts by stream id, reset every round-trip.
    streams: HashMap<String, usize>,
    /// Tool parts by call id.
    calls: HashMap<String, usize>,
    step: usize,
    blocked: bool,
    compact: bool,
}

impl Run<'_> {
    async fn execute(&mut self, mut conversation: Vec<ModelMessage>) -> TurnResult {
        let session_id = self.message.session_id.clone();
        tracing::debug!(session_id = %session_id, message_id = %self.message.id, "turn start");
        self.emitter.emit(AgentEvent::TurnStart {
            session_id: session_id.clone(),
            message_id: self.message.id.clone(),
        });
        publish_status(self.bus(), &session_id, &SessionStatus::Busy);
        if let Err(err) = self.save_message().await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to persist new message");
        }

        let processor = self.processor;
        let settings = &processor.settings;
        let mut steps = 0usize;
        let mut attempt = 0u32;
        let outcome = loop {
            if self.cancel.is_cancelled() {
                break self.fail(KilnError::Canceled);
            }
            if attempt == 0 {
                if steps >= settings.max_steps {
                    tracing::warn!(session_id = %session_id, steps, "turn reached max steps");
                    break TurnOutcome::Stop;
                }
                steps += 1;
                self.step = steps;
                self.emitter.emit(AgentEvent::StepStart { step: steps });
            }

            match self.round_trip(&conversation).await {
                Ok(round) => {
                    attempt = 0;
                    if self.blocked {
                        break TurnOutcome::Blocked;
                    }
                    if self.compact {
                        break TurnOutcome::Compact;
                    }
                    if round.calls.is_empty() {
                        break TurnOutcome::Stop;
                    }
                    conversation.push(assistant_message(round.text, round.calls));
                    conversation.extend(round.results);
                }
                Err(err) if err.is_retryable() && !self.cancel.is_cancelled() => {
                    attempt += 1;
                    if !settings.retry.allows(attempt) {
                        break self.fail(err);
                    }
                    self.interrupt_open_parts().await;
                    let delay = settings.retry.delay(attempt);
                    let next = now_millis() + delay.as_millis() as i64;
                    tracing::warn!(
                        session_id = %session_id,
                        attempt,
                        max_attempts = settings.retry.max_attempts,
                        error = %err,
                        "Retrying after error"
                    );
                    let status = SessionStatus::Retry {
                        attempt,
                        message: err.to_string(),
                        next,
                    };
                    publish_status(self.bus(), &session_id, &status);
                    self.emitter.emit(AgentEvent::Retry {
                        attempt,
                        message: err.to_string(),
                        next,
                    });
                    if let Err(canceled) = retry::sleep(delay, &self.cancel).await {
                        break self.fail(canceled);
                    }
                }
                Err(err) => {
                    let err = if self.cancel.is_cancelled() { KilnError::Canceled } else { err };
                    break self.fail(err);
                }
            }
        };

        self.finish(outcome, steps).await
    }

    fn bus(&self) -> &crate::bus::EventBus {
        self.processor.permissions.bus()
    }

    fn fail(&mut self, err: KilnError) -> TurnOutcome {
        tracing::debug!(message_id = %self.message.id, error = %err, "turn failed");
        let error = MessageError::from(&err);
        let published = serde_json::to_value(&error).map_err(KilnError::from).and_then(|value| {
            self.bus().publish(
                bus_events::SESSION_ERROR,
                json!({ "session_id": self.message.session_id, "error": value }),
            )
        });
        if let Err(publish_err) = published {
            tracing::warn!(error = %publish_err, "failed to publish session error");
        }
        self.emitter.emit(AgentEvent::Error {
            error: err.to_string(),
        });
        self.message.error = Some(error);
        TurnOutcome::Error
    }

    async fn finish(&mut self, outcome: TurnOutcome, steps: usize) -> TurnResult {
        self.interrupt_open_parts().await;
        let finish = if self.message.error.is_some() {
            "error".to_string()
        } else {
            self.message.finish.clone().unwrap_or_else(|| "stop".to_string())
        };
        self.message.finish = Some(finish.clone());
        self.message.time.completed = Some(now_millis());
        if let Err(err) = self.save_message().await {
            tracing::warn!(message_id = %self.message.id, error = %err, "failed to persist final message");
        }
        publish_status(self.bus(), &self.message.session_id, &SessionStatus::Idle);
        tracing::debug!(message_id = %self.message.id, outcome = %outcome, steps, "turn end");
        self.emitter.emit(AgentEvent::TurnEnd {
            message_id: self.message.id.clone(),
            outcome,
            finish,
        });
        TurnResult {
            outcome,
            message: self.message.clone(),
            steps,
        }
    }

    async fn round_trip(&mut self, conversation: &[ModelMessage]) -> Result<RoundTrip> {
        // Ids are only unique within one stream; a retry replays the round from scratch.
        self.streams.clear();
        self.calls.clear();
        let registry = &self.processor.registry;
        let hidden = permission::disabled(registry.names(), &self.processor.ruleset);
        let request = ModelRequest {
            session_id: self.message.session_id.clone(),
            messages: conversation.to_vec(),
            tools: registry.specs(&hidden),
        };

        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KilnError::Canceled),
            opened = self.processor.model.open(&request, self.cancel.child_token()) => opened?,
        };

        let mut round = RoundTrip::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(KilnError::Canceled),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            self.apply(event?, &mut round).await?;
        }
        Ok(round)
    }

    async fn apply(&mut self, event: StreamEvent, round: &mut RoundTrip) -> Result<()> {
        match event {
            StreamEvent::StartStep | StreamEvent::ToolInputEnd { .. } => {}

            StreamEvent::ReasoningStart { id, metadata } => {
                let index = self.push_part(PartKind::Reasoning {
                    text: String::new(),
                    metadata,
                    time: TimeSpan::starting_now(),
                });
                self.streams.insert(id, index);
                self.save_part(index, None).await?;
            }
            StreamEvent::TextStart { id } => {
                let index = self.push_part(PartKind::Text {
                    text: String::new(),
                    time: Some(TimeSpan::starting_now()),
                });
                self.streams.insert(id, index);
                self.save_part(index, None).await?;
            }
            StreamEvent::ReasoningDelta { id, text } => {
                let index = self.stream_part(id, true);
                append_text(&mut self.parts[index], &text);
                self.save_part(index, Some(text)).await?;
            }
            StreamEvent::TextDelta { id, text } => {
                let index = self.stream_part(id, false);
                append_text(&mut self.parts[index], &text);
                round.text.push_str(&text);
                self.save_part(index, Some(text)).await?;
            }
            StreamEvent::ReasoningEnd { id } | StreamEvent::TextEnd { id } => {
                if let Some(index) = self.streams.remove(&id) {
                    if close_text(&mut self.parts[index]) {
                        self.save_part(index, None).await?;
                    }
                }
            }

            StreamEvent::ToolInputStart { id, tool_name } => {
                let index = self.tool_part(&id, &tool_name);
                self.save_part(index, None).await?;
            }
            StreamEvent::ToolInputDelta { id, delta } => {
                if let Some(&index) = self.calls.get(&id) {
                    if let Some(ToolState::Pending { raw, .. }) = self.parts[index].tool_state_mut() {
                        raw.push_str(&delta);
                    }
                    self.save_part(index, None).await?;
                }
            }
            StreamEvent::ToolCall {
                call_id,
                tool_name,
                input,
                provider_executed,
            } => {
                return self
                    .tool_call(call_id, tool_name, input, provider_executed, round)
                    .await;
            }
            StreamEvent::ToolResult {
                call_id,
                output,
                title,
                metadata,
            } => {
                if let Some(&index) = self.calls.get(&call_id) {
                    if let Some(state) = self.parts[index].tool_state_mut() {
                        let completed = state.complete(
                            output,
                            title.unwrap_or_default(),
                            metadata.unwrap_or_else(|| json!({})),
                            Vec::new(),
                        );
                        if let Err(err) = completed {
                            tracing::warn!(call_id = %call_id, error = %err, "ignoring tool result");
                            return Ok(());
                        }
                    }
                    self.tool_finished(index);
                    self.save_part(index, None).await?;
                }
            }
            StreamEvent::ToolError {
                call_id,
                error,
                rejected,
            } => {
                if let Some(&index) = self.calls.get(&call_id) {
                    if let Some(state) = self.parts[index].tool_state_mut() {
                        if let Err(err) = state.fail(error, None) {
                            tracing::warn!(call_id = %call_id, error = %err, "ignoring tool error");
                            return Ok(());
                        }
                    }
                    self.tool_finished(index);
                    self.save_part(index, None).await?;
                }
                if rejected {
                    self.blocked = true;
                }
            }
            StreamEvent::FinishStep {
                usage,
                cost,
                finish_reason,
            } => {
                self.message.usage.add(&usage);
                self.message.cost += cost;
                if let Some(reason) = finish_reason {
                    self.message.finish = Some(reason.to_string());
                }
                self.save_message().await?;
                self.emitter.emit(AgentEvent::StepFinish {
                    step: self.step,
                    usage,
                    cost,
                });
                if let Some(limit) = self.processor.settings.context_limit {
                    if usage.context_tokens() > limit {
                        tracing::debug!(tokens = usage.context_tokens(), limit, "context limit reached");
                        self.compact = true;
                    }
                }
            }
            event @ StreamEvent::Error { .. } => {
                if let Some(err) = event.into_error() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn tool_call(
        &mut self,
        call_id: String,
        tool_name: String,
        input: serde_json::Value,
        provider_executed: bool,
        round: &mut RoundTrip,
    ) -> Result<()> {
        let index = self.tool_part(&call_id, &tool_name);
        if let Some(state) = self.parts[index].tool_state_mut() {
            if let Err(err) = state.start(input.clone()) {
                tracing::warn!(call_id = %call_id, error = %err, "duplicate tool call ignored");
                return Ok(());
            }
        }
        self.save_part(index, None).await?;
        self.emitter.emit(AgentEvent::ToolExecutionStart {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            input: input.clone(),
        });
        if self.blocked {
            // Left running; the exit sweep interrupts it.
            tracing::debug!(call_id = %call_id, tool = %tool_name, "turn blocked, call not dispatched");
            return Ok(());
        }

        let ctx = self.tool_context(&call_id);
        if let Some(record) = doom_loop::detect(&self.parts, self.processor.settings.doom_loop_threshold) {
            tracing::warn!(tool = %record.tool, call_id = %call_id, "repeated identical tool calls");
            match ctx.ask(record.escalation()).await {
                Ok(()) => {}
                Err(err) if err.is_rejection() => return self.reject(index, err.to_string()).await,
                Err(err) => return Err(err),
            }
        }
        if provider_executed {
            return Ok(());
        }

        round.calls.push(ToolCallContent {
            id: call_id.clone(),
            name: tool_name.clone(),
            arguments: input.clone(),
        });
        match self.processor.registry.invoke(&tool_name, input, &ctx).await {
            ToolOutcome::Completed(output) => {
                let content = output.output.clone();
                if let Some(state) = self.parts[index].tool_state_mut() {
                    state.complete(output.output, output.title, output.metadata, output.attachments)?;
                }
                round.results.push(ModelMessage::tool_result(&call_id, content, false));
            }
            ToolOutcome::Failed(KilnError::Canceled) if self.cancel.is_cancelled() => {
                return Err(KilnError::Canceled);
            }
            ToolOutcome::Failed(err) => {
                let message = err.to_string();
                if let Some(state) = self.parts[index].tool_state_mut() {
                    state.fail(message.clone(), None)?;
                }
                round.results.push(ModelMessage::tool_result(&call_id, message, true));
            }
            ToolOutcome::Rejected { reason } => return self.reject(index, reason).await,
        }
        self.tool_finished(index);
        self.save_part(index, None).await
    }

    /// Block the turn and settle the rejected part, keeping the reason on it.
    /// The rest of the stream is still consumed.
    async fn reject(&mut self, index: usize, reason: String) -> Result<()> {
        tracing::debug!(part_id = %self.parts[index].id, reason = %reason, "tool rejected");
        self.blocked = true;
        if let Some(state) = self.parts[index].tool_state_mut() {
            state.fail(INTERRUPTED, Some(json!({ "rejected": reason })))?;
        }
        self.tool_finished(index);
        self.save_part(index, None).await
    }

    fn tool_context(&self, call_id: &str) -> ToolContext {
        ToolContext {
            session_id: self.message.session_id.clone(),
            message_id: self.message.id.clone(),
            call_id: call_id.to_string(),
            cancel: self.cancel.child_token(),
            permissions: self.processor.permissions.clone(),
            ruleset: self.processor.ruleset.clone(),
            store: self.processor.store.clone(),
            registry: self.processor.registry.clone(),
        }
    }

    fn tool_finished(&self, index: usize) {
        let part = &self.parts[index];
        if let (PartKind::Tool { call_id, tool, .. }, Some(state)) = (&part.kind, part.tool_state()) {
            self.emitter.emit(AgentEvent::ToolExecutionEnd {
                call_id: call_id.clone(),
                tool_name: tool.clone(),
                status: state.status().to_string(),
            });
        }
    }

    fn push_part(&mut self, kind: PartKind) -> usize {
        self.parts.push(Part {
            id: id::ascending(IdPrefix::Part),
            session_id: self.message.session_id.clone(),
            message_id: self.message.id.clone(),
            kind,
        });
        self.parts.len() - 1
    }

    /// Open part for a stream id, created if the start event was skipped.
    fn stream_part(&mut self, id: String, reasoning: bool) -> usize {
        if let Some(&index) = self.streams.get(&id) {
            return index;
        }
        let kind = if reasoning {
            PartKind::Reasoning {
                text: String::new(),
                metadata: None,
                time: TimeSpan::starting_now(),
            }
        } else {
            PartKind::Text {
                text: String::new(),
                time: Some(TimeSpan::starting_now()),
            }
        };
        let index = self.push_part(kind);
        self.streams.insert(id, index);
        index
    }

    fn tool_part(&mut self, call_id: &str, tool_name: &str) -> usize {
        if let Some(&index) = self.calls.get(call_id) {
            return index;
        }
        let index = self.push_part(PartKind::Tool {
            call_id: call_id.to_string(),
            tool: tool_name.to_string(),
            state: ToolState::pending(),
        });
        self.calls.insert(call_id.to_string(), index);
        index
    }

    async fn save_part(&self, index: usize, delta: Option<String>) -> Result<()> {
        let part = &self.parts[index];
        self.processor.store.update_part(part, delta.as_deref()).await?;
        self.emitter.emit(AgentEvent::PartUpdated {
            part: part.clone(),
            delta,
        });
        Ok(())
    }

    async fn save_message(&self) -> Result<()> {
        self.processor.store.update_message(&self.message).await
    }

    /// Close open text parts and fail unfinished tool parts.
    async fn interrupt_open_parts(&mut self) {
        for index in 0..self.parts.len() {
            let part = &mut self.parts[index];
            let changed = match part.tool_state_mut() {
                Some(state) => !state.is_terminal() && state.fail(INTERRUPTED, None).is_ok(),
                None => close_text(part),
            };
            if changed {
                if let Err(err) = self.save_part(index, None).await {
                    tracing::warn!(part_id = %self.parts[index].id, error = %err, "failed to persist interrupted part");
                }
            }
        }
        self.streams.clear();
    }
}

fn append_text(part: &mut Part, delta: &str) {
    if let PartKind::Text { text, .. } | PartKind::Reasoning { text, .. } = &mut part.kind {
        text.push_str(delta);
    }
}

/// Trim trailing whitespace and stamp the end time. `false` if already closed.
fn close_text(part: &mut Part) -> bool {
    let now = now_millis();
    match &mut part.kind {
        PartKind::Text { text, time } => {
            if time.is_some_and(|t| t.end.is_some()) {
                return false;
            }
            text.truncate(text.trim_end().len());
            let start = time.map_or(now, |t| t.start);
            *time = Some(TimeSpan { start, end: Some(now) });
            true
        }
        PartKind::Reasoning { text, time, .. } => {
            if time.end.is_some() {
                return false;
            }
            text.truncate(text.trim_end().len());
            time.end = Some(now);
            true
        }
        PartKind::Tool { .. } => false,
    }
}

fn assistant_message(text: String, calls: Vec<ToolCallContent>) -> ModelMessage {
    let mut content = Vec::with_capacity(calls.len() + 1);
    if !text.is_empty() {
        content.push(ContentPart::Text { text });
    }
    content.extend(calls.into_iter().map(ContentPart::ToolCall));
    ModelMessage {
        role: Role::Assistant,
        content,
    }
}
