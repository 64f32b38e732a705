//! `batch`: run several tool calls concurrently inside one call.
//!
//! Each accepted entry gets its own tool part, goes through the normal
//! [`ToolRegistry::invoke`] wrapper and fails in isolation. Entries beyond the
//! cap are not executed and are reported as failed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::arguments::ToolArguments;
use super::tool::{PermissionCheck, Tool, ToolContext};
use super::types::{ToolOutcome, ToolOutput, ToolParameters};
use super::validation::validate_arguments;
use crate::error::Result;
use crate::id::{self, IdPrefix};
use crate::session::{Part, PartKind, ToolState};

pub const MAX_BATCH: usize = 25;
const DISALLOWED: &[&str] = &["batch"];

#[derive(Debug, Clone, Deserialize)]
struct BatchCall {
    tool: String,
    #[serde(default)]
    parameters: Value,
}

/// Per-entry outcome reported in the batch metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct BatchTool {
    parameters: ToolParameters,
    max_calls: usize,
}

impl Default for BatchTool {
    fn default() -> Self {
        Self::new(MAX_BATCH)
    }
}

impl BatchTool {
    pub fn new(max_calls: usize) -> Self {
        let item = json!({
            "type": "object",
            "properties": {
                "tool": { "type": "string", "description": "The name of the tool to execute" },
                "parameters": { "type": "object", "description": "Parameters for the tool" }
            },
            "required": ["tool", "parameters"]
        });
        Self {
            parameters: ToolParameters::object()
                .array("tool_calls", "Array of tool calls to execute in parallel", item, Some(1), true)
                .build(),
            max_calls,
        }
    }

    fn limit_error(&self) -> String {
        format!("Maximum of {} tools allowed in batch", self.max_calls)
    }

    async fn run_one(&self, call: BatchCall, ctx: &ToolContext) -> CallReport {
        let call_id = id::ascending(IdPrefix::Call);
        let mut part = Part {
            id: id::ascending(IdPrefix::Part),
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id.clone(),
            kind: PartKind::Tool {
                call_id: call_id.clone(),
                tool: call.tool.clone(),
                state: ToolState::pending(),
            },
        };

        let outcome = match self.admit(&call, ctx) {
            Err(error) => ToolOutcome::Failed(error),
            Ok(()) => {
                if let Some(state) = part.tool_state_mut() {
                    let _ = state.start(call.parameters.clone());
                }
                persist(ctx, &part).await;
                ctx.registry
                    .invoke(&call.tool, call.parameters.clone(), &ctx.for_call(call_id))
                    .await
            }
        };

        let report = match outcome {
            ToolOutcome::Completed(output) => {
                if let Some(state) = part.tool_state_mut() {
                    let _ = state.complete(output.output, output.title, output.metadata, output.attachments);
                }
                CallReport {
                    tool: call.tool,
                    success: true,
                    error: None,
                }
            }
            ToolOutcome::Rejected { reason } => failed_part(&mut part, call.tool, reason),
            ToolOutcome::Failed(err) => failed_part(&mut part, call.tool, err.to_string()),
        };
        persist(ctx, &part).await;
        report
    }

    fn admit(&self, call: &BatchCall, ctx: &ToolContext) -> Result<()> {
        if DISALLOWED.contains(&call.tool.as_str()) {
            return Err(crate::error::KilnError::Validation(format!(
                "Tool '{}' is not allowed in batch. Disallowed tools: {}",
                call.tool,
                DISALLOWED.join(", ")
            )));
        }
        let tool = ctx
            .registry
            .get(&call.tool)
            .ok_or_else(|| ctx.registry.unknown_tool(&call.tool))?;
        validate_arguments(&call.parameters, &tool.parameters().schema).map_err(|message| {
            crate::error::KilnError::InvalidToolInput {
                tool: call.tool.clone(),
                message: tool.format_validation_error(&message),
            }
        })
    }
}

fn failed_part(part: &mut Part, tool: String, error: String) -> CallReport {
    if let Some(state) = part.tool_state_mut() {
        let _ = state.fail(error.clone(), None);
    }
    CallReport {
        tool,
        success: false,
        error: Some(error),
    }
}

async fn persist(ctx: &ToolContext, part: &Part) {
    if let Err(err) = ctx.store.update_part(part, None).await {
        tracing::warn!(part_id = %part.id, error = %err, "failed to persist batch part");
    }
}

#[async_trait::async_trait]
impl Tool for BatchTool {
    fn name(&self) -> &str {
        "batch"
    }

    fn description(&self) -> &str {
        "Execute multiple independent tool calls concurrently. Each call succeeds or fails on its own."
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn permission(&self, _args: &ToolArguments) -> Option<PermissionCheck> {
        None
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput> {
        let mut calls: Vec<BatchCall> = args.field("tool_calls")?;
        let discarded = if calls.len() > self.max_calls {
            calls.split_off(self.max_calls)
        } else {
            Vec::new()
        };
        tracing::debug!(
            accepted = calls.len(),
            discarded = discarded.len(),
            call_id = %ctx.call_id,
            "batch start"
        );

        let mut reports =
            futures::future::join_all(calls.into_iter().map(|call| self.run_one(call, ctx))).await;

        for call in discarded {
            let mut part = Part {
                id: id::ascending(IdPrefix::Part),
                session_id: ctx.session_id.clone(),
                message_id: ctx.message_id.clone(),
                kind: PartKind::Tool {
                    call_id: id::ascending(IdPrefix::Call),
                    tool: call.tool.clone(),
                    state: ToolState::pending(),
                },
            };
            reports.push(failed_part(&mut part, call.tool, self.limit_error()));
            persist(ctx, &part).await;
        }

        let total = reports.len();
        let successful = reports.iter().filter(|r| r.success).count();
        let failed = total - successful;
        let output = if failed == 0 {
            format!(
                "All {total} tools executed successfully.\n\nKeep using the batch tool for optimal performance in your next response!"
            )
        } else {
            format!("Executed {successful}/{total} tools successfully. {failed} failed.")
        };
        let tools: Vec<&str> = reports.iter().map(|r| r.tool.as_str()).collect();

        Ok(ToolOutput::new(format!("Batch execution ({successful}/{total} successful)"), output)
            .with_metadata(json!({
                "total_calls": total,
                "successful": successful,
                "failed": failed,
                "tools": tools,
                "details": reports,
            })))
    }
}
