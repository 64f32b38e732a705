//! Name-keyed tool registry and the invocation wrapper every call goes through.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolContext};
use super::truncate::Truncator;
use super::types::ToolOutcome;
use super::validation::validate_arguments;
use crate::error::KilnError;
use crate::model::ToolSpec;

/// Tools available to a turn, built once at startup.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    truncator: Truncator,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(truncator: Truncator) -> Self {
        Self {
            tools: BTreeMap::new(),
            truncator,
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn truncator(&self) -> &Truncator {
        &self.truncator
    }

    /// Definitions to advertise to the model, minus `hidden`.
    pub fn specs(&self, hidden: &HashSet<String>) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|tool| !hidden.contains(tool.name()))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters().schema.clone(),
            })
            .collect()
    }

    /// Error returned for a name that is not registered.
    pub fn unknown_tool(&self, name: &str) -> KilnError {
        KilnError::Validation(format!(
            "Unknown tool '{name}'. Available tools: {}",
            self.names().join(", ")
        ))
    }

    /// Look up, validate, check permission, execute and truncate.
    pub async fn invoke(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return ToolOutcome::Failed(self.unknown_tool(name));
        };

        if let Err(message) = validate_arguments(&input, &tool.parameters().schema) {
            return ToolOutcome::Failed(KilnError::InvalidToolInput {
                tool: name.to_string(),
                message: tool.format_validation_error(&message),
            });
        }
        let args = ToolArguments::new(input);

        if let Some(check) = tool.permission(&args) {
            if let Err(err) = ctx.ask(check).await {
                return rejected_or_failed(err);
            }
        }

        tracing::debug!(tool = name, call_id = %ctx.call_id, "tool execute");
        let mut output = match tool.execute(&args, ctx).await {
            Ok(output) => output,
            Err(err) => return rejected_or_failed(err),
        };

        if output.metadata.get("truncated").is_some() {
            return ToolOutcome::Completed(output);
        }
        match self.truncator.apply(&output.output).await {
            Ok(truncated) => {
                output.output = truncated.content;
                output.set_metadata("truncated", json!(truncated.truncated));
                if let Some(path) = truncated.output_path {
                    output.set_metadata("output_path", json!(path.display().to_string()));
                }
                ToolOutcome::Completed(output)
            }
            Err(err) => ToolOutcome::Failed(err),
        }
    }
}

fn rejected_or_failed(err: KilnError) -> ToolOutcome {
    if err.is_rejection() {
        ToolOutcome::Rejected {
            reason: err.to_string(),
        }
    } else {
        ToolOutcome::Failed(err)
    }
}
