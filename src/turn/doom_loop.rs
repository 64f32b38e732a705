//! Detection of a model repeating the same tool call.

use serde_json::{json, Value};

use crate::permission::DOOM_LOOP;
use crate::session::{Part, PartKind};
use crate::tools::PermissionCheck;

pub const DEFAULT_THRESHOLD: usize = 3;

/// Tool name and input of one call, compared structurally.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub tool: String,
    pub input: Value,
}

impl ToolCallRecord {
    fn from_part(part: &Part) -> Option<Self> {
        match &part.kind {
            PartKind::Tool { tool, state, .. } => Some(Self {
                tool: tool.clone(),
                input: state.input().clone(),
            }),
            _ => None,
        }
    }

    /// Permission check escalating the loop to policy.
    pub fn escalation(&self) -> PermissionCheck {
        PermissionCheck::new(DOOM_LOOP, vec![self.tool.clone()])
            .with_metadata(json!({ "tool": self.tool, "input": self.input }))
    }
}

/// The repeated call, if the last `threshold` tool parts are identical.
pub fn detect(parts: &[Part], threshold: usize) -> Option<ToolCallRecord> {
    if threshold == 0 {
        return None;
    }
    let window: Vec<ToolCallRecord> = parts
        .iter()
        .rev()
        .filter_map(ToolCallRecord::from_part)
        .take(threshold)
        .collect();
    if window.len() < threshold {
        return None;
    }
    let first = &window[0];
    window[1..]
        .iter()
        .all(|record| record == first)
        .then(|| first.clone())
}
