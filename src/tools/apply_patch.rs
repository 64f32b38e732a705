//! `apply_patch`: edit files with the multi-file patch format in [`crate::patch`].

use std::path::{Path, PathBuf};

use serde_json::json;

use super::arguments::ToolArguments;
use super::tool::{PermissionCheck, Tool, ToolContext};
use super::types::{ToolOutput, ToolParameters};
use crate::error::{KilnError, Result};
use crate::patch::{self, FileChange};

/// Applies patches to files under a working directory.
#[derive(Debug)]
pub struct ApplyPatchTool {
    root: PathBuf,
    parameters: ToolParameters,
}

impl ApplyPatchTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            parameters: ToolParameters::object()
                .string(
                    "patch_text",
                    "The full patch text, from '*** Begin Patch' to '*** End Patch'",
                    true,
                )
                .build(),
        }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[async_trait::async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Add, delete, move and update files with a single patch. Update hunks locate their \
         target by context lines rather than line numbers."
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    // Targets are only known after parsing, so the check happens in `execute`.
    fn permission(&self, _args: &ToolArguments) -> Option<PermissionCheck> {
        None
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput> {
        let hunks = patch::parse_patch(args.get_str("patch_text")?)?;
        if hunks.is_empty() {
            return Err(KilnError::Validation("patch rejected: no files to change".into()));
        }
        let changes = patch::plan(&self.root, &hunks).await?;

        let mut targets: Vec<String> = Vec::new();
        for change in &changes {
            let source = match change {
                FileChange::Add { path, .. } | FileChange::Delete { path } | FileChange::Update { path, .. } => path,
            };
            targets.push(self.relative(source));
            if let FileChange::Update {
                move_path: Some(target),
                ..
            } = change
            {
                targets.push(self.relative(target));
            }
        }
        targets.dedup();

        ctx.ask(
            PermissionCheck::new("edit", targets.clone())
                .with_metadata(json!({ "files": targets })),
        )
        .await?;

        if ctx.cancel.is_cancelled() {
            return Err(KilnError::Canceled);
        }
        patch::commit(&changes).await?;

        let summary: Vec<String> = changes
            .iter()
            .map(|change| format!("{} {}", change.marker(), self.relative(change.target())))
            .collect();
        tracing::debug!(session_id = %ctx.session_id, files = changes.len(), "patch applied");

        Ok(ToolOutput::new(
            format!("{} file(s) changed", changes.len()),
            format!("Success. Updated the following files:\n{}", summary.join("\n")),
        )
        .with_metadata(json!({ "files": summary })))
    }
}
