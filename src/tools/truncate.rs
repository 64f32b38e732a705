//! Output-size capping for tool results.
//!
//! Output over either cap is cut from the chosen end; the full text is saved
//! to `<data_dir>/tool-output/<tool id>` and the kept text carries a note
//! pointing at that file. Side files are named by ascending `tool_` IDs, so
//! their age can be read from the name when cleaning up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::id::{self, IdPrefix};

pub const MAX_LINES: usize = 2000;
pub const MAX_BYTES: usize = 50 * 1024;
pub const OUTPUT_DIR: &str = "tool-output";
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Which end of the output to keep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Head,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder)]
pub struct TruncateOptions {
    #[builder(default = MAX_LINES)]
    pub max_lines: usize,
    #[builder(default = MAX_BYTES)]
    pub max_bytes: usize,
    #[builder(default)]
    pub direction: Direction,
}

impl Default for TruncateOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub content: String,
    pub truncated: bool,
    /// Side file holding the full output.
    pub output_path: Option<PathBuf>,
}

/// Applies truncation and owns the side-file directory.
#[derive(Debug, Clone)]
pub struct Truncator {
    dir: PathBuf,
    defaults: TruncateOptions,
}

impl Truncator {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join(OUTPUT_DIR),
            defaults: TruncateOptions::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: TruncateOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn defaults(&self) -> &TruncateOptions {
        &self.defaults
    }

    /// Truncate with the configured defaults.
    pub async fn apply(&self, text: &str) -> Result<Truncated> {
        self.apply_with(text, &self.defaults).await
    }

    pub async fn apply_with(&self, text: &str, options: &TruncateOptions) -> Result<Truncated> {
        let lines: Vec<&str> = text.split('\n').collect();
        let total_bytes = text.len();
        if lines.len() <= options.max_lines && total_bytes <= options.max_bytes {
            return Ok(Truncated {
                content: text.to_string(),
                truncated: false,
                output_path: None,
            });
        }

        let mut kept: Vec<&str> = Vec::new();
        let mut bytes = 0usize;
        let mut hit_bytes = false;
        match options.direction {
            Direction::Head => {
                for line in lines.iter().take(options.max_lines) {
                    let size = line.len() + usize::from(!kept.is_empty());
                    if bytes + size > options.max_bytes {
                        hit_bytes = true;
                        break;
                    }
                    kept.push(line);
                    bytes += size;
                }
            }
            Direction::Tail => {
                for line in lines.iter().rev().take(options.max_lines) {
                    let size = line.len() + usize::from(!kept.is_empty());
                    if bytes + size > options.max_bytes {
                        hit_bytes = true;
                        break;
                    }
                    kept.push(line);
                    bytes += size;
                }
                kept.reverse();
            }
        }

        let (removed, unit) = if hit_bytes {
            (total_bytes - bytes, "bytes")
        } else {
            (lines.len() - kept.len(), "lines")
        };
        let preview = kept.join("\n");

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(id::ascending(IdPrefix::Tool));
        tokio::fs::write(&path, text).await?;
        tracing::debug!(path = %path.display(), removed, unit, "tool output truncated");

        let hint = format!(
            "The tool call succeeded but the output was truncated. Full output saved to: {}\n\
             Search the full content or read it with an offset and limit to view specific sections.",
            path.display()
        );
        let content = match options.direction {
            Direction::Head => format!("{preview}\n\n...{removed} {unit} truncated...\n\n{hint}"),
            Direction::Tail => format!("...{removed} {unit} truncated...\n\n{hint}\n\n{preview}"),
        };
        Ok(Truncated {
            content,
            truncated: true,
            output_path: Some(path),
        })
    }

    /// Delete side files older than [`RETENTION`]; returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let cutoff = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let cutoff = cutoff.saturating_sub(RETENTION.as_millis() as u64);

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("tool_") {
                continue;
            }
            let Some(created) = id::timestamp(name) else { continue };
            if created < cutoff {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "expired tool output removed");
        }
        Ok(removed)
    }

    /// Run [`Truncator::cleanup`] every `interval` until `cancel` fires.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.cleanup().await {
                            tracing::warn!(error = %err, "tool output cleanup failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize) -> String {
        (0..count)
            .map(|i| format!("line{i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn small_output_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = Truncator::new(dir.path());
        let result = truncator.apply("hello\nworld").await.unwrap();
        assert!(!result.truncated);
        assert_eq!(result.content, "hello\nworld");
        assert!(result.output_path.is_none());
        assert!(!truncator.dir().exists());
    }

    #[tokio::test]
    async fn line_cap_spills_full_text() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = Truncator::new(dir.path());
        let text = numbered(3000);
        let result = truncator.apply(&text).await.unwrap();
        assert!(result.truncated);
        assert!(result.content.starts_with("line0\n"));
        assert!(result.content.contains("...1000 lines truncated..."));
        let path = result.output_path.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        assert!(result.content.contains(&path.display().to_string()));
    }

    #[tokio::test]
    async fn head_and_tail_keep_opposite_ends() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = Truncator::new(dir.path());
        let text = numbered(100);

        let head = TruncateOptions::builder().max_lines(5).build();
        let result = truncator.apply_with(&text, &head).await.unwrap();
        assert!(result.content.starts_with("line0\nline1\nline2\nline3\nline4\n\n...95 lines"));

        let tail = TruncateOptions::builder()
            .max_lines(5)
            .direction(Direction::Tail)
            .build();
        let result = truncator.apply_with(&text, &tail).await.unwrap();
        assert!(result.content.starts_with("...95 lines truncated..."));
        assert!(result.content.ends_with("\n\nline95\nline96\nline97\nline98\nline99"));
    }

    #[tokio::test]
    async fn byte_cap_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = Truncator::new(dir.path());
        let text = "x".repeat(100);
        let options = TruncateOptions::builder().max_bytes(10).build();
        let result = truncator.apply_with(&text, &options).await.unwrap();
        assert!(result.truncated);
        assert!(result.content.contains("...100 bytes truncated..."), "{}", result.content);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = Truncator::new(dir.path());
        std::fs::create_dir_all(truncator.dir()).unwrap();

        let old_millis = chrono::Utc::now().timestamp_millis() as u64 - 8 * 24 * 60 * 60 * 1000;
        let old = format!("tool_{:016x}{}", old_millis * 4096 + 1, "a".repeat(14));
        std::fs::write(truncator.dir().join(&old), "old").unwrap();
        let fresh = id::ascending(IdPrefix::Tool);
        std::fs::write(truncator.dir().join(&fresh), "fresh").unwrap();
        std::fs::write(truncator.dir().join("notes.txt"), "keep").unwrap();

        assert_eq!(truncator.cleanup().await.unwrap(), 1);
        assert!(!truncator.dir().join(&old).exists());
        assert!(truncator.dir().join(&fresh).exists());
        assert!(truncator.dir().join("notes.txt").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_cleanup_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = Arc::new(Truncator::new(dir.path()));
        let cancel = CancellationToken::new();
        let handle = truncator.spawn_cleanup(Duration::from_secs(60), cancel.clone());
        tokio::time::sleep(Duration::from_secs(120)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
