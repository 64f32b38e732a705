//! Multi-file patch format used by the `apply_patch` tool.
//!
//! ```text
//! *** Begin Patch
//! *** Add File: notes/todo.txt
//! +first line
//! *** Update File: src/app.rs
//! *** Move to: src/main.rs
//! @@ fn main() {
//! -    old();
//! +    new();
//! *** Delete File: obsolete.txt
//! *** End Patch
//! ```
//!
//! Update chunks are addressed by context rather than line numbers: the
//! optional `@@` header names a line to seek to, and the chunk's old lines
//! are then located at or after it. Matching falls back from exact to
//! whitespace-insensitive to punctuation-normalized comparison.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;

const BEGIN: &str = "*** Begin Patch";
const END: &str = "*** End Patch";
const ADD: &str = "*** Add File: ";
const DELETE: &str = "*** Delete File: ";
const UPDATE: &str = "*** Update File: ";
const MOVE: &str = "*** Move to: ";
const END_OF_FILE: &str = "*** End of File";

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Invalid patch: {0}")]
    Invalid(String),

    #[error("Invalid patch line {line}: {message}")]
    InvalidLine { line: usize, message: String },

    #[error("Failed to find context '{context}' in {path}")]
    ContextNotFound { path: String, context: String },

    #[error("Failed to find expected lines in {path}:\n{lines}")]
    LinesNotFound { path: String, lines: String },

    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One context-addressed replacement inside an updated file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateChunk {
    /// Line to seek to before matching `old_lines` (`@@ <context>`).
    pub change_context: Option<String>,
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
    /// Chunk must match at the end of the file.
    pub is_end_of_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hunk {
    Add {
        path: String,
        contents: String,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_path: Option<String>,
        chunks: Vec<UpdateChunk>,
    },
}

impl Hunk {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Delete { path } | Self::Update { path, .. } => path,
        }
    }
}

/// Strip a shell heredoc wrapper (`<<'EOF' ... EOF`, optionally after `cat`).
fn strip_heredoc(text: &str) -> &str {
    let trimmed = text.trim();
    let Ok(opener) = Regex::new(r#"^(?:cat\s+)?<<-?\s*['"]?(\w+)['"]?\s*\n"#) else {
        return trimmed;
    };
    let Some(captures) = opener.captures(trimmed) else {
        return trimmed;
    };
    let (Some(all), Some(tag)) = (captures.get(0), captures.get(1)) else {
        return trimmed;
    };
    let body = &trimmed[all.end()..];
    match body.trim_end().strip_suffix(tag.as_str()) {
        Some(inner) => inner,
        None => trimmed,
    }
}

fn is_file_header(line: &str) -> bool {
    line.starts_with(ADD) || line.starts_with(DELETE) || line.starts_with(UPDATE) || line == END
}

/// Parse patch text into hunks.
pub fn parse_patch(text: &str) -> Result<Vec<Hunk>, PatchError> {
    let lines: Vec<&str> = strip_heredoc(text).lines().collect();
    let begin = lines
        .iter()
        .position(|line| line.trim() == BEGIN)
        .ok_or_else(|| PatchError::Invalid(format!("missing '{BEGIN}' marker")))?;
    let end = lines
        .iter()
        .rposition(|line| line.trim() == END)
        .filter(|end| *end > begin)
        .ok_or_else(|| PatchError::Invalid(format!("missing '{END}' marker")))?;

    let mut hunks = Vec::new();
    let mut i = begin + 1;
    while i < end {
        let line = lines[i];
        if let Some(path) = line.strip_prefix(ADD) {
            i += 1;
            let mut contents = String::new();
            while i < end && !is_file_header(lines[i]) {
                match lines[i].strip_prefix('+') {
                    Some(added) => {
                        contents.push_str(added);
                        contents.push('\n');
                    }
                    None => {
                        return Err(PatchError::InvalidLine {
                            line: i + 1,
                            message: format!("expected '+' in added file, got '{}'", lines[i]),
                        })
                    }
                }
                i += 1;
            }
            hunks.push(Hunk::Add {
                path: path.trim().to_string(),
                contents,
            });
        } else if let Some(path) = line.strip_prefix(DELETE) {
            hunks.push(Hunk::Delete {
                path: path.trim().to_string(),
            });
            i += 1;
        } else if let Some(path) = line.strip_prefix(UPDATE) {
            i += 1;
            let mut move_path = None;
            if let Some(target) = lines.get(i).and_then(|l| l.strip_prefix(MOVE)) {
                move_path = Some(target.trim().to_string());
                i += 1;
            }
            let (chunks, next) = parse_chunks(&lines, i, end)?;
            if chunks.is_empty() {
                return Err(PatchError::InvalidLine {
                    line: i,
                    message: format!("update for '{}' has no changes", path.trim()),
                });
            }
            hunks.push(Hunk::Update {
                path: path.trim().to_string(),
                move_path,
                chunks,
            });
            i = next;
        } else if line.trim().is_empty() {
            i += 1;
        } else {
            return Err(PatchError::InvalidLine {
                line: i + 1,
                message: format!("expected a file header, got '{line}'"),
            });
        }
    }
    Ok(hunks)
}

fn parse_chunks(lines: &[&str], mut i: usize, end: usize) -> Result<(Vec<UpdateChunk>, usize), PatchError> {
    let mut chunks: Vec<UpdateChunk> = Vec::new();
    let mut current: Option<UpdateChunk> = None;

    while i < end && !is_file_header(lines[i]) {
        let line = lines[i];
        if let Some(header) = line.strip_prefix("@@") {
            chunks.extend(current.take());
            let context = header.trim();
            current = Some(UpdateChunk {
                change_context: (!context.is_empty()).then(|| context.to_string()),
                ..UpdateChunk::default()
            });
        } else if line == END_OF_FILE {
            current.get_or_insert_with(UpdateChunk::default).is_end_of_file = true;
            chunks.extend(current.take());
        } else {
            let chunk = current.get_or_insert_with(UpdateChunk::default);
            if let Some(removed) = line.strip_prefix('-') {
                chunk.old_lines.push(removed.to_string());
            } else if let Some(added) = line.strip_prefix('+') {
                chunk.new_lines.push(added.to_string());
            } else if let Some(context) = line.strip_prefix(' ') {
                chunk.old_lines.push(context.to_string());
                chunk.new_lines.push(context.to_string());
            } else if line.is_empty() {
                chunk.old_lines.push(String::new());
                chunk.new_lines.push(String::new());
            } else {
                return Err(PatchError::InvalidLine {
                    line: i + 1,
                    message: format!("unexpected line in update hunk: '{line}'"),
                });
            }
        }
        i += 1;
    }
    chunks.extend(current);
    Ok((chunks, i))
}

fn normalize_punctuation(line: &str) -> String {
    line.trim()
        .chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' | '\u{2212}' => '-',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2009}' | '\u{202F}' | '\u{3000}' => ' ',
            other => other,
        })
        .collect()
}

/// Find `pattern` in `lines` at or after `start`, loosening the comparison
/// on each pass. With `eof`, a match at the very end is tried first.
fn seek_sequence(lines: &[String], pattern: &[String], start: usize, eof: bool) -> Option<usize> {
    if pattern.is_empty() {
        return Some(start);
    }
    if pattern.len() > lines.len() {
        return None;
    }
    let last = lines.len() - pattern.len();
    let passes: [fn(&str, &str) -> bool; 4] = [
        |a, b| a == b,
        |a, b| a.trim_end() == b.trim_end(),
        |a, b| a.trim() == b.trim(),
        |a, b| normalize_punctuation(a) == normalize_punctuation(b),
    ];
    for eq in passes {
        let matches_at = |i: usize| lines[i..i + pattern.len()].iter().zip(pattern).all(|(a, b)| eq(a, b));
        if eof && last >= start && matches_at(last) {
            return Some(last);
        }
        if let Some(found) = (start..=last).find(|&i| matches_at(i)) {
            return Some(found);
        }
    }
    None
}

/// Apply `chunks` to `original`, returning the new file contents.
pub fn derive_new_contents(path: &str, original: &str, chunks: &[UpdateChunk]) -> Result<String, PatchError> {
    let mut lines: Vec<String> = original.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }

    let mut replacements: Vec<(usize, usize, Vec<String>)> = Vec::new();
    let mut cursor = 0;
    for chunk in chunks {
        if let Some(context) = &chunk.change_context {
            let found = seek_sequence(&lines, std::slice::from_ref(context), cursor, false).ok_or_else(|| {
                PatchError::ContextNotFound {
                    path: path.to_string(),
                    context: context.clone(),
                }
            })?;
            cursor = found + 1;
        }

        if chunk.old_lines.is_empty() {
            replacements.push((lines.len(), 0, chunk.new_lines.clone()));
            continue;
        }

        let mut old = chunk.old_lines.as_slice();
        let mut new = chunk.new_lines.as_slice();
        let mut found = seek_sequence(&lines, old, cursor, chunk.is_end_of_file);
        if found.is_none() && old.last().is_some_and(String::is_empty) {
            old = &old[..old.len() - 1];
            if new.last().is_some_and(String::is_empty) {
                new = &new[..new.len() - 1];
            }
            found = seek_sequence(&lines, old, cursor, chunk.is_end_of_file);
        }
        let start = found.ok_or_else(|| PatchError::LinesNotFound {
            path: path.to_string(),
            lines: chunk.old_lines.join("\n"),
        })?;
        replacements.push((start, old.len(), new.to_vec()));
        cursor = start + old.len();
    }

    replacements.sort_by_key(|(start, _, _)| *start);
    for (start, len, new) in replacements.into_iter().rev() {
        lines.splice(start..start + len, new);
    }
    if lines.last().map_or(true, |line| !line.is_empty()) {
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// A fully resolved filesystem change, ready to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Add {
        path: PathBuf,
        contents: String,
    },
    Delete {
        path: PathBuf,
    },
    Update {
        path: PathBuf,
        move_path: Option<PathBuf>,
        contents: String,
    },
}

impl FileChange {
    /// Path the change ends up at.
    pub fn target(&self) -> &Path {
        match self {
            Self::Add { path, .. } | Self::Delete { path } => path,
            Self::Update { path, move_path, .. } => move_path.as_deref().unwrap_or(path),
        }
    }

    /// `A`, `M` or `D`.
    pub fn marker(&self) -> char {
        match self {
            Self::Add { .. } => 'A',
            Self::Update { .. } => 'M',
            Self::Delete { .. } => 'D',
        }
    }
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> PatchError + 'a {
    move |source| PatchError::Io {
        action,
        path: path.display().to_string(),
        source,
    }
}

/// Join a patch path onto `root`, refusing absolute paths and `..` that climb out.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf, PatchError> {
    let escapes = || PatchError::Invalid(format!("path escapes the working directory: {relative}"));
    let mut resolved = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(escapes());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escapes()),
        }
    }
    if resolved.as_os_str().is_empty() {
        return Err(PatchError::Invalid(format!("not a file path: {relative}")));
    }
    Ok(root.join(resolved))
}

/// Resolve hunks against files under `root` without touching the disk.
pub async fn plan(root: &Path, hunks: &[Hunk]) -> Result<Vec<FileChange>, PatchError> {
    let mut changes = Vec::with_capacity(hunks.len());
    for hunk in hunks {
        let path = resolve(root, hunk.path())?;
        let change = match hunk {
            Hunk::Add { contents, .. } => FileChange::Add {
                path,
                contents: contents.clone(),
            },
            Hunk::Delete { .. } => {
                tokio::fs::metadata(&path)
                    .await
                    .map_err(io_error("delete", &path))?;
                FileChange::Delete { path }
            }
            Hunk::Update {
                path: relative,
                move_path,
                chunks,
            } => {
                let move_path = match move_path {
                    Some(target) => Some(resolve(root, target)?),
                    None => None,
                };
                let original = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(io_error("read file to update", &path))?;
                let contents = derive_new_contents(relative, &original, chunks)?;
                FileChange::Update {
                    move_path,
                    path,
                    contents,
                }
            }
        };
        changes.push(change);
    }
    Ok(changes)
}

/// Write planned changes to disk in order.
pub async fn commit(changes: &[FileChange]) -> Result<(), PatchError> {
    for change in changes {
        match change {
            FileChange::Add { path, contents } => write_creating_parents(path, contents).await?,
            FileChange::Delete { path } => tokio::fs::remove_file(path)
                .await
                .map_err(io_error("delete", path))?,
            FileChange::Update {
                path,
                move_path,
                contents,
            } => match move_path {
                Some(target) => {
                    write_creating_parents(target, contents).await?;
                    if target != path {
                        tokio::fs::remove_file(path)
                            .await
                            .map_err(io_error("remove moved file", path))?;
                    }
                }
                None => tokio::fs::write(path, contents)
                    .await
                    .map_err(io_error("write", path))?,
            },
        }
        tracing::debug!(path = %change.target().display(), kind = %change.marker(), "patch change applied");
    }
    Ok(())
}

async fn write_creating_parents(path: &Path, contents: &str) -> Result<(), PatchError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error("create directory for", path))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(io_error("write", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_every_hunk_kind() {
        let patch = "*** Begin Patch\n\
                     *** Add File: new.txt\n\
                     +hello\n\
                     +world\n\
                     *** Delete File: old.txt\n\
                     *** Update File: src/app.rs\n\
                     *** Move to: src/main.rs\n\
                     @@ fn main() {\n\
                     -    old();\n\
                     +    new();\n\
                     *** End Patch";
        let hunks = parse_patch(patch).unwrap();
        assert_eq!(
            hunks,
            vec![
                Hunk::Add {
                    path: "new.txt".into(),
                    contents: "hello\nworld\n".into(),
                },
                Hunk::Delete { path: "old.txt".into() },
                Hunk::Update {
                    path: "src/app.rs".into(),
                    move_path: Some("src/main.rs".into()),
                    chunks: vec![UpdateChunk {
                        change_context: Some("fn main() {".into()),
                        old_lines: lines(&["    old();"]),
                        new_lines: lines(&["    new();"]),
                        is_end_of_file: false,
                    }],
                },
            ]
        );
    }

    #[test]
    fn strips_heredoc_wrapper() {
        let patch = "cat <<'EOF'\n*** Begin Patch\n*** Delete File: a.txt\n*** End Patch\nEOF\n";
        assert_eq!(parse_patch(patch).unwrap(), vec![Hunk::Delete { path: "a.txt".into() }]);
    }

    #[test]
    fn missing_markers_are_rejected() {
        assert!(matches!(parse_patch("*** Delete File: a.txt"), Err(PatchError::Invalid(_))));
        assert!(matches!(
            parse_patch("*** Begin Patch\n*** Delete File: a.txt\n"),
            Err(PatchError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_inside_update_is_reported_with_line() {
        let patch = "*** Begin Patch\n*** Update File: a.txt\n@@\nnot a diff line\n*** End Patch";
        match parse_patch(patch) {
            Err(PatchError::InvalidLine { line, .. }) => assert_eq!(line, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn applies_context_addressed_chunks() {
        let original = "fn a() {\n    run();\n}\nfn b() {\n    run();\n}\n";
        let chunks = vec![UpdateChunk {
            change_context: Some("fn b() {".into()),
            old_lines: lines(&["    run();"]),
            new_lines: lines(&["    walk();"]),
            is_end_of_file: false,
        }];
        let updated = derive_new_contents("lib.rs", original, &chunks).unwrap();
        assert_eq!(updated, "fn a() {\n    run();\n}\nfn b() {\n    walk();\n}\n");
    }

    #[test]
    fn end_of_file_chunk_matches_last_occurrence() {
        let original = "x\ny\nx\n";
        let chunks = vec![UpdateChunk {
            old_lines: lines(&["x"]),
            new_lines: lines(&["z"]),
            is_end_of_file: true,
            ..UpdateChunk::default()
        }];
        assert_eq!(derive_new_contents("f", original, &chunks).unwrap(), "x\ny\nz\n");
    }

    #[test]
    fn whitespace_and_punctuation_fall_back() {
        let original = "let s = \u{201C}hi\u{201D};   \n";
        let chunks = vec![UpdateChunk {
            old_lines: lines(&["let s = \"hi\";"]),
            new_lines: lines(&["let s = \"bye\";"]),
            ..UpdateChunk::default()
        }];
        assert_eq!(derive_new_contents("f", original, &chunks).unwrap(), "let s = \"bye\";\n");
    }

    #[test]
    fn pure_insertion_appends() {
        let chunks = vec![UpdateChunk {
            new_lines: lines(&["tail"]),
            ..UpdateChunk::default()
        }];
        assert_eq!(derive_new_contents("f", "head", &chunks).unwrap(), "head\ntail\n");
    }

    #[test]
    fn missing_lines_are_an_error() {
        let chunks = vec![UpdateChunk {
            old_lines: lines(&["absent"]),
            new_lines: lines(&["x"]),
            ..UpdateChunk::default()
        }];
        assert!(matches!(
            derive_new_contents("f", "present\n", &chunks),
            Err(PatchError::LinesNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn plan_then_commit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        std::fs::write(dir.path().join("app.txt"), "one\ntwo\n").unwrap();
        let hunks = parse_patch(
            "*** Begin Patch\n\
             *** Add File: nested/new.txt\n\
             +hi\n\
             *** Delete File: old.txt\n\
             *** Update File: app.txt\n\
             *** Move to: moved/app.txt\n\
             @@\n\
             -two\n\
             +three\n\
             *** End Patch",
        )
        .unwrap();

        let changes = plan(dir.path(), &hunks).await.unwrap();
        assert_eq!(changes.iter().map(FileChange::marker).collect::<String>(), "ADM");
        assert!(dir.path().join("old.txt").exists());

        commit(&changes).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("nested/new.txt")).unwrap(), "hi\n");
        assert!(!dir.path().join("old.txt").exists());
        assert!(!dir.path().join("app.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("moved/app.txt")).unwrap(),
            "one\nthree\n"
        );
    }

    #[tokio::test]
    async fn plan_fails_for_missing_update_target() {
        let dir = tempfile::tempdir().unwrap();
        let hunks = parse_patch("*** Begin Patch\n*** Update File: nope.txt\n@@\n-a\n+b\n*** End Patch").unwrap();
        assert!(matches!(plan(dir.path(), &hunks).await, Err(PatchError::Io { .. })));
    }

    #[tokio::test]
    async fn paths_outside_the_root_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("work");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("app.txt"), "one\n").unwrap();
        let escape = dir.path().join("escape.txt");

        for patch in [
            format!("*** Begin Patch\n*** Add File: {}\n+x\n*** End Patch", escape.display()),
            "*** Begin Patch\n*** Add File: ../escape.txt\n+x\n*** End Patch".to_string(),
            "*** Begin Patch\n*** Delete File: nested/../../escape.txt\n*** End Patch".to_string(),
            "*** Begin Patch\n*** Update File: app.txt\n*** Move to: ../escape.txt\n@@\n-one\n+two\n*** End Patch"
                .to_string(),
        ] {
            let hunks = parse_patch(&patch).unwrap();
            let err = plan(&root, &hunks).await.unwrap_err();
            assert!(
                matches!(&err, PatchError::Invalid(message) if message.contains("escapes the working directory")),
                "{err}"
            );
        }
        assert!(!escape.exists());
    }

    #[tokio::test]
    async fn dot_segments_inside_the_root_are_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let hunks = parse_patch("*** Begin Patch\n*** Add File: ./a/../b/new.txt\n+hi\n*** End Patch").unwrap();
        let changes = plan(dir.path(), &hunks).await.unwrap();
        assert_eq!(changes[0].target(), dir.path().join("b/new.txt").as_path());
    }
}
