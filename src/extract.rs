//! Artifact extraction from generated text.
//!
//! Turns a raw response into an ordered list of named file artifacts. The
//! transform is pure and deterministic: no disk or network access, and the
//! same text always yields the same artifacts.
//!
//! ## Naming rules
//!
//! A fenced block takes its path from, in order:
//! - **The fence line**: ` ```python:src/app.py `, ` ```src/app.py `,
//!   ` ```rust filename=src/lib.rs ` or ` ```py title="a.py" `
//! - **The first line inside the fence**: a comment such as `# file: app.py`
//!   or `// src/index.js`
//! - **A `File: <path>` marker** on the line before the fence (blank lines allowed)
//!
//! Blocks without a discoverable path are used only when the response has
//! no named block at all; they are named `<task>.<ext>`, `<task>_2.<ext>`
//! and so on. A response without any fence becomes a single `<task>.md`.
//! When a path repeats, the first block wins.
//!
//! ## Example
//!
//! ```
//! use conductor::core::{Role, TaskId};
//! use conductor::extract::extract_artifacts;
//!
//! let text = "File: app.py\n```python\nprint('hi')\n```\n";
//! let artifacts = extract_artifacts(text, &TaskId::from("build"), Role::Developer);
//! assert_eq!(artifacts.len(), 1);
//! assert_eq!(artifacts[0].path, "app.py");
//! assert_eq!(artifacts[0].content, "print('hi')\n");
//! ```

use crate::core::{Artifact, Role, TaskId};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Opening fence: three or more backticks or tildes, then the info string.
static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(`{3,}|~{3,})\s*(.*?)\s*$").unwrap());

/// `File: path`, `**File:** path`, `### Filename: path`
static FILE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s+)?[*_]{0,2}(?:file|filename|path)[*_]{0,2}\s*:\s*[*_]{0,2}\s*(.+?)\s*$")
        .unwrap()
});

/// A leading comment that names the file: `# file: app.py`, `// src/a.ts`, `<!-- index.html -->`
static COMMENT_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?://|#|--|;|/\*|<!--)\s*(?:(?:file|filename|path)\s*:?\s*)?([\w][\w./-]*\.[A-Za-z0-9]+)\s*(?:\*/|-->)?\s*$",
    )
    .unwrap()
});

/// `key=value` attribute in a fence info string.
static INFO_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:file|filename|path|title)\s*=\s*(?:"([^"]+)"|'([^']+)'|(\S+))"#).unwrap()
});

/// File names without an extension that are still clearly files.
const BARE_FILE_NAMES: &[&str] = &["Dockerfile", "Makefile", "Procfile", "Justfile", "LICENSE"];

/// Fallback artifact extension for a fence language tag.
fn extension_for_language(lang: &str) -> Option<&'static str> {
    let ext = match lang.to_ascii_lowercase().as_str() {
        "python" | "py" | "python3" => "py",
        "rust" | "rs" => "rs",
        "javascript" | "js" | "node" => "js",
        "typescript" | "ts" => "ts",
        "tsx" => "tsx",
        "jsx" => "jsx",
        "go" | "golang" => "go",
        "java" => "java",
        "kotlin" | "kt" => "kt",
        "c" => "c",
        "cpp" | "c++" | "cc" => "cpp",
        "csharp" | "cs" | "c#" => "cs",
        "ruby" | "rb" => "rb",
        "php" => "php",
        "swift" => "swift",
        "bash" | "sh" | "shell" | "zsh" => "sh",
        "yaml" | "yml" => "yml",
        "json" => "json",
        "toml" => "toml",
        "ini" => "ini",
        "xml" => "xml",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        "markdown" | "md" => "md",
        "text" | "txt" | "plaintext" => "txt",
        _ => return None,
    };
    Some(ext)
}

/// Normalize a candidate path, or reject it.
///
/// Quotes and backticks are stripped, `\` becomes `/`, leading `/` and
/// `./` are removed and empty or `.` segments dropped. Any `..` segment
/// rejects the path.
pub fn sanitize_path(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_matches(|c| matches!(c, '`' | '"' | '\'' | '*'))
        .trim()
        .replace('\\', "/");

    if cleaned.is_empty() || cleaned.chars().any(|c| c.is_control()) {
        return None;
    }

    let mut segments = Vec::new();
    for segment in cleaned.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Whether a single info-string token names a file rather than a language.
fn looks_like_path(token: &str) -> bool {
    if token.contains('/') {
        return true;
    }
    if BARE_FILE_NAMES.contains(&token) {
        return true;
    }
    match token.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 10
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Language tag and path parsed from a fence info string.
#[derive(Debug, Default, PartialEq, Eq)]
struct FenceInfo {
    lang: Option<String>,
    path: Option<String>,
}

fn parse_info(info: &str) -> FenceInfo {
    let mut result = FenceInfo::default();
    let info = info.trim();
    if info.is_empty() {
        return result;
    }

    if let Some(caps) = INFO_ATTR_RE.captures(info) {
        let value = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str());
        result.path = value.map(str::to_string);
    }

    let mut tokens = info.split_whitespace();
    if let Some(first) = tokens.next() {
        if let Some((lang, path)) = first.split_once(':') {
            if !lang.is_empty() && !path.is_empty() {
                result.lang = Some(lang.to_string());
                result.path.get_or_insert_with(|| path.to_string());
                return result;
            }
        }
        if looks_like_path(first) && !first.contains('=') {
            result.path.get_or_insert_with(|| first.to_string());
        } else if !first.contains('=') {
            result.lang = Some(first.to_string());
        }
    }

    if result.path.is_none() {
        result.path = tokens
            .find(|t| !t.contains('=') && looks_like_path(t))
            .map(str::to_string);
    }
    result
}

/// One fenced block as found in the text.
#[derive(Debug)]
struct Block {
    path: Option<String>,
    lang: Option<String>,
    content: String,
}

fn is_closing_fence(line: &str, fence: &str) -> bool {
    let trimmed = line.trim();
    let Some(ch) = fence.chars().next() else {
        return false;
    };
    trimmed.len() >= fence.len() && trimmed.chars().all(|c| c == ch)
}

fn scan_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut marker: Option<String> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        let Some(caps) = FENCE_OPEN_RE.captures(line) else {
            if let Some(m) = FILE_MARKER_RE.captures(line) {
                marker = m.get(1).map(|p| p.as_str().to_string());
            } else if !line.trim().is_empty() {
                marker = None;
            }
            i += 1;
            continue;
        };

        let fence = caps.get(1).map(|m| m.as_str()).unwrap_or("```");
        let info = parse_info(caps.get(2).map(|m| m.as_str()).unwrap_or(""));

        let mut body = Vec::new();
        i += 1;
        while i < lines.len() && !is_closing_fence(lines[i], fence) {
            body.push(lines[i]);
            i += 1;
        }
        // Skip the closing fence; an unclosed block runs to the end.
        i += 1;

        let comment_path = body
            .first()
            .and_then(|first| COMMENT_PATH_RE.captures(first))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        let path = [info.path, comment_path, marker.take()]
            .into_iter()
            .flatten()
            .find_map(|candidate| sanitize_path(&candidate));

        let mut content = body.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        blocks.push(Block {
            path,
            lang: info.lang,
            content,
        });
    }

    blocks
}

fn file_stem(task_id: &TaskId) -> String {
    let stem: String = task_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        "output".to_string()
    } else {
        stem.to_string()
    }
}

/// Extract file artifacts from generated text.
///
/// Artifacts are returned in order of appearance. Blank text yields an
/// empty list; non-blank text without fences is never dropped.
pub fn extract_artifacts(text: &str, task_id: &TaskId, role: Role) -> Vec<Artifact> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let blocks = scan_blocks(text);
    let stem = file_stem(task_id);
    let make = |path: String, content: String| Artifact::new(path, content, task_id.clone(), role);

    if blocks.is_empty() {
        let mut content = text.trim().to_string();
        content.push('\n');
        return vec![make(format!("{}.md", stem), content)];
    }

    let has_named = blocks.iter().any(|b| b.path.is_some());
    let mut seen = HashSet::new();
    let mut artifacts = Vec::new();

    if has_named {
        for block in blocks {
            if let Some(path) = block.path {
                if seen.insert(path.clone()) {
                    artifacts.push(make(path, block.content));
                }
            }
        }
        return artifacts;
    }

    let mut ordinal = 0;
    for block in blocks {
        if block.content.trim().is_empty() {
            continue;
        }
        ordinal += 1;
        let ext = block
            .lang
            .as_deref()
            .and_then(extension_for_language)
            .unwrap_or_else(|| role.default_extension());
        let path = if ordinal == 1 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{}_{}.{}", stem, ordinal, ext)
        };
        if seen.insert(path.clone()) {
            artifacts.push(make(path, block.content));
        }
    }
    artifacts
}
