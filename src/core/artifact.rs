//! Artifacts extracted from generated text.

use crate::core::role::Role;
use crate::core::task::TaskId;
use serde::{Deserialize, Serialize};

/// A named piece of generated content destined to become a file.
///
/// `path` is always relative and free of `..` segments; the extractor
/// guarantees this before an artifact is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Logical file path, relative to the output root.
    pub path: String,
    /// File content.
    pub content: String,
    /// Task whose response produced this artifact.
    pub producing_task_id: TaskId,
    /// Role of the producing task.
    pub role: Role,
}

impl Artifact {
    pub fn new(
        path: impl Into<String>,
        content: impl Into<String>,
        producing_task_id: TaskId,
        role: Role,
    ) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            producing_task_id,
            role,
        }
    }

    /// Number of lines in the content.
    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }
}
