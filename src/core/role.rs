//! Specialized agent roles.
//!
//! Each role selects the system instructions, the user-prompt layout and the
//! default file extension for artifacts it produces. The scheduler and the
//! resilience layer never look at the role.

use crate::core::artifact::Artifact;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of specialized behaviours a task can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ProductManager,
    Architect,
    Developer,
    Tester,
    Reviewer,
    DevOps,
    TechWriter,
}

impl Role {
    /// All roles, in pipeline order.
    pub const ALL: [Role; 7] = [
        Role::ProductManager,
        Role::Architect,
        Role::Developer,
        Role::Tester,
        Role::Reviewer,
        Role::DevOps,
        Role::TechWriter,
    ];

    /// Extension used when a generated file carries no name of its own.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Role::ProductManager | Role::Architect | Role::Reviewer | Role::TechWriter => "md",
            Role::Developer | Role::Tester => "py",
            Role::DevOps => "yml",
        }
    }

    /// System instructions sent with every request for this role.
    pub fn system_instructions(&self) -> &'static str {
        match self {
            Role::ProductManager => {
                "You are a product manager. Turn the request into concise requirements \
                 with acceptance criteria."
            }
            Role::Architect => {
                "You are a software architect. Describe components, interfaces and data flow."
            }
            Role::Developer => {
                "You are a software developer. Produce complete source files. Precede each \
                 file with a line `File: <path>` followed by a fenced code block."
            }
            Role::Tester => {
                "You are a test engineer. Produce complete test files. Precede each file \
                 with a line `File: <path>` followed by a fenced code block."
            }
            Role::Reviewer => {
                "You are a code reviewer. List concrete defects. End with a line \
                 `OUTCOME: continue` or `OUTCOME: needs-review`."
            }
            Role::DevOps => {
                "You are a DevOps engineer. Produce build and deployment configuration files."
            }
            Role::TechWriter => {
                "You are a technical writer. Produce user-facing documentation in Markdown."
            }
        }
    }

    /// Build the user prompt for a task.
    ///
    /// The task description comes first, then the context map in key order,
    /// then every upstream artifact as a `File:` block.
    pub fn build_user_prompt(
        &self,
        description: &str,
        context: &BTreeMap<String, String>,
        inputs: &[Artifact],
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("## Task ({})\n{}\n", self, description.trim()));

        if !context.is_empty() {
            prompt.push_str("\n## Context\n");
            for (key, value) in context {
                prompt.push_str(&format!("- {}: {}\n", key, value));
            }
        }

        if !inputs.is_empty() {
            prompt.push_str("\n## Existing files\n");
            for artifact in inputs {
                prompt.push_str(&format!(
                    "\nFile: {}\n```\n{}\n```\n",
                    artifact.path,
                    artifact.content.trim_end()
                ));
            }
        }

        prompt
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::ProductManager => write!(f, "product_manager"),
            Role::Architect => write!(f, "architect"),
            Role::Developer => write!(f, "developer"),
            Role::Tester => write!(f, "tester"),
            Role::Reviewer => write!(f, "reviewer"),
            Role::DevOps => write!(f, "dev_ops"),
            Role::TechWriter => write!(f, "tech_writer"),
        }
    }
}
