// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Job descriptors and runtime state
//!
//! A [`Job`] is immutable once compiled; a [`JobRun`] tracks one
//! execution of it. The scheduler owns all runs for the lifetime of an
//! invocation.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::errors::{CilocalError, CilocalResult};
use crate::variables::Scope;

/// When a job runs relative to its predecessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    OnSuccess,
    OnFailure,
    Always,
    Never,
    Manual,
}

impl When {
    pub fn parse(s: &str) -> CilocalResult<Self> {
        match s {
            "on_success" => Ok(Self::OnSuccess),
            "on_failure" => Ok(Self::OnFailure),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "manual" => Ok(Self::Manual),
            other => Err(CilocalError::InvalidPipeline {
                reason: format!("invalid when value '{other}'"),
                help: Some(
                    "expected one of: on_success, on_failure, always, never, manual".to_string(),
                ),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
            Self::Always => "always",
            Self::Never => "never",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for When {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved container image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobImage {
    /// Image name, always carrying a tag
    pub name: String,
    pub entrypoint: Option<Vec<String>>,
}

impl JobImage {
    /// Normalize an image name, defaulting the tag to `:latest`.
    pub fn new(name: &str, entrypoint: Option<Vec<String>>) -> Self {
        let tail = name.rsplit('/').next().unwrap_or(name);
        let name = if tail.contains(':') {
            name.to_string()
        } else {
            format!("{name}:latest")
        };
        Self { name, entrypoint }
    }
}

/// Resolved cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Literal(String),
    Files(Vec<String>),
}

/// Resolved cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCache {
    pub key: CacheKey,
    pub paths: Vec<String>,
}

/// An immutable compiled job descriptor
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    /// Filesystem-safe rewrite of `name`
    pub safe_name: String,
    /// Unique within one pipeline; part of volume names
    pub job_id: u64,
    pub stage: String,
    pub image: Option<JobImage>,
    pub scripts: Vec<String>,
    pub before_scripts: Vec<String>,
    pub after_scripts: Vec<String>,
    /// Explicit predecessors; `Some(vec![])` means none at all
    pub needs: Option<Vec<String>>,
    pub artifact_paths: Vec<String>,
    pub cache: Option<JobCache>,
    /// The fully composed and expanded job scope
    pub variables: Scope,
    pub interactive: bool,
    pub inject_ssh_agent: bool,
    pub coverage: Option<String>,
    /// Mutated to the rule outcome during compilation
    pub when: When,
    /// Mutated to the rule outcome during compilation
    pub allow_failure: bool,
}

impl Job {
    pub fn is_manual(&self) -> bool {
        self.when == When::Manual
    }

    pub fn is_never(&self) -> bool {
        self.when == When::Never
    }
}

/// Lifecycle states of one job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Eligible,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Manual,
    WarnedFailure,
}

impl JobState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Manual | Self::WarnedFailure
        )
    }

    /// A terminal state that does not block successors.
    pub fn unblocks_successors(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::WarnedFailure | Self::Skipped | Self::Manual
        )
    }

    /// Counts as pipeline success.
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::WarnedFailure | Self::Skipped | Self::Manual
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Eligible => "eligible",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Manual => "manual",
            Self::WarnedFailure => "warned",
        };
        write!(f, "{s}")
    }
}

/// Mutable runtime state of one job execution
#[derive(Debug, Clone)]
pub struct JobRun {
    pub state: JobState,
    /// Exit code of before_script + script, `None` until done
    pub prescript_exit: Option<i32>,
    /// Exit code of after_script, `None` when absent or not run
    pub afterscript_exit: Option<i32>,
    /// First captured coverage value, e.g. `"82.5"`
    pub coverage: Option<String>,
    pub container_id: Option<String>,
    pub artifacts_container_id: Option<String>,
    pub volume_name: Option<String>,
    pub started_at: Option<Instant>,
}

impl JobRun {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            prescript_exit: None,
            afterscript_exit: None,
            coverage: None,
            container_id: None,
            artifacts_container_id: None,
            volume_name: None,
            started_at: None,
        }
    }
}

impl Default for JobRun {
    fn default() -> Self {
        Self::new(JobState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_when_parse_round_trip() {
        for s in ["on_success", "on_failure", "always", "never", "manual"] {
            assert_eq!(When::parse(s).unwrap().as_str(), s);
        }
        assert!(When::parse("sometimes").is_err());
    }

    #[test]
    fn test_image_tag_defaulting() {
        assert_eq!(JobImage::new("alpine", None).name, "alpine:latest");
        assert_eq!(JobImage::new("alpine:3.19", None).name, "alpine:3.19");
        // a registry port is not a tag
        assert_eq!(
            JobImage::new("registry.local:5000/tools/img", None).name,
            "registry.local:5000/tools/img:latest"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::WarnedFailure.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Pending.is_terminal());
    }

    #[test]
    fn test_failed_blocks_successors() {
        assert!(!JobState::Failed.unblocks_successors());
        assert!(JobState::Skipped.unblocks_successors());
        assert!(JobState::Manual.unblocks_successors());
    }
}
