// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Error types
//!
//! Everything that can go wrong while compiling or running a pipeline,
//! split by the point in the lifecycle where it surfaces: configuration
//! errors abort before any job starts, runtime errors abort the affected
//! job, cleanup problems are downgraded to warnings by the engine.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for cilocal operations
pub type CilocalResult<T> = Result<T, CilocalError>;

/// Main error type for cilocal
#[derive(Error, Debug, Diagnostic)]
pub enum CilocalError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Job name '{name}' is not allowed: {reason}")]
    #[diagnostic(code(cilocal::invalid_job_name))]
    InvalidJobName { name: String, reason: String },

    #[error("Job '{job}' references unknown stage '{stage}'")]
    #[diagnostic(
        code(cilocal::unknown_stage),
        help("Declare '{stage}' in the top-level stages: list")
    )]
    UnknownStage { job: String, stage: String },

    #[error("[ {} ] jobs are needed by {job}, but they cannot be found", missing.join(", "))]
    #[diagnostic(code(cilocal::unknown_needs))]
    UnknownNeeds { job: String, missing: Vec<String> },

    #[error("Invalid rule expression '{expression}': {message}")]
    #[diagnostic(
        code(cilocal::rule_syntax),
        help("Supported: $VAR, quoted strings, null, /regex/, ==, !=, =~, !~, && and ||")
    )]
    RuleSyntax { expression: String, message: String },

    #[error("Job '{job}' is invalid: {reason}")]
    #[diagnostic(code(cilocal::invalid_job))]
    InvalidJob { job: String, reason: String },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(cilocal::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Circular include chain: {}", trace.join(" -> "))]
    #[diagnostic(code(cilocal::include_cycle))]
    IncludeCycle { trace: Vec<String> },

    #[error("Circular extends chain: {}", trace.join(" -> "))]
    #[diagnostic(code(cilocal::extends_cycle))]
    ExtendsCycle { trace: Vec<String> },

    #[error("Job '{job}' extends unknown job '{base}'")]
    #[diagnostic(code(cilocal::unknown_extends))]
    UnknownExtends { job: String, base: String },

    #[error("Failed to resolve include '{target}': {message}")]
    #[diagnostic(code(cilocal::include_failed))]
    IncludeFailed { target: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Runtime Dependencies
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Required tool '{tool}' is not available")]
    #[diagnostic(code(cilocal::tool_missing), help("{help}"))]
    ToolMissing { tool: String, help: String },

    #[error("Git metadata is missing: {what}")]
    #[diagnostic(
        code(cilocal::git_missing),
        help("cilocal must run inside a git repository with a configured user and origin remote")
    )]
    GitMissing { what: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Command failed (exit {exit_code}): {command}")]
    #[diagnostic(code(cilocal::command_failed))]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Job '{job}' needs artifacts from '{dependency}' which are not on disk")]
    #[diagnostic(
        code(cilocal::artifacts_missing),
        help("Run '{dependency}' first, or pass --needs to run predecessors automatically")
    )]
    ArtifactsMissing { job: String, dependency: String },

    #[error("Pipeline was cancelled")]
    #[diagnostic(code(cilocal::cancelled))]
    Cancelled,

    // ─────────────────────────────────────────────────────────────────────────
    // File Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(cilocal::pipeline_not_found),
        help("Create a .gitlab-ci.yml in the working tree, or pass --cwd")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(cilocal::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(cilocal::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(cilocal::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(cilocal::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(cilocal::json_error))]
    Json { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(cilocal::glob_error))]
    GlobPattern { message: String },

    #[error("Invalid regex: {message}")]
    #[diagnostic(code(cilocal::regex_error))]
    Regex { message: String },

    #[error("HTTP request failed: {message}")]
    #[diagnostic(code(cilocal::http_error))]
    Http { message: String },
}

impl From<std::io::Error> for CilocalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for CilocalError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for CilocalError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<glob::PatternError> for CilocalError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl From<regex::Error> for CilocalError {
    fn from(e: regex::Error) -> Self {
        Self::Regex { message: e.to_string() }
    }
}

impl From<reqwest::Error> for CilocalError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http { message: e.to_string() }
    }
}

impl CilocalError {
    /// Container runtime missing, with an installation hint
    pub fn docker_missing() -> Self {
        Self::ToolMissing {
            tool: "docker".to_string(),
            help: "Install Docker and ensure the daemon is running: https://docs.docker.com/get-docker/"
                .to_string(),
        }
    }

    /// Git binary missing
    pub fn git_missing_binary() -> Self {
        Self::ToolMissing {
            tool: "git".to_string(),
            help: "Install git and ensure it is in your PATH".to_string(),
        }
    }
}
