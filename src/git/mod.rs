// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Git metadata probe
//!
//! Reads commit, ref and identity information from the working tree. The
//! predefined `CI_*` variable set is derived entirely from this data, so
//! missing metadata is a fatal compile-time error.

use std::collections::HashMap;
use std::path::Path;

use crate::errors::{CilocalError, CilocalResult};
use crate::spawn::{spawn, spawn_unchecked};

/// Parsed `origin` remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    pub domain: String,
    /// Group path, possibly nested (`group/subgroup`)
    pub group: String,
    pub project: String,
}

impl GitRemote {
    /// Parse an SSH or HTTPS remote URL.
    ///
    /// Accepted forms:
    /// - `git@host:group/project.git`
    /// - `ssh://git@host/group/project.git`
    /// - `https://host/group/project.git`
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim();

        let rest = if let Some(rest) = url.strip_prefix("https://") {
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("http://") {
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("ssh://") {
            let rest = rest.strip_prefix("git@").unwrap_or(rest);
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("git@") {
            // scp-like syntax: host:path
            rest.replacen(':', "/", 1)
        } else {
            return None;
        };

        let mut parts = rest.split('/');
        let domain = parts.next()?.to_string();
        let path: Vec<&str> = parts.filter(|p| !p.is_empty()).collect();
        if domain.is_empty() || path.len() < 2 {
            return None;
        }

        let project = path.last()?.trim_end_matches(".git").to_string();
        let group = path[..path.len() - 1].join("/");

        Some(Self {
            domain,
            group,
            project,
        })
    }

    /// `group/project`
    pub fn path(&self) -> String {
        format!("{}/{}", self.group, self.project)
    }
}

/// Everything the compiler needs to know about the working tree
#[derive(Debug, Clone)]
pub struct GitInfo {
    pub user_name: String,
    pub user_email: String,
    /// Branch or tag name
    pub ref_name: String,
    /// True when HEAD is exactly on a tag
    pub is_tag: bool,
    pub sha: String,
    pub short_sha: String,
    pub commit_title: String,
    pub commit_message: String,
    pub commit_description: String,
    pub remote: GitRemote,
}

impl GitInfo {
    /// Probe the repository at `cwd`.
    pub async fn probe(cwd: &Path) -> CilocalResult<Self> {
        let env = HashMap::new();

        let version = spawn_unchecked("git --version", cwd, &env).await?;
        if !version.success() {
            return Err(CilocalError::git_missing_binary());
        }

        let inside = spawn_unchecked("git rev-parse --is-inside-work-tree", cwd, &env).await?;
        if !inside.success() {
            return Err(CilocalError::GitMissing {
                what: "not a git repository".to_string(),
            });
        }

        let user_name = git_value(cwd, "git config user.name", "user.name").await?;
        let user_email = git_value(cwd, "git config user.email", "user.email").await?;
        let sha = git_value(cwd, "git rev-parse HEAD", "HEAD commit").await?;
        let short_sha = git_value(cwd, "git rev-parse --short=8 HEAD", "short commit SHA").await?;
        let commit_title = git_value(cwd, "git log -1 --format=%s", "commit title").await?;

        let message = spawn("git log -1 --format=%B", cwd, &env).await?;
        let commit_message = message.stdout.trim_end().to_string();
        let commit_description = commit_message
            .split_once('\n')
            .map(|(_, rest)| rest.trim_start_matches('\n').to_string())
            .unwrap_or_default();

        // Tag if HEAD matches one exactly, branch name otherwise.
        let tag = spawn_unchecked("git describe --tags --exact-match", cwd, &env).await?;
        let (ref_name, is_tag) = if tag.success() && !tag.stdout.trim().is_empty() {
            (tag.stdout.trim().to_string(), true)
        } else {
            let branch =
                git_value(cwd, "git rev-parse --abbrev-ref HEAD", "current branch").await?;
            (branch, false)
        };

        let remote_url = git_value(cwd, "git remote get-url origin", "origin remote").await?;
        let remote = GitRemote::parse(&remote_url).ok_or_else(|| CilocalError::GitMissing {
            what: format!("cannot parse origin remote '{remote_url}'"),
        })?;

        Ok(Self {
            user_name,
            user_email,
            ref_name,
            is_tag,
            sha,
            short_sha,
            commit_title,
            commit_message,
            commit_description,
            remote,
        })
    }
}

/// Run a git command and require non-empty trimmed output.
async fn git_value(cwd: &Path, cmd: &str, what: &str) -> CilocalResult<String> {
    let out = spawn_unchecked(cmd, cwd, &HashMap::new()).await?;
    let value = out.stdout.trim().to_string();

    if !out.success() || value.is_empty() {
        return Err(CilocalError::GitMissing {
            what: what.to_string(),
        });
    }

    Ok(value)
}
