// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Shell-mode workspace
//!
//! Jobs without an image run against a per-job copy of the working tree
//! under `.gitlab-ci-local/builds/`. The copy honors `.gitignore` and
//! never includes `.git/` or cilocal's own state directory.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::errors::{CilocalError, CilocalResult};
use crate::spawn::{spawn, spawn_unchecked};

/// Workspace directory for one job.
pub fn workspace_dir(cwd: &Path, safe_name: &str) -> PathBuf {
    cwd.join(".gitlab-ci-local").join("builds").join(safe_name)
}

/// Mirror the working tree into the job workspace.
pub async fn prepare_workspace(cwd: &Path, safe_name: &str) -> CilocalResult<PathBuf> {
    let rsync = spawn_unchecked("rsync --version", cwd, &HashMap::new()).await?;
    if !rsync.success() {
        return Err(CilocalError::ToolMissing {
            tool: "rsync".to_string(),
            help: "Install rsync; it is used to populate job workspaces".to_string(),
        });
    }

    let target = workspace_dir(cwd, safe_name);
    std::fs::create_dir_all(&target)?;

    let cmd = format!(
        "rsync -a --delete --exclude=.git --exclude=.gitlab-ci-local --filter=':- .gitignore' ./ {}/",
        crate::engine::script::shell_quote(&target.to_string_lossy())
    );
    spawn(&cmd, cwd, &HashMap::new()).await?;

    Ok(target)
}

/// Write a phase script into the workspace, executable.
pub fn write_script(workspace: &Path, name: &str, content: &str) -> CilocalResult<PathBuf> {
    let path = workspace.join(name);
    std::fs::write(&path, content).map_err(|e| CilocalError::FileWriteError {
        path: path.clone(),
        error: e.to_string(),
    })?;

    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_script_is_executable() {
        let tmp = TempDir::new().unwrap();
        let path = write_script(tmp.path(), "gcl-init", "echo hi\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "echo hi\n");
    }

    #[tokio::test]
    async fn test_prepare_workspace_copies_tree() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("hello.txt"), "hi").unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git").join("HEAD"), "ref").unwrap();

        let ws = prepare_workspace(tmp.path(), "job").await.unwrap();

        assert!(ws.join("hello.txt").exists());
        assert!(!ws.join(".git").exists());
    }

    #[tokio::test]
    async fn test_prepare_workspace_honors_gitignore() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".gitignore"), "ignored.txt\n").unwrap();
        std::fs::write(tmp.path().join("ignored.txt"), "x").unwrap();
        std::fs::write(tmp.path().join("kept.txt"), "x").unwrap();

        let ws = prepare_workspace(tmp.path(), "job").await.unwrap();

        assert!(ws.join("kept.txt").exists());
        assert!(!ws.join("ignored.txt").exists());
    }

    #[tokio::test]
    async fn test_workspace_is_isolated_from_state_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("src.txt"), "x").unwrap();
        std::fs::create_dir_all(tmp.path().join(".gitlab-ci-local").join("output")).unwrap();

        let ws = prepare_workspace(tmp.path(), "job").await.unwrap();

        assert!(!ws.join(".gitlab-ci-local").exists());
    }
}
