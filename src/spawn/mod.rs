// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Process spawner
//!
//! All external processes (git, docker, rsync, cp) go through this module.
//! Commands run under a POSIX shell with stdin detached and both output
//! streams captured in full.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::errors::{CilocalError, CilocalResult};

/// Delay between child exit and resolution, so OS-buffered output flushes.
const FLUSH_DELAY: Duration = Duration::from_millis(10);

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct SpawnedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SpawnedOutput {
    /// Both streams joined, stdout first
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `cmd` under `sh -c`, failing on non-zero exit.
///
/// The error message carries the combined output so callers can surface
/// tool diagnostics without re-running anything.
pub async fn spawn(
    cmd: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> CilocalResult<SpawnedOutput> {
    let output = spawn_unchecked(cmd, cwd, env).await?;

    if !output.success() {
        return Err(CilocalError::CommandFailed {
            command: cmd.to_string(),
            exit_code: output.exit_code,
            output: output.combined(),
        });
    }

    Ok(output)
}

/// Run `cmd` under `sh -c` and return the output whatever the exit code.
///
/// Used where a non-zero exit is an answer rather than a failure, e.g.
/// probing whether an image is present locally.
pub async fn spawn_unchecked(
    cmd: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> CilocalResult<SpawnedOutput> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (k, v) in env {
        command.env(k, v);
    }

    let output = command.output().await.map_err(|e| CilocalError::Io {
        message: format!("failed to spawn '{}': {}", cmd, e),
    })?;

    // Let late writes land before we resolve.
    tokio::time::sleep(FLUSH_DELAY).await;

    Ok(SpawnedOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_captures_stdout() {
        let out = spawn("echo hello", Path::new("."), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_spawn_env_is_passed() {
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi there".to_string());
        let out = spawn("echo \"$GREETING\"", Path::new("."), &env)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi there");
    }

    #[tokio::test]
    async fn test_spawn_failure_carries_output() {
        let err = spawn("echo oops >&2; exit 3", Path::new("."), &HashMap::new())
            .await
            .unwrap_err();
        match err {
            CilocalError::CommandFailed {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_unchecked_tolerates_failure() {
        let out = spawn_unchecked("exit 7", Path::new("."), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn test_spawn_stdin_is_closed() {
        // `cat` would hang forever on an open stdin
        let out = spawn("cat", Path::new("."), &HashMap::new()).await.unwrap();
        assert_eq!(out.stdout, "");
    }
}
