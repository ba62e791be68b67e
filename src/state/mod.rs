// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Persistent per-working-tree state
//!
//! Currently just the pipeline instance counter. The file is rewritten
//! atomically (write-temp-then-rename) so a crashed run never leaves a
//! truncated state behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CilocalError, CilocalResult};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    pipeline_iid: u64,
}

fn state_path(cwd: &Path) -> PathBuf {
    cwd.join(".gitlab-ci-local").join("state.json")
}

/// Read the last pipeline iid for this working tree, 0 when none.
pub fn current_pipeline_iid(cwd: &Path) -> CilocalResult<u64> {
    let path = state_path(cwd);
    if !path.exists() {
        return Ok(0);
    }

    let content = std::fs::read_to_string(&path).map_err(|e| CilocalError::FileReadError {
        path: path.clone(),
        error: e.to_string(),
    })?;
    let state: StateFile = serde_json::from_str(&content)?;
    Ok(state.pipeline_iid)
}

/// Increment and persist the pipeline iid, returning the new value.
pub fn next_pipeline_iid(cwd: &Path) -> CilocalResult<u64> {
    let iid = current_pipeline_iid(cwd)? + 1;

    let path = state_path(cwd);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(&StateFile { pipeline_iid: iid })?;
    std::fs::write(&tmp, json).map_err(|e| CilocalError::FileWriteError {
        path: tmp.clone(),
        error: e.to_string(),
    })?;
    std::fs::rename(&tmp, &path).map_err(|e| CilocalError::FileWriteError {
        path: path.clone(),
        error: e.to_string(),
    })?;

    Ok(iid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_iid_starts_at_one() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(current_pipeline_iid(tmp.path()).unwrap(), 0);
        assert_eq!(next_pipeline_iid(tmp.path()).unwrap(), 1);
    }

    #[test]
    fn test_iid_is_monotonic_across_calls() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(next_pipeline_iid(tmp.path()).unwrap(), 1);
        assert_eq!(next_pipeline_iid(tmp.path()).unwrap(), 2);
        assert_eq!(next_pipeline_iid(tmp.path()).unwrap(), 3);
        assert_eq!(current_pipeline_iid(tmp.path()).unwrap(), 3);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        next_pipeline_iid(tmp.path()).unwrap();
        let dir = tmp.path().join(".gitlab-ci-local");
        let names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.json"]);
    }
}
