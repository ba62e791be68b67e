// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Job caches
//!
//! A cache is a keyed host-side directory bound into the container
//! across jobs. String keys are variable-expanded; `key:files` keys are
//! derived from the BLAKE3 hash of the named files' contents. Access is
//! serialized per key so concurrent jobs sharing a cache never race on
//! directory setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::{CilocalError, CilocalResult};
use crate::pipeline::job::{CacheKey, JobCache};
use crate::variables::{expand_text, Scope};

/// Root of the shared host-side cache
pub const HOST_CACHE_ROOT: &str = "/tmp/gitlab-ci-local/cache";

/// Compute the concrete cache key for a job.
pub fn cache_key(cache: &JobCache, scope: &Scope, cwd: &Path) -> CilocalResult<String> {
    match &cache.key {
        CacheKey::Literal(key) => {
            let key = expand_text(key, scope);
            Ok(sanitize_key(&key))
        }
        CacheKey::Files(files) => {
            let mut hasher = blake3::Hasher::new();
            // Sorted so the key is independent of declaration order.
            let mut files = files.clone();
            files.sort();
            for file in &files {
                let path = cwd.join(file);
                let content =
                    std::fs::read(&path).map_err(|e| CilocalError::FileReadError {
                        path: path.clone(),
                        error: e.to_string(),
                    })?;
                hasher.update(file.as_bytes());
                hasher.update(&content);
            }
            let hex = hasher.finalize().to_hex().to_string();
            Ok(hex[..16].to_string())
        }
    }
}

/// Host directory backing one cache key.
pub fn host_cache_dir(key: &str) -> PathBuf {
    Path::new(HOST_CACHE_ROOT).join(key)
}

/// A cache key must survive as a single path component.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Process-level advisory locks, one per cache key.
#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, creating it on first use. The guard is
    /// held across the whole cache-touching section of a job.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::JobCache;
    use tempfile::TempDir;

    fn scope(pairs: &[(&str, &str)]) -> Scope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_literal_key_is_expanded() {
        let cache = JobCache {
            key: CacheKey::Literal("$CI_COMMIT_REF_SLUG".into()),
            paths: vec!["node_modules/".into()],
        };
        let key = cache_key(&cache, &scope(&[("CI_COMMIT_REF_SLUG", "main")]), Path::new("."))
            .unwrap();
        assert_eq!(key, "main");
    }

    #[test]
    fn test_key_with_slash_is_sanitized() {
        let cache = JobCache {
            key: CacheKey::Literal("feature/login".into()),
            paths: vec!["target/".into()],
        };
        let key = cache_key(&cache, &scope(&[]), Path::new(".")).unwrap();
        assert_eq!(key, "feature_login");
    }

    #[test]
    fn test_files_key_tracks_content() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.lock"), "v1").unwrap();

        let cache = JobCache {
            key: CacheKey::Files(vec!["Cargo.lock".into()]),
            paths: vec!["target/".into()],
        };

        let key1 = cache_key(&cache, &scope(&[]), tmp.path()).unwrap();
        let key2 = cache_key(&cache, &scope(&[]), tmp.path()).unwrap();
        assert_eq!(key1, key2);

        std::fs::write(tmp.path().join("Cargo.lock"), "v2").unwrap();
        let key3 = cache_key(&cache, &scope(&[]), tmp.path()).unwrap();
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_files_key_missing_file_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let cache = JobCache {
            key: CacheKey::Files(vec!["nope.lock".into()]),
            paths: vec!["target/".into()],
        };
        assert!(cache_key(&cache, &scope(&[]), tmp.path()).is_err());
    }

    #[tokio::test]
    async fn test_key_locks_serialize_same_key() {
        let locks = Arc::new(KeyLocks::new());

        let guard = locks.lock("shared").await;
        let locks2 = locks.clone();
        let contender = tokio::spawn(async move {
            let _guard = locks2.lock("shared").await;
        });

        // Other keys stay independent.
        let _other = locks.lock("different").await;

        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
