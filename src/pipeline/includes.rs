// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Include resolution
//!
//! Resolves `include:` directives to a fixed point: local paths, remote
//! URLs, project files fetched over `git archive`, and shipped templates.
//! Downloads are cached under `.gitlab-ci-local/includes/` so repeated
//! runs work offline. Merging is shallow key-union: later includes
//! override earlier ones, the including file overrides them all.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde_yaml::Mapping;

use crate::errors::{CilocalError, CilocalResult};
use crate::pipeline::config::{IncludeItem, IncludeSpec};
use crate::spawn::spawn;

/// Resolves includes relative to one working tree
pub struct IncludeResolver {
    cwd: PathBuf,
    /// GitLab host used for `project:` includes
    domain: String,
    client: reqwest::Client,
    /// Extra environment for spawned fetch commands
    env: HashMap<String, String>,
}

impl IncludeResolver {
    pub fn new(cwd: &Path, domain: &str) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            domain: domain.to_string(),
            client: reqwest::Client::new(),
            env: HashMap::new(),
        }
    }

    /// Add an environment variable for the fetch commands.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Resolve all includes of `doc`, recursively, and merge.
    pub async fn resolve(&self, doc: Mapping) -> CilocalResult<Mapping> {
        let mut visited = Vec::new();
        self.resolve_document(doc, &mut visited).await
    }

    fn resolve_document<'a>(
        &'a self,
        mut doc: Mapping,
        visited: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = CilocalResult<Mapping>> + Send + 'a>> {
        Box::pin(async move {
            let Some(include_value) = doc.remove("include") else {
                return Ok(doc);
            };

            let spec: IncludeSpec = serde_yaml::from_value(include_value)?;
            let mut merged = Mapping::new();

            for item in spec.into_items() {
                for (identity, text) in self.fetch(&item).await? {
                    if visited.contains(&identity) {
                        let mut trace = visited.clone();
                        trace.push(identity);
                        return Err(CilocalError::IncludeCycle { trace });
                    }

                    let child = parse_mapping(&text, &identity)?;

                    visited.push(identity);
                    let child = self.resolve_document(child, visited).await?;
                    visited.pop();

                    merge_shallow(&mut merged, child);
                }
            }

            // The including file wins over everything it pulled in.
            merge_shallow(&mut merged, doc);
            Ok(merged)
        })
    }

    /// Fetch one include item, returning `(identity, content)` pairs.
    /// Project includes may name several files.
    async fn fetch(&self, item: &IncludeItem) -> CilocalResult<Vec<(String, String)>> {
        match item {
            IncludeItem::Local { local } | IncludeItem::Path(local) => {
                let path = self.cwd.join(local.trim_start_matches('/'));
                let text = read_file(&path)?;
                Ok(vec![(format!("local:{local}"), text)])
            }

            IncludeItem::Remote { remote } => {
                let text = self.fetch_remote(remote).await?;
                Ok(vec![(format!("remote:{remote}"), text)])
            }

            IncludeItem::Project {
                project,
                ref_name,
                file,
            } => {
                let ref_name = ref_name.as_deref().unwrap_or("HEAD");
                let mut out = Vec::new();
                for file in file.to_vec() {
                    let text = self.fetch_project_file(project, ref_name, &file).await?;
                    out.push((format!("project:{project}@{ref_name}:{file}"), text));
                }
                Ok(out)
            }

            IncludeItem::Template { template } => {
                let path = self.cwd.join("templates").join(template);
                let text = read_file(&path)?;
                Ok(vec![(format!("template:{template}"), text)])
            }
        }
    }

    /// Download a remote include, mirroring it into the include cache.
    /// A failed download falls back to the cached copy when one exists.
    async fn fetch_remote(&self, url: &str) -> CilocalResult<String> {
        let cache_path = self.remote_cache_path(url)?;

        let downloaded = match self.client.get(url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => Some(response.text().await?),
                Err(e) => {
                    if cache_path.exists() {
                        tracing::warn!("include download failed, using cache: {e}");
                        None
                    } else {
                        return Err(CilocalError::IncludeFailed {
                            target: url.to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            },
            Err(e) => {
                if cache_path.exists() {
                    tracing::warn!("include download failed, using cache: {e}");
                    None
                } else {
                    return Err(CilocalError::IncludeFailed {
                        target: url.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        };

        match downloaded {
            Some(text) => {
                write_cached(&cache_path, &text)?;
                Ok(text)
            }
            None => read_file(&cache_path),
        }
    }

    /// Fetch one file from another project at a ref via `git archive`.
    async fn fetch_project_file(
        &self,
        project: &str,
        ref_name: &str,
        file: &str,
    ) -> CilocalResult<String> {
        let cache_path = self
            .cwd
            .join(".gitlab-ci-local")
            .join("includes")
            .join(&self.domain)
            .join(project)
            .join(ref_name)
            .join(file);

        let quoted_ref = crate::engine::script::shell_quote(ref_name);
        let quoted_file = crate::engine::script::shell_quote(file);
        let cmd = format!(
            "git archive --remote=ssh://git@{domain}/{project}.git {quoted_ref} {quoted_file} | tar -xO {quoted_file}",
            domain = self.domain,
        );

        match spawn(&cmd, &self.cwd, &self.env).await {
            Ok(out) => {
                write_cached(&cache_path, &out.stdout)?;
                Ok(out.stdout)
            }
            Err(e) => {
                if cache_path.exists() {
                    tracing::warn!("git archive failed, using cached include: {e}");
                    read_file(&cache_path)
                } else {
                    Err(CilocalError::IncludeFailed {
                        target: format!("{project}@{ref_name}:{file}"),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    fn remote_cache_path(&self, url: &str) -> CilocalResult<PathBuf> {
        let parsed = reqwest::Url::parse(url).map_err(|e| CilocalError::IncludeFailed {
            target: url.to_string(),
            message: e.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or("unknown-host");

        let mut path = self
            .cwd
            .join(".gitlab-ci-local")
            .join("includes")
            .join(host);
        for segment in parsed.path().split('/').filter(|s| !s.is_empty()) {
            path = path.join(segment);
        }
        Ok(path)
    }
}

/// Parse YAML text into a top-level mapping.
pub fn parse_mapping(text: &str, what: &str) -> CilocalResult<Mapping> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    match value {
        serde_yaml::Value::Mapping(m) => Ok(m),
        serde_yaml::Value::Null => Ok(Mapping::new()),
        _ => Err(CilocalError::InvalidPipeline {
            reason: format!("{what} is not a YAML mapping"),
            help: None,
        }),
    }
}

/// Shallow key-union merge; `overlay` wins.
pub fn merge_shallow(base: &mut Mapping, overlay: Mapping) {
    for (k, v) in overlay {
        base.insert(k, v);
    }
}

fn read_file(path: &Path) -> CilocalResult<String> {
    std::fs::read_to_string(path).map_err(|e| CilocalError::FileReadError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

fn write_cached(path: &Path, text: &str) -> CilocalResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text).map_err(|e| CilocalError::FileWriteError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    /// Install a stub `git` that answers `archive` from a fixture
    /// directory and rejects the ref "bad-ref". Returns the PATH value
    /// that puts the stub first.
    fn install_fake_git(tmp: &Path, fixture: &Path) -> String {
        let bin = tmp.join("bin");
        std::fs::create_dir_all(&bin).unwrap();

        let script = format!(
            "#!/bin/sh\n\
             if [ \"$3\" = \"bad-ref\" ]; then\n\
                 echo 'fatal: remote ref does not exist' >&2\n\
                 exit 1\n\
             fi\n\
             cd '{}' && exec tar -cf - \"$4\"\n",
            fixture.display()
        );

        let git = bin.join("git");
        std::fs::write(&git, script).unwrap();
        let mut perms = std::fs::metadata(&git).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&git, perms).unwrap();

        format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        )
    }

    #[tokio::test]
    async fn test_local_include_merges_under_root() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "ci/lint.yml", "lint:\n  script: cargo clippy\nfmt:\n  script: cargo fmt\n");

        let root = parse_mapping(
            "include: ci/lint.yml\nfmt:\n  script: overridden\n",
            "root",
        )
        .unwrap();

        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com");
        let merged = resolver.resolve(root).await.unwrap();

        assert!(merged.get("lint").is_some());
        // root file overrides the include
        let fmt = merged.get("fmt").unwrap();
        assert_eq!(
            fmt.get("script").unwrap().as_str().unwrap(),
            "overridden"
        );
    }

    #[tokio::test]
    async fn test_nested_includes_resolve_to_fixed_point() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.yml", "include: b.yml\nfrom_a:\n  script: a\n");
        write(tmp.path(), "b.yml", "from_b:\n  script: b\n");

        let root = parse_mapping("include: a.yml\n", "root").unwrap();
        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com");
        let merged = resolver.resolve(root).await.unwrap();

        assert!(merged.get("from_a").is_some());
        assert!(merged.get("from_b").is_some());
    }

    #[tokio::test]
    async fn test_include_cycle_is_fatal() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.yml", "include: b.yml\n");
        write(tmp.path(), "b.yml", "include: a.yml\n");

        let root = parse_mapping("include: a.yml\n", "root").unwrap();
        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com");
        let err = resolver.resolve(root).await.unwrap_err();

        assert!(matches!(err, CilocalError::IncludeCycle { .. }));
    }

    #[tokio::test]
    async fn test_later_include_overrides_earlier() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "one.yml", "job:\n  script: one\n");
        write(tmp.path(), "two.yml", "job:\n  script: two\n");

        let root = parse_mapping("include:\n  - one.yml\n  - two.yml\n", "root").unwrap();
        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com");
        let merged = resolver.resolve(root).await.unwrap();

        let job = merged.get("job").unwrap();
        assert_eq!(job.get("script").unwrap().as_str().unwrap(), "two");
    }

    #[tokio::test]
    async fn test_template_include_reads_templates_dir() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "templates/Rust.yml", "rust-build:\n  script: cargo build\n");

        let root = parse_mapping("include:\n  - template: Rust.yml\n", "root").unwrap();
        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com");
        let merged = resolver.resolve(root).await.unwrap();

        assert!(merged.get("rust-build").is_some());
    }

    #[tokio::test]
    async fn test_project_include_caches_under_documented_path() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "fixture/jobs.yml",
            "remote-job:\n  script: echo remote\n",
        );
        let path = install_fake_git(tmp.path(), &tmp.path().join("fixture"));

        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com").with_env("PATH", &path);
        let root = parse_mapping(
            "include:\n  - project: widgets/templates\n    ref: v2\n    file: jobs.yml\n",
            "root",
        )
        .unwrap();
        let merged = resolver.resolve(root).await.unwrap();

        assert!(merged.get("remote-job").is_some());

        // host/project/ref/file mirror of the fetched include
        let cached = tmp
            .path()
            .join(".gitlab-ci-local/includes/gitlab.com/widgets/templates/v2/jobs.yml");
        let content = std::fs::read_to_string(cached).unwrap();
        assert!(content.contains("remote-job"));
    }

    #[tokio::test]
    async fn test_project_include_invalid_ref_fails() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "fixture/jobs.yml", "remote-job:\n  script: x\n");
        let path = install_fake_git(tmp.path(), &tmp.path().join("fixture"));

        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com").with_env("PATH", &path);
        let root = parse_mapping(
            "include:\n  - project: widgets/templates\n    ref: bad-ref\n    file: jobs.yml\n",
            "root",
        )
        .unwrap();

        let err = resolver.resolve(root).await.unwrap_err();
        assert!(matches!(err, CilocalError::IncludeFailed { .. }));
    }

    #[tokio::test]
    async fn test_project_include_falls_back_to_cache_on_fetch_failure() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            ".gitlab-ci-local/includes/gitlab.com/widgets/templates/bad-ref/jobs.yml",
            "cached-job:\n  script: echo cached\n",
        );
        let fixture = tmp.path().join("fixture");
        std::fs::create_dir_all(&fixture).unwrap();
        let path = install_fake_git(tmp.path(), &fixture);

        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com").with_env("PATH", &path);
        let root = parse_mapping(
            "include:\n  - project: widgets/templates\n    ref: bad-ref\n    file: jobs.yml\n",
            "root",
        )
        .unwrap();

        let merged = resolver.resolve(root).await.unwrap();
        assert!(merged.get("cached-job").is_some());
    }

    #[test]
    fn test_remote_cache_path_mirrors_url() {
        let tmp = TempDir::new().unwrap();
        let resolver = IncludeResolver::new(tmp.path(), "gitlab.com");
        let path = resolver
            .remote_cache_path("https://example.com/group/ci.yml")
            .unwrap();
        assert!(path.ends_with(".gitlab-ci-local/includes/example.com/group/ci.yml"));
    }
}
