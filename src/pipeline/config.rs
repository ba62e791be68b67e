// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Raw pipeline schema
//!
//! serde models for `.gitlab-ci.yml` content. GitLab's YAML leans on
//! one-or-many shorthands everywhere, so most fields are untagged unions.
//! Unknown keys are ignored, matching the tolerant reader of the real
//! service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level keys that can never be job names
pub const RESERVED_JOB_NAMES: &[&str] = &[
    "include",
    "image",
    "services",
    "stages",
    "types",
    "before_script",
    "default",
    "after_script",
    "variables",
    "cache",
    "workflow",
    "pages",
];

/// Default stage list when the file declares none
pub const DEFAULT_STAGES: &[&str] = &[".pre", "build", "test", "deploy", ".post"];

/// A single string or a list of strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// `image:` shorthand or detailed form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        entrypoint: Option<Vec<String>>,
    },
}

impl ImageSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::Detailed { name, .. } => name,
        }
    }

    pub fn entrypoint(&self) -> Option<&[String]> {
        match self {
            Self::Name(_) => None,
            Self::Detailed { entrypoint, .. } => entrypoint.as_deref(),
        }
    }
}

/// One entry of a `rules:` list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub allow_failure: Option<bool>,
}

/// `cache.key`: literal string or content-derived
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheKeySpec {
    Literal(String),
    Files { files: Vec<String> },
}

/// `cache:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSpec {
    #[serde(default)]
    pub key: Option<CacheKeySpec>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// `artifacts:` block; only `paths` is meaningful locally
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactsSpec {
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One entry of a `needs:` list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeedsEntry {
    Name(String),
    Detailed { job: String },
}

impl NeedsEntry {
    pub fn job(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::Detailed { job } => job,
        }
    }
}

/// YAML lets variable values be scalars of any kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

impl std::fmt::Display for VariableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A job entry as written, before inheritance and rule evaluation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawJob {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub script: Option<StringOrList>,
    #[serde(default)]
    pub before_script: Option<StringOrList>,
    #[serde(default)]
    pub after_script: Option<StringOrList>,
    #[serde(default)]
    pub extends: Option<StringOrList>,
    #[serde(default)]
    pub needs: Option<Vec<NeedsEntry>>,
    #[serde(default)]
    pub rules: Option<Vec<RuleSpec>>,
    #[serde(default)]
    pub artifacts: Option<ArtifactsSpec>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub variables: HashMap<String, VariableValue>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default, rename = "injectSSHAgent")]
    pub inject_ssh_agent: bool,
    #[serde(default)]
    pub coverage: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub allow_failure: Option<bool>,
}

/// The `default:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsSpec {
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub before_script: Option<StringOrList>,
    #[serde(default)]
    pub after_script: Option<StringOrList>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
}

/// One `include:` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncludeItem {
    Local {
        local: String,
    },
    Remote {
        remote: String,
    },
    Project {
        project: String,
        #[serde(rename = "ref", default)]
        ref_name: Option<String>,
        file: StringOrList,
    },
    Template {
        template: String,
    },
    /// Bare string shorthand for a local path
    Path(String),
}

/// `include:` accepts one entry or a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncludeSpec {
    One(IncludeItem),
    Many(Vec<IncludeItem>),
}

impl IncludeSpec {
    pub fn into_items(self) -> Vec<IncludeItem> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_with_script_shorthand() {
        let job: RawJob = serde_yaml::from_str("script: echo hi").unwrap();
        assert_eq!(job.script.unwrap().to_vec(), vec!["echo hi"]);
    }

    #[test]
    fn test_parse_job_full() {
        let yaml = r#"
stage: build
image:
  name: node:20
  entrypoint: [""]
script:
  - npm ci
  - npm run build
needs:
  - lint
  - job: compile
artifacts:
  paths:
    - dist/
cache:
  key: "$CI_COMMIT_REF_SLUG"
  paths:
    - node_modules/
variables:
  RETRIES: 3
  VERBOSE: true
rules:
  - if: '$CI_COMMIT_BRANCH == "main"'
    when: on_success
    allow_failure: false
"#;
        let job: RawJob = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.stage.as_deref(), Some("build"));
        assert_eq!(job.image.as_ref().unwrap().name(), "node:20");
        assert_eq!(job.image.as_ref().unwrap().entrypoint().unwrap().len(), 1);
        assert_eq!(job.script.as_ref().unwrap().to_vec().len(), 2);
        let needs: Vec<&str> = job
            .needs
            .as_ref()
            .unwrap()
            .iter()
            .map(|n| n.job())
            .collect();
        assert_eq!(needs, vec!["lint", "compile"]);
        assert_eq!(job.variables["RETRIES"].to_string(), "3");
        assert_eq!(job.variables["VERBOSE"].to_string(), "true");
        match job.cache.as_ref().unwrap().key.as_ref().unwrap() {
            CacheKeySpec::Literal(k) => assert_eq!(k, "$CI_COMMIT_REF_SLUG"),
            other => panic!("unexpected key: {other:?}"),
        }
    }

    #[test]
    fn test_parse_cache_key_files() {
        let yaml = r#"
key:
  files:
    - Cargo.lock
paths:
  - target/
"#;
        let cache: CacheSpec = serde_yaml::from_str(yaml).unwrap();
        match cache.key.unwrap() {
            CacheKeySpec::Files { files } => assert_eq!(files, vec!["Cargo.lock"]),
            other => panic!("unexpected key: {other:?}"),
        }
    }

    #[test]
    fn test_parse_include_forms() {
        let yaml = r#"
- local: ci/lint.yml
- remote: https://example.com/ci.yml
- project: widgets/templates
  ref: v2
  file: jobs.yml
- template: Rust.gitlab-ci.yml
- plain/path.yml
"#;
        let spec: IncludeSpec = serde_yaml::from_str(yaml).unwrap();
        let items = spec.into_items();
        assert_eq!(items.len(), 5);
        assert!(matches!(items[0], IncludeItem::Local { .. }));
        assert!(matches!(items[1], IncludeItem::Remote { .. }));
        assert!(matches!(items[2], IncludeItem::Project { .. }));
        assert!(matches!(items[3], IncludeItem::Template { .. }));
        assert!(matches!(items[4], IncludeItem::Path(_)));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let job: RawJob =
            serde_yaml::from_str("script: echo hi\nretry: 2\ntimeout: 1h").unwrap();
        assert!(job.script.is_some());
    }
}
