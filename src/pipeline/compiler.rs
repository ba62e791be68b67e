// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Pipeline compiler
//!
//! Turns the merged YAML document into immutable [`Job`] descriptors:
//! resolves `extends` chains, composes variable scopes, evaluates rules
//! and validates cross-field constraints. Everything here is fatal; the
//! scheduler only ever sees a valid pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::errors::{CilocalError, CilocalResult};
use crate::git::GitInfo;
use crate::pipeline::config::{
    CacheKeySpec, CacheSpec, DefaultsSpec, ImageSpec, RawJob, StringOrList, DEFAULT_STAGES,
    RESERVED_JOB_NAMES,
};
use crate::pipeline::includes::{parse_mapping, IncludeResolver};
use crate::pipeline::job::{CacheKey, Job, JobCache, JobImage, When};
use crate::rules;
use crate::state;
use crate::utils::safe_job_name;
use crate::variables::{self, JobIdentity, Scope};

/// A compiled pipeline, ready for scheduling
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stages: Vec<String>,
    /// Global `variables:` block, unexpanded
    pub variables: Scope,
    pub jobs: BTreeMap<String, Job>,
    pub iid: u64,
    pub git: GitInfo,
    pub cwd: PathBuf,
}

impl PipelineConfig {
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Jobs ordered by stage, then name — the stable listing order.
    pub fn jobs_in_order(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| (self.stage_index(&j.stage).unwrap_or(usize::MAX), j.name.clone()));
        jobs
    }
}

/// Compiler inputs beyond the working tree itself
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Override for the per-user variables file directory
    pub home: Option<PathBuf>,
}

/// Compile the pipeline at `cwd`.
pub async fn compile(cwd: &Path, options: &CompileOptions) -> CilocalResult<PipelineConfig> {
    let git = GitInfo::probe(cwd).await?;
    let iid = state::next_pipeline_iid(cwd)?;

    let root_path = cwd.join(".gitlab-ci.yml");
    if !root_path.exists() {
        return Err(CilocalError::PipelineNotFound { path: root_path });
    }
    let text = std::fs::read_to_string(&root_path).map_err(|e| CilocalError::FileReadError {
        path: root_path.clone(),
        error: e.to_string(),
    })?;

    let root = parse_mapping(&text, ".gitlab-ci.yml")?;
    let resolver = IncludeResolver::new(cwd, &git.remote.domain);
    let merged = resolver.resolve(root).await?;

    compile_merged(merged, cwd, git, iid, options)
}

/// Compile an already include-resolved document. Split out for tests.
pub fn compile_merged(
    merged: Mapping,
    cwd: &Path,
    git: GitInfo,
    iid: u64,
    options: &CompileOptions,
) -> CilocalResult<PipelineConfig> {
    let stages = extract_stages(&merged)?;
    let global_variables = extract_variables(merged.get("variables"))?;
    let defaults = extract_defaults(&merged)?;
    let project_variables = load_home_variables(options.home.as_deref())?;

    let env = variables::process_env();

    // Job names, lexicographic so job ids are deterministic.
    let mut names: Vec<String> = Vec::new();
    for (key, value) in &merged {
        let Some(name) = key.as_str() else {
            return Err(CilocalError::InvalidPipeline {
                reason: "non-string top-level key".to_string(),
                help: None,
            });
        };
        if name.starts_with('.') {
            // Templates; only reachable through extends.
            continue;
        }
        if RESERVED_JOB_NAMES.contains(&name) {
            // Reserved keys hold configuration, not jobs. A job
            // definition hiding under one is a config error.
            if value.get("script").is_some() {
                return Err(CilocalError::InvalidJobName {
                    name: name.to_string(),
                    reason: "the name is reserved".to_string(),
                });
            }
            continue;
        }
        names.push(name.to_string());
    }
    names.sort();

    let mut jobs = BTreeMap::new();
    for (index, name) in names.iter().enumerate() {
        let raw = resolve_extends(name, &merged)?;
        let raw: RawJob = serde_yaml::from_value(Value::Mapping(raw)).map_err(|e| {
            CilocalError::InvalidJob {
                job: name.clone(),
                reason: e.to_string(),
            }
        })?;

        let job = instantiate_job(
            name,
            index as u64 + 1,
            raw,
            &stages,
            &defaults,
            &global_variables,
            &project_variables,
            &env,
            &git,
            iid,
            cwd,
        )?;
        jobs.insert(name.clone(), job);
    }

    validate_needs(&jobs)?;

    Ok(PipelineConfig {
        stages,
        variables: global_variables,
        jobs,
        iid,
        git,
        cwd: cwd.to_path_buf(),
    })
}

/// Build one Job from its raw form.
#[allow(clippy::too_many_arguments)]
fn instantiate_job(
    name: &str,
    job_id: u64,
    raw: RawJob,
    stages: &[String],
    defaults: &DefaultsSpec,
    global_variables: &Scope,
    project_variables: &Scope,
    env: &Scope,
    git: &GitInfo,
    iid: u64,
    cwd: &Path,
) -> CilocalResult<Job> {
    let stage = raw.stage.clone().unwrap_or_else(|| "test".to_string());
    if !stages.contains(&stage) {
        return Err(CilocalError::UnknownStage {
            job: name.to_string(),
            stage,
        });
    }

    let safe_name = safe_job_name(name);

    let image_spec = raw.image.as_ref().or(defaults.image.as_ref());
    let image = image_spec.map(|spec| {
        JobImage::new(spec.name(), spec.entrypoint().map(|e| e.to_vec()))
    });

    let project_dir = if image.is_some() {
        "/builds".to_string()
    } else {
        cwd.join(".gitlab-ci-local")
            .join("builds")
            .join(&safe_name)
            .to_string_lossy()
            .to_string()
    };

    let identity = JobIdentity {
        name,
        stage: &stage,
        job_id,
    };
    let predefined = variables::predefined(identity, git, iid, &project_dir);

    let job_variables: Scope = raw
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();

    // Later tiers win; the process environment only seeds expansion.
    let full_scope = variables::compose(&[
        env,
        &predefined,
        project_variables,
        global_variables,
        &job_variables,
    ]);

    // What actually gets injected into the job: everything but the
    // ambient process environment.
    let injected = variables::compose(&[
        &predefined,
        project_variables,
        global_variables,
        &job_variables,
    ]);
    let injected = variables::expand_all(&injected, &full_scope);

    let (when, allow_failure) = match &raw.rules {
        Some(rule_list) => {
            let outcome = rules::evaluate(rule_list, &full_scope)?;
            (outcome.when, outcome.allow_failure)
        }
        None => {
            let when = match &raw.when {
                Some(w) => When::parse(w)?,
                None => When::OnSuccess,
            };
            (when, raw.allow_failure.unwrap_or(false))
        }
    };

    let before_scripts = raw
        .before_script
        .as_ref()
        .or(defaults.before_script.as_ref())
        .map(StringOrList::to_vec)
        .unwrap_or_default();
    let after_scripts = raw
        .after_script
        .as_ref()
        .or(defaults.after_script.as_ref())
        .map(StringOrList::to_vec)
        .unwrap_or_default();
    let scripts = raw.script.as_ref().map(StringOrList::to_vec).unwrap_or_default();

    let cache = resolve_cache(raw.cache.as_ref().or(defaults.cache.as_ref()));

    let needs = raw
        .needs
        .as_ref()
        .map(|entries| entries.iter().map(|n| n.job().to_string()).collect());

    let job = Job {
        name: name.to_string(),
        safe_name,
        job_id,
        stage,
        image,
        scripts,
        before_scripts,
        after_scripts,
        needs,
        artifact_paths: raw.artifacts.map(|a| a.paths).unwrap_or_default(),
        cache,
        variables: injected,
        interactive: raw.interactive,
        inject_ssh_agent: raw.inject_ssh_agent,
        coverage: raw.coverage,
        when,
        allow_failure,
    };

    validate_job(&job)?;
    Ok(job)
}

/// Cross-field invariants that cannot be expressed in the schema.
fn validate_job(job: &Job) -> CilocalResult<()> {
    if job.interactive && (job.when != When::Manual || job.image.is_some()) {
        return Err(CilocalError::InvalidJob {
            job: job.name.clone(),
            reason: "interactive jobs must be 'when: manual' and cannot use an image".to_string(),
        });
    }

    if job.inject_ssh_agent && job.image.is_none() {
        return Err(CilocalError::InvalidJob {
            job: job.name.clone(),
            reason: "injectSSHAgent requires an image".to_string(),
        });
    }

    Ok(())
}

/// Every `needs:` target must be a real job.
fn validate_needs(jobs: &BTreeMap<String, Job>) -> CilocalResult<()> {
    for job in jobs.values() {
        let Some(needs) = &job.needs else { continue };

        let missing: Vec<String> = needs
            .iter()
            .filter(|n| !jobs.contains_key(*n))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(CilocalError::UnknownNeeds {
                job: job.name.clone(),
                missing,
            });
        }
    }
    Ok(())
}

/// Resolve an `extends:` chain at the YAML level, depth-first.
///
/// Bases are merged in listed order, the extending job last. Mappings
/// merge recursively; scalars and sequences are replaced wholesale.
fn resolve_extends(name: &str, doc: &Mapping) -> CilocalResult<Mapping> {
    let mut visited = Vec::new();
    resolve_extends_inner(name, doc, &mut visited)
}

fn resolve_extends_inner(
    name: &str,
    doc: &Mapping,
    visited: &mut Vec<String>,
) -> CilocalResult<Mapping> {
    if visited.iter().any(|v| v == name) {
        let mut trace = visited.clone();
        trace.push(name.to_string());
        return Err(CilocalError::ExtendsCycle { trace });
    }

    let value = doc
        .get(name)
        .ok_or_else(|| CilocalError::UnknownExtends {
            job: visited.last().cloned().unwrap_or_default(),
            base: name.to_string(),
        })?;
    let own = match value {
        Value::Mapping(m) => m.clone(),
        _ => {
            return Err(CilocalError::InvalidJob {
                job: name.to_string(),
                reason: "job entry is not a mapping".to_string(),
            })
        }
    };

    let bases: Vec<String> = match own.get("extends") {
        None => Vec::new(),
        Some(v) => serde_yaml::from_value::<StringOrList>(v.clone())
            .map_err(|e| CilocalError::InvalidJob {
                job: name.to_string(),
                reason: format!("invalid extends: {e}"),
            })?
            .to_vec(),
    };

    visited.push(name.to_string());
    let mut acc = Mapping::new();
    for base in bases {
        let resolved = resolve_extends_inner(&base, doc, visited)?;
        deep_merge(&mut acc, resolved);
    }
    visited.pop();

    deep_merge(&mut acc, own);
    acc.remove("extends");
    Ok(acc)
}

/// Recursive mapping merge; `overlay` wins on conflicts.
fn deep_merge(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match value {
            Value::Mapping(incoming) => {
                if let Some(Value::Mapping(existing)) = base.get_mut(&key) {
                    deep_merge(existing, incoming);
                    continue;
                }
                base.insert(key, Value::Mapping(incoming));
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Stage list with the `.pre`/`.post` bookends always present.
fn extract_stages(doc: &Mapping) -> CilocalResult<Vec<String>> {
    let mut stages: Vec<String> = match doc.get("stages") {
        None => DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
        Some(v) => serde_yaml::from_value(v.clone())?,
    };

    if stages.first().map(String::as_str) != Some(".pre") {
        stages.insert(0, ".pre".to_string());
    }
    if stages.last().map(String::as_str) != Some(".post") {
        stages.push(".post".to_string());
    }

    let mut seen = HashSet::new();
    for stage in &stages {
        if !seen.insert(stage) {
            return Err(CilocalError::InvalidPipeline {
                reason: format!("duplicate stage '{stage}'"),
                help: None,
            });
        }
    }

    Ok(stages)
}

fn extract_variables(value: Option<&Value>) -> CilocalResult<Scope> {
    let Some(value) = value else {
        return Ok(Scope::new());
    };
    let vars: HashMap<String, crate::pipeline::config::VariableValue> =
        serde_yaml::from_value(value.clone())?;
    Ok(vars.into_iter().map(|(k, v)| (k, v.to_string())).collect())
}

/// The `default:` block, with the deprecated top-level aliases as
/// fallback.
fn extract_defaults(doc: &Mapping) -> CilocalResult<DefaultsSpec> {
    let mut defaults: DefaultsSpec = match doc.get("default") {
        None => DefaultsSpec::default(),
        Some(v) => serde_yaml::from_value(v.clone())?,
    };

    if defaults.image.is_none() {
        if let Some(v) = doc.get("image") {
            defaults.image = Some(serde_yaml::from_value::<ImageSpec>(v.clone())?);
        }
    }
    if defaults.before_script.is_none() {
        if let Some(v) = doc.get("before_script") {
            defaults.before_script = Some(serde_yaml::from_value::<StringOrList>(v.clone())?);
        }
    }
    if defaults.after_script.is_none() {
        if let Some(v) = doc.get("after_script") {
            defaults.after_script = Some(serde_yaml::from_value::<StringOrList>(v.clone())?);
        }
    }
    if defaults.cache.is_none() {
        if let Some(v) = doc.get("cache") {
            defaults.cache = Some(serde_yaml::from_value::<CacheSpec>(v.clone())?);
        }
    }

    Ok(defaults)
}

fn resolve_cache(spec: Option<&CacheSpec>) -> Option<JobCache> {
    let spec = spec?;
    if spec.paths.is_empty() {
        return None;
    }

    let key = match &spec.key {
        None => CacheKey::Literal("default".to_string()),
        Some(CacheKeySpec::Literal(k)) => CacheKey::Literal(k.clone()),
        Some(CacheKeySpec::Files { files }) => CacheKey::Files(files.clone()),
    };

    Some(JobCache {
        key,
        paths: spec.paths.clone(),
    })
}

/// Per-user variables: `$HOME/.gitlab-ci-local/variables.yml`, or the
/// same file under `--home`. A top-level `global:` mapping is the scope;
/// a flat file is accepted as-is.
fn load_home_variables(home: Option<&Path>) -> CilocalResult<Scope> {
    let base = match home {
        Some(h) => h.to_path_buf(),
        None => match std::env::var_os("HOME") {
            Some(h) => PathBuf::from(h),
            None => return Ok(Scope::new()),
        },
    };

    let path = base.join(".gitlab-ci-local").join("variables.yml");
    if !path.exists() {
        return Ok(Scope::new());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| CilocalError::FileReadError {
        path: path.clone(),
        error: e.to_string(),
    })?;
    let mapping = parse_mapping(&text, "variables.yml")?;

    let scoped = match mapping.get("global").cloned() {
        Some(v) => v,
        None => Value::Mapping(mapping),
    };
    extract_variables(Some(&scoped))
}
