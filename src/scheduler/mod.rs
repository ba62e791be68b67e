// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! DAG scheduler
//!
//! Orders jobs by stage and explicit `needs`, dispatches them in waves
//! as predecessors reach terminal states, and gates successors on
//! failure. The engine is reached through the [`JobExecutor`] seam so
//! scheduling is testable without containers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use colored::Colorize;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::errors::{CilocalError, CilocalResult};
use crate::output::Sink;
use crate::pipeline::job::{Job, JobRun, JobState, When};
use crate::pipeline::PipelineConfig;

/// Executes one job to a terminal state. Implemented by the engine and
/// by test doubles.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run `job`, staging artifacts from the given predecessor
    /// safe-names. Must return a terminal [`JobRun`].
    async fn run_job(&self, job: &Job, predecessors: &[String]) -> CilocalResult<JobRun>;
}

/// Requests cooperative shutdown of a running pipeline.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of a [`CancelHandle`].
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling; park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected cancel handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Invocation filter and limits
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Explicitly selected job names; empty selects the whole pipeline
    pub jobs: Vec<String>,
    /// Close the selection transitively over predecessors
    pub needs: bool,
    /// Maximum concurrently running jobs; `None` is unbounded
    pub concurrency: Option<usize>,
}

/// Final state of one invocation
#[derive(Debug)]
pub struct PipelineSummary {
    pub runs: BTreeMap<String, JobRun>,
    pub success: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Schedules one pipeline invocation
pub struct Scheduler {
    config: Arc<PipelineConfig>,
    executor: Arc<dyn JobExecutor>,
    sink: Arc<dyn Sink>,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(
        config: Arc<PipelineConfig>,
        executor: Arc<dyn JobExecutor>,
        sink: Arc<dyn Sink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            executor,
            sink,
            cancel,
        }
    }

    /// Predecessors of `job`: explicit `needs` when declared (an empty
    /// list means none at all), otherwise every job in an earlier stage.
    pub fn predecessors_of(config: &PipelineConfig, job: &Job) -> Vec<String> {
        if let Some(needs) = &job.needs {
            return needs.clone();
        }

        let stage_index = config.stage_index(&job.stage).unwrap_or(usize::MAX);
        config
            .jobs
            .values()
            .filter(|other| {
                config.stage_index(&other.stage).unwrap_or(usize::MAX) < stage_index
            })
            .map(|other| other.name.clone())
            .collect()
    }

    /// Run the pipeline to completion.
    pub async fn run(&self, options: &SchedulerOptions) -> CilocalResult<PipelineSummary> {
        let started = Instant::now();

        let selection = self.select_jobs(options)?;
        let predecessors: HashMap<String, Vec<String>> = selection
            .iter()
            .map(|name| {
                let job = &self.config.jobs[name];
                (name.clone(), Self::predecessors_of(&self.config, job))
            })
            .collect();

        self.check_acyclic(&selection, &predecessors)?;
        if !options.needs {
            self.check_external_artifacts(&selection, &predecessors)?;
        }

        let explicit: Vec<&str> = options.jobs.iter().map(String::as_str).collect();
        let mut runs: BTreeMap<String, JobRun> = selection
            .iter()
            .map(|name| {
                let job = &self.config.jobs[name];
                let state = initial_state(job, &explicit);
                (name.clone(), JobRun::new(state))
            })
            .collect();

        let semaphore = options
            .concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut tasks: JoinSet<(String, CilocalResult<JobRun>)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
            }

            if !cancelled {
                // Skips can cascade within one wave, so re-gate until
                // nothing changes.
                while self.dispatch_wave(&mut runs, &predecessors, &mut tasks, &semaphore) {}
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok((name, Ok(run))) => {
                    runs.insert(name, run);
                }
                Ok((name, Err(e))) => {
                    self.sink.stderr_line(&format!(
                        "{} {} {e}",
                        name.blue(),
                        "ERROR".red().bold()
                    ));
                    if let Some(run) = runs.get_mut(&name) {
                        run.state = JobState::Failed;
                    }
                }
                Err(join_error) => {
                    self.sink
                        .stderr_line(&format!("{} {join_error}", "ERROR".red().bold()));
                }
            }
        }

        // Anything still pending was unreachable (cancelled pipeline or
        // skipped predecessors).
        for run in runs.values_mut() {
            if !run.state.is_terminal() {
                run.state = JobState::Skipped;
            }
        }

        let success = !cancelled && runs.values().all(|r| r.state.is_ok());

        Ok(PipelineSummary {
            runs,
            success,
            cancelled,
            duration: started.elapsed(),
        })
    }

    /// Start every job that became eligible, in lexicographic order so
    /// logs are deterministic. Returns whether any state changed.
    fn dispatch_wave(
        &self,
        runs: &mut BTreeMap<String, JobRun>,
        predecessors: &HashMap<String, Vec<String>>,
        tasks: &mut JoinSet<(String, CilocalResult<JobRun>)>,
        semaphore: &Option<Arc<Semaphore>>,
    ) -> bool {
        // BTreeMap iteration order is the tie-break.
        let pending: Vec<String> = runs
            .iter()
            .filter(|(_, run)| run.state == JobState::Pending)
            .map(|(name, _)| name.clone())
            .collect();

        let mut changed = false;
        for name in pending {
            let job = &self.config.jobs[&name];
            let gate = self.gate_of(job, &predecessors[&name], runs);

            match gate {
                Gate::Wait => {}
                Gate::Skip => {
                    runs.get_mut(&name).expect("selected job").state = JobState::Skipped;
                    changed = true;
                }
                Gate::Run => {
                    let run = runs.get_mut(&name).expect("selected job");
                    run.state = JobState::Running;
                    run.started_at = Some(Instant::now());

                    let job = job.clone();
                    let preds: Vec<String> = predecessors[&name]
                        .iter()
                        .filter_map(|p| self.config.jobs.get(p))
                        .map(|p| p.safe_name.clone())
                        .collect();
                    let executor = self.executor.clone();
                    let semaphore = semaphore.clone();

                    tasks.spawn(async move {
                        let _permit = match &semaphore {
                            Some(s) => s.clone().acquire_owned().await.ok(),
                            None => None,
                        };
                        let result = executor.run_job(&job, &preds).await;
                        (job.name.clone(), result)
                    });
                    changed = true;
                }
            }
        }

        changed
    }

    /// Decide whether a pending job can start.
    fn gate_of(&self, job: &Job, preds: &[String], runs: &BTreeMap<String, JobRun>) -> Gate {
        let mut any_failed = false;

        for pred in preds {
            // Predecessors outside the selection were validated up
            // front and count as satisfied.
            let Some(run) = runs.get(pred) else { continue };

            if !run.state.is_terminal() {
                return Gate::Wait;
            }
            if run.state == JobState::Failed {
                any_failed = true;
            }
        }

        if job.when == When::OnFailure {
            // Runs only on the failure of a predecessor.
            return if any_failed { Gate::Run } else { Gate::Skip };
        }

        if any_failed {
            Gate::Skip
        } else {
            Gate::Run
        }
    }

    /// Resolve the invocation filter into the set of scheduled jobs.
    fn select_jobs(&self, options: &SchedulerOptions) -> CilocalResult<Vec<String>> {
        if options.jobs.is_empty() {
            return Ok(self.config.jobs.keys().cloned().collect());
        }

        for name in &options.jobs {
            if !self.config.jobs.contains_key(name) {
                return Err(CilocalError::InvalidPipeline {
                    reason: format!("no job named '{name}'"),
                    help: Some("use 'cilocal list' to see available jobs".to_string()),
                });
            }
        }

        let mut selected: Vec<String> = options.jobs.clone();

        if options.needs {
            // Transitive closure over predecessors.
            let mut queue = selected.clone();
            while let Some(name) = queue.pop() {
                let job = &self.config.jobs[&name];
                for pred in Self::predecessors_of(&self.config, job) {
                    if self.config.jobs.contains_key(&pred) && !selected.contains(&pred) {
                        selected.push(pred.clone());
                        queue.push(pred);
                    }
                }
            }
        }

        selected.sort();
        selected.dedup();
        Ok(selected)
    }

    /// Needs cycles are representable in YAML; refuse them here.
    fn check_acyclic(
        &self,
        selection: &[String],
        predecessors: &HashMap<String, Vec<String>>,
    ) -> CilocalResult<()> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for name in selection {
            let node = graph.add_node(name.as_str());
            nodes.insert(name.as_str(), node);
        }
        for name in selection {
            for pred in &predecessors[name] {
                if let Some(&from) = nodes.get(pred.as_str()) {
                    graph.add_edge(from, nodes[name.as_str()], ());
                }
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            let job = graph[cycle.node_id()].to_string();
            CilocalError::InvalidPipeline {
                reason: format!("dependency cycle involving '{job}'"),
                help: Some("check the needs: entries of the jobs involved".to_string()),
            }
        })?;

        Ok(())
    }

    /// Without `--needs`, predecessors outside the selection must have
    /// their artifacts on disk already.
    fn check_external_artifacts(
        &self,
        selection: &[String],
        predecessors: &HashMap<String, Vec<String>>,
    ) -> CilocalResult<()> {
        for name in selection {
            for pred in &predecessors[name] {
                if selection.contains(pred) {
                    continue;
                }
                let Some(pred_job) = self.config.jobs.get(pred) else {
                    continue;
                };
                if pred_job.artifact_paths.is_empty() {
                    continue;
                }

                let dir = artifacts_dir(&self.config.cwd, &pred_job.safe_name);
                if !dir.exists() {
                    return Err(CilocalError::ArtifactsMissing {
                        job: name.clone(),
                        dependency: pred.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

enum Gate {
    Run,
    Skip,
    Wait,
}

/// Where a job's harvested artifacts live.
pub fn artifacts_dir(cwd: &Path, safe_name: &str) -> std::path::PathBuf {
    cwd.join(".gitlab-ci-local").join("artifacts").join(safe_name)
}

fn initial_state(job: &Job, explicit: &[&str]) -> JobState {
    if job.is_never() {
        return JobState::Skipped;
    }
    if job.is_manual() && !explicit.contains(&job.name.as_str()) {
        // Stays unrun; terminal and never a blocker.
        return JobState::Manual;
    }
    JobState::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitInfo, GitRemote};
    use crate::output::MockSink;
    use std::sync::Mutex;

    fn fake_git() -> GitInfo {
        GitInfo {
            user_name: "Test User".into(),
            user_email: "test@example.com".into(),
            ref_name: "main".into(),
            is_tag: false,
            sha: "0123456789abcdef0123456789abcdef01234567".into(),
            short_sha: "01234567".into(),
            commit_title: "initial".into(),
            commit_message: "initial".into(),
            commit_description: String::new(),
            remote: GitRemote {
                domain: "gitlab.com".into(),
                group: "widgets".into(),
                project: "api".into(),
            },
        }
    }

    fn job(name: &str, stage: &str, needs: Option<Vec<&str>>) -> Job {
        Job {
            name: name.to_string(),
            safe_name: name.to_string(),
            job_id: 1,
            stage: stage.to_string(),
            image: None,
            scripts: vec!["true".to_string()],
            before_scripts: vec![],
            after_scripts: vec![],
            needs: needs.map(|n| n.into_iter().map(String::from).collect()),
            artifact_paths: vec![],
            cache: None,
            variables: Default::default(),
            interactive: false,
            inject_ssh_agent: false,
            coverage: None,
            when: When::OnSuccess,
            allow_failure: false,
        }
    }

    fn config(jobs: Vec<Job>) -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            stages: vec![
                ".pre".into(),
                "build".into(),
                "test".into(),
                "deploy".into(),
                ".post".into(),
            ],
            variables: Default::default(),
            jobs: jobs.into_iter().map(|j| (j.name.clone(), j)).collect(),
            iid: 1,
            git: fake_git(),
            cwd: std::env::temp_dir(),
        })
    }

    /// Records dispatch order and returns scripted outcomes.
    struct FakeExecutor {
        order: Mutex<Vec<String>>,
        fail: Vec<String>,
    }

    impl FakeExecutor {
        fn new() -> Self {
            Self {
                order: Mutex::new(vec![]),
                fail: vec![],
            }
        }

        fn failing(names: &[&str]) -> Self {
            Self {
                order: Mutex::new(vec![]),
                fail: names.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl JobExecutor for FakeExecutor {
        async fn run_job(&self, job: &Job, _predecessors: &[String]) -> CilocalResult<JobRun> {
            self.order.lock().unwrap().push(job.name.clone());

            let mut run = JobRun::default();
            if self.fail.contains(&job.name) {
                run.prescript_exit = Some(1);
                run.state = if job.allow_failure {
                    JobState::WarnedFailure
                } else {
                    JobState::Failed
                };
            } else {
                run.prescript_exit = Some(0);
                run.state = JobState::Succeeded;
            }
            Ok(run)
        }
    }

    fn scheduler(config: Arc<PipelineConfig>, executor: Arc<FakeExecutor>) -> Scheduler {
        let (_handle, token) = cancel_pair();
        // Keep the pipeline alive even though the handle is dropped.
        Scheduler::new(config, executor, Arc::new(MockSink::new()), token)
    }

    #[tokio::test]
    async fn test_linear_pipeline_runs_in_stage_order() {
        let config = config(vec![
            job("unit", "test", None),
            job("compile", "build", None),
        ]);
        let executor = Arc::new(FakeExecutor::new());
        let summary = scheduler(config, executor.clone())
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(
            executor.order.lock().unwrap().clone(),
            vec!["compile", "unit"]
        );
    }

    #[tokio::test]
    async fn test_failed_predecessor_skips_successors() {
        let config = config(vec![
            job("compile", "build", None),
            job("unit", "test", None),
            job("deploy", "deploy", None),
        ]);
        let executor = Arc::new(FakeExecutor::failing(&["compile"]));
        let summary = scheduler(config, executor.clone())
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(!summary.success);
        assert_eq!(summary.runs["compile"].state, JobState::Failed);
        assert_eq!(summary.runs["unit"].state, JobState::Skipped);
        assert_eq!(summary.runs["deploy"].state, JobState::Skipped);
        assert_eq!(executor.order.lock().unwrap().clone(), vec!["compile"]);
    }

    #[tokio::test]
    async fn test_warned_failure_does_not_block() {
        let mut flaky = job("flaky", "build", None);
        flaky.allow_failure = true;
        let config = config(vec![flaky, job("unit", "test", None)]);
        let executor = Arc::new(FakeExecutor::failing(&["flaky"]));
        let summary = scheduler(config, executor)
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.runs["flaky"].state, JobState::WarnedFailure);
        assert_eq!(summary.runs["unit"].state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_explicit_needs_override_stage_order() {
        // deploy-stage job with needs: [] starts immediately
        let config = config(vec![
            job("compile", "build", None),
            job("standalone", "deploy", Some(vec![])),
        ]);
        let executor = Arc::new(FakeExecutor::new());
        let summary = scheduler(config.clone(), executor)
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(summary.success);
        let standalone = &config.jobs["standalone"];
        assert!(Scheduler::predecessors_of(&config, standalone).is_empty());
    }

    #[tokio::test]
    async fn test_never_job_is_skipped_not_failed() {
        let mut never = job("never-job", "test", None);
        never.when = When::Never;
        let config = config(vec![never]);
        let executor = Arc::new(FakeExecutor::new());
        let summary = scheduler(config, executor.clone())
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.runs["never-job"].state, JobState::Skipped);
        assert!(executor.order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_job_not_selected_does_not_block() {
        let mut gate = job("approve", "build", None);
        gate.when = When::Manual;
        let config = config(vec![gate, job("unit", "test", None)]);
        let executor = Arc::new(FakeExecutor::new());
        let summary = scheduler(config, executor.clone())
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.runs["approve"].state, JobState::Manual);
        assert_eq!(summary.runs["unit"].state, JobState::Succeeded);
        assert_eq!(executor.order.lock().unwrap().clone(), vec!["unit"]);
    }

    #[tokio::test]
    async fn test_manual_job_runs_when_selected() {
        let mut gate = job("approve", "build", None);
        gate.when = When::Manual;
        let config = config(vec![gate]);
        let executor = Arc::new(FakeExecutor::new());
        let options = SchedulerOptions {
            jobs: vec!["approve".to_string()],
            ..Default::default()
        };
        let summary = scheduler(config, executor.clone())
            .run(&options)
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.runs["approve"].state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_needs_closure_expands_selection() {
        let config = config(vec![
            job("compile", "build", None),
            job("unit", "test", Some(vec!["compile"])),
        ]);
        let executor = Arc::new(FakeExecutor::new());
        let options = SchedulerOptions {
            jobs: vec!["unit".to_string()],
            needs: true,
            ..Default::default()
        };
        let summary = scheduler(config, executor.clone())
            .run(&options)
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(
            executor.order.lock().unwrap().clone(),
            vec!["compile", "unit"]
        );
    }

    #[tokio::test]
    async fn test_unknown_job_selection_fails() {
        let config = config(vec![job("unit", "test", None)]);
        let executor = Arc::new(FakeExecutor::new());
        let options = SchedulerOptions {
            jobs: vec!["nope".to_string()],
            ..Default::default()
        };
        let err = scheduler(config, executor).run(&options).await.unwrap_err();
        assert!(matches!(err, CilocalError::InvalidPipeline { .. }));
    }

    #[tokio::test]
    async fn test_missing_external_artifacts_fail_up_front() {
        let mut compile = job("compile", "build", None);
        compile.artifact_paths = vec!["dist/".to_string()];
        compile.safe_name = "compile-without-artifacts-on-disk".to_string();
        let config = config(vec![compile, job("unit", "test", Some(vec!["compile"]))]);
        let executor = Arc::new(FakeExecutor::new());
        let options = SchedulerOptions {
            jobs: vec!["unit".to_string()],
            ..Default::default()
        };
        let err = scheduler(config, executor).run(&options).await.unwrap_err();
        assert!(matches!(err, CilocalError::ArtifactsMissing { .. }));
    }

    #[tokio::test]
    async fn test_needs_cycle_is_rejected() {
        let config = config(vec![
            job("a", "test", Some(vec!["b"])),
            job("b", "test", Some(vec!["a"])),
        ]);
        let executor = Arc::new(FakeExecutor::new());
        let err = scheduler(config, executor)
            .run(&SchedulerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CilocalError::InvalidPipeline { .. }));
    }

    #[tokio::test]
    async fn test_on_failure_job_runs_after_failure() {
        let mut notify = job("notify", "deploy", None);
        notify.when = When::OnFailure;
        let config = config(vec![job("compile", "build", None), notify]);
        let executor = Arc::new(FakeExecutor::failing(&["compile"]));
        let summary = scheduler(config, executor.clone())
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(!summary.success);
        assert_eq!(summary.runs["notify"].state, JobState::Succeeded);
        assert!(executor.order.lock().unwrap().contains(&"notify".to_string()));
    }

    #[tokio::test]
    async fn test_on_failure_job_skipped_on_success() {
        let mut notify = job("notify", "deploy", None);
        notify.when = When::OnFailure;
        let config = config(vec![job("compile", "build", None), notify]);
        let executor = Arc::new(FakeExecutor::new());
        let summary = scheduler(config, executor)
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.runs["notify"].state, JobState::Skipped);
    }

    #[tokio::test]
    async fn test_skip_cascade_unblocks_in_same_wave() {
        // "aa" is examined before "bb" gets skipped; the wave must
        // re-gate so "aa" still dispatches on the skipped predecessor.
        let config = config(vec![
            job("aa", "test", Some(vec!["bb"])),
            job("bb", "test", Some(vec!["cc"])),
            job("cc", "build", None),
        ]);
        let executor = Arc::new(FakeExecutor::failing(&["cc"]));
        let summary = scheduler(config, executor)
            .run(&SchedulerOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.runs["cc"].state, JobState::Failed);
        assert_eq!(summary.runs["bb"].state, JobState::Skipped);
        assert_eq!(summary.runs["aa"].state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_is_not_success() {
        let config = config(vec![job("unit", "test", None)]);
        let executor = Arc::new(FakeExecutor::new());
        let (handle, token) = cancel_pair();
        handle.cancel();
        let sched = Scheduler::new(config, executor.clone(), Arc::new(MockSink::new()), token);
        let summary = sched.run(&SchedulerOptions::default()).await.unwrap();

        assert!(summary.cancelled);
        assert!(!summary.success);
        assert!(executor.order.lock().unwrap().is_empty());
        assert_eq!(summary.runs["unit"].state, JobState::Skipped);
    }
}
