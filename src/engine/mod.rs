// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Job execution engine
//!
//! Runs one job from workspace provisioning to artifact harvest. The
//! run is a straight line through the phases; whatever happens on that
//! line, `cleanup` runs before the outcome leaves this module, so no
//! container or volume outlives its job.

pub mod artifacts;
pub mod docker;
pub mod script;
pub mod shell;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{self, KeyLocks};
use crate::engine::docker::{ContainerSpec, Docker};
use crate::errors::{CilocalError, CilocalResult};
use crate::output::{JobLogger, Sink};
use crate::pipeline::job::{Job, JobImage, JobRun, JobState};
use crate::scheduler::{artifacts_dir, CancelToken, JobExecutor};
use crate::variables::{expand_text, Scope};

/// Silence interval before the watchdog speaks up
const SILENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// In-container mount point of the SSH agent socket
const SSH_AGENT_SOCK: &str = "/run/host-services/ssh-auth.sock";

/// Shared inputs of every job execution
pub struct ExecContext {
    pub cwd: PathBuf,
    pub privileged: bool,
    pub extra_hosts: Vec<String>,
    pub sink: Arc<dyn Sink>,
    pub locks: Arc<KeyLocks>,
    pub cancel: CancelToken,
    /// Width jobs names are padded to in log prefixes
    pub name_pad: usize,
}

/// Re-arms on output; fires `> still running...` after sustained silence.
pub struct Watchdog {
    tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
}

/// Cheap handle for stream readers to feed the watchdog
#[derive(Clone)]
pub struct WatchdogTicker(mpsc::UnboundedSender<()>);

impl WatchdogTicker {
    pub fn reset(&self) {
        let _ = self.0.send(());
    }
}

impl Watchdog {
    pub fn arm(logger: Arc<JobLogger>) -> Self {
        Self::arm_with(logger, SILENCE_TIMEOUT)
    }

    fn arm_with(logger: Arc<JobLogger>, silence: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(silence, rx.recv()).await {
                    // progress; re-arm
                    Ok(Some(())) => {}
                    // ticker dropped; job is done
                    Ok(None) => break,
                    Err(_) => logger.stdout("still running..."),
                }
            }
        });
        Self { tx, handle }
    }

    pub fn ticker(&self) -> WatchdogTicker {
        WatchdogTicker(self.tx.clone())
    }

    /// Stop the timer and wait for it to wind down.
    pub async fn disarm(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

/// Resources owned by one run, released by `cleanup`
#[derive(Default)]
struct RunHandles {
    container_id: Option<String>,
    after_container_id: Option<String>,
    artifacts_container_id: Option<String>,
    volume_name: Option<String>,
}

/// The real job executor
pub struct Engine {
    ctx: ExecContext,
    docker: Docker,
}

impl Engine {
    pub fn new(ctx: ExecContext) -> Self {
        let docker = Docker::new(&ctx.cwd);
        Self { ctx, docker }
    }

    fn log_path(&self, job: &Job) -> PathBuf {
        self.ctx
            .cwd
            .join(".gitlab-ci-local")
            .join("output")
            .join(format!("{}.log", job.safe_name))
    }

    /// Phases 1-4. Returns (prescript exit, afterscript exit).
    async fn run_inner(
        &self,
        job: &Job,
        predecessors: &[String],
        logger: &Arc<JobLogger>,
        watchdog: &Watchdog,
        handles: &mut RunHandles,
    ) -> CilocalResult<(i32, Option<i32>)> {
        let cwd = &self.ctx.cwd;

        let prescripts: Vec<String> = job
            .before_scripts
            .iter()
            .chain(job.scripts.iter())
            .cloned()
            .collect();

        // Nothing to run: no workspace, no container.
        if prescripts.is_empty() {
            return Ok((0, None));
        }

        let workspace = shell::prepare_workspace(cwd, &job.safe_name).await?;

        if job.interactive {
            let exit = self.run_interactive(job, &workspace).await?;
            return Ok((exit, None));
        }

        if let Some(image) = &job.image {
            self.run_container(
                job,
                image,
                predecessors,
                &workspace,
                &prescripts,
                logger,
                watchdog,
                handles,
            )
            .await
        } else {
            self.run_shell(job, predecessors, &workspace, &prescripts, logger, watchdog)
                .await
        }
    }

    /// Container mode: volume, container, seeded workspace, two phases.
    #[allow(clippy::too_many_arguments)]
    async fn run_container(
        &self,
        job: &Job,
        image: &JobImage,
        predecessors: &[String],
        workspace: &Path,
        prescripts: &[String],
        logger: &Arc<JobLogger>,
        watchdog: &Watchdog,
        handles: &mut RunHandles,
    ) -> CilocalResult<(i32, Option<i32>)> {
        let cwd = &self.ctx.cwd;

        self.docker.available().await?;
        self.docker.ensure_image(&image.name, logger).await?;

        // Cache binds, serialized per key for the whole run.
        let mut binds: Vec<(String, String)> = Vec::new();
        let mut _cache_guard = None;
        if let Some(job_cache) = &job.cache {
            match cache::cache_key(job_cache, &job.variables, cwd) {
                Ok(key) => {
                    _cache_guard = Some(self.ctx.locks.lock(&key).await);
                    for path in &job_cache.paths {
                        let rel = expand_text(path, &job.variables);
                        let rel = rel.trim_matches('/').to_string();
                        let host = cache::host_cache_dir(&key).join(&rel);
                        std::fs::create_dir_all(&host)?;
                        binds.push((
                            host.to_string_lossy().to_string(),
                            format!("/builds/{rel}"),
                        ));
                    }
                }
                Err(e) => logger.warn(&format!("cache disabled: {e}")),
            }
        }

        let mut env = job.variables.clone();
        if job.inject_ssh_agent {
            if cfg!(target_os = "macos") {
                binds.push((SSH_AGENT_SOCK.to_string(), SSH_AGENT_SOCK.to_string()));
            } else if let Ok(host_sock) = std::env::var("SSH_AUTH_SOCK") {
                binds.push((host_sock, SSH_AGENT_SOCK.to_string()));
            }
            env.insert("SSH_AUTH_SOCK".to_string(), SSH_AGENT_SOCK.to_string());
        }

        let volume = format!("gcl-{}-{}", job.safe_name, job.job_id);
        self.docker.volume_create(&volume).await?;
        handles.volume_name = Some(volume.clone());

        let init = script::compose(prescripts, &job.variables, false);
        shell::write_script(workspace, "gcl-init", &init)?;

        let entrypoint = image
            .entrypoint
            .as_ref()
            .and_then(|e| e.first())
            .map(String::as_str);
        let probe = script::shell_probe("/builds/gcl-init");
        let spec = ContainerSpec {
            image: &image.name,
            volume: &volume,
            privileged: self.ctx.privileged,
            env: &env,
            extra_hosts: &self.ctx.extra_hosts,
            entrypoint,
            binds: binds.clone(),
            command: &probe,
        };

        let container = self.docker.create(&spec).await?;
        handles.container_id = Some(container.clone());

        // Seed the volume with the workspace, then predecessor artifacts.
        self.docker
            .cp_into(&container, &workspace.join("."), "/builds")
            .await?;
        artifacts::stage_inputs_container(&self.docker, &container, cwd, predecessors).await?;

        let prescript_exit = self
            .stream(
                &Docker::start_attach_command(&container),
                cwd,
                &Scope::new(),
                logger,
                watchdog,
            )
            .await?;

        // after_script always runs, in a fresh container on the same
        // volume; the primary container's command has already exited.
        let mut afterscript_exit = None;
        if !job.after_scripts.is_empty() {
            let after = script::compose(&job.after_scripts, &job.variables, false);
            let after_path = shell::write_script(workspace, "gcl-after", &after)?;

            let after_probe = script::shell_probe("/builds/gcl-after");
            let after_spec = ContainerSpec {
                command: &after_probe,
                binds: binds.clone(),
                env: &env,
                extra_hosts: &self.ctx.extra_hosts,
                entrypoint,
                image: &image.name,
                privileged: self.ctx.privileged,
                volume: &volume,
            };
            let after_container = self.docker.create(&after_spec).await?;
            handles.after_container_id = Some(after_container.clone());

            self.docker
                .cp_into(&after_container, &after_path, "/builds/gcl-after")
                .await?;

            let exit = self
                .stream(
                    &Docker::start_attach_command(&after_container),
                    cwd,
                    &Scope::new(),
                    logger,
                    watchdog,
                )
                .await?;
            afterscript_exit = Some(exit);
        }

        if prescript_exit == 0 && !job.artifact_paths.is_empty() {
            let patterns: Vec<String> = job
                .artifact_paths
                .iter()
                .map(|p| expand_text(p, &job.variables))
                .collect();
            artifacts::harvest_container(
                &self.docker,
                &volume,
                &patterns,
                &artifacts_dir(cwd, &job.safe_name),
                logger,
                &mut handles.artifacts_container_id,
            )
            .await?;
        }

        Ok((prescript_exit, afterscript_exit))
    }

    /// Shell mode: scripts run directly in the workspace copy.
    async fn run_shell(
        &self,
        job: &Job,
        predecessors: &[String],
        workspace: &Path,
        prescripts: &[String],
        logger: &Arc<JobLogger>,
        watchdog: &Watchdog,
    ) -> CilocalResult<(i32, Option<i32>)> {
        let cwd = &self.ctx.cwd;

        artifacts::stage_inputs_shell(cwd, predecessors, workspace).await?;

        let init = script::compose(prescripts, &job.variables, true);
        let init_path = shell::write_script(workspace, "gcl-init", &init)?;
        let probe =
            script::shell_probe(&script::shell_quote(&init_path.to_string_lossy()));

        let prescript_exit = self
            .stream(&probe, workspace, &job.variables, logger, watchdog)
            .await?;

        let mut afterscript_exit = None;
        if !job.after_scripts.is_empty() {
            let after = script::compose(&job.after_scripts, &job.variables, true);
            let after_path = shell::write_script(workspace, "gcl-after", &after)?;
            let after_probe =
                script::shell_probe(&script::shell_quote(&after_path.to_string_lossy()));
            let exit = self
                .stream(&after_probe, workspace, &job.variables, logger, watchdog)
                .await?;
            afterscript_exit = Some(exit);
        }

        if prescript_exit == 0 && !job.artifact_paths.is_empty() {
            let patterns: Vec<String> = job
                .artifact_paths
                .iter()
                .map(|p| expand_text(p, &job.variables))
                .collect();
            artifacts::harvest_shell(
                workspace,
                &patterns,
                &artifacts_dir(cwd, &job.safe_name),
                logger,
            )
            .await?;
        }

        Ok((prescript_exit, afterscript_exit))
    }

    /// Interactive jobs inherit host stdio, with no echo or prefixing.
    async fn run_interactive(&self, job: &Job, workspace: &Path) -> CilocalResult<i32> {
        let source = job
            .before_scripts
            .iter()
            .chain(job.scripts.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&source)
            .current_dir(workspace)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (k, v) in &job.variables {
            command.env(k, v);
        }

        let status = command.status().await.map_err(|e| CilocalError::Io {
            message: format!("failed to start interactive job: {e}"),
        })?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Stream one child process line-by-line into the job logger.
    async fn stream(
        &self,
        cmd: &str,
        cwd: &Path,
        env: &Scope,
        logger: &Arc<JobLogger>,
        watchdog: &Watchdog,
    ) -> CilocalResult<i32> {
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

        let mut child = command.spawn().map_err(|e| CilocalError::Io {
            message: format!("failed to spawn '{cmd}': {e}"),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| CilocalError::Io {
            message: "child stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| CilocalError::Io {
            message: "child stderr was not captured".to_string(),
        })?;

        let out_logger = logger.clone();
        let out_tick = watchdog.ticker();
        let out_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_tick.reset();
                out_logger.stdout(&line);
            }
        });

        let err_logger = logger.clone();
        let err_tick = watchdog.ticker();
        let err_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err_tick.reset();
                err_logger.stderr(&line);
            }
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| CilocalError::Io {
                message: format!("failed to wait on '{cmd}': {e}"),
            })?,
            _ = self.ctx.cancel.cancelled() => {
                let _ = child.start_kill();
                child.wait().await.map_err(|e| CilocalError::Io {
                    message: format!("failed to wait on '{cmd}': {e}"),
                })?
            }
        };

        let _ = out_task.await;
        let _ = err_task.await;

        // Let OS-buffered output land.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(status.code().unwrap_or(-1))
    }

    /// Phase 6. Never fails; problems are warnings.
    async fn cleanup(&self, handles: &RunHandles, logger: &Arc<JobLogger>) {
        for container in [
            &handles.container_id,
            &handles.after_container_id,
            &handles.artifacts_container_id,
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = self.docker.rm_forced(container).await {
                logger.warn(&format!("cleanup: could not remove container: {e}"));
            }
        }

        if let Some(volume) = &handles.volume_name {
            if let Err(e) = self.docker.volume_rm(volume).await {
                logger.warn(&format!("cleanup: could not remove volume: {e}"));
            }
        }
    }
}

#[async_trait]
impl JobExecutor for Engine {
    async fn run_job(&self, job: &Job, predecessors: &[String]) -> CilocalResult<JobRun> {
        let started = Instant::now();
        let logger = Arc::new(JobLogger::create(
            self.ctx.sink.clone(),
            &job.name,
            self.ctx.name_pad,
            &self.log_path(job),
        )?);

        let watchdog = Watchdog::arm(logger.clone());
        let mut handles = RunHandles::default();

        let result = self
            .run_inner(job, predecessors, &logger, &watchdog, &mut handles)
            .await;

        // Every exit path converges here.
        watchdog.disarm().await;
        self.cleanup(&handles, &logger).await;

        let (prescript_exit, afterscript_exit) = result?;

        let mut run = JobRun::default();
        run.started_at = Some(started);
        run.prescript_exit = Some(prescript_exit);
        run.afterscript_exit = afterscript_exit;
        run.container_id = handles.container_id.clone();
        run.artifacts_container_id = handles.artifacts_container_id.clone();
        run.volume_name = handles.volume_name.clone();

        if let Some(code) = afterscript_exit {
            if code != 0 {
                logger.warn(&format!("after_script failed with exit code {code}"));
            }
        }

        run.state = if prescript_exit == 0 {
            JobState::Succeeded
        } else if job.allow_failure {
            logger.warn(&format!("{prescript_exit} exit code, allowed to fail"));
            JobState::WarnedFailure
        } else {
            JobState::Failed
        };

        if let Some(pattern) = &job.coverage {
            let log_text = std::fs::read_to_string(self.log_path(job)).unwrap_or_default();
            run.coverage = Some(extract_coverage(&log_text, pattern)?);
        }

        Ok(run)
    }
}

/// Scan a job log with the configured coverage regex.
///
/// The pattern may carry `/.../` delimiters; it is applied in multiline
/// mode and the first numeric substring of the first match is the
/// result. No match yields `"0"`.
pub fn extract_coverage(log_text: &str, pattern: &str) -> CilocalResult<String> {
    let trimmed = pattern.trim();
    let trimmed = trimmed
        .strip_prefix('/')
        .and_then(|p| p.strip_suffix('/'))
        .unwrap_or(trimmed);

    let regex = regex::Regex::new(&format!("(?m){trimmed}"))?;
    let Some(found) = regex.find(log_text) else {
        return Ok("0".to_string());
    };

    let number = regex::Regex::new(r"\d+(\.\d+)?").expect("static regex");
    Ok(number
        .find(found.as_str())
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "0".to_string()))
}
