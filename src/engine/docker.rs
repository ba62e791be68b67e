// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Container runtime operations
//!
//! Thin wrappers over the docker CLI. Only the command set the engine
//! needs: `image ls`, `pull`, `volume create`/`rm`, `create`,
//! `start --attach -i`, `cp` and `rm -f`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::engine::script::shell_quote;
use crate::errors::{CilocalError, CilocalResult};
use crate::output::JobLogger;
use crate::spawn::{spawn, spawn_unchecked};
use crate::variables::Scope;

/// Docker CLI bound to one working directory
pub struct Docker {
    cwd: PathBuf,
}

/// Everything needed to create a job container
pub struct ContainerSpec<'a> {
    pub image: &'a str,
    pub volume: &'a str,
    pub privileged: bool,
    pub env: &'a Scope,
    pub extra_hosts: &'a [String],
    pub entrypoint: Option<&'a str>,
    /// Additional host-path to container-path binds
    pub binds: Vec<(String, String)>,
    /// Command run by `docker start`, typically the shell probe
    pub command: &'a str,
}

impl Docker {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }

    /// Fail early when no docker CLI answers.
    pub async fn available(&self) -> CilocalResult<()> {
        let out = spawn_unchecked("docker version --format '{{.Client.Version}}'", &self.cwd, &HashMap::new())
            .await?;
        if !out.success() {
            return Err(CilocalError::docker_missing());
        }
        Ok(())
    }

    /// Pull the image unless it is already present locally.
    pub async fn ensure_image(&self, image: &str, logger: &JobLogger) -> CilocalResult<()> {
        let probe = format!(
            "docker image ls --format '{{{{.Repository}}}}:{{{{.Tag}}}}' | grep -x -F {}",
            shell_quote(image)
        );
        let present = spawn_unchecked(&probe, &self.cwd, &HashMap::new()).await?;
        if present.success() {
            return Ok(());
        }

        logger.stdout(&format!("pulling {image}"));
        spawn(&format!("docker pull {}", shell_quote(image)), &self.cwd, &HashMap::new()).await?;
        Ok(())
    }

    pub async fn volume_create(&self, name: &str) -> CilocalResult<()> {
        spawn(
            &format!("docker volume create {}", shell_quote(name)),
            &self.cwd,
            &HashMap::new(),
        )
        .await?;
        Ok(())
    }

    /// Best-effort; cleanup swallows the result.
    pub async fn volume_rm(&self, name: &str) -> CilocalResult<()> {
        let out = spawn_unchecked(
            &format!("docker volume rm -f {}", shell_quote(name)),
            &self.cwd,
            &HashMap::new(),
        )
        .await?;
        if !out.success() {
            return Err(CilocalError::CommandFailed {
                command: format!("docker volume rm {name}"),
                exit_code: out.exit_code,
                output: out.combined(),
            });
        }
        Ok(())
    }

    /// Create a container, returning its id.
    pub async fn create(&self, spec: &ContainerSpec<'_>) -> CilocalResult<String> {
        let cmd = create_command(spec);
        let out = spawn(&cmd, &self.cwd, &HashMap::new()).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Copy from the host into a container path.
    pub async fn cp_into(&self, container: &str, from: &Path, to: &str) -> CilocalResult<()> {
        let cmd = format!(
            "docker cp {} {container}:{to}",
            shell_quote(&from.to_string_lossy())
        );
        spawn(&cmd, &self.cwd, &HashMap::new()).await?;
        Ok(())
    }

    /// Copy from a container path to the host.
    pub async fn cp_out(&self, container: &str, from: &str, to: &Path) -> CilocalResult<()> {
        let cmd = format!(
            "docker cp {container}:{from} {}",
            shell_quote(&to.to_string_lossy())
        );
        spawn(&cmd, &self.cwd, &HashMap::new()).await?;
        Ok(())
    }

    /// Force-remove a container; best-effort for cleanup.
    pub async fn rm_forced(&self, container: &str) -> CilocalResult<()> {
        let out = spawn_unchecked(
            &format!("docker rm -f {}", shell_quote(container)),
            &self.cwd,
            &HashMap::new(),
        )
        .await?;
        if !out.success() {
            return Err(CilocalError::CommandFailed {
                command: format!("docker rm -f {container}"),
                exit_code: out.exit_code,
                output: out.combined(),
            });
        }
        Ok(())
    }

    /// The attach command streamed by the engine.
    pub fn start_attach_command(container: &str) -> String {
        format!("docker start --attach -i {}", shell_quote(container))
    }
}

/// Assemble the full `docker create` invocation.
fn create_command(spec: &ContainerSpec<'_>) -> String {
    let mut cmd = String::from("docker create --interactive --user 0:0");

    if spec.privileged {
        cmd.push_str(" --privileged");
    }

    cmd.push_str(&format!(" -v {}:/builds", shell_quote(spec.volume)));
    for (host, container) in &spec.binds {
        cmd.push_str(&format!(" -v {}", shell_quote(&format!("{host}:{container}"))));
    }

    let mut env_names: Vec<&String> = spec.env.keys().collect();
    env_names.sort();
    for name in env_names {
        cmd.push_str(&format!(
            " -e {}",
            shell_quote(&format!("{name}={}", spec.env[name]))
        ));
    }

    for host in spec.extra_hosts {
        cmd.push_str(&format!(" --add-host={}", shell_quote(host)));
    }

    if let Some(entrypoint) = spec.entrypoint {
        cmd.push_str(&format!(" --entrypoint {}", shell_quote(entrypoint)));
    }

    cmd.push_str(&format!(
        " {} sh -c {}",
        shell_quote(spec.image),
        shell_quote(spec.command)
    ));
    cmd
}
