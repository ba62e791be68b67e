// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Artifact harvest and staging
//!
//! After a job finishes, files matching its `artifacts.paths` globs move
//! to `.gitlab-ci-local/artifacts/<safe-name>/`. Successors get those
//! directories copied back into their workspace before scripts run.
//! Container jobs harvest through a transient sidecar bound to the same
//! volume, because the primary container may lack `cp`.

use std::path::Path;
use std::sync::Arc;

use crate::engine::docker::{ContainerSpec, Docker};
use crate::engine::script::shell_quote;
use crate::errors::CilocalResult;
use crate::output::JobLogger;
use crate::spawn::spawn;
use crate::variables::Scope;

/// Image used for the artifact-copy sidecar
pub const SIDECAR_IMAGE: &str = "debian:stable-slim";

/// Staging directory inside the sidecar
const SIDECAR_DIR: &str = "/gcl-artifacts";

/// Harvest artifacts from a shell-mode workspace.
pub async fn harvest_shell(
    workspace: &Path,
    patterns: &[String],
    dest: &Path,
    logger: &Arc<JobLogger>,
) -> CilocalResult<()> {
    std::fs::create_dir_all(dest)?;

    let mut matched: Vec<String> = Vec::new();
    for pattern in patterns {
        let full = workspace.join(pattern.trim_end_matches('/'));
        let mut found = false;

        for entry in glob::glob(&full.to_string_lossy())? {
            let Ok(path) = entry else { continue };
            if let Ok(rel) = path.strip_prefix(workspace) {
                matched.push(rel.to_string_lossy().to_string());
                found = true;
            }
        }

        if !found {
            logger.warn(&format!("no artifacts matched '{pattern}'"));
        }
    }

    if matched.is_empty() {
        return Ok(());
    }

    let files = matched
        .iter()
        .map(|m| shell_quote(m))
        .collect::<Vec<_>>()
        .join(" ");
    let cmd = format!(
        "cp -r --parents {files} {}",
        shell_quote(&dest.to_string_lossy())
    );
    spawn(&cmd, workspace, &Default::default()).await?;

    Ok(())
}

/// Harvest artifacts from a container job's volume via a sidecar.
///
/// The created sidecar id lands in `id_slot` before anything else runs,
/// so cleanup can always find it.
pub async fn harvest_container(
    docker: &Docker,
    volume: &str,
    patterns: &[String],
    dest: &Path,
    logger: &Arc<JobLogger>,
    id_slot: &mut Option<String>,
) -> CilocalResult<()> {
    std::fs::create_dir_all(dest)?;
    docker.ensure_image(SIDECAR_IMAGE, logger).await?;

    let files = patterns
        .iter()
        .map(|p| shell_quote(p.trim_end_matches('/')))
        .collect::<Vec<_>>()
        .join(" ");
    let copy = format!(
        "mkdir -p {dir} && cd /builds && cp -r --parents {files} {dir}",
        dir = SIDECAR_DIR
    );

    let env = Scope::new();
    let spec = ContainerSpec {
        image: SIDECAR_IMAGE,
        volume,
        privileged: false,
        env: &env,
        extra_hosts: &[],
        entrypoint: None,
        binds: vec![],
        command: &copy,
    };

    let id = docker.create(&spec).await?;
    *id_slot = Some(id.clone());

    spawn(
        &Docker::start_attach_command(&id),
        dest,
        &Default::default(),
    )
    .await?;

    docker.cp_out(&id, &format!("{SIDECAR_DIR}/."), dest).await?;
    Ok(())
}

/// Copy predecessor artifacts into a shell-mode workspace.
pub async fn stage_inputs_shell(
    cwd: &Path,
    predecessors: &[String],
    workspace: &Path,
) -> CilocalResult<()> {
    for safe_name in predecessors {
        let dir = crate::scheduler::artifacts_dir(cwd, safe_name);
        if !dir.exists() {
            continue;
        }

        let cmd = format!(
            "cp -r {}/. {}/",
            shell_quote(&dir.to_string_lossy()),
            shell_quote(&workspace.to_string_lossy())
        );
        spawn(&cmd, cwd, &Default::default()).await?;
    }
    Ok(())
}

/// Copy predecessor artifacts into a container at `/builds/`.
pub async fn stage_inputs_container(
    docker: &Docker,
    container: &str,
    cwd: &Path,
    predecessors: &[String],
) -> CilocalResult<()> {
    for safe_name in predecessors {
        let dir = crate::scheduler::artifacts_dir(cwd, safe_name);
        if !dir.exists() {
            continue;
        }
        docker.cp_into(container, &dir.join("."), "/builds/").await?;
    }
    Ok(())
}
