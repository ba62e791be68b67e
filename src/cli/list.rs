// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! List command - show the compiled jobs

use std::path::{Path, PathBuf};

use colored::Colorize;
use miette::Result;

use crate::pipeline::{compile, CompileOptions};
use crate::scheduler::Scheduler;

/// Print the compiled job table.
pub async fn run(cwd: &Path, stage: Option<String>, home: Option<PathBuf>) -> Result<()> {
    let config = compile(cwd, &CompileOptions { home }).await?;

    let jobs: Vec<_> = config
        .jobs_in_order()
        .into_iter()
        .filter(|j| stage.as_deref().map(|s| j.stage == s).unwrap_or(true))
        .collect();

    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    let name_pad = jobs.iter().map(|j| j.name.len()).max().unwrap_or(4).max(4);
    let stage_pad = jobs.iter().map(|j| j.stage.len()).max().unwrap_or(5).max(5);

    println!(
        "{}",
        format!(
            "{:name_pad$}  {:stage_pad$}  {:10}  {:13}  needs",
            "name", "stage", "when", "allow_failure"
        )
        .bold()
    );

    for job in jobs {
        let needs = match Scheduler::predecessors_of(&config, job) {
            preds if preds.is_empty() => "-".to_string(),
            preds => preds.join(", "),
        };

        println!(
            "{}  {:stage_pad$}  {:10}  {:13}  {}",
            format!("{:name_pad$}", job.name).blue(),
            job.stage,
            job.when.to_string(),
            job.allow_failure.to_string(),
            needs
        );
    }

    Ok(())
}
