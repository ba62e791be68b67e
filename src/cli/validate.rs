// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Validate command - compile without running

use std::path::{Path, PathBuf};

use colored::Colorize;
use miette::Result;

use crate::pipeline::{compile, CompileOptions};

/// Compile the pipeline and report the outcome.
pub async fn run(cwd: &Path, home: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config = compile(cwd, &CompileOptions { home }).await?;

    println!(
        "{} {} job(s) across {} stage(s)",
        "✓".green(),
        config.jobs.len(),
        config.stages.len()
    );

    if verbose {
        for job in config.jobs_in_order() {
            println!("  {} ({}, when: {})", job.name.bold(), job.stage, job.when);
        }
    }

    Ok(())
}
