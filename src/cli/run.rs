// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Run command - compile and execute the pipeline

use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use miette::Result;

use crate::cache::KeyLocks;
use crate::engine::{Engine, ExecContext};
use crate::output::TerminalSink;
use crate::pipeline::job::JobState;
use crate::pipeline::{compile, CompileOptions};
use crate::scheduler::{cancel_pair, PipelineSummary, Scheduler, SchedulerOptions};

/// Flags of one `cilocal run` invocation
pub struct RunArgs {
    pub jobs: Vec<String>,
    pub needs: bool,
    pub privileged: bool,
    pub extra_hosts: Vec<String>,
    pub home: Option<PathBuf>,
    pub concurrency: Option<usize>,
}

/// Run the pipeline.
pub async fn run(cwd: &Path, args: RunArgs, verbose: bool) -> Result<()> {
    let compile_options = CompileOptions {
        home: args.home.clone(),
    };
    let config = Arc::new(compile(cwd, &compile_options).await?);

    if verbose {
        eprintln!(
            "pipeline #{} with {} job(s)",
            config.iid,
            config.jobs.len()
        );
    }

    let name_pad = config
        .jobs
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0);

    let sink = Arc::new(TerminalSink::new());
    let (cancel_handle, cancel) = cancel_pair();

    // First ctrl-c requests cooperative shutdown; a second one aborts.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "cancelling, waiting for cleanup...".yellow());
            cancel_handle.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let engine = Arc::new(Engine::new(ExecContext {
        cwd: cwd.to_path_buf(),
        privileged: args.privileged,
        extra_hosts: args.extra_hosts.clone(),
        sink: sink.clone(),
        locks: Arc::new(KeyLocks::new()),
        cancel: cancel.clone(),
        name_pad,
    }));

    let scheduler = Scheduler::new(config.clone(), engine, sink, cancel);
    let options = SchedulerOptions {
        jobs: args.jobs.clone(),
        needs: args.needs,
        concurrency: args.concurrency,
    };

    let summary = scheduler.run(&options).await?;
    print_summary(&summary);

    if summary.cancelled {
        return Err(crate::errors::CilocalError::Cancelled.into());
    }
    if !summary.success {
        return Err(miette::miette!("Pipeline failed"));
    }
    Ok(())
}

fn print_summary(summary: &PipelineSummary) {
    println!();
    for (name, run) in &summary.runs {
        let state = match run.state {
            JobState::Succeeded => "success".green(),
            JobState::WarnedFailure => "warning".yellow(),
            JobState::Failed => "failed".red(),
            JobState::Skipped => "skipped".dimmed(),
            JobState::Manual => "manual".cyan(),
            other => other.to_string().normal(),
        };

        match &run.coverage {
            Some(coverage) => println!("  {} {} ({coverage}% coverage)", state, name.bold()),
            None => println!("  {} {}", state, name.bold()),
        }
    }

    println!();
    let elapsed = summary.duration.as_secs_f64();
    if summary.cancelled {
        println!("{}", format!("Pipeline cancelled after {elapsed:.2}s").yellow());
    } else if summary.success {
        println!("{}", format!("Pipeline finished in {elapsed:.2}s").green());
    } else {
        println!("{}", format!("Pipeline failed after {elapsed:.2}s").red());
    }
}
