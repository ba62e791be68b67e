// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! CLI command definitions and handlers

pub mod list;
pub mod run;
pub mod validate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run GitLab CI pipelines on your own machine
#[derive(Parser, Debug)]
#[clap(
    name = "cilocal",
    version,
    about = "Run GitLab CI pipelines on your own machine",
    long_about = None,
    after_help = "Examples:\n\
        cilocal run                     Run the whole pipeline\n\
        cilocal run build-job           Run one job\n\
        cilocal run test-job --needs    Run a job and its predecessors\n\
        cilocal list                    Show the compiled jobs\n\n\
        See 'cilocal <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Working tree to run in
    #[clap(short = 'C', long = "cwd", global = true, value_name = "DIR")]
    pub cwd: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile the pipeline and run jobs
    Run {
        /// Jobs to run (default: the whole pipeline)
        jobs: Vec<String>,

        /// Also run the selected jobs' predecessors, transitively
        #[clap(long)]
        needs: bool,

        /// Run containers in privileged mode
        #[clap(long)]
        privileged: bool,

        /// Extra container host mappings (host:ip), repeatable
        #[clap(long = "extra-host", value_name = "HOST:IP")]
        extra_hosts: Vec<String>,

        /// Directory holding .gitlab-ci-local/variables.yml
        #[clap(long, value_name = "DIR")]
        home: Option<PathBuf>,

        /// Maximum concurrently running jobs (default: unbounded)
        #[clap(long, value_name = "N")]
        concurrency: Option<usize>,
    },

    /// List the compiled jobs without running anything
    List {
        /// Only jobs of this stage
        #[clap(short, long)]
        stage: Option<String>,

        /// Directory holding .gitlab-ci-local/variables.yml
        #[clap(long, value_name = "DIR")]
        home: Option<PathBuf>,
    },

    /// Compile the pipeline and report configuration problems
    Validate {
        /// Directory holding .gitlab-ci-local/variables.yml
        #[clap(long, value_name = "DIR")]
        home: Option<PathBuf>,
    },
}
