// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! cilocal - run GitLab CI pipelines on your own machine

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cilocal::cli::{run::RunArgs, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cilocal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let cwd = match cli.cwd {
        Some(dir) => dir.canonicalize().map_err(|e| {
            miette::miette!("Failed to resolve directory '{}': {}", dir.display(), e)
        })?,
        None => std::env::current_dir()
            .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?,
    };

    match cli.command {
        Commands::Run {
            jobs,
            needs,
            privileged,
            extra_hosts,
            home,
            concurrency,
        } => {
            let args = RunArgs {
                jobs,
                needs,
                privileged,
                extra_hosts,
                home,
                concurrency,
            };
            cilocal::cli::run::run(&cwd, args, cli.verbose).await
        }
        Commands::List { stage, home } => cilocal::cli::list::run(&cwd, stage, home).await,
        Commands::Validate { home } => cilocal::cli::validate::run(&cwd, home, cli.verbose).await,
    }
}
