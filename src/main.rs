// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod identifiers;
mod kubernetes;
mod output;
pub mod policy;
pub mod progress;
pub mod resolver;
pub mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cli::{Args, Command, ResolveArgs};
use config::Config;
use kubernetes::{ClusterAccessor, KubeAccessor, KubePodSource, PodSource};
use output::Report;
use policy::CommandPolicy;
use progress::ProgressUpdate;
use resolver::CommandResolver;
use watcher::WorkloadWatcher;

/// Initialize logging to stderr, plus rotated files when `log_dir` is set
fn init_logging(verbose: bool, log_dir: Option<&Path>) {
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::format::FmtSpan;

    let filter = if verbose {
        "cluster_agent=debug"
    } else {
        "cluster_agent=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NONE);

    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory: {}", e);
            return None;
        }

        // Rotate daily or at 10MB, keep 5 files
        let condition = RollingConditionBase::new()
            .daily()
            .max_size(10 * 1024 * 1024);
        let appender =
            match RollingFileAppenderBase::new(dir.join("cluster-agent.log"), condition, 5) {
                Ok(appender) => appender,
                Err(e) => {
                    eprintln!("Warning: Could not create log file: {}", e);
                    return None;
                }
            };

        let (non_blocking, guard) = appender.get_non_blocking_appender();
        // Keep the background writer alive for the life of the process
        std::mem::forget(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::NONE),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

/// Config file, then environment, then flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    config.apply_flags(args.cluster.as_deref(), args.agent_namespace.as_deref());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs); a second install is harmless
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(args.verbose, config.log_dir.as_deref());

    if config.cluster_name.is_empty() {
        warn!("No cluster name configured, identifiers will carry an empty cluster level");
    }

    match &args.command {
        Command::Watch { report_interval } => run_watch(&args, &config, *report_interval).await,
        Command::Resolve(resolve) => run_resolve(&args, &config, resolve).await,
    }
}

async fn run_watch(args: &Args, config: &Config, report_interval: u64) -> Result<()> {
    let client = kubernetes::connect().await?;
    let accessor: Arc<dyn ClusterAccessor> = Arc::new(KubeAccessor::new(client.clone()));
    let pods = Arc::new(KubePodSource::new(client, config.watch_timeout_secs));
    let handle = progress::create_progress_handle();
    let mut updates = handle.subscribe();
    let watcher = Arc::new(
        WorkloadWatcher::new(config.cluster_name.clone(), accessor, pods)
            .with_progress(handle)
            .with_resync_backoff(config.resync_backoff()),
    );

    let status_watcher = Arc::clone(&watcher);
    let status = tokio::spawn(async move {
        let mut spinner = Some(progress::create_spinner("Listing running pods..."));
        let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
        ticker.tick().await;

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(ProgressUpdate::Synced { generation, pods, images, workloads, errors, elapsed_ms }) => {
                        if let Some(pb) = spinner.take() {
                            pb.finish_and_clear();
                        }
                        info!(generation, pods, images, workloads, errors, elapsed_ms, "Image maps synced");
                    }
                    Ok(ProgressUpdate::Resyncing { generation }) => {
                        info!(generation, "Resyncing image maps");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Progress updates dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick(), if report_interval > 0 => {
                    let images = status_watcher.images_to_wlids().await.len();
                    let workloads = status_watcher.wlids_to_container_images().await.len();
                    let (_, events) = status_watcher.progress().progress();
                    info!(images, workloads, events, "Watcher status");
                }
            }
        }
    });

    let result = watcher
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;
    status.abort();
    result?;

    let report = Report::from_image_index(&watcher.images_to_wlids().await);
    println!("{}", report.format(&args.output, args.no_headers));
    Ok(())
}

async fn run_resolve(args: &Args, config: &Config, resolve: &ResolveArgs) -> Result<()> {
    let input = match (&resolve.command, &resolve.file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read command file: {}", path.display()))?,
        (None, None) => anyhow::bail!("Either --command or --file is required"),
    };
    let commands = command::parse_commands(&input).context("Invalid command JSON")?;

    let client = kubernetes::connect().await?;
    let accessor: Arc<dyn ClusterAccessor> = Arc::new(KubeAccessor::new(client.clone()));
    let policy = Arc::new(CommandPolicy::new(&config.agent_namespace));
    let mut resolver = CommandResolver::new(config.cluster_name.clone(), accessor.clone(), policy);

    if resolve.snapshot {
        let pods = Arc::new(KubePodSource::new(client, config.watch_timeout_secs));
        let spinner = progress::create_spinner("Building image maps...");
        let snapshot = pods.list_pods().await;
        spinner.finish_and_clear();
        let snapshot = snapshot?;

        let watcher = Arc::new(WorkloadWatcher::new(
            config.cluster_name.clone(),
            accessor,
            pods,
        ));
        for err in watcher.build_from_pod_list(&snapshot.pods).await {
            warn!(error = %err, "Skipping pod");
        }
        resolver = resolver.with_watcher(watcher);
    }

    let mut reports = Vec::with_capacity(commands.len());
    for command in &commands {
        let targets = resolver
            .resolve_command(command)
            .await
            .with_context(|| format!("Failed to resolve {} command", command.command_name))?;
        info!(
            command = %command.command_name,
            target = %command.target_identifier(),
            identifiers = targets.identifiers.len(),
            excluded = targets.excluded.len(),
            errors = targets.errors.len(),
            "Resolved command"
        );
        reports.push(Report::from_targets(command, &targets));
    }

    match reports.into_iter().reduce(|mut all, report| {
        all.extend(report);
        all
    }) {
        Some(report) => println!("{}", report.format(&args.output, args.no_headers)),
        None => eprintln!("No commands to resolve"),
    }
    Ok(())
}
