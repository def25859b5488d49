// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cluster-agent")]
#[command(
    author,
    version,
    about = "Track workload images and resolve command targets in a Kubernetes cluster"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: ~/.cluster-agent/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Cluster name used in identifiers (overrides config and CA_CLUSTER_NAME)
    #[arg(long, global = true, value_name = "NAME")]
    pub cluster: Option<String>,

    /// Namespace the agent runs in (overrides config and CA_NAMESPACE)
    #[arg(long, global = true, value_name = "NAMESPACE")]
    pub agent_namespace: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    pub output: OutputFormat,

    /// Omit column headers in output
    #[arg(long, global = true)]
    pub no_headers: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch running pods and keep the image maps current until Ctrl-C
    Watch {
        /// Seconds between status lines (0 disables them)
        #[arg(long, default_value = "60", value_name = "SECS")]
        report_interval: u64,
    },

    /// Resolve the targets of a command
    Resolve(ResolveArgs),
}

#[derive(ClapArgs, Debug)]
#[command(group = clap::ArgGroup::new("input").required(true).args(["command", "file"]))]
pub struct ResolveArgs {
    /// Command JSON, single or {"commands": [...]}
    #[arg(long, value_name = "JSON")]
    pub command: Option<String>,

    /// Read the command JSON from a file
    #[arg(short, long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Build the image maps from one pod listing first
    #[arg(long)]
    pub snapshot: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}
