// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use printforge_core::types::JobStatus;

#[derive(Debug, Parser)]
#[command(name = "printforge", version)]
#[command(about = "Persistent print queue and printer agent", long_about = None)]
pub struct Cli {
    /// JSON configuration file (defaults are used if it does not exist)
    #[arg(long, global = true, value_name = "FILE", default_value = "printforge.json")]
    pub config: PathBuf,

    /// Queue file, overriding `agent.queue_path` from the configuration
    #[arg(long, global = true, value_name = "FILE")]
    pub queue: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Add a G-code or project file to the queue
    Submit {
        /// File to print (.gcode, .gco, .g or .3mf)
        artifact: PathBuf,
        /// Display name (default: file stem)
        #[arg(short, long)]
        name: Option<String>,
        /// Anything above zero jumps ahead of normal jobs
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        #[arg(long)]
        customer: Option<String>,
        #[arg(long)]
        design: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Expected print time in seconds
        #[arg(long, value_name = "SECS")]
        estimate: Option<u64>,
    },
    /// Show one job as JSON
    Job { id: String },
    /// Show the queue lists, or every job with the given status
    Queue {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Cancel a job that has not finished
    Cancel { id: String },
    /// Drop old completed and failed jobs
    Prune {
        /// Jobs kept per list (default: agent.keep_terminal_jobs)
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Run the agent until Ctrl-C or for a fixed time
    Run {
        /// Drive the in-process simulated printer
        #[arg(long)]
        simulate: bool,
        /// Stop after this many seconds
        #[arg(long = "for", value_name = "SECS")]
        run_for: Option<u64>,
    },
}
