// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printforge: persistent print queue and printer agent.
//
// Entry point. Initialises logging, parses the command line and runs the
// selected command.

mod cli;
mod commands;
mod offline;

use std::process::ExitCode;

use clap::Parser;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "Printforge starting");

    let mut stdout = std::io::stdout();
    match commands::execute(cli, &mut stdout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
