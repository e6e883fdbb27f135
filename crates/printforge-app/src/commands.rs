// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command handlers.  Each one loads the configuration, builds an agent over
// the configured queue and writes its result to `out`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use printforge_core::config::AppConfig;
use printforge_core::error::{PrintforgeError, Result};
use printforge_core::types::{JobId, JobMetadata};
use printforge_print::{DeviceAdapter, PrinterAgent, RetryPolicy, SimulatedPrinter};

use crate::cli::{Cli, Commands};
use crate::offline::OfflinePrinter;

/// Progress the simulated printer makes per status poll.
const SIMULATED_PROGRESS_STEP: f64 = 10.0;

/// Load, override and validate the configuration named on the command line.
pub fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(queue) = &cli.queue {
        config.agent.queue_path = queue.clone();
    }
    config.validate()?;
    Ok(config)
}

pub async fn execute(cli: Cli, out: &mut dyn Write) -> Result<()> {
    let config = load_config(&cli)?;
    info!(
        config = %cli.config.display(),
        queue = %config.agent.queue_path.display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Submit {
            artifact,
            name,
            priority,
            customer,
            design,
            description,
            estimate,
        } => {
            let metadata = JobMetadata {
                customer_id: customer,
                design_id: design,
                description,
                estimated_duration_secs: estimate,
            };
            let job =
                offline_agent(&config)?.submit_job(&artifact, name, priority, Some(metadata))?;
            writeln!(out, "{}", job.id)?;
        }
        Commands::Job { id } => {
            let job = offline_agent(&config)?.get_job_status(&JobId::from(id))?;
            writeln!(out, "{}", serde_json::to_string_pretty(&job)?)?;
        }
        Commands::Queue { status } => {
            let agent = offline_agent(&config)?;
            let json = match status {
                Some(status) => {
                    serde_json::to_string_pretty(&agent.queue().jobs_with_status(status))?
                }
                None => serde_json::to_string_pretty(&agent.get_queue_state())?,
            };
            writeln!(out, "{json}")?;
        }
        Commands::Cancel { id } => {
            let id = JobId::from(id);
            if !offline_agent(&config)?.cancel_job(&id).await? {
                return Err(PrintforgeError::Validation(format!(
                    "job {id} is unknown or already finished"
                )));
            }
            writeln!(out, "cancelled {id}")?;
        }
        Commands::Prune { keep } => {
            let keep = keep.unwrap_or(config.agent.keep_terminal_jobs);
            let agent = offline_agent(&config)?;
            let removed = agent.queue().clear_terminal_jobs(keep);
            agent.queue().save()?;
            writeln!(out, "removed {removed} terminal jobs")?;
        }
        Commands::Run { simulate, run_for } => {
            run_agent(config, simulate, run_for, out).await?;
        }
    }
    Ok(())
}

/// Agent for commands that only work on the queue.
fn offline_agent(config: &AppConfig) -> Result<PrinterAgent> {
    let device: Arc<dyn DeviceAdapter> =
        Arc::new(OfflinePrinter::new(&config.printer.printer_id));
    PrinterAgent::open(config.agent.clone(), device)
}

async fn run_agent(
    config: AppConfig,
    simulate: bool,
    run_for: Option<u64>,
    out: &mut dyn Write,
) -> Result<()> {
    let device: Arc<dyn DeviceAdapter> = if simulate {
        let printer = SimulatedPrinter::new(&config.printer)
            .with_upload_policy(RetryPolicy::from_config(&config.agent));
        printer.set_auto_advance(Some(SIMULATED_PROGRESS_STEP));
        Arc::new(printer)
    } else {
        Arc::new(OfflinePrinter::new(&config.printer.printer_id))
    };

    let agent = PrinterAgent::open(config.agent, device)?;
    agent.start().await?;

    let deadline = async {
        match run_for {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = deadline => info!("run time elapsed"),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("interrupt received"),
            Err(e) => warn!(error = %e, "could not listen for Ctrl-C; stopping"),
        },
    }

    agent.stop().await;

    let state = agent.get_queue_state();
    writeln!(
        out,
        "pending {} active {} completed {} failed {}",
        state.pending.len(),
        state.active.len(),
        state.completed.len(),
        state.failed.len()
    )?;
    Ok(())
}
