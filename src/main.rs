// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Operator CLI.
//!
//! `start` seeds the in-memory store from a workload file and drives the
//! run with stub backends, which is enough to exercise planning, retries,
//! cost caps, and the acceptance gate from a terminal. Production
//! deployments embed `ExecutionService` behind a durable `StateStore`, where
//! `pause`/`resume`/`cancel`/`status` address long-lived runs by id.
//!
//! Exit codes: 0 success, 2 blocked by gate, 3 blocked by cost, 4 invalid
//! input, 1 internal error.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use uuid::Uuid;

use atomwave::config::{load_config, load_workload, EngineConfig};
use atomwave::engine::cost::ViolationKind;
use atomwave::engine::{ExecutionService, RunReport, StartOutcome};
use atomwave::errors::EngineError;
use atomwave::storage::MemoryStore;
use atomwave::stub::{EchoGenerator, ScriptedRunner, TracingSink};
use atomwave::traits::RunStatus;

const EXIT_BLOCKED_BY_GATE: u8 = 2;
const EXIT_BLOCKED_BY_COST: u8 = 3;
const EXIT_INVALID_INPUT: u8 = 4;

#[derive(Parser)]
#[command(name = "atomwave", about = "Wave-based execution engine for code-generation atoms")]
struct Args {
    /// Engine configuration YAML; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Seed the store from a workload file and drive the run to a stop.
    Start {
        /// Workload YAML: masterplan id, atoms, edges, acceptance tests.
        workload: String,
        /// Per-call cost charged by the stub generator.
        #[arg(long, default_value_t = 0.05)]
        stub_cost: f64,
        /// Make the stub generator fail the first N calls transiently.
        #[arg(long, default_value_t = 0)]
        fail_first: u32,
        /// Fail acceptance tests whose requirement contains this marker.
        #[arg(long)]
        fail_tests_marked: Option<String>,
    },
    /// Finish the current wave, then stop the run.
    Pause { run_id: Uuid },
    /// Resume a paused, blocked, or degraded run.
    Resume { run_id: Uuid },
    /// Cancel a run; in-flight attempts finish and are discarded.
    Cancel { run_id: Uuid },
    /// Print a run's current report.
    Status { run_id: Uuid },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match args.config.as_deref().map(load_config).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(load_error) => {
            eprintln!("invalid configuration: {:#}", load_error);
            return ExitCode::from(EXIT_INVALID_INPUT);
        }
    };

    match run(args.command, config).await {
        Ok(code) => code,
        Err(EngineError::InvalidInput(message)) => {
            eprintln!("invalid input: {}", message);
            ExitCode::from(EXIT_INVALID_INPUT)
        }
        Err(EngineError::RunNotFound(run_id)) => {
            eprintln!("run {} not found in this process's store", run_id);
            ExitCode::from(EXIT_INVALID_INPUT)
        }
        Err(engine_error) => {
            eprintln!("error: {}", engine_error);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: EngineConfig) -> Result<ExitCode, EngineError> {
    match command {
        Command::Start {
            workload,
            stub_cost,
            fail_first,
            fail_tests_marked,
        } => {
            let workload = load_workload(&workload)
                .map_err(|load_error| EngineError::InvalidInput(format!("{:#}", load_error)))?;
            let store = Arc::new(MemoryStore::new());
            store.seed_workload(&workload);

            let generator = if fail_first > 0 {
                EchoGenerator::with_transient_failures(stub_cost, fail_first)
            } else {
                EchoGenerator::new(stub_cost)
            };
            let runner = match fail_tests_marked {
                Some(marker) => ScriptedRunner::failing_marked(marker),
                None => ScriptedRunner::passing(),
            };

            let service = ExecutionService::new(
                config,
                store,
                generator,
                runner,
                TracingSink::new(),
            )?;

            match service.start(workload.masterplan_id).await? {
                StartOutcome::AlreadyRunning { run_id } => {
                    println!("run {} already active", run_id);
                    Ok(ExitCode::SUCCESS)
                }
                StartOutcome::Finished(report) => {
                    print_report(&report);
                    Ok(exit_for(&report))
                }
            }
        }
        // The in-memory store lives for one invocation; against it these
        // resolve to run-not-found. A durable store makes them meaningful.
        Command::Pause { run_id } => {
            empty_service(config)?.pause(run_id).await?;
            println!("pause requested for {}", run_id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume { run_id } => match empty_service(config)?.resume(run_id).await? {
            StartOutcome::AlreadyRunning { run_id } => {
                println!("run {} already active", run_id);
                Ok(ExitCode::SUCCESS)
            }
            StartOutcome::Finished(report) => {
                print_report(&report);
                Ok(exit_for(&report))
            }
        },
        Command::Cancel { run_id } => {
            empty_service(config)?.cancel(run_id).await?;
            println!("cancel requested for {}", run_id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { run_id } => {
            let report = empty_service(config)?.status(run_id).await?;
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn empty_service(config: EngineConfig) -> Result<ExecutionService, EngineError> {
    ExecutionService::new(
        config,
        Arc::new(MemoryStore::new()),
        EchoGenerator::new(0.0),
        ScriptedRunner::passing(),
        TracingSink::new(),
    )
}

fn exit_for(report: &RunReport) -> ExitCode {
    // Cost admission is the only path to a skipped atom, so skips mean the
    // run was throttled by its caps.
    let cost_blocked = report.ledger.hard_breached
        || report.atoms.skipped > 0
        || report.violations.iter().any(|v| v.kind == ViolationKind::Hard);
    match report.status {
        RunStatus::Blocked => ExitCode::from(EXIT_BLOCKED_BY_GATE),
        _ if cost_blocked => ExitCode::from(EXIT_BLOCKED_BY_COST),
        _ => ExitCode::SUCCESS,
    }
}

fn print_report(report: &RunReport) {
    println!("run {} ({:?})", report.run_id, report.status);
    println!(
        "  atoms: {} succeeded, {} failed, {} skipped, {} cancelled, {} flagged for review",
        report.atoms.succeeded,
        report.atoms.failed,
        report.atoms.skipped,
        report.atoms.cancelled,
        report.atoms.needs_review,
    );
    if let Some(gate) = &report.gate {
        println!("  gate: {}", gate.summary);
    }
    println!(
        "  cost: ${:.2} accumulated (soft ${:.2} / hard ${:.2})",
        report.ledger.accumulated, report.ledger.soft_cap, report.ledger.hard_cap
    );
    for violation in &report.violations {
        println!(
            "  violation: {:?} observed ${:.2} against cap ${:.2}",
            violation.kind, violation.observed, violation.cap
        );
    }
}
