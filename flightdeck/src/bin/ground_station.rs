//! Ground station against a simulated vehicle.
//!
//! Runs the heartbeat, telemetry and command workers, logs every command
//! report, and stops after the run duration or once the vehicle is reported
//! disconnected.
//!
//! # Usage
//!
//! ```sh
//! ground-station --run-secs 30 --disconnect-after-secs 10 --target 10,0,-10
//! ```

use std::time::Duration;

use clap::Parser;

use flightdeck::station::command::{CommandArgs, Position, command_worker};
use flightdeck::station::heartbeat::{
    DEFAULT_MISS_THRESHOLD, ReceiverArgs, SenderArgs, heartbeat_receiver, heartbeat_sender,
};
use flightdeck::station::telemetry::{TelemetryArgs, TelemetryData, telemetry_worker};
use flightdeck::station::{SimulatedLink, SimulationConfig, is_disconnect};
use flightdeck::{Flow, Orchestrator, OrchestratorConfig, PipelineError, SuperviseOutcome, Watch};

const HEARTBEAT_TO_MAIN_CAPACITY: i64 = 1;
const TELEMETRY_TO_COMMAND_CAPACITY: i64 = 5;
const COMMAND_TO_MAIN_CAPACITY: i64 = 5;

#[derive(Debug, Parser)]
#[command(name = "ground-station", version, about)]
struct Cli {
    /// Stop after this many seconds.
    #[arg(long, default_value_t = 100)]
    run_secs: u64,

    /// Timeout of each supervisory poll, in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Heartbeat period, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Missed heartbeats before the vehicle counts as disconnected.
    #[arg(long, default_value_t = DEFAULT_MISS_THRESHOLD)]
    miss_threshold: u32,

    /// Simulated vehicle stops talking after this many seconds.
    #[arg(long)]
    disconnect_after_secs: Option<u64>,

    /// Target position as `x,y,z` in metres (NED).
    #[arg(long, value_parser = parse_position, default_value = "0,0,-10")]
    target: Position,

    /// Prefix of the shared memory objects.
    #[arg(long, default_value = "flightdeck")]
    shm_prefix: String,
}

fn parse_position(s: &str) -> Result<Position, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("`{p}`: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match parts[..] {
        [x, y, z] => Ok(Position::new(x, y, z)),
        _ => Err(format!("expected x,y,z, got `{s}`")),
    }
}

fn main() {
    flightdeck::init_tracing();
    if let Err(e) = run(&Cli::parse()) {
        eprintln!("ground-station: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), PipelineError> {
    let poll = Duration::from_millis(cli.poll_ms);
    let period = Duration::from_millis(cli.heartbeat_ms);
    let mut orch = Orchestrator::new(OrchestratorConfig {
        poll_timeout: poll,
        run_duration: Duration::from_secs(cli.run_secs),
        shm_prefix: cli.shm_prefix.clone(),
        ..OrchestratorConfig::default()
    })?;

    let link = SimulatedLink::new(SimulationConfig {
        disconnect_after: cli.disconnect_after_secs.map(Duration::from_secs),
        ..SimulationConfig::default()
    });

    let heartbeat_to_main = orch.channel::<String>("heartbeat_to_main", HEARTBEAT_TO_MAIN_CAPACITY)?;
    let telemetry_to_command =
        orch.channel::<TelemetryData>("telemetry_to_command", TELEMETRY_TO_COMMAND_CAPACITY)?;
    let command_to_main = orch.channel::<String>("command_to_main", COMMAND_TO_MAIN_CAPACITY)?;

    orch.worker(
        1,
        heartbeat_receiver(),
        ReceiverArgs {
            link: link.clone(),
            period,
            miss_threshold: cli.miss_threshold,
            put_timeout: poll,
        },
        &[],
        &[heartbeat_to_main.port()],
    )?;
    orch.worker(
        1,
        heartbeat_sender(),
        SenderArgs {
            link: link.clone(),
            period,
        },
        &[],
        &[],
    )?;
    orch.worker(
        1,
        telemetry_worker(),
        TelemetryArgs {
            link: link.clone(),
            window: Duration::from_secs(1),
            put_timeout: poll,
        },
        &[],
        &[telemetry_to_command.port()],
    )?;
    orch.worker(
        1,
        command_worker(),
        CommandArgs {
            link,
            target: cli.target,
            poll_timeout: poll,
        },
        &[telemetry_to_command.port()],
        &[command_to_main.port()],
    )?;

    let mut watches = [
        Watch::new(&command_to_main, |report: String| {
            println!("{report}");
            Flow::Continue
        }),
        Watch::new(&heartbeat_to_main, |status: String| {
            if is_disconnect(&status) {
                eprintln!("ground-station: vehicle disconnected");
                Flow::Stop
            } else {
                Flow::Continue
            }
        }),
    ];

    let run = orch.run(&mut watches)?;
    match &run.outcome {
        SuperviseOutcome::DeadlineElapsed => eprintln!("ground-station: run time elapsed"),
        SuperviseOutcome::Terminated { channel } => {
            eprintln!("ground-station: stopped by `{channel}`");
        }
        SuperviseOutcome::ExitRaised => eprintln!("ground-station: a worker failed"),
    }
    for drained in &run.shutdown.drained {
        eprintln!(
            "ground-station: drained {} ({} discarded)",
            drained.channel, drained.discarded
        );
    }
    for pool in &run.shutdown.pools {
        for exit in &pool.exits {
            eprintln!(
                "ground-station: {}[{}] pid {} {}",
                pool.pool, exit.index, exit.pid, exit.reason
            );
        }
    }

    orch.reset()?;
    eprintln!("ground-station: stopped");
    Ok(())
}
