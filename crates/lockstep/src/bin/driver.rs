//! Reference driver: spawns workers and runs the counter stimulus.
//!
//! Usage: lockstep-driver [--workers N] [--port P] [--cycles C] -- <program> [args...]

use std::process;

use lockstep::logging::init_tracing;
use lockstep::orchestrator::{DEFAULT_PORT, Orchestrator, OrchestratorConfig, OrchestratorError};
use lockstep::process::LaunchTemplate;
use lockstep::stimulus::Stimulus;

const DEFAULT_WORKERS: usize = 4;

#[derive(Debug)]
struct Args {
    workers: usize,
    port: u16,
    cycles: Option<u64>,
    launch: LaunchTemplate,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: lockstep-driver [OPTIONS] -- <program> [args...]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --workers <n>    Number of worker processes [default: {DEFAULT_WORKERS}]");
            eprintln!("  --port <port>    Coordinator port, 0 for any [default: {DEFAULT_PORT}]");
            eprintln!("  --cycles <n>     Ticks to run [default: until power off]");
            process::exit(2);
        }
    };

    init_tracing();
    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut workers = DEFAULT_WORKERS;
    let mut port = DEFAULT_PORT;
    let mut cycles = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--workers" => {
                i += 1;
                workers = parse_value(args.get(i), "--workers")?;
                if workers == 0 {
                    return Err("--workers must be at least 1".to_string());
                }
            }
            "--port" => {
                i += 1;
                port = parse_value(args.get(i), "--port")?;
            }
            "--cycles" => {
                i += 1;
                cycles = Some(parse_value(args.get(i), "--cycles")?);
            }
            "--" => {
                i += 1;
                break;
            }
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    let program = args
        .get(i)
        .ok_or("missing worker program after `--`")?
        .clone();
    let launch = LaunchTemplate::new(program).with_args(args[i + 1..].iter().cloned());
    Ok(Args {
        workers,
        port,
        cycles,
        launch,
    })
}

fn parse_value<T: std::str::FromStr>(value: Option<&String>, flag: &str) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

fn run(args: Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(drive(args))
}

async fn drive(args: Args) -> anyhow::Result<()> {
    let stimulus = Stimulus::reference();
    let cycles = args
        .cycles
        .or_else(|| stimulus.power_off_cycle().map(|c| c + 1))
        .unwrap_or(1);

    tracing::info!(version = lockstep::VERSION, workers = args.workers, cycles, "Starting driver");
    let config = OrchestratorConfig::new(args.workers, args.launch).with_port(args.port);
    let mut orchestrator = Orchestrator::new(config);

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping");
            shutdown.shutdown();
        }
    });

    let outcome = exchange(&mut orchestrator, &stimulus, cycles).await;
    orchestrator.shutdown().await?;

    match outcome {
        Err(OrchestratorError::Interrupted) => {
            tracing::warn!(completed = orchestrator.cycles(), "Run interrupted");
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

async fn exchange(
    orchestrator: &mut Orchestrator,
    stimulus: &Stimulus,
    cycles: u64,
) -> Result<(), OrchestratorError> {
    orchestrator.spawn().await?;
    orchestrator.wait_ready().await?;

    for outbound in stimulus.frames(cycles) {
        let result = orchestrator.on_tick(&outbound).await?;
        for (slot, inbound) in &result.frames {
            tracing::info!(cycle = result.cycle, slot, %outbound, %inbound, "Tick");
        }
        for (slot, failure) in &result.failures {
            tracing::warn!(cycle = result.cycle, slot, ?failure, "Slot failed");
        }
        if result.frames.is_empty() {
            tracing::warn!(cycle = result.cycle, "No workers responding, stopping");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("lockstep-driver")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_flags_and_launch_command() {
        let args = parse_args(&argv(&[
            "--workers", "2", "--port", "0", "--cycles", "10", "--", "sim", "--fast",
        ]))
        .unwrap();
        assert_eq!(args.workers, 2);
        assert_eq!(args.port, 0);
        assert_eq!(args.cycles, Some(10));
        assert_eq!(args.launch.command_line(5), vec!["sim", "--fast", "5"]);
    }

    #[test]
    fn defaults() {
        let args = parse_args(&argv(&["--", "sim"])).unwrap();
        assert_eq!(args.workers, DEFAULT_WORKERS);
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.cycles, None);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["--workers", "0", "--", "sim"])).is_err());
        assert!(parse_args(&argv(&["--port", "big", "--", "sim"])).is_err());
        assert!(parse_args(&argv(&["sim"])).is_err());
    }
}
