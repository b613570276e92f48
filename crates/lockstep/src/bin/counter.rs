//! Reference worker: a 4-bit up-counter.
//!
//! Usage: lockstep-counter [--host <host>] <port>

use std::process;

use lockstep::counter::Counter;
use lockstep::logging::init_tracing;
use lockstep::worker::{WorkerConfig, run_worker};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: lockstep-counter [--host <host>] <port>");
            process::exit(2);
        }
    };

    init_tracing();
    if let Err(e) = run(config) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<WorkerConfig, String> {
    let mut host: Option<String> = None;
    let mut positional = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let config = WorkerConfig::from_args(&positional).map_err(|e| e.to_string())?;
    Ok(match host {
        Some(host) => config.with_host(host),
        None => config,
    })
}

fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let exit = runtime.block_on(run_worker(Counter::new(), config))?;
    tracing::debug!(ticks = exit.ticks, reason = ?exit.reason, "Counter exiting");
    Ok(())
}
