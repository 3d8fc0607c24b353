use orderflow_engine::pipeline::{replay_file, Engine, IngressQueue};
use orderflow_engine::wire::Frame;
use orderflow_engine::{EngineConfig, EngineError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("{msg}");
            print_usage();
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Start => run_start(cli),
        Command::Replay => run_replay(cli),
        Command::Health => run_health(cli),
    };

    if let Err(e) = result {
        error!(error = %e, "fatal");
        std::process::exit(e.exit_code());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Replay,
    Health,
}

struct Cli {
    command: Command,
    config_path: PathBuf,
    capture_path: Option<PathBuf>,
    from_ms: i64,
    to_ms: i64,
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let command = match args.get(1).map(String::as_str) {
        Some("start") => Command::Start,
        Some("replay") => Command::Replay,
        Some("health") => Command::Health,
        Some("--help") | Some("-h") => {
            print_usage();
            std::process::exit(0);
        }
        Some(other) => return Err(format!("Unknown subcommand: {other}")),
        None => return Err("Missing subcommand".to_string()),
    };

    let mut config_path = PathBuf::from("orderflow.json");
    let mut capture_path = None;
    let mut from_ms = 0i64;
    let mut to_ms = i64::MAX;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                config_path = PathBuf::from(next_value(args, &mut i)?);
            }
            "--file" => {
                capture_path = Some(PathBuf::from(next_value(args, &mut i)?));
            }
            "--from" => {
                from_ms = next_value(args, &mut i)?
                    .parse()
                    .map_err(|_| "--from expects a millisecond timestamp".to_string())?;
            }
            "--to" => {
                to_ms = next_value(args, &mut i)?
                    .parse()
                    .map_err(|_| "--to expects a millisecond timestamp".to_string())?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("Unknown argument: {other}")),
        }
        i += 1;
    }

    if command == Command::Replay && capture_path.is_none() {
        return Err("replay requires --file <capture.jsonl>".to_string());
    }

    Ok(Cli {
        command,
        config_path,
        capture_path,
        from_ms,
        to_ms,
    })
}

fn next_value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} expects a value", args[*i - 1]))
}

fn print_usage() {
    println!("orderflow-engine - real-time order-flow analytics for one spot market");
    println!();
    println!("USAGE:");
    println!("    orderflow-engine <SUBCOMMAND> [OPTIONS]");
    println!();
    println!("SUBCOMMANDS:");
    println!("    start               Run the live pipeline, reading frames from stdin");
    println!("    replay              Feed a captured frame file through the pipeline");
    println!("    health              Validate configuration and report readiness");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>     Config file (default: orderflow.json)");
    println!("    --file <PATH>       Capture file for replay (JSON lines)");
    println!("    --from <TS_MS>      Replay window start, Unix milliseconds");
    println!("    --to <TS_MS>        Replay window end, Unix milliseconds");
    println!("    --help, -h          Print this help message");
    println!();
    println!("EXIT CODES:");
    println!("    0  normal   1  config error   2  init failure   3  fatal runtime error");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    RUST_LOG            Logging filter (default: info)");
}

fn run_start(cli: Cli) -> Result<(), EngineError> {
    let cfg = EngineConfig::load(&cli.config_path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Init(format!("runtime: {e}")))?;

    runtime.block_on(async {
        let queue = Arc::new(IngressQueue::new(&cfg.ingress));
        let mut engine = Engine::new(cfg)?;
        let mut egress = engine.subscribe();
        engine.init(chrono::Utc::now().timestamp_millis())?;

        let cancel = CancellationToken::new();

        // Egress consumer: serialise events to stdout for downstream
        // collectors. A real deployment attaches its own subscriber.
        tokio::spawn(async move {
            loop {
                match egress.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "egress serialisation failed"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "egress consumer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Ingress worker: one frame per stdin line.
        let ingress_queue = queue.clone();
        let ingress_cancel = cancel.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            loop {
                tokio::select! {
                    _ = ingress_cancel.cancelled() => break,
                    maybe = lines.next_line() => match maybe {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Frame>(&line) {
                                Ok(frame) => {
                                    ingress_queue.push_wait(frame).await;
                                }
                                Err(e) => warn!(error = %e, "malformed ingress line dropped"),
                            }
                        }
                        Ok(None) => {
                            info!("ingress stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "ingress read error");
                            break;
                        }
                    }
                }
            }
            ingress_queue.close();
        });

        let shutdown_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown_cancel.cancel();
            }
        });

        let stats = engine.run(queue, cancel).await?;
        info!(
            trades = stats.processed_trades,
            depth_diffs = stats.processed_depth_diffs,
            signals = stats.signals_confirmed,
            "engine stopped"
        );
        Ok(())
    })
}

fn run_replay(cli: Cli) -> Result<(), EngineError> {
    let cfg = EngineConfig::load(&cli.config_path)?;
    let capture = cli.capture_path.expect("validated by parse_args");
    let stats = replay_file(cfg, &capture, cli.from_ms, cli.to_ms)?;
    match serde_json::to_string_pretty(&stats) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => warn!(error = %e, "replay stats serialisation failed"),
    }
    Ok(())
}

fn run_health(cli: Cli) -> Result<(), EngineError> {
    let cfg = EngineConfig::load(&cli.config_path)?;
    // Configuration parsed and validated; report the resolved essentials.
    let report = serde_json::json!({
        "status": "ok",
        "symbol": cfg.book.symbol,
        "tickSizeScaled": cfg.tick_size_scaled(),
        "resolutions": cfg.preprocessor.resolutions,
        "journalEnabled": cfg.journal.enabled,
        "queueCapacity": cfg.ingress.queue_capacity,
    });
    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => warn!(error = %e, "health report serialisation failed"),
    }
    Ok(())
}
