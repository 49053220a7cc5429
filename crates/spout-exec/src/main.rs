use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use spout::{DecodedRecord, DroppedRecord, ExecConfig, ExecSource};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match parse_args(&args) {
        Ok(path) => path,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: spout-exec <config.json>");
            eprintln!();
            eprintln!("Runs one exec source. Records are written to stdout as JSON lines,");
            eprintln!("dropped records to stderr. Logs follow RUST_LOG, or SPOUT_LOG");
            eprintln!("(debug|info|warn|error); LOG_FORMAT=json switches to JSON logs.");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(&config_path).await {
        tracing::error!(error = %e, "spout-exec failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<PathBuf, String> {
    let mut config: Option<PathBuf> = None;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            path => {
                if config.is_some() {
                    return Err(format!("unexpected argument: {path}"));
                }
                config = Some(PathBuf::from(path));
            }
        }
    }

    config.ok_or_else(|| "missing required argument: <config.json>".to_string())
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SPOUT_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("spout={level},spout_exec={level}"))
    };

    // stdout carries records, so logs always go to stderr.
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ExecConfig> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open config {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("failed to parse config {}", path.display()))
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let source = ExecSource::from_config(&config)?;
    let records = source.take_records()?;
    let dropped = source.take_dropped()?;
    source.start()?;

    let mut printer = tokio::spawn(print_records(records, dropped));
    let finished = tokio::select! {
        res = &mut printer => Some(res),
        signal = shutdown_signal() => {
            signal?;
            None
        }
    };

    let report = source.stop().await?;
    match finished {
        Some(res) => res?,
        None => printer.await?,
    }

    info!(
        records = report.stats.records,
        dropped_records = report.stats.dropped_records,
        lost_bytes = report.lost_bytes,
        "Exec source drained"
    );
    Ok(())
}

/// Until both outputs close.
async fn print_records(
    mut records: mpsc::Receiver<DecodedRecord>,
    mut dropped: mpsc::Receiver<DroppedRecord>,
) {
    let mut records_open = true;
    let mut dropped_open = true;
    while records_open || dropped_open {
        tokio::select! {
            record = records.recv(), if records_open => match record {
                Some(record) => {
                    if writeln!(std::io::stdout().lock(), "{}", record.to_json()).is_err() {
                        tracing::warn!("stdout closed, discarding records");
                        records_open = false;
                    }
                }
                None => records_open = false,
            },
            record = dropped.recv(), if dropped_open => match record {
                Some(record) => {
                    let _ = writeln!(std::io::stderr().lock(), "{}", record.to_json());
                }
                None => dropped_open = false,
            },
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Received SIGINT, stopping");
            }
            _ = terminate.recv() => info!("Received SIGTERM, stopping"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, stopping");
    }

    Ok(())
}
