use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const HELP: &str = "wikifeed - An endless feed of encyclopedia cards in the terminal.

Usage: wikifeed [OPTIONS]

  --demo               Browse generated cards without network access
  --config <PATH>      Read configuration from PATH
  --version, -V        Show version and exit
  --help,    -h        Show this help message

Environment:
  WIKIFEED_LOG         Log filter, e.g. wikifeed=debug
  WIKIFEED_LOG_FILE    Write logs to this file instead of stderr";

fn main() {
    let opts = match parse_args(std::env::args().skip(1)) {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(message) => {
            eprintln!("error: {message}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    init_logging();

    if let Err(err) = wikifeed::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// `Ok(None)` means an informational flag was handled and the process should exit.
fn parse_args(args: impl Iterator<Item = String>) -> Result<Option<wikifeed::RunOptions>, String> {
    let mut opts = wikifeed::RunOptions::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("wikifeed {}", wikifeed::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--demo" => opts.demo = true,
            "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                opts.config_file = Some(PathBuf::from(path));
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Some(opts))
}

/// The terminal UI owns the screen, so logs go to stderr only when a filter
/// was asked for explicitly.
fn init_logging() {
    let filter = EnvFilter::try_from_env("WIKIFEED_LOG");
    match std::env::var_os("WIKIFEED_LOG_FILE") {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("warning: cannot open log file {}: {err}", PathBuf::from(&path).display());
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter.unwrap_or_else(|_| EnvFilter::new("warn")))
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            if let Ok(filter) = filter {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .try_init();
            }
        }
    }
}
