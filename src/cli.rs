use std::path::PathBuf;

use vectorset::config::Config;
use vectorset::engine::snapshot;

#[derive(Debug, PartialEq)]
pub enum Command {
    Serve,
    Check { snapshot: Option<PathBuf> },
}

pub fn parse_command() -> anyhow::Result<Command> {
    let args: Vec<String> = std::env::args().collect();
    parse_args(&args)
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    match args[1].as_str() {
        "serve" => Ok(Command::Serve),
        "check" => parse_check(&args[2..]),
        _ => Ok(Command::Serve),
    }
}

fn parse_check(args: &[String]) -> anyhow::Result<Command> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--snapshot" {
            let value = iter
                .next()
                .ok_or_else(|| anyhow::anyhow!("--snapshot requires a path"))?;
            return Ok(Command::Check {
                snapshot: Some(PathBuf::from(value)),
            });
        }
    }
    Ok(Command::Check { snapshot: None })
}

/// Validates a snapshot file and prints what it holds. Without an explicit
/// path the snapshot under the configured data directory is checked.
pub fn run_check(config: &Config, path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path
        .or_else(|| config.snapshot_path())
        .ok_or_else(|| anyhow::anyhow!("check requires --snapshot <path> or DATA_DIR"))?;

    let summary = snapshot::inspect(&path)
        .map_err(|err| anyhow::anyhow!("snapshot {} is invalid: {err}", path.display()))?;
    println!(
        "Snapshot `{}` OK: keys={} vector_sets={} strings={} elements={}",
        path.display(),
        summary.keys,
        summary.vector_sets,
        summary.strings,
        summary.elements
    );
    Ok(())
}
