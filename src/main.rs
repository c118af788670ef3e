mod cli;
mod server;

use cli::Command;
use tracing_subscriber::EnvFilter;
use vectorset::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = log_filter_from_args();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    match cli::parse_command()? {
        Command::Check { snapshot } => cli::run_check(&config, snapshot),
        Command::Serve => server::run(config).await,
    }
}

fn log_filter_from_args() -> EnvFilter {
    if let Some(level) = parse_log_arg() {
        return EnvFilter::new(level);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn parse_log_arg() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--logs" {
            let Some(raw) = args.next() else {
                eprintln!("`--logs` needs a value (info|warning|error|critical); using `info`.");
                return Some("info".to_string());
            };
            if let Some(level) = map_log_level(&raw) {
                return Some(level.to_string());
            }
            eprintln!(
                "Unknown log level `{raw}`. Use one of: info, warning, error, critical. Using `info`."
            );
            return Some("info".to_string());
        }
    }
    None
}

fn map_log_level(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warning" | "warn" => Some("warn"),
        "error" | "critical" => Some("error"),
        _ => None,
    }
}
