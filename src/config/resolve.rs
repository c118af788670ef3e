use std::net::IpAddr;

pub fn resolve_bind_addr() -> anyhow::Result<IpAddr> {
    let raw = resolve_string("--bind", "BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
    raw.parse()
        .map_err(|err| anyhow::anyhow!("invalid bind address `{raw}`: {err}"))
}

pub fn resolve_port() -> u16 {
    resolve_u64("--port", "PORT", 7379).min(u16::MAX as u64) as u16
}

pub fn resolve_data_dir() -> Option<String> {
    resolve_string("--data-dir", "DATA_DIR").filter(|s| !s.trim().is_empty())
}

pub fn resolve_snapshot_interval_secs() -> u64 {
    resolve_u64("--snapshot-interval-secs", "SNAPSHOT_INTERVAL_SECS", 300)
}

pub fn resolve_request_timeout_secs() -> u64 {
    resolve_u64("--request-timeout-secs", "REQUEST_TIMEOUT_SECS", 30)
}

pub fn resolve_search_ef() -> usize {
    resolve_usize("--search-ef", "VSET_SEARCH_EF", 100)
}

pub fn resolve_construction_ef() -> usize {
    resolve_usize("--construction-ef", "VSET_CONSTRUCTION_EF", 200)
}

pub fn resolve_default_count() -> usize {
    resolve_usize("--default-count", "VSET_DEFAULT_COUNT", 10)
}

pub fn resolve_max_ef() -> usize {
    resolve_usize("--max-ef", "VSET_MAX_EF", 1_000_000)
}

pub fn resolve_hnsw_m() -> usize {
    resolve_usize("--hnsw-m", "VSET_HNSW_M", crate::hnsw::DEFAULT_M)
}

pub fn resolve_read_slots() -> usize {
    let default = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    resolve_usize("--read-slots", "VSET_READ_SLOTS", default)
}

pub fn resolve_max_vector_dim() -> usize {
    resolve_usize("--max-vector-dim", "MAX_VECTOR_DIM", 32_768)
}

pub fn resolve_replication_backlog() -> usize {
    resolve_usize("--replication-backlog", "REPLICATION_BACKLOG", 10_000)
}

pub fn resolve_background_threads() -> bool {
    resolve_bool("--background-threads", "VSET_BACKGROUND_THREADS", true)
}

// Helpers

fn cli_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn resolve_string(flag: &str, env: &str) -> Option<String> {
    cli_arg(flag).or_else(|| std::env::var(env).ok())
}

fn resolve_parsed<T: std::str::FromStr>(flag: &str, env: &str) -> Option<T> {
    cli_arg(flag)
        .and_then(|raw| raw.parse().ok())
        .or_else(|| std::env::var(env).ok().and_then(|raw| raw.parse().ok()))
}

fn resolve_usize(flag: &str, env: &str, default: usize) -> usize {
    resolve_parsed(flag, env).unwrap_or(default)
}

fn resolve_u64(flag: &str, env: &str, default: u64) -> u64 {
    resolve_parsed(flag, env).unwrap_or(default)
}

fn resolve_bool(flag: &str, env: &str, default: bool) -> bool {
    resolve_string(flag, env)
        .and_then(|raw| parse_bool(&raw))
        .unwrap_or(default)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
