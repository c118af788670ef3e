mod resolve;

use std::net::{IpAddr, Ipv4Addr};

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Snapshots are disabled when unset.
    pub data_dir: Option<String>,
    pub snapshot_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub default_search_ef: usize,
    pub default_construction_ef: usize,
    pub default_count: usize,
    pub max_ef: usize,
    pub hnsw_m: usize,
    pub read_slots: usize,
    pub max_vector_dim: usize,
    pub replication_backlog: usize,
    /// Allows CAS inserts and searches to run on worker threads.
    pub background_threads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7379,
            data_dir: None,
            snapshot_interval_secs: 300,
            request_timeout_secs: 30,
            default_search_ef: 100,
            default_construction_ef: 200,
            default_count: 10,
            max_ef: 1_000_000,
            hnsw_m: crate::hnsw::DEFAULT_M,
            read_slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_vector_dim: 32_768,
            replication_backlog: 10_000,
            background_threads: true,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            bind_addr: resolve::resolve_bind_addr()?,
            port: resolve::resolve_port(),
            data_dir: resolve::resolve_data_dir(),
            snapshot_interval_secs: resolve::resolve_snapshot_interval_secs().max(1),
            request_timeout_secs: resolve::resolve_request_timeout_secs().max(1),
            default_search_ef: resolve::resolve_search_ef().max(1),
            default_construction_ef: resolve::resolve_construction_ef().max(1),
            default_count: resolve::resolve_default_count().max(1),
            max_ef: resolve::resolve_max_ef().max(1),
            hnsw_m: resolve::resolve_hnsw_m(),
            read_slots: resolve::resolve_read_slots().max(1),
            max_vector_dim: resolve::resolve_max_vector_dim().max(1),
            replication_backlog: resolve::resolve_replication_backlog(),
            background_threads: resolve::resolve_background_threads(),
        };
        if config.hnsw_m < 2 {
            anyhow::bail!("HNSW M must be at least 2 (got {})", config.hnsw_m);
        }
        Ok(config)
    }

    pub fn snapshot_path(&self) -> Option<std::path::PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| std::path::Path::new(dir).join(SNAPSHOT_FILE))
    }
}

pub const SNAPSHOT_FILE: &str = "dump.vset";
