use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::vset::CommitPath;

#[derive(Debug, Default)]
pub struct Metrics {
    commands: AtomicU64,
    command_errors: AtomicU64,
    inserts_sync: AtomicU64,
    inserts_background: AtomicU64,
    commits_optimistic: AtomicU64,
    commits_fallback: AtomicU64,
    inserts_discarded: AtomicU64,
    searches_sync: AtomicU64,
    searches_background: AtomicU64,
    searches_background_done: AtomicU64,
    thread_start_failures: AtomicU64,
    sets_destroyed: AtomicU64,
    snapshots: AtomicU64,
    replicated: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub commands: u64,
    pub command_errors: u64,
    pub inserts_sync: u64,
    pub inserts_background: u64,
    pub commits_optimistic: u64,
    pub commits_fallback: u64,
    pub inserts_discarded: u64,
    pub searches_sync: u64,
    pub searches_background: u64,
    pub searches_background_done: u64,
    pub thread_start_failures: u64,
    pub sets_destroyed: u64,
    pub snapshots: u64,
    pub replicated: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn inc_command(&self) {
        bump(&self.commands);
    }

    pub fn inc_command_error(&self) {
        bump(&self.command_errors);
    }

    pub fn inc_insert_sync(&self) {
        bump(&self.inserts_sync);
    }

    pub fn inc_insert_background(&self) {
        bump(&self.inserts_background);
    }

    pub fn record_commit(&self, path: CommitPath) {
        match path {
            CommitPath::Optimistic => bump(&self.commits_optimistic),
            CommitPath::Fallback => bump(&self.commits_fallback),
        }
    }

    pub fn inc_insert_discarded(&self) {
        bump(&self.inserts_discarded);
    }

    pub fn inc_search_sync(&self) {
        bump(&self.searches_sync);
    }

    pub fn inc_search_background(&self) {
        bump(&self.searches_background);
    }

    pub fn inc_search_background_done(&self) {
        bump(&self.searches_background_done);
    }

    pub fn inc_thread_start_failure(&self) {
        bump(&self.thread_start_failures);
    }

    pub fn inc_set_destroyed(&self) {
        bump(&self.sets_destroyed);
    }

    pub fn inc_snapshot(&self) {
        bump(&self.snapshots);
    }

    pub fn inc_replicated(&self) {
        bump(&self.replicated);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            commands: load(&self.commands),
            command_errors: load(&self.command_errors),
            inserts_sync: load(&self.inserts_sync),
            inserts_background: load(&self.inserts_background),
            commits_optimistic: load(&self.commits_optimistic),
            commits_fallback: load(&self.commits_fallback),
            inserts_discarded: load(&self.inserts_discarded),
            searches_sync: load(&self.searches_sync),
            searches_background: load(&self.searches_background),
            searches_background_done: load(&self.searches_background_done),
            thread_start_failures: load(&self.thread_start_failures),
            sets_destroyed: load(&self.sets_destroyed),
            snapshots: load(&self.snapshots),
            replicated: load(&self.replicated),
        }
    }

    /// Plain-text exposition, one `vset_<name> <value>` line per counter.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let rows = [
            ("commands_total", s.commands),
            ("command_errors_total", s.command_errors),
            ("inserts_sync_total", s.inserts_sync),
            ("inserts_background_total", s.inserts_background),
            ("commits_optimistic_total", s.commits_optimistic),
            ("commits_fallback_total", s.commits_fallback),
            ("inserts_discarded_total", s.inserts_discarded),
            ("searches_sync_total", s.searches_sync),
            ("searches_background_total", s.searches_background),
            ("searches_background_done_total", s.searches_background_done),
            ("thread_start_failures_total", s.thread_start_failures),
            ("sets_destroyed_total", s.sets_destroyed),
            ("snapshots_total", s.snapshots),
            ("replicated_commands_total", s.replicated),
        ];
        let mut out = String::new();
        for (name, value) in rows {
            let _ = writeln!(out, "vset_{name} {value}");
        }
        out
    }
}
