use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::keyspace::{Keyspace, Value};
use super::metrics::Metrics;
use super::replication::ReplicationLog;
use super::reply::{Reply, ReplySender};
use super::{insert, reflect, search, snapshot, Args, CommandContext, ControlMsg, EngineError};
use crate::config::Config;
use crate::vset::VsetError;

/// Owner of the keyspace. Runs on its own thread and never blocks on
/// anything but the command channel and, when a set is destroyed, that
/// set's in-flight background work.
pub(crate) struct Controller {
    pub(crate) config: Config,
    pub(crate) keyspace: Keyspace,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) replication: Arc<ReplicationLog>,
    pub(crate) tx: mpsc::UnboundedSender<ControlMsg>,
    snapshot_path: Option<PathBuf>,
}

impl Controller {
    pub(crate) fn new(
        config: Config,
        keyspace: Keyspace,
        metrics: Arc<Metrics>,
        replication: Arc<ReplicationLog>,
        tx: mpsc::UnboundedSender<ControlMsg>,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            keyspace,
            metrics,
            replication,
            tx,
            snapshot_path,
        }
    }

    pub(crate) fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControlMsg>) {
        tracing::debug!(keys = self.keyspace.len(), "controller started");
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                ControlMsg::Command { args, ctx, reply } => self.dispatch(args, ctx, reply),
                ControlMsg::InsertPrepared(task) => insert::complete(&mut self, task),
                ControlMsg::Save(done) => {
                    let _ = done.send(self.save());
                }
                ControlMsg::Shutdown => break,
            }
        }
        if self.snapshot_path.is_some() {
            if let Err(err) = self.save() {
                tracing::warn!(error = %err, "final snapshot failed");
            }
        }
        self.keyspace.clear();
        tracing::debug!("controller stopped");
    }

    fn dispatch(&mut self, args: Args, ctx: CommandContext, reply: ReplySender) {
        self.metrics.inc_command();
        let Some(first) = args.first() else {
            self.respond(reply, Reply::Error("ERR empty command".to_string()));
            return;
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        match name.as_str() {
            "VADD" => insert::vadd(self, args, ctx, reply),
            "VSIM" => search::vsim(self, args, ctx, reply),
            _ => {
                let result = self.execute(&name, &args).unwrap_or_else(Reply::from);
                self.respond(reply, result);
            }
        }
    }

    fn execute(&mut self, name: &str, args: &Args) -> Result<Reply, VsetError> {
        match name {
            "VREM" => self.vrem(args),
            "VDIM" => reflect::vdim(&self.keyspace, args),
            "VCARD" => reflect::vcard(&self.keyspace, args),
            "VEMB" => reflect::vemb(&self.keyspace, args),
            "VLINKS" => reflect::vlinks(&self.keyspace, args),
            "VINFO" => reflect::vinfo(&self.keyspace, args),
            "MEMUSAGE" => reflect::memusage(&self.keyspace, args),
            "DIGEST" => reflect::digest(&self.keyspace, args),
            "DEL" => self.del(args),
            "EXISTS" => self.exists(args),
            "TYPE" => self.type_of(args),
            "SET" => self.set_string(args),
            "GET" => self.get_string(args),
            "KEYS" => self.keys(args),
            "DBSIZE" => {
                arity(args, 1, "dbsize")?;
                Ok(Reply::Integer(self.keyspace.len() as i64))
            }
            "PING" => Ok(Reply::Simple("PONG".to_string())),
            "SAVE" => {
                arity(args, 1, "save")?;
                Ok(match self.save() {
                    Ok(()) => Reply::Ok,
                    Err(err) => Reply::Error(format!("ERR {err}")),
                })
            }
            other => Err(VsetError::UnknownCommand(other.to_ascii_lowercase())),
        }
    }

    pub(crate) fn respond(&self, reply: ReplySender, result: Reply) {
        if result.is_error() {
            self.metrics.inc_command_error();
        }
        let _ = reply.send(result);
    }

    pub(crate) fn replicate(&self, args: &Args) {
        self.replication.append(args.clone());
        self.metrics.inc_replicated();
    }

    fn save(&self) -> Result<(), EngineError> {
        let Some(path) = &self.snapshot_path else {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "no data directory configured"
            )));
        };
        snapshot::write_snapshot(path, &self.keyspace)?;
        self.metrics.inc_snapshot();
        tracing::info!(keys = self.keyspace.len(), path = %path.display(), "snapshot written");
        Ok(())
    }

    fn vrem(&mut self, args: &Args) -> Result<Reply, VsetError> {
        arity(args, 3, "vrem")?;
        let key = &args[1];
        let Some(set) = self.keyspace.vector_set(key)?.cloned() else {
            return Ok(Reply::Integer(0));
        };
        if !set.remove(&args[2]) {
            return Ok(Reply::Integer(0));
        }
        if set.is_empty() {
            drop(set);
            self.keyspace.remove(key);
            self.metrics.inc_set_destroyed();
        }
        self.replicate(args);
        Ok(Reply::Integer(1))
    }

    fn del(&mut self, args: &Args) -> Result<Reply, VsetError> {
        if args.len() < 2 {
            return Err(VsetError::WrongArity("del".to_string()));
        }
        let mut removed = 0i64;
        for key in &args[1..] {
            let was_set = matches!(self.keyspace.get(key), Some(Value::Set(_)));
            if self.keyspace.remove(key) {
                removed += 1;
                if was_set {
                    self.metrics.inc_set_destroyed();
                }
            }
        }
        if removed > 0 {
            self.replicate(args);
        }
        Ok(Reply::Integer(removed))
    }

    fn exists(&self, args: &Args) -> Result<Reply, VsetError> {
        if args.len() < 2 {
            return Err(VsetError::WrongArity("exists".to_string()));
        }
        let n = args[1..]
            .iter()
            .filter(|k| self.keyspace.contains(k))
            .count();
        Ok(Reply::Integer(n as i64))
    }

    fn type_of(&self, args: &Args) -> Result<Reply, VsetError> {
        arity(args, 2, "type")?;
        let name = self
            .keyspace
            .get(&args[1])
            .map_or("none", Value::type_name);
        Ok(Reply::Simple(name.to_string()))
    }

    fn set_string(&mut self, args: &Args) -> Result<Reply, VsetError> {
        arity(args, 3, "set")?;
        let replaced_set = matches!(self.keyspace.get(&args[1]), Some(Value::Set(_)));
        self.keyspace
            .insert(args[1].clone(), Value::Str(args[2].clone()));
        if replaced_set {
            self.metrics.inc_set_destroyed();
        }
        self.replicate(args);
        Ok(Reply::Ok)
    }

    fn get_string(&self, args: &Args) -> Result<Reply, VsetError> {
        arity(args, 2, "get")?;
        match self.keyspace.get(&args[1]) {
            None => Ok(Reply::Null),
            Some(Value::Str(v)) => Ok(Reply::Bulk(v.clone())),
            Some(Value::Set(_)) => Err(VsetError::WrongType),
        }
    }

    fn keys(&self, args: &Args) -> Result<Reply, VsetError> {
        arity(args, 2, "keys")?;
        let mut keys: Vec<&Vec<u8>> = self
            .keyspace
            .keys()
            .filter(|k| glob_match(&args[1], k))
            .collect();
        keys.sort();
        Ok(Reply::Array(
            keys.into_iter().map(|k| Reply::Bulk(k.clone())).collect(),
        ))
    }
}

pub(crate) fn arity(args: &Args, n: usize, name: &str) -> Result<(), VsetError> {
    if args.len() != n {
        return Err(VsetError::WrongArity(name.to_string()));
    }
    Ok(())
}

/// `*` and `?` wildcard matching over raw bytes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
