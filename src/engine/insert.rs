//! VADD: argument parsing, the synchronous path and the two-phase
//! background path.
//!
//! A background insert moves through `Preparing` (worker thread, holding a
//! lease on the set) to `Prepared` (context handed back to the controller)
//! and ends `Committed` or `Discarded`. Discarding happens when the key was
//! deleted or recreated, or the element appeared, while the worker ran.

use std::sync::Arc;

use super::controller::Controller;
use super::keyspace::{Keyspace, Value};
use super::reply::{Reply, ReplySender};
use super::{worker, Args, CommandContext, ControlMsg};
use crate::config::Config;
use crate::hnsw::{InsertContext, QuantMode};
use crate::vset::vector_spec::{eq_ignore_case, parse_number, parse_vector, VectorSpec};
use crate::vset::{
    BackgroundLease, CommitPath, InsertOutcome, Label, Projection, VectorSet, VsetError,
};

#[derive(Debug, PartialEq)]
pub(crate) struct AddRequest {
    pub(crate) key: Vec<u8>,
    pub(crate) spec: VectorSpec,
    pub(crate) label: Vec<u8>,
    pub(crate) cas: bool,
    /// Q8 unless NOQUANT or BIN was given.
    pub(crate) quant: QuantMode,
    pub(crate) ef: usize,
}

pub(crate) fn parse_vadd(args: &Args, config: &Config) -> Result<AddRequest, VsetError> {
    if args.len() < 5 {
        return Err(VsetError::WrongArity("vadd".to_string()));
    }
    let spec = parse_vector(args, 2, true)?;
    let mut pos = 2 + spec.consumed;
    let label = args
        .get(pos)
        .cloned()
        .ok_or_else(|| VsetError::WrongArity("vadd".to_string()))?;
    pos += 1;

    let mut cas = false;
    let mut quant = QuantMode::Q8;
    let mut ef = config.default_construction_ef;
    while pos < args.len() {
        let opt = &args[pos];
        if eq_ignore_case(opt, "CAS") {
            cas = true;
        } else if eq_ignore_case(opt, "NOQUANT") {
            quant = QuantMode::F32;
        } else if eq_ignore_case(opt, "Q8") {
            quant = QuantMode::Q8;
        } else if eq_ignore_case(opt, "BIN") {
            quant = QuantMode::Bin;
        } else if eq_ignore_case(opt, "EF") && pos + 1 < args.len() {
            pos += 1;
            let value: i64 = parse_number(&args[pos]).ok_or(VsetError::InvalidEf)?;
            if value <= 0 || value as u64 > config.max_ef as u64 {
                return Err(VsetError::InvalidEf);
            }
            ef = value as usize;
        } else {
            return Err(VsetError::InvalidAddOption);
        }
        pos += 1;
    }

    let reduce = spec.reduce.unwrap_or(0);
    if spec.values.len() > config.max_vector_dim || reduce > config.max_vector_dim {
        return Err(VsetError::DimensionTooLarge(config.max_vector_dim));
    }

    Ok(AddRequest {
        key: args[1].clone(),
        spec,
        label,
        cas,
        quant,
        ef,
    })
}

/// Rejects a request that does not fit an existing set.
pub(crate) fn validate_against(set: &VectorSet, req: &AddRequest) -> Result<(), VsetError> {
    if req.quant != set.quant() {
        return Err(VsetError::QuantMismatch);
    }
    if let Some(reduce) = req.spec.reduce {
        match set.projection() {
            None => return Err(VsetError::ProjectionMissing),
            Some(_) if reduce != set.dim() => return Err(VsetError::ProjectionMismatch),
            Some(_) => {}
        }
    }
    let expected = set.input_dim();
    if req.spec.values.len() != expected {
        return Err(VsetError::DimensionMismatch {
            got: req.spec.values.len(),
            expected,
        });
    }
    Ok(())
}

enum AddPlan {
    Sync {
        set: Arc<VectorSet>,
        label: Vec<u8>,
        vector: Vec<f32>,
        ef: usize,
    },
    Background {
        lease: BackgroundLease,
        key: Vec<u8>,
        label: Label,
        vector: Vec<f32>,
        ef: usize,
    },
}

fn plan(ctl: &mut Controller, args: &Args, ctx: CommandContext) -> Result<AddPlan, VsetError> {
    let req = parse_vadd(args, &ctl.config)?;
    let existing = ctl.keyspace.vector_set(&req.key)?.cloned();

    let (set, created) = match existing {
        Some(set) => {
            validate_against(&set, &req)?;
            (set, false)
        }
        None => {
            let quant = req.quant;
            let input_dim = req.spec.values.len();
            let (dim, projection) = match req.spec.reduce {
                Some(reduce) => (reduce, Some(Projection::random(input_dim, reduce))),
                None => (input_dim, None),
            };
            let set = Arc::new(VectorSet::with_params(
                dim,
                quant,
                projection,
                ctl.keyspace.params(),
                ctl.keyspace.registry(),
            ));
            ctl.keyspace.insert(req.key.clone(), Value::Set(set.clone()));
            tracing::debug!(dim, quant = quant.name(), "vector set created");
            (set, true)
        }
    };

    let vector = match set.projection() {
        Some(p) => p.apply(&req.spec.values),
        None => req.spec.values,
    };

    // the first element of a new key is always added synchronously
    let background = req.cas
        && !created
        && ctx.allows_background()
        && ctl.config.background_threads
        && !set.contains(&req.label);
    if !background {
        return Ok(AddPlan::Sync {
            set,
            label: req.label,
            vector,
            ef: req.ef,
        });
    }

    let lease = set.lease().ok_or(VsetError::Destroying)?;
    Ok(AddPlan::Background {
        lease,
        key: req.key,
        label: Label::from(req.label),
        vector,
        ef: req.ef,
    })
}

pub(crate) fn vadd(ctl: &mut Controller, args: Args, ctx: CommandContext, reply: ReplySender) {
    match plan(ctl, &args, ctx) {
        Err(err) => ctl.respond(reply, err.into()),
        Ok(AddPlan::Sync {
            set,
            label,
            vector,
            ef,
        }) => {
            let outcome = set.insert(&label, &vector, true, ef);
            ctl.metrics.inc_insert_sync();
            ctl.replicate(&args);
            let added = outcome == InsertOutcome::Inserted;
            ctl.respond(reply, Reply::Integer(added as i64));
        }
        Ok(AddPlan::Background {
            lease,
            key,
            label,
            vector,
            ef,
        }) => {
            let job = InsertJob {
                key,
                identity: lease.identity(),
                label,
                vector,
                ef,
                args,
                reply,
            };
            start_background(ctl, job, lease);
        }
    }
}

/// Request-level data a background insert carries from start to reply.
pub(crate) struct InsertJob {
    key: Vec<u8>,
    identity: u64,
    label: Label,
    vector: Vec<f32>,
    ef: usize,
    args: Args,
    reply: ReplySender,
}

pub(crate) enum InsertState {
    Preparing(BackgroundLease),
    Prepared(InsertContext<Label>),
    Committed(CommitPath),
    Discarded(DiscardReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DiscardReason {
    KeyMissing,
    WrongType,
    SetReplaced,
    AlreadyPresent,
}

pub(crate) struct TwoPhaseInsert {
    job: InsertJob,
    state: InsertState,
}

impl TwoPhaseInsert {
    pub(crate) fn new(job: InsertJob, lease: BackgroundLease) -> Self {
        Self {
            job,
            state: InsertState::Preparing(lease),
        }
    }

    /// Candidate search; runs on a worker thread. The lease is released as
    /// soon as the graph is no longer read.
    pub(crate) fn prepare(self) -> Self {
        let Self { job, state } = self;
        let state = match state {
            InsertState::Preparing(lease) => {
                let ctx = lease.prepare_insert(job.label.clone(), &job.vector, job.ef);
                drop(lease);
                InsertState::Prepared(ctx)
            }
            other => other,
        };
        Self { job, state }
    }

    /// Links the prepared element into the set it was prepared against, if
    /// that set is still the one under the key. Runs on the controller.
    pub(crate) fn commit(self, keyspace: &Keyspace) -> Self {
        let Self { job, state } = self;
        let state = match state {
            InsertState::Prepared(ctx) => match target_set(keyspace, &job) {
                Ok(set) => InsertState::Committed(set.commit_prepared(ctx, &job.vector, job.ef)),
                Err(reason) => InsertState::Discarded(reason),
            },
            other => other,
        };
        Self { job, state }
    }

    pub(crate) fn state(&self) -> &InsertState {
        &self.state
    }
}

fn target_set<'a>(keyspace: &'a Keyspace, job: &InsertJob) -> Result<&'a Arc<VectorSet>, DiscardReason> {
    match keyspace.get(&job.key) {
        None => Err(DiscardReason::KeyMissing),
        Some(Value::Str(_)) => Err(DiscardReason::WrongType),
        Some(Value::Set(set)) if set.identity() != job.identity => Err(DiscardReason::SetReplaced),
        Some(Value::Set(set)) if set.contains(&job.label) => Err(DiscardReason::AlreadyPresent),
        Some(Value::Set(set)) => Ok(set),
    }
}

fn start_background(ctl: &mut Controller, job: InsertJob, lease: BackgroundLease) {
    let tx = ctl.tx.clone();
    let task = TwoPhaseInsert::new(job, lease);
    let spawned = worker::spawn_worker("vset-insert", task, move |task: TwoPhaseInsert| {
        let prepared = task.prepare();
        if tx.send(ControlMsg::InsertPrepared(prepared)).is_err() {
            tracing::debug!("controller stopped before a prepared insert could commit");
        }
    });
    match spawned {
        Ok(()) => ctl.metrics.inc_insert_background(),
        Err((task, err)) => {
            tracing::warn!(error = %err, "cannot start insert worker");
            ctl.metrics.inc_thread_start_failure();
            let TwoPhaseInsert { job, state } = task;
            drop(state);
            ctl.respond(job.reply, VsetError::ThreadStart.into());
        }
    }
}

/// Second half of a background insert, on the controller. The client is
/// answered 1 whether the element was linked or the result was discarded.
pub(crate) fn complete(ctl: &mut Controller, task: TwoPhaseInsert) {
    let TwoPhaseInsert { job, state } = task.commit(&ctl.keyspace);
    match state {
        InsertState::Committed(path) => {
            ctl.metrics.record_commit(path);
            if path == CommitPath::Fallback {
                tracing::debug!("graph changed during background insert; inserted synchronously");
            }
            ctl.replicate(&job.args);
        }
        InsertState::Discarded(reason) => {
            ctl.metrics.inc_insert_discarded();
            tracing::debug!(?reason, "background insert discarded");
        }
        InsertState::Preparing(_) | InsertState::Prepared(_) => {
            tracing::warn!("background insert completed without being prepared");
        }
    }
    ctl.respond(job.reply, Reply::Integer(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vset::IndexParams;
    use tokio::sync::oneshot;

    fn args(parts: &[&str]) -> Args {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn parses_options() {
        let config = Config::default();
        let req = parse_vadd(
            &args(&["VADD", "k", "VALUES", "2", "1", "2", "e", "cas", "BIN", "EF", "64"]),
            &config,
        )
        .unwrap();
        assert_eq!(req.label, b"e".to_vec());
        assert!(req.cas);
        assert_eq!(req.quant, QuantMode::Bin);
        assert_eq!(req.ef, 64);

        let req = parse_vadd(&args(&["VADD", "k", "VALUES", "1", "1", "e"]), &config).unwrap();
        assert_eq!(req.ef, 200);
        assert_eq!(req.quant, QuantMode::Q8);
    }

    #[test]
    fn rejects_bad_options() {
        let config = Config::default();
        let base = ["VADD", "k", "VALUES", "1", "1", "e"];
        let with = |extra: &[&str]| {
            let mut a: Vec<&str> = base.to_vec();
            a.extend_from_slice(extra);
            parse_vadd(&args(&a), &config).unwrap_err()
        };
        assert_eq!(with(&["EF", "0"]), VsetError::InvalidEf);
        assert_eq!(with(&["EF", "1000001"]), VsetError::InvalidEf);
        assert_eq!(with(&["BOGUS"]), VsetError::InvalidAddOption);
        assert_eq!(with(&["EF"]), VsetError::InvalidAddOption);
        assert_eq!(
            parse_vadd(
                &args(&["VADD", "k", "REDUCE", "18446744073709551615", "VALUES", "1", "1", "e"]),
                &config
            )
            .unwrap_err(),
            VsetError::DimensionTooLarge(config.max_vector_dim)
        );
        assert_eq!(
            parse_vadd(&args(&["VADD", "k", "VALUES", "1"]), &config).unwrap_err(),
            VsetError::WrongArity("vadd".into())
        );
    }

    #[test]
    fn validation_against_existing_set() {
        let config = Config::default();
        let registry = crate::vset::IdentityRegistry::new();
        let set = VectorSet::new(4, QuantMode::Q8, &registry);
        let req = parse_vadd(&args(&["VADD", "k", "VALUES", "3", "1", "2", "3", "e"]), &config)
            .unwrap();
        assert_eq!(
            validate_against(&set, &req),
            Err(VsetError::DimensionMismatch {
                got: 3,
                expected: 4
            })
        );
        let req = parse_vadd(
            &args(&["VADD", "k", "VALUES", "4", "1", "2", "3", "4", "e", "NOQUANT"]),
            &config,
        )
        .unwrap();
        assert_eq!(validate_against(&set, &req), Err(VsetError::QuantMismatch));

        // no option means Q8, which an f32 set refuses as well
        let f32_set = VectorSet::new(4, QuantMode::F32, &registry);
        let req = parse_vadd(&args(&["VADD", "k", "VALUES", "4", "1", "2", "3", "4", "e"]), &config)
            .unwrap();
        assert_eq!(validate_against(&f32_set, &req), Err(VsetError::QuantMismatch));
        let req = parse_vadd(
            &args(&["VADD", "k", "REDUCE", "2", "VALUES", "4", "1", "2", "3", "4", "e"]),
            &config,
        )
        .unwrap();
        assert_eq!(validate_against(&set, &req), Err(VsetError::ProjectionMissing));
    }

    fn job_for(set: &Arc<VectorSet>, label: &str) -> (InsertJob, oneshot::Receiver<Reply>) {
        let (reply, rx) = oneshot::channel();
        let job = InsertJob {
            key: b"k".to_vec(),
            identity: set.identity(),
            label: Label::from(label.as_bytes()),
            vector: vec![0.3, 0.1, 0.9],
            ef: 32,
            args: args(&["VADD", "k", "VALUES", "3", "0.3", "0.1", "0.9", label, "CAS"]),
            reply,
        };
        (job, rx)
    }

    fn keyspace_with_set() -> (Keyspace, Arc<VectorSet>) {
        let mut ks = Keyspace::new(IndexParams::default());
        let set = Arc::new(VectorSet::new(3, QuantMode::Q8, ks.registry()));
        set.insert(b"seed", &[1.0, 0.0, 0.0], true, 32);
        ks.insert(b"k".to_vec(), Value::Set(set.clone()));
        (ks, set)
    }

    #[test]
    fn prepared_insert_commits_into_the_same_set() {
        let (ks, set) = keyspace_with_set();
        let (job, _rx) = job_for(&set, "x");
        let task = TwoPhaseInsert::new(job, set.lease().unwrap()).prepare();
        assert!(matches!(task.state(), InsertState::Prepared(_)));
        assert_eq!(set.in_flight(), 0);
        let task = task.commit(&ks);
        assert!(matches!(
            task.state(),
            InsertState::Committed(CommitPath::Optimistic)
        ));
        assert!(set.contains(b"x"));
    }

    #[test]
    fn prepared_insert_is_discarded_when_the_key_changed() {
        let (mut ks, set) = keyspace_with_set();
        let (job, _rx) = job_for(&set, "x");
        let task = TwoPhaseInsert::new(job, set.lease().unwrap()).prepare();

        let replacement = Arc::new(VectorSet::new(3, QuantMode::Q8, ks.registry()));
        ks.insert(b"k".to_vec(), Value::Set(replacement.clone()));
        let task = task.commit(&ks);
        assert!(matches!(
            task.state(),
            InsertState::Discarded(DiscardReason::SetReplaced)
        ));
        assert!(!replacement.contains(b"x"));
    }

    #[test]
    fn prepared_insert_is_discarded_when_the_element_appeared() {
        let (ks, set) = keyspace_with_set();
        let (job, _rx) = job_for(&set, "x");
        let task = TwoPhaseInsert::new(job, set.lease().unwrap()).prepare();
        set.insert(b"x", &[0.0, 1.0, 0.0], true, 32);
        let task = task.commit(&ks);
        assert!(matches!(
            task.state(),
            InsertState::Discarded(DiscardReason::AlreadyPresent)
        ));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn prepared_insert_falls_back_after_a_concurrent_write() {
        let (ks, set) = keyspace_with_set();
        let (job, _rx) = job_for(&set, "x");
        let task = TwoPhaseInsert::new(job, set.lease().unwrap()).prepare();
        set.insert(b"y", &[0.0, 1.0, 0.0], true, 32);
        let task = task.commit(&ks);
        assert!(matches!(
            task.state(),
            InsertState::Committed(CommitPath::Fallback)
        ));
        assert_eq!(set.len(), 3);
    }
}
