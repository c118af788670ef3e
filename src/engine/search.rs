use std::sync::Arc;

use super::controller::Controller;
use super::metrics::Metrics;
use super::reply::{Reply, ReplySender};
use super::{worker, Args, CommandContext};
use crate::config::Config;
use crate::vset::vector_spec::{eq_ignore_case, parse_number, parse_vector};
use crate::vset::{BackgroundLease, VectorSet, VsetError};

#[derive(Clone, Debug, PartialEq)]
pub struct SearchParams {
    pub count: usize,
    /// Results farther than this cosine distance are cut off.
    pub epsilon: f32,
    pub with_scores: bool,
    /// 0 selects the configured default.
    pub ef: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            count: 10,
            epsilon: 2.0,
            with_scores: false,
            ef: 0,
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Query {
    Element(Vec<u8>),
    Vector(Vec<f32>),
}

#[derive(Debug, PartialEq)]
pub(crate) struct SearchRequest {
    pub(crate) key: Vec<u8>,
    pub(crate) query: Query,
    pub(crate) params: SearchParams,
    pub(crate) nothread: bool,
}

pub(crate) fn parse_vsim(args: &Args, config: &Config) -> Result<SearchRequest, VsetError> {
    if args.len() < 4 {
        return Err(VsetError::WrongArity("vsim".to_string()));
    }
    let (query, mut pos) = if eq_ignore_case(&args[2], "ELE") {
        (Query::Element(args[3].clone()), 4)
    } else {
        let spec = parse_vector(args, 2, false)?;
        (Query::Vector(spec.values), 2 + spec.consumed)
    };

    let mut params = SearchParams {
        count: config.default_count,
        ..SearchParams::default()
    };
    let mut nothread = false;
    while pos < args.len() {
        let opt = &args[pos];
        let value = args.get(pos + 1);
        if eq_ignore_case(opt, "WITHSCORES") {
            params.with_scores = true;
        } else if eq_ignore_case(opt, "NOTHREAD") {
            nothread = true;
        } else if eq_ignore_case(opt, "COUNT") && value.is_some() {
            let count: i64 = value
                .and_then(|v| parse_number(v))
                .ok_or(VsetError::InvalidCount)?;
            if count <= 0 {
                return Err(VsetError::InvalidCount);
            }
            params.count = count as usize;
            pos += 1;
        } else if eq_ignore_case(opt, "EPSILON") && value.is_some() {
            let epsilon: f64 = value
                .and_then(|v| parse_number(v))
                .ok_or(VsetError::InvalidEpsilon)?;
            if !(epsilon > 0.0) {
                return Err(VsetError::InvalidEpsilon);
            }
            params.epsilon = epsilon as f32;
            pos += 1;
        } else if eq_ignore_case(opt, "EF") && value.is_some() {
            let ef: i64 = value
                .and_then(|v| parse_number(v))
                .ok_or(VsetError::InvalidEf)?;
            if ef <= 0 || ef as u64 > config.max_ef as u64 {
                return Err(VsetError::InvalidEf);
            }
            params.ef = ef as usize;
            pos += 1;
        } else {
            return Err(VsetError::Syntax("VSIM"));
        }
        pos += 1;
    }

    Ok(SearchRequest {
        key: args[1].clone(),
        query,
        params,
        nothread,
    })
}

/// Beam width actually used: the requested or default value, and never
/// less than the number of results asked for.
pub fn effective_ef(requested: usize, count: usize, default_ef: usize) -> usize {
    let ef = if requested == 0 { default_ef } else { requested };
    ef.max(count)
}

pub fn run_search(set: &VectorSet, query: &[f32], params: &SearchParams, default_ef: usize) -> Reply {
    let ef = effective_ef(params.ef, params.count, default_ef);
    let hits = set.search(query, ef);
    let kept = hits
        .into_iter()
        .take(params.count)
        .take_while(|n| n.distance <= params.epsilon);
    if params.with_scores {
        Reply::Map(
            kept.map(|n| {
                (
                    Reply::Bulk(n.payload.to_vec()),
                    Reply::Double(1.0 - n.distance as f64 / 2.0),
                )
            })
            .collect(),
        )
    } else {
        Reply::Array(kept.map(|n| Reply::Bulk(n.payload.to_vec())).collect())
    }
}

struct SearchTask {
    lease: BackgroundLease,
    query: Vec<f32>,
    params: SearchParams,
    default_ef: usize,
    metrics: Arc<Metrics>,
    reply: ReplySender,
}

fn run_task(task: SearchTask) {
    let SearchTask {
        lease,
        query,
        params,
        default_ef,
        metrics,
        reply,
    } = task;
    let result = run_search(&lease, &query, &params, default_ef);
    metrics.inc_search_background_done();
    drop(lease);
    let _ = reply.send(result);
}

enum Plan {
    Done(Reply),
    Run {
        set: Arc<VectorSet>,
        query: Vec<f32>,
        params: SearchParams,
        background: bool,
    },
}

fn plan(ctl: &Controller, args: &Args, ctx: CommandContext) -> Result<Plan, VsetError> {
    let req = parse_vsim(args, &ctl.config)?;
    let Some(set) = ctl.keyspace.vector_set(&req.key)?.cloned() else {
        return Ok(Plan::Done(Reply::Array(Vec::new())));
    };
    let query = match req.query {
        Query::Element(label) => set.embedding(&label).ok_or(VsetError::ElementNotFound)?,
        Query::Vector(values) => {
            let got = values.len();
            let projected = set.project(values);
            if projected.len() != set.dim() {
                return Err(VsetError::DimensionMismatch {
                    got,
                    expected: set.dim(),
                });
            }
            projected
        }
    };
    let background = !req.nothread && ctx.allows_background() && ctl.config.background_threads;
    Ok(Plan::Run {
        set,
        query,
        params: req.params,
        background,
    })
}

pub(crate) fn vsim(ctl: &mut Controller, args: Args, ctx: CommandContext, reply: ReplySender) {
    let (set, query, params, background) = match plan(ctl, &args, ctx) {
        Err(err) => return ctl.respond(reply, err.into()),
        Ok(Plan::Done(result)) => return ctl.respond(reply, result),
        Ok(Plan::Run {
            set,
            query,
            params,
            background,
        }) => (set, query, params, background),
    };
    let default_ef = ctl.config.default_search_ef;

    if !background {
        ctl.metrics.inc_search_sync();
        let result = run_search(&set, &query, &params, default_ef);
        return ctl.respond(reply, result);
    }

    let Some(lease) = set.lease() else {
        return ctl.respond(reply, VsetError::Destroying.into());
    };
    let task = SearchTask {
        lease,
        query,
        params,
        default_ef,
        metrics: ctl.metrics.clone(),
        reply,
    };
    match worker::spawn_worker("vset-search", task, run_task) {
        Ok(()) => ctl.metrics.inc_search_background(),
        Err((task, err)) => {
            tracing::warn!(error = %err, "cannot start search worker");
            ctl.metrics.inc_thread_start_failure();
            let SearchTask { lease, reply, .. } = task;
            drop(lease);
            ctl.respond(reply, VsetError::ThreadStart.into());
        }
    }
}
