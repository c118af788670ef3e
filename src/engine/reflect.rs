//! Read-only introspection commands. They run inline on the controller.

use super::controller::arity;
use super::keyspace::Keyspace;
use super::reply::Reply;
use super::Args;
use crate::hnsw::QuantMode;
use crate::vset::vector_spec::eq_ignore_case;
use crate::vset::VsetError;

fn similarity(distance: f32) -> Reply {
    Reply::Double(1.0 - distance as f64 / 2.0)
}

pub(crate) fn vdim(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    arity(args, 2, "vdim")?;
    let set = ks.vector_set(&args[1])?.ok_or(VsetError::NoSuchKey)?;
    Ok(Reply::Integer(set.dim() as i64))
}

pub(crate) fn vcard(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    arity(args, 2, "vcard")?;
    let n = ks.vector_set(&args[1])?.map_or(0, |set| set.len());
    Ok(Reply::Integer(n as i64))
}

pub(crate) fn vemb(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    if args.len() != 3 && args.len() != 4 {
        return Err(VsetError::WrongArity("vemb".to_string()));
    }
    let raw = match args.get(3) {
        None => false,
        Some(opt) if eq_ignore_case(opt, "RAW") => true,
        Some(_) => return Err(VsetError::InvalidOption),
    };
    let Some(set) = ks.vector_set(&args[1])? else {
        return Ok(Reply::Null);
    };

    if !raw {
        return Ok(set.embedding(&args[2]).map_or(Reply::Null, |v| {
            Reply::Array(v.into_iter().map(|x| Reply::Double(x as f64)).collect())
        }));
    }
    let Some(stored) = set.raw_embedding(&args[2]) else {
        return Ok(Reply::Null);
    };
    let mut out = vec![
        Reply::Simple(stored.quant.name().to_string()),
        Reply::Bulk(stored.bytes),
        Reply::Double(stored.l2 as f64),
    ];
    if stored.quant == QuantMode::Q8 {
        out.push(Reply::Double(stored.range as f64));
    }
    Ok(Reply::Array(out))
}

pub(crate) fn vlinks(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    if args.len() != 3 && args.len() != 4 {
        return Err(VsetError::WrongArity("vlinks".to_string()));
    }
    let with_scores = match args.get(3) {
        None => false,
        Some(opt) if eq_ignore_case(opt, "WITHSCORES") => true,
        Some(_) => return Err(VsetError::InvalidOption),
    };
    let Some(set) = ks.vector_set(&args[1])? else {
        return Ok(Reply::Null);
    };
    let Some(layers) = set.links(&args[2]) else {
        return Ok(Reply::Null);
    };

    let replies = layers
        .into_iter()
        .rev()
        .map(|layer| {
            if with_scores {
                Reply::Map(
                    layer
                        .into_iter()
                        .map(|n| (Reply::Bulk(n.payload.to_vec()), similarity(n.distance)))
                        .collect(),
                )
            } else {
                Reply::Array(
                    layer
                        .into_iter()
                        .map(|n| Reply::Bulk(n.payload.to_vec()))
                        .collect(),
                )
            }
        })
        .collect();
    Ok(Reply::Array(replies))
}

pub(crate) fn vinfo(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    arity(args, 2, "vinfo")?;
    let Some(set) = ks.vector_set(&args[1])? else {
        return Ok(Reply::NullArray);
    };
    let field = |name: &str| Reply::Simple(name.to_string());
    let mut info = vec![
        (field("quant-type"), Reply::Simple(set.quant().name().to_string())),
        (field("vector-dim"), Reply::Integer(set.dim() as i64)),
        (field("size"), Reply::Integer(set.len() as i64)),
        (field("max-level"), Reply::Integer(set.index().max_level() as i64)),
        (field("vset-uid"), Reply::Integer(set.identity() as i64)),
        (
            field("hnsw-max-node-uid"),
            Reply::Integer(set.index().last_uid() as i64),
        ),
    ];
    if let Some(p) = set.projection() {
        info.push((
            field("projection-input-dim"),
            Reply::Integer(p.input_dim() as i64),
        ));
    }
    Ok(Reply::Map(info))
}

pub(crate) fn memusage(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    arity(args, 2, "memusage")?;
    Ok(ks
        .vector_set(&args[1])?
        .map_or(Reply::Null, |set| Reply::Integer(set.mem_usage() as i64)))
}

pub(crate) fn digest(ks: &Keyspace, args: &Args) -> Result<Reply, VsetError> {
    arity(args, 2, "digest")?;
    Ok(ks
        .vector_set(&args[1])?
        .map_or(Reply::Null, |set| Reply::Bulk(set.digest().into_bytes())))
}
