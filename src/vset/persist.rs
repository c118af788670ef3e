//! Binary encoding of one vector set.
//!
//! A [`SetHeader`] (dimension, element count, quant code, optional
//! projection) followed by one [`DiskNode`] per element, each written with
//! bincode. Node params are the flat list produced by
//! [`Hnsw::serialize_node`](crate::hnsw::Hnsw::serialize_node).

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::{IndexParams, IdentityRegistry, Label, Projection, VectorSet, VsetError};
use crate::hnsw::QuantMode;

pub const ENCODING_VERSION: u32 = 0;

#[derive(Debug, Serialize, Deserialize)]
struct SetHeader {
    dim: u64,
    count: u64,
    quant: u64,
    projection: Option<DiskProjection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskProjection {
    input_dim: u64,
    matrix: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskNode {
    label: Vec<u8>,
    vector: Vec<u8>,
    params: Vec<u64>,
}

pub(crate) fn codec_error(err: bincode::Error) -> VsetError {
    VsetError::Corrupt(format!("bincode: {err}"))
}

pub fn save<W: Write>(set: &VectorSet, w: &mut W) -> Result<(), VsetError> {
    let nodes: Vec<DiskNode> = set.with_map(|map| {
        map.iter()
            .filter_map(|(label, &handle)| {
                let node = set.index().serialize_node(handle)?;
                Some(DiskNode {
                    label: label.to_vec(),
                    vector: node.vector,
                    params: node.params,
                })
            })
            .collect()
    });
    let header = SetHeader {
        dim: set.dim() as u64,
        count: nodes.len() as u64,
        quant: set.quant().code(),
        projection: set.projection().map(|p| DiskProjection {
            input_dim: p.input_dim() as u64,
            matrix: p.to_bytes(),
        }),
    };
    bincode::serialize_into(&mut *w, &header).map_err(codec_error)?;
    for node in &nodes {
        bincode::serialize_into(&mut *w, node).map_err(codec_error)?;
    }
    Ok(())
}

pub fn encode(set: &VectorSet) -> Result<Vec<u8>, VsetError> {
    let mut buf = Vec::new();
    save(set, &mut buf)?;
    Ok(buf)
}

/// Rebuilds a set. Any inconsistency fails the whole load; nothing
/// partially built escapes.
pub fn load<R: Read>(
    r: &mut R,
    version: u32,
    params: IndexParams,
    registry: &IdentityRegistry,
) -> Result<VectorSet, VsetError> {
    if version != ENCODING_VERSION {
        return Err(VsetError::UnsupportedVersion(version));
    }
    let header: SetHeader = bincode::deserialize_from(&mut *r).map_err(codec_error)?;
    let dim = dimension(header.dim, params.max_dim)?;
    let quant = QuantMode::from_code(header.quant)
        .ok_or_else(|| VsetError::Corrupt(format!("unknown quantization {}", header.quant)))?;
    let projection = match header.projection {
        None => None,
        Some(p) => {
            let input_dim = dimension(p.input_dim, params.max_dim)?;
            Some(Projection::from_bytes(input_dim, dim, &p.matrix)?)
        }
    };

    let set = VectorSet::with_params(dim, quant, projection, params, registry);
    let expected = quant.bytes_for(dim);
    for _ in 0..header.count {
        let node: DiskNode = bincode::deserialize_from(&mut *r).map_err(codec_error)?;
        if node.vector.len() != expected {
            return Err(VsetError::Corrupt(format!(
                "mismatching vector dimension: {} bytes, expected {expected}",
                node.vector.len()
            )));
        }
        let label = Label::from(node.label);
        let handle = set
            .index()
            .insert_serialized(&node.vector, &node.params, label.clone())?;
        if !set.insert_loaded(label, handle) {
            return Err(VsetError::Corrupt("duplicate element".into()));
        }
    }
    set.index().finalize_after_load()?;
    Ok(set)
}

pub fn decode(
    bytes: &[u8],
    version: u32,
    params: IndexParams,
    registry: &IdentityRegistry,
) -> Result<VectorSet, VsetError> {
    let mut r = bytes;
    let set = load(&mut r, version, params, registry)?;
    if !r.is_empty() {
        return Err(VsetError::Corrupt("trailing bytes".into()));
    }
    Ok(set)
}

fn dimension(v: u64, max: usize) -> Result<usize, VsetError> {
    match usize::try_from(v) {
        Ok(dim) if dim > 0 && dim <= max => Ok(dim),
        _ => Err(VsetError::Corrupt(format!("dimension {v} out of range"))),
    }
}
