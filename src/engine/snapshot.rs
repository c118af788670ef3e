//! Snapshot file: a sequence of records, one per key.
//!
//! Every record starts with a 16 byte header (magic, encoding version, value
//! type, payload length, CRC32 of the payload). The payload is the bincode
//! encoded key followed by either the string value or the encoded vector set.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crc32fast::Hasher;
use serde::Serialize;

use super::keyspace::{Keyspace, Value};
use super::EngineError;
use crate::vset::persist::{self, codec_error, ENCODING_VERSION};
use crate::vset::{IndexParams, VsetError};

const SNAPSHOT_MAGIC: u32 = 0x5653_4554;
const HEADER_BYTES: usize = 16;
const TYPE_STRING: u16 = 0;
const TYPE_SET: u16 = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
struct RecordHeader {
    version: u16,
    kind: u16,
    len: u32,
    crc32: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf[0..4].copy_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, VsetError> {
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let half = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);
        if word(0) != SNAPSHOT_MAGIC {
            return Err(VsetError::Corrupt("bad record magic".into()));
        }
        let version = half(4);
        if u32::from(version) != ENCODING_VERSION {
            return Err(VsetError::UnsupportedVersion(u32::from(version)));
        }
        Ok(Self {
            version,
            kind: half(6),
            len: word(8),
            crc32: word(12),
        })
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Serializes every key in the keyspace. Key order is sorted so identical
/// contents give identical files.
pub fn encode_keyspace(keyspace: &Keyspace) -> io::Result<Vec<u8>> {
    let mut entries: Vec<(&Vec<u8>, &Value)> = keyspace.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let invalid = |err: VsetError| io::Error::new(io::ErrorKind::InvalidData, err.to_string());
    let mut out = Vec::new();
    for (key, value) in entries {
        let mut payload = Vec::new();
        bincode::serialize_into(&mut payload, key)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bincode serialize"))?;
        let kind = match value {
            Value::Str(bytes) => {
                bincode::serialize_into(&mut payload, bytes)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bincode serialize"))?;
                TYPE_STRING
            }
            Value::Set(set) => {
                persist::save(set, &mut payload).map_err(invalid)?;
                TYPE_SET
            }
        };
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "snapshot record exceeds 4 GiB")
        })?;
        let header = RecordHeader {
            version: ENCODING_VERSION as u16,
            kind,
            len,
            crc32: checksum(&payload),
        };
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

/// Parses a whole snapshot. The first bad record fails everything.
pub fn decode_records(
    bytes: &[u8],
    params: IndexParams,
    keyspace: &Keyspace,
) -> Result<Vec<(Vec<u8>, Value)>, VsetError> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let header_buf = bytes
            .get(pos..pos + HEADER_BYTES)
            .ok_or_else(|| VsetError::Corrupt("truncated record header".into()))?;
        let header = RecordHeader::decode(header_buf)?;
        pos += HEADER_BYTES;
        let end = pos + header.len as usize;
        let payload = bytes
            .get(pos..end)
            .ok_or_else(|| VsetError::Corrupt("truncated record".into()))?;
        if checksum(payload) != header.crc32 {
            return Err(VsetError::Corrupt(format!("checksum mismatch at offset {pos}")));
        }
        pos = end;

        let mut r = payload;
        let key: Vec<u8> = bincode::deserialize_from(&mut r).map_err(codec_error)?;
        let value = match header.kind {
            TYPE_STRING => Value::Str(bincode::deserialize_from(&mut r).map_err(codec_error)?),
            TYPE_SET => {
                let set = persist::load(
                    &mut r,
                    u32::from(header.version),
                    params,
                    keyspace.registry(),
                )?;
                Value::Set(Arc::new(set))
            }
            other => return Err(VsetError::Corrupt(format!("unknown value type {other}"))),
        };
        if !r.is_empty() {
            return Err(VsetError::Corrupt("trailing bytes in record".into()));
        }
        records.push((key, value));
    }
    Ok(records)
}

pub fn write_snapshot(path: &Path, keyspace: &Keyspace) -> io::Result<()> {
    let bytes = encode_keyspace(keyspace)?;
    atomic_write_bytes(path, &bytes)
}

/// Loads `path` into `keyspace`, which is left untouched on any error.
/// Returns the number of keys loaded.
pub fn load_snapshot(path: &Path, keyspace: &mut Keyspace) -> Result<usize, EngineError> {
    let bytes = fs::read(path)?;
    let records = decode_records(&bytes, keyspace.params(), keyspace)?;
    let loaded = records.len();
    for (key, value) in records {
        keyspace.insert(key, value);
    }
    Ok(loaded)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub keys: usize,
    pub strings: usize,
    pub vector_sets: usize,
    pub elements: usize,
}

/// Validates a snapshot file without starting an engine.
pub fn inspect(path: &Path) -> Result<SnapshotSummary, EngineError> {
    let mut keyspace = Keyspace::new(IndexParams::default());
    load_snapshot(path, &mut keyspace)?;
    let mut summary = SnapshotSummary {
        keys: keyspace.len(),
        ..SnapshotSummary::default()
    };
    for (_, value) in keyspace.iter() {
        match value {
            Value::Str(_) => summary.strings += 1,
            Value::Set(set) => {
                summary.vector_sets += 1;
                summary.elements += set.len();
            }
        }
    }
    Ok(summary)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_data()?;
    fs::rename(tmp, path)?;
    Ok(())
}
