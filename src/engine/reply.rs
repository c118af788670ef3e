use base64::Engine as _;
use serde_json::{json, Value as Json};
use tokio::sync::oneshot;

use crate::vset::VsetError;

pub type ReplySender = oneshot::Sender<Reply>;

/// A command reply in the shapes a key-value store protocol distinguishes.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ok,
    Simple(String),
    Integer(i64),
    Double(f64),
    Bulk(Vec<u8>),
    Null,
    NullArray,
    Array(Vec<Reply>),
    Map(Vec<(Reply, Reply)>),
    Error(String),
}

impl Reply {
    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(bytes.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            Reply::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Looks up a key in a map reply by its textual form.
    pub fn field(&self, name: &str) -> Option<&Reply> {
        match self {
            Reply::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_bytes() == Some(name.as_bytes()))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// JSON rendering for the HTTP surface. Binary bulk strings come out as
    /// `{"b64": ...}`; maps become objects when every key is text.
    pub fn to_json(&self) -> Json {
        match self {
            Reply::Ok => json!("OK"),
            Reply::Simple(s) => json!(s),
            Reply::Integer(v) => json!(v),
            Reply::Double(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Reply::Bulk(bytes) => bulk_json(bytes),
            Reply::Null | Reply::NullArray => Json::Null,
            Reply::Array(items) => Json::Array(items.iter().map(Reply::to_json).collect()),
            Reply::Map(pairs) => {
                let textual: Option<serde_json::Map<String, Json>> = pairs
                    .iter()
                    .map(|(k, v)| {
                        let key = std::str::from_utf8(k.as_bytes()?).ok()?;
                        Some((key.to_string(), v.to_json()))
                    })
                    .collect();
                match textual {
                    Some(obj) if obj.len() == pairs.len() => Json::Object(obj),
                    _ => Json::Array(
                        pairs
                            .iter()
                            .map(|(k, v)| json!([k.to_json(), v.to_json()]))
                            .collect(),
                    ),
                }
            }
            Reply::Error(msg) => json!({ "error": msg }),
        }
    }
}

impl From<VsetError> for Reply {
    fn from(err: VsetError) -> Self {
        Reply::Error(err.to_string())
    }
}

fn bulk_json(bytes: &[u8]) -> Json {
    match std::str::from_utf8(bytes) {
        Ok(text) => json!(text),
        Err(_) => json!({ "b64": base64::engine::general_purpose::STANDARD.encode(bytes) }),
    }
}
