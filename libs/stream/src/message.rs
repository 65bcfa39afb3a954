//! Default message model carried over the stream.
//!
//! The transport treats payloads as opaque bytes; these types are what most
//! services exchange and what the [`JsonCodec`](crate::codec::JsonCodec)
//! encodes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form key/value payload
pub type Data = Map<String, Value>;

/// A request addressed to a named service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub serv: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub data: Data,
}

impl Request {
    pub fn new(serv: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            serv: serv.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Attach a data field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// The answer to a [`Request`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: i64,
    #[serde(default)]
    pub data: Data,
}

impl Response {
    pub fn new(result: i64) -> Self {
        Self {
            result,
            data: Data::new(),
        }
    }

    /// Attach a data field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A one-way notification fanned out to a set of users
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Push {
    #[serde(default)]
    pub serv: String,
    #[serde(default)]
    pub user: Vec<Value>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: Data,
}
