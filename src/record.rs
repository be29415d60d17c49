//! Intermediate Records for Batching Backends
//!
//! A [`Record`] is what the queue relay hands to a batch sink: either a
//! structured map destined for JSON, built up by `SET`/`SADD`/`HMSET`
//! commands (possibly inside a `MULTI`/`EXEC` transaction), or an opaque
//! byte payload from `RAWSET`.
//!
//! Byte-valued fields are gzip-compressed individually before the record is
//! serialized; the JSON carries them base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// One value in a record's data map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Str(String),
    /// Raw bytes; compressed and base64-encoded at serialization time.
    Bytes(Vec<u8>),
    /// Accumulated by `SADD`.
    List(Vec<Field>),
    /// Accumulated by `HMSET`.
    Map(BTreeMap<String, Field>),
}

impl Field {
    fn is_bytes(&self) -> bool {
        matches!(self, Field::Bytes(_))
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Str(s.to_string())
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Str(s)
    }
}

impl From<Vec<u8>> for Field {
    fn from(b: Vec<u8>) -> Self {
        Field::Bytes(b)
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Str(s) => serializer.serialize_str(s),
            Field::Bytes(b) => serializer.serialize_str(&BASE64.encode(b)),
            Field::List(l) => l.serialize(serializer),
            Field::Map(m) => m.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Data(BTreeMap<String, Field>),
    Raw(Bytes),
}

/// A typed payload plus its millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    ts_ms: i64,
    payload: Payload,
    /// Set when the data map holds byte-valued fields needing per-field
    /// compression before serialization.
    compress_fields: bool,
}

#[derive(serde::Serialize)]
struct Envelope<'a> {
    ts: i64,
    data: &'a BTreeMap<String, Field>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            ts_ms: now_ms(),
            payload: Payload::Data(BTreeMap::new()),
            compress_fields: false,
        }
    }

    /// A record carrying opaque bytes, bypassing JSON serialization.
    pub fn raw(bytes: Bytes) -> Self {
        Self {
            ts_ms: now_ms(),
            payload: Payload::Raw(bytes),
            compress_fields: false,
        }
    }

    /// Sets `key` unless already present.
    pub fn add(&mut self, key: &str, value: impl Into<Field>) {
        if let Payload::Data(data) = &mut self.payload {
            if data.contains_key(key) {
                return;
            }
            let value = value.into();
            self.compress_fields |= value.is_bytes();
            data.insert(key.to_string(), value);
        }
    }

    /// Appends `value` to the list at `key`, creating the list on first use.
    pub fn sadd(&mut self, key: &str, value: impl Into<Field>) {
        if let Payload::Data(data) = &mut self.payload {
            let value = value.into();
            self.compress_fields |= value.is_bytes();
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Field::List(Vec::new()));
            if let Field::List(list) = entry {
                list.push(value);
            }
        }
    }

    /// Sets `field` inside the nested map at `key`.
    pub fn mhset(&mut self, key: &str, field: &str, value: impl Into<Field>) {
        if let Payload::Data(data) = &mut self.payload {
            let value = value.into();
            self.compress_fields |= value.is_bytes();
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Field::Map(BTreeMap::new()));
            if let Field::Map(map) = entry {
                map.insert(field.to_string(), value);
            }
        }
    }

    /// The record in wire form: raw bytes as-is, otherwise the JSON envelope
    /// with byte fields compressed.
    pub fn bytes(&self) -> Bytes {
        match &self.payload {
            Payload::Raw(b) => b.clone(),
            Payload::Data(data) => {
                let json = if self.compress_fields {
                    let compressed: BTreeMap<String, Field> = data
                        .iter()
                        .map(|(k, v)| match v {
                            Field::Bytes(b) => (k.clone(), Field::Bytes(gzip(b))),
                            other => (k.clone(), other.clone()),
                        })
                        .collect();
                    serde_json::to_vec(&Envelope {
                        ts: self.ts_ms,
                        data: &compressed,
                    })
                } else {
                    serde_json::to_vec(&Envelope {
                        ts: self.ts_ms,
                        data,
                    })
                };
                match json {
                    Ok(v) => Bytes::from(v),
                    Err(e) => {
                        error!(error = %e, "Record serialization failed");
                        Bytes::new()
                    }
                }
            }
        }
    }

    /// Serialized length; zero-length records are dropped by the workers.
    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Raw(b) => b.len(),
            Payload::Data(data) => {
                if data.is_empty() {
                    0
                } else {
                    self.bytes().len()
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.ts_ms
    }

    /// Wire bytes plus a unique id derived from the content and the current
    /// time, used for batch entry deduplication on the sink side.
    pub fn bytes_uniq_id(&self) -> (Bytes, String) {
        let bytes = self.bytes();
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        (bytes, format!("{}{:016X}", nanos, hasher.finish()))
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}
