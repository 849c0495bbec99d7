//! Versioned binary envelope for cached payloads.
//!
//! The first byte is a set of feature bits, the rest is a CBOR map keyed by
//! small integers. Tags are persisted and must never be renumbered.

use ciborium::Value;
use uuid::Uuid;

use crate::error::{Code, Error, Forward, Result};

const HEADER_ZSTD: u8 = 1 << 0;
const KNOWN_HEADER_BITS: u8 = HEADER_ZSTD;

/// Bodies larger than this are compressed.
pub const COMPRESS_ABOVE: usize = 1024;

/// Prefixes the header byte, compressing large bodies.
pub fn seal(body: Vec<u8>) -> Result<Vec<u8>> {
    if body.len() <= COMPRESS_ABOVE {
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(0);
        out.extend_from_slice(&body);
        return Ok(out);
    }

    let compressed = zstd::encode_all(body.as_slice(), 0).map_err(|e| {
        Error::new("d1de1979-b576-45cf-be49-8b2a3df8623c", Code::Unknown, "Failed to compress payload.").with_cause(e)
    })?;

    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(HEADER_ZSTD);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Strips the header byte and returns the raw body.
pub fn open(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&header, body)) = data.split_first() else {
        return Err(Error::new("4d6df740-26d7-45c1-8d6c-02a443cc7634", Code::InvalidArgument, "Empty payload."));
    };

    if header & !KNOWN_HEADER_BITS != 0 {
        return Err(
            Error::new("129ed9f6-96d5-4b2d-b73b-3def50854857", Code::InvalidArgument, "Unsupported payload header.")
                .with_meta("header", header),
        );
    }

    if header & HEADER_ZSTD == 0 {
        return Ok(body.to_vec());
    }

    zstd::decode_all(body).map_err(|e| {
        Error::new("866d4c26-0a96-4892-aaa1-cd825248db0d", Code::Unknown, "Failed to decompress payload.").with_cause(e)
    })
}

/// Builder for an integer-keyed CBOR map. Zero values are omitted.
#[derive(Debug, Default)]
pub(crate) struct Fields(Vec<(Value, Value)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, tag: u8, value: Value) {
        self.0.push((Value::Integer(tag.into()), value));
    }

    pub fn uuid(mut self, tag: u8, value: Option<Uuid>) -> Self {
        if let Some(id) = value.filter(|id| !id.is_nil()) {
            self.put(tag, Value::Bytes(id.as_bytes().to_vec()));
        }
        self
    }

    pub fn text(mut self, tag: u8, value: &str) -> Self {
        if !value.is_empty() {
            self.put(tag, Value::Text(value.to_string()));
        }
        self
    }

    pub fn uint(mut self, tag: u8, value: u64) -> Self {
        if value != 0 {
            self.put(tag, Value::Integer(value.into()));
        }
        self
    }

    pub fn bytes(mut self, tag: u8, value: &[u8]) -> Self {
        if !value.is_empty() {
            self.put(tag, Value::Bytes(value.to_vec()));
        }
        self
    }

    pub fn texts(mut self, tag: u8, values: &[&str]) -> Self {
        if !values.is_empty() {
            let items = values.iter().map(|s| Value::Text((*s).to_string())).collect();
            self.put(tag, Value::Array(items));
        }
        self
    }

    /// Encodes the map and seals it in an envelope.
    pub fn seal(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(&Value::Map(self.0), &mut buf).map_err(|e| {
            Error::new("ddf0514c-c695-46a2-94ca-c9362a213ed2", Code::Unknown, "Failed to marshal.").with_cause(e)
        })?;
        seal(buf)
    }
}

/// Read side of [`Fields`]. Unknown tags are ignored.
#[derive(Debug)]
pub(crate) struct Decoded(Vec<(Value, Value)>);

impl Decoded {
    pub fn open(data: &[u8]) -> Result<Self> {
        let body = open(data).forward("487a539d-1a4f-47b4-ac81-1152cba2fcff")?;

        let value: Value = ciborium::from_reader(body.as_slice()).map_err(|e| {
            Error::new("ba638240-38ca-40be-b804-c2f1909f78bb", Code::Unknown, "Failed to unmarshal.").with_cause(e)
        })?;

        match value {
            Value::Map(entries) => Ok(Self(entries)),
            _ => Err(Error::new("f58d4eef-11eb-4046-a7ee-9c65b136d32c", Code::DataLoss, "Payload is not a map.")),
        }
    }

    fn get(&self, tag: u8) -> Option<&Value> {
        self.0.iter().find_map(|(k, v)| match k {
            Value::Integer(i) if i128::from(*i) == i128::from(tag) => Some(v),
            _ => None,
        })
    }

    fn mismatch(tag: u8) -> Error {
        Error::new("63b5b323-e735-4d14-8b67-c4e0989e78f7", Code::DataLoss, "Unexpected field type.").with_meta("tag", tag)
    }

    pub fn uuid(&self, tag: u8) -> Result<Option<Uuid>> {
        match self.get(tag) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Uuid::from_slice(b)
                .map(Some)
                .map_err(|e| Self::mismatch(tag).with_cause(e)),
            Some(_) => Err(Self::mismatch(tag)),
        }
    }

    pub fn text(&self, tag: u8) -> Result<String> {
        match self.get(tag) {
            None => Ok(String::new()),
            Some(Value::Text(s)) => Ok(s.clone()),
            Some(_) => Err(Self::mismatch(tag)),
        }
    }

    pub fn uint(&self, tag: u8) -> Result<u64> {
        match self.get(tag) {
            None => Ok(0),
            Some(Value::Integer(i)) => u64::try_from(*i).map_err(|_| Self::mismatch(tag)),
            Some(_) => Err(Self::mismatch(tag)),
        }
    }

    pub fn bytes(&self, tag: u8) -> Result<Vec<u8>> {
        match self.get(tag) {
            None => Ok(Vec::new()),
            Some(Value::Bytes(b)) => Ok(b.clone()),
            Some(_) => Err(Self::mismatch(tag)),
        }
    }

    pub fn texts(&self, tag: u8) -> Result<Vec<String>> {
        match self.get(tag) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::Text(s) => Ok(s.clone()),
                    _ => Err(Self::mismatch(tag)),
                })
                .collect(),
            Some(_) => Err(Self::mismatch(tag)),
        }
    }
}
