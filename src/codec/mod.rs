//! Typed-value wire format shared by the host and the sandbox.
//!
//! Every value is self-describing: a little-endian `u32` type tag followed by
//! its payload. Numbers are fixed width, strings and byte sequences are
//! length-prefixed, addresses are fixed length. A heterogeneous sequence is
//! simply the concatenation of its values, so it round-trips without a schema.

pub mod envelope;
pub mod guest;

use std::fmt;
use std::str::FromStr;

pub use envelope::{Envelope, InvalidMethodName, MethodCall, Outcome};

/// Length in bytes of an [`Address`].
pub const ADDRESS_LENGTH: usize = 20;

const TAG_UINT32: u32 = 0;
const TAG_UINT64: u32 = 1;
const TAG_STRING: u32 = 2;
const TAG_BYTES: u32 = 3;
const TAG_ADDRESS: u32 = 4;

/// Fixed-length account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    /// Parses 40 hex characters (an optional `0x` prefix is accepted).
    pub fn from_hex(text: &str) -> Result<Self, String> {
        let text = text.strip_prefix("0x").unwrap_or(text);
        let raw = hex::decode(text).map_err(|e| format!("invalid address hex: {e}"))?;
        let bytes: [u8; ADDRESS_LENGTH] = raw.try_into().map_err(|raw: Vec<u8>| {
            format!("address must be {ADDRESS_LENGTH} bytes, got {}", raw.len())
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Type of a [`TypedValue`], used by the capability catalog to describe
/// parameters and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Uint32,
    Uint64,
    String,
    Bytes,
    Address,
}

/// A single self-describing value on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedValue {
    Uint32(u32),
    Uint64(u64),
    String(String),
    Bytes(Vec<u8>),
    Address(Address),
}

impl TypedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::Uint32(_) => ValueType::Uint32,
            TypedValue::Uint64(_) => ValueType::Uint64,
            TypedValue::String(_) => ValueType::String,
            TypedValue::Bytes(_) => ValueType::Bytes,
            TypedValue::Address(_) => ValueType::Address,
        }
    }

    fn tag(&self) -> u32 {
        match self {
            TypedValue::Uint32(_) => TAG_UINT32,
            TypedValue::Uint64(_) => TAG_UINT64,
            TypedValue::String(_) => TAG_STRING,
            TypedValue::Bytes(_) => TAG_BYTES,
            TypedValue::Address(_) => TAG_ADDRESS,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        out.extend_from_slice(&self.tag().to_le_bytes());
        match self {
            TypedValue::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::String(s) => write_prefixed(out, s.as_bytes())?,
            TypedValue::Bytes(b) => write_prefixed(out, b)?,
            TypedValue::Address(a) => out.extend_from_slice(&a.0),
        }
        Ok(())
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Uint32(v) => write!(f, "u32:{v}"),
            TypedValue::Uint64(v) => write!(f, "u64:{v}"),
            TypedValue::String(s) => write!(f, "str:{s}"),
            TypedValue::Bytes(b) => write!(f, "bytes:{}", hex::encode(b)),
            TypedValue::Address(a) => write!(f, "addr:{}", hex::encode(a.0)),
        }
    }
}

/// Parses the `type:literal` notation used on the command line,
/// e.g. `u32:7`, `str:hello`, `bytes:0a0b`.
impl FromStr for TypedValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, literal) = s
            .split_once(':')
            .ok_or_else(|| format!("expected TYPE:VALUE, got '{s}'"))?;
        match kind {
            "u32" | "uint32" => literal
                .parse()
                .map(TypedValue::Uint32)
                .map_err(|e| format!("invalid u32 '{literal}': {e}")),
            "u64" | "uint64" => literal
                .parse()
                .map(TypedValue::Uint64)
                .map_err(|e| format!("invalid u64 '{literal}': {e}")),
            "str" | "string" => Ok(TypedValue::String(literal.to_string())),
            "bytes" => hex::decode(literal)
                .map(TypedValue::Bytes)
                .map_err(|e| format!("invalid bytes hex '{literal}': {e}")),
            "addr" | "address" => Address::from_hex(literal).map(TypedValue::Address),
            other => Err(format!("unknown value type '{other}'")),
        }
    }
}

/// Failure to decode a value sequence or an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input at offset {offset}: needed {needed} more bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown type tag {tag} at offset {offset}")]
    UnknownTag { tag: u32, offset: usize },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("envelope shorter than its {0}-byte header")]
    ShortHeader(usize),
}

/// Largest string or byte payload a `u32` length prefix can describe.
pub const MAX_PAYLOAD_LENGTH: usize = u32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LENGTH}-byte limit")]
    PayloadTooLarge(usize),
}

fn length_prefix(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::PayloadTooLarge(len))
}

fn write_prefixed(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), EncodeError> {
    out.extend_from_slice(&length_prefix(payload.len())?.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Encodes an ordered sequence of values.
pub fn encode(values: &[TypedValue]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    encode_into(values, &mut out)?;
    Ok(out)
}

pub(crate) fn encode_into(values: &[TypedValue], out: &mut Vec<u8>) -> Result<(), EncodeError> {
    for value in values {
        value.write_to(out)?;
    }
    Ok(())
}

/// Decodes a sequence produced by [`encode`]. Empty input is an empty sequence.
pub fn decode(bytes: &[u8]) -> Result<Vec<TypedValue>, DecodeError> {
    let mut reader = Reader { bytes, offset: 0 };
    let mut values = Vec::new();
    while !reader.is_empty() {
        values.push(reader.value()?);
    }
    Ok(values)
}

/// Cursor over an input buffer. All reads are bounds-checked.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.bytes.len() - self.offset;
        if len > available {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: len,
                available,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn value(&mut self) -> Result<TypedValue, DecodeError> {
        let start = self.offset;
        let tag = self.u32()?;
        match tag {
            TAG_UINT32 => self.u32().map(TypedValue::Uint32),
            TAG_UINT64 => self.u64().map(TypedValue::Uint64),
            TAG_STRING => {
                let payload_offset = self.offset + 4;
                let raw = self.prefixed()?;
                std::str::from_utf8(raw)
                    .map(|s| TypedValue::String(s.to_string()))
                    .map_err(|_| DecodeError::InvalidUtf8 {
                        offset: payload_offset,
                    })
            }
            TAG_BYTES => self.prefixed().map(|raw| TypedValue::Bytes(raw.to_vec())),
            TAG_ADDRESS => {
                let mut address = [0u8; ADDRESS_LENGTH];
                address.copy_from_slice(self.take(ADDRESS_LENGTH)?);
                Ok(TypedValue::Address(Address(address)))
            }
            tag => Err(DecodeError::UnknownTag { tag, offset: start }),
        }
    }
}
