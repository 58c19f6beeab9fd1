//! Envelope framing and the invocation-level messages carried on group 0.
//!
//! Wire layout: `[group: u32 LE][op: u32 LE][typed values...]`, the value
//! sequence running to the end of the buffer. Group 0 never names a
//! capability group; it carries the invocation request (host → guest), call
//! replies (host → guest) and the terminal result (guest → host one-way).

use super::{decode, encode_into, DecodeError, EncodeError, TypedValue};

/// Group id reserved for the invocation itself.
pub const INVOCATION_GROUP: u32 = 0;
/// Op on group 0: invocation request, success result, or value reply.
pub const OP_VALUE: u32 = 0;
/// Op on group 0: error result or error reply.
pub const OP_ERROR: u32 = 1;

const HEADER_LENGTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub group: u32,
    pub op: u32,
    pub values: Vec<TypedValue>,
}

impl Envelope {
    pub fn new(group: u32, op: u32, values: Vec<TypedValue>) -> Self {
        Self { group, op, values }
    }

    /// The initial host → guest request: `(0, 0, [method, args...])`.
    pub fn invocation(call: &MethodCall) -> Self {
        let mut values = Vec::with_capacity(call.args.len() + 1);
        values.push(TypedValue::String(call.method.clone()));
        values.extend(call.args.iter().cloned());
        Self::new(INVOCATION_GROUP, OP_VALUE, values)
    }

    /// Terminal result (guest → host) or call reply (host → guest).
    /// Both share the outcome shape.
    pub fn outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Empty => Self::new(INVOCATION_GROUP, OP_VALUE, Vec::new()),
            Outcome::Value(v) => Self::new(INVOCATION_GROUP, OP_VALUE, vec![v.clone()]),
            Outcome::Error(msg) => Self::new(
                INVOCATION_GROUP,
                OP_ERROR,
                vec![TypedValue::String(msg.clone())],
            ),
        }
    }

    pub fn is_invocation_group(&self) -> bool {
        self.group == INVOCATION_GROUP
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(HEADER_LENGTH);
        out.extend_from_slice(&self.group.to_le_bytes());
        out.extend_from_slice(&self.op.to_le_bytes());
        encode_into(&self.values, &mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(DecodeError::ShortHeader(HEADER_LENGTH));
        }
        let group = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let op = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        // Offsets in value errors are relative to the value section
        let values = decode(&bytes[HEADER_LENGTH..])?;
        Ok(Self { group, op, values })
    }

    /// Interprets a group-0 envelope as an [`Outcome`].
    /// Returns a description of the problem for any other shape.
    pub fn into_outcome(self) -> Result<Outcome, String> {
        if self.group != INVOCATION_GROUP {
            return Err(format!("group {} is not the invocation group", self.group));
        }
        let mut values = self.values;
        match (self.op, values.len()) {
            (OP_VALUE, 0) => Ok(Outcome::Empty),
            (OP_VALUE, 1) => Ok(Outcome::Value(values.remove(0))),
            (OP_ERROR, 1) => match values.remove(0) {
                TypedValue::String(msg) => Ok(Outcome::Error(msg)),
                other => Err(format!(
                    "error result must carry a string, got {:?}",
                    other.value_type()
                )),
            },
            (op, n) => Err(format!("op {op} with {n} values is not a result")),
        }
    }
}

/// Final result of a contract method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The method returned nothing.
    Empty,
    /// The method raised; the message is what the guest reported.
    Error(String),
    Value(TypedValue),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Empty => write!(f, "(empty)"),
            Outcome::Error(msg) => write!(f, "error: {msg}"),
            Outcome::Value(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("method name must not be empty")]
pub struct InvalidMethodName;

/// A contract method name with its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    method: String,
    args: Vec<TypedValue>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Vec<TypedValue>) -> Result<Self, InvalidMethodName> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(InvalidMethodName);
        }
        Ok(Self { method, args })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[TypedValue] {
        &self.args
    }
}
