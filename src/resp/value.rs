//! The decoded RESP value: a closed, tagged sum type (never an open/dynamic
//! runtime type) plus the RESP3 attributes that may ride along with it.

use bytes::Bytes;

/// Key/value pairs attached to a [`Value`] by a preceding RESP3 attribute
/// frame (`|`). Duplicate keys are preserved verbatim, matching the
/// duplicate-safe container the decoder uses for `Map`/`Set` bodies.
pub type Attributes = Vec<(Value, Value)>;

/// One decoded RESP value. Immutable once constructed.
///
/// `attributes` is `None` unless the decoder was built in "preserve" mode and
/// the server actually sent an attribute frame ahead of this value (§4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub data: ValueData,
    pub attributes: Option<Attributes>,
}

impl Value {
    pub fn new(data: ValueData) -> Self {
        Value { data, attributes: None }
    }

    pub fn simple_string(s: impl Into<String>) -> Self {
        Value::new(ValueData::SimpleString(s.into()))
    }

    pub fn error(s: impl Into<String>) -> Self {
        Value::new(ValueData::Error(s.into()))
    }

    pub fn integer(i: i64) -> Self {
        Value::new(ValueData::Integer(i))
    }

    pub fn bulk(b: Option<Bytes>) -> Self {
        Value::new(ValueData::BulkString(b))
    }

    pub fn array(items: Option<Vec<Value>>) -> Self {
        Value::new(ValueData::Array(items))
    }

    pub fn null() -> Self {
        Value::new(ValueData::Null)
    }

    /// True if this is a RESP3 push frame (`>`), the only type that may
    /// legally appear outside the normal request/response sequence.
    pub fn is_push(&self) -> bool {
        matches!(self.data, ValueData::Push(_))
    }

    /// True if this is a server error reply (`-...`).
    pub fn is_error(&self) -> bool {
        matches!(self.data, ValueData::Error(_))
    }

    /// The error text, if this value is an `Error`.
    pub fn as_error_text(&self) -> Option<&str> {
        match &self.data {
            ValueData::Error(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained bytes for bulk strings and simple strings, the
    /// canonical ASCII form for integers, or `None` for anything else
    /// (arrays, maps, null, etc). Used by callers that just want "the reply
    /// as bytes" regardless of which scalar frame carried it.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self.data {
            ValueData::BulkString(b) => b,
            ValueData::SimpleString(s) => Some(Bytes::from(s.into_bytes())),
            ValueData::Integer(i) => Some(Bytes::from(i.to_string().into_bytes())),
            _ => None,
        }
    }
}

/// The tagged variants a RESP2/RESP3 stream can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` represents the RESP2 legacy null bulk string (`$-1`) as well
    /// as the RESP3 null (`_`) when it stands in for a bulk reply.
    BulkString(Option<Bytes>),
    /// `None` represents the RESP2 legacy null array (`*-1`).
    Array(Option<Vec<Value>>),
    Null,
    Double(f64),
    Boolean(bool),
    /// Kept verbatim as text; RESP does not bound big-number precision.
    BigNumber(String),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Out-of-band RESP3 push frame (pub/sub messages, invalidations, ...).
    Push(Vec<Value>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_bytes_covers_scalar_variants() {
        assert_eq!(Value::bulk(Some(Bytes::from_static(b"a"))).into_bytes(), Some(Bytes::from_static(b"a")));
        assert_eq!(Value::simple_string("OK").into_bytes(), Some(Bytes::from_static(b"OK")));
        assert_eq!(Value::integer(42).into_bytes(), Some(Bytes::from_static(b"42")));
        assert_eq!(Value::array(Some(vec![])).into_bytes(), None);
    }
}
