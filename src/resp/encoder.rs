//! Encodes argument lists into RESP arrays of bulk strings.
//!
//! Small writes are coalesced into one buffer up to [`COALESCE_CUTOFF`];
//! anything larger passes through as its own zero-copy [`Bytes`] chunk so a
//! large `SET` payload is never copied into the coalescing buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RedisCoreError, Result};

/// Coalescing cutoff for the encoder's chunk buffer (≈6 KiB, per §4.1).
pub const COALESCE_CUTOFF: usize = 6 * 1024;

/// One command argument before it is rendered to wire bytes.
///
/// This is intentionally a closed set: encoding a sequence, mapping, or
/// boolean as a command argument is a caller error, not a representable
/// argument, and is rejected by [`Argument::try_from`] before it ever
/// reaches the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Bytes(Bytes),
    Text(String),
    Int(i64),
    Float(f64),
}

impl From<&str> for Argument {
    fn from(s: &str) -> Self {
        Argument::Text(s.to_owned())
    }
}

impl From<String> for Argument {
    fn from(s: String) -> Self {
        Argument::Text(s)
    }
}

impl From<Bytes> for Argument {
    fn from(b: Bytes) -> Self {
        Argument::Bytes(b)
    }
}

impl From<Vec<u8>> for Argument {
    fn from(b: Vec<u8>) -> Self {
        Argument::Bytes(Bytes::from(b))
    }
}

impl From<i64> for Argument {
    fn from(i: i64) -> Self {
        Argument::Int(i)
    }
}

impl From<f64> for Argument {
    fn from(f: f64) -> Self {
        Argument::Float(f)
    }
}

/// The full dynamic set of values an embedder might try to hand in as an
/// argument. Values outside [`Argument`]'s closed set fail with
/// `EncodingError` here rather than reaching the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bytes(Bytes),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Seq(Vec<ArgValue>),
    Map(Vec<(ArgValue, ArgValue)>),
}

impl TryFrom<ArgValue> for Argument {
    type Error = RedisCoreError;

    fn try_from(value: ArgValue) -> Result<Argument> {
        match value {
            ArgValue::Bytes(b) => Ok(Argument::Bytes(b)),
            ArgValue::Text(s) => Ok(Argument::Text(s)),
            ArgValue::Int(i) => Ok(Argument::Int(i)),
            ArgValue::Float(f) => Ok(Argument::Float(f)),
            other @ (ArgValue::Bool(_) | ArgValue::Seq(_) | ArgValue::Map(_)) => Err(
                RedisCoreError::Encoding(format!("cannot encode {other:?} as a command argument")),
            ),
        }
    }
}

/// How text arguments are rendered to bytes. Only strict UTF-8 is
/// implemented — `Argument::Text` already holds a valid Rust `String`, so
/// this is mainly the extension point for a future configurable text
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8Strict,
}

/// Stateless RESP command encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    pub encoding: TextEncoding,
}

impl Encoder {
    pub fn new(encoding: TextEncoding) -> Self {
        Encoder { encoding }
    }

    /// Encodes one command (`*N\r\n` followed by `$len\r\n<bytes>\r\n` per
    /// argument) as a sequence of byte chunks ready to hand to a transport.
    pub fn encode_command(&self, args: &[Argument]) -> Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        let mut pending = BytesMut::new();
        self.encode_into(args, &mut pending, &mut chunks)?;
        flush(&mut pending, &mut chunks);
        Ok(chunks)
    }

    /// Encodes several commands back to back into one chunk stream —
    /// pipelining appends further commands to the same pending buffer
    /// instead of starting a fresh one per command.
    pub fn encode_pipeline(&self, commands: &[Vec<Argument>]) -> Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        let mut pending = BytesMut::new();
        for args in commands {
            self.encode_into(args, &mut pending, &mut chunks)?;
        }
        flush(&mut pending, &mut chunks);
        Ok(chunks)
    }

    fn encode_into(&self, args: &[Argument], pending: &mut BytesMut, chunks: &mut Vec<Bytes>) -> Result<()> {
        pending.put_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            let rendered = self.render(arg)?;
            pending.put_slice(format!("${}\r\n", rendered.len()).as_bytes());
            if rendered.len() > COALESCE_CUTOFF {
                flush(pending, chunks);
                chunks.push(rendered);
                pending.put_slice(b"\r\n");
            } else {
                pending.put_slice(&rendered);
                pending.put_slice(b"\r\n");
                if pending.len() >= COALESCE_CUTOFF {
                    flush(pending, chunks);
                }
            }
        }
        Ok(())
    }

    fn render(&self, arg: &Argument) -> Result<Bytes> {
        match arg {
            Argument::Bytes(b) => Ok(b.clone()),
            Argument::Text(s) => match self.encoding {
                TextEncoding::Utf8Strict => Ok(Bytes::copy_from_slice(s.as_bytes())),
            },
            Argument::Int(i) => Ok(Bytes::from(i.to_string().into_bytes())),
            Argument::Float(f) => Ok(Bytes::from(format_float(*f).into_bytes())),
        }
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() {
        format!("{f:.0}")
    } else {
        format!("{f}")
    }
}

fn flush(pending: &mut BytesMut, chunks: &mut Vec<Bytes>) {
    if !pending.is_empty() {
        chunks.push(std::mem::take(pending).freeze());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(strs: &[&str]) -> Vec<Argument> {
        strs.iter().map(|s| Argument::from(*s)).collect()
    }

    #[test]
    fn encodes_simple_command() {
        let enc = Encoder::default();
        let chunks = enc.encode_command(&args(&["SET", "a", "b"])).unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n");
    }

    #[test]
    fn large_argument_is_a_standalone_chunk() {
        let enc = Encoder::default();
        let big = Bytes::from(vec![b'x'; COALESCE_CUTOFF + 10]);
        let chunks = enc.encode_command(&[Argument::from("SET"), Argument::from("k"), Argument::Bytes(big.clone())]).unwrap();
        assert!(chunks.iter().any(|c| c.as_ref() == big.as_ref()));
    }

    #[test]
    fn pipeline_appends_to_same_stream() {
        let enc = Encoder::default();
        let pipeline = vec![args(&["SET", "a", "b"]), args(&["GET", "a"])];
        let chunks = enc.encode_pipeline(&pipeline).unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    }

    #[test]
    fn rejects_non_scalar_argument_values() {
        let err = Argument::try_from(ArgValue::Bool(true)).unwrap_err();
        assert!(matches!(err, RedisCoreError::Encoding(_)));
    }
}
