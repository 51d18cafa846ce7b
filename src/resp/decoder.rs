//! Incremental RESP2/RESP3 decoder.
//!
//! Fed arbitrary byte chunks via [`Decoder::extract`], which returns either a
//! fully decoded [`Value`] or `Ok(None)` ("need more data"). Nested
//! aggregates are tracked on an explicit [`Frame`] stack rather than via
//! recursive calls, so a hostile or truncated stream can drive frame depth
//! but never the Rust call stack.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{RedisCoreError, Result};
use crate::resp::value::{Attributes, Value, ValueData};

/// Nesting guard: a stream that opens more aggregates than this without
/// closing any is a protocol error, not a resource exhaustion vector.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggKind {
    Array,
    Set,
    Map,
    Push,
    Attributes,
}

#[derive(Debug)]
struct AggFrame {
    kind: AggKind,
    /// `None` means streamed, terminated by a `.` marker frame.
    remaining: Option<usize>,
    items: Vec<Value>,
}

#[derive(Debug, Default)]
struct BulkFrame {
    buf: BytesMut,
}

#[derive(Debug)]
enum Frame {
    Agg(AggFrame),
    Bulk(BulkFrame),
}

enum FrameResult {
    Value(Value),
    Attrs(Attributes),
}

enum StepOutcome {
    FrameOpened,
    StreamTerminator,
    BulkStreamFinished(Bytes),
    Value(Value),
}

/// Incremental decoder. One instance owns exactly one connection's inbound
/// stream; a protocol error poisons it for good (see [`Decoder::poisoned`]).
#[derive(Debug)]
pub struct Decoder {
    preserve_attributes: bool,
    stack: Vec<Frame>,
    pending_attrs: Option<Attributes>,
    poisoned: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new(false)
    }
}

impl Decoder {
    /// `preserve_attributes = true` wraps every value with its RESP3
    /// attributes instead of silently discarding them (§4.1).
    pub fn new(preserve_attributes: bool) -> Self {
        Decoder { preserve_attributes, stack: Vec::new(), pending_attrs: None, poisoned: false }
    }

    /// True once a protocol error has been observed; the decoder must not be
    /// reused past this point (a fresh `Connection` gets a fresh `Decoder`).
    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    /// Attempts to extract one complete top-level value from `input`.
    /// Leaves unconsumed bytes in `input` untouched when more data is
    /// needed; never partially consumes a frame.
    pub fn extract(&mut self, input: &mut BytesMut) -> Result<Option<Value>> {
        if self.poisoned {
            return Err(RedisCoreError::protocol("decoder already failed; connection must be discarded"));
        }
        match self.extract_inner(input) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn extract_inner(&mut self, input: &mut BytesMut) -> Result<Option<Value>> {
        loop {
            while matches!(self.stack.last(), Some(Frame::Agg(f)) if f.remaining == Some(0)) {
                let Some(Frame::Agg(frame)) = self.stack.pop() else { unreachable!() };
                match finish_agg_frame(frame) {
                    FrameResult::Attrs(attrs) => self.pending_attrs = Some(attrs),
                    FrameResult::Value(v) => {
                        let v = self.finalize(v);
                        if let Some(top) = self.route_into_parent(v) {
                            return Ok(Some(top));
                        }
                    }
                }
            }

            let outcome = match self.stack.last() {
                Some(Frame::Bulk(_)) => self.try_read_bulk_chunk(input)?,
                _ => self.try_read_one(input)?,
            };
            let Some(outcome) = outcome else { return Ok(None) };

            match outcome {
                StepOutcome::FrameOpened => continue,
                StepOutcome::StreamTerminator => {
                    let frame = self
                        .stack
                        .pop()
                        .ok_or_else(|| RedisCoreError::protocol("unexpected stream terminator"))?;
                    match frame {
                        Frame::Agg(f) if f.remaining.is_none() => match finish_agg_frame(f) {
                            FrameResult::Attrs(attrs) => self.pending_attrs = Some(attrs),
                            FrameResult::Value(v) => {
                                let v = self.finalize(v);
                                if let Some(top) = self.route_into_parent(v) {
                                    return Ok(Some(top));
                                }
                            }
                        },
                        _ => return Err(RedisCoreError::protocol("unexpected stream terminator")),
                    }
                }
                StepOutcome::BulkStreamFinished(bytes) => {
                    let v = self.finalize(Value::bulk(Some(bytes)));
                    if let Some(top) = self.route_into_parent(v) {
                        return Ok(Some(top));
                    }
                }
                StepOutcome::Value(v) => {
                    let v = self.finalize(v);
                    if let Some(top) = self.route_into_parent(v) {
                        return Ok(Some(top));
                    }
                }
            }
        }
    }

    fn finalize(&mut self, mut v: Value) -> Value {
        if let Some(attrs) = self.pending_attrs.take() {
            if self.preserve_attributes {
                v.attributes = Some(attrs);
            }
        }
        v
    }

    /// Routes a fully-resolved value either to the caller (stack empty) or
    /// into the aggregate frame on top of the stack.
    fn route_into_parent(&mut self, v: Value) -> Option<Value> {
        match self.stack.last_mut() {
            None => Some(v),
            Some(Frame::Bulk(_)) => unreachable!("bulk frames are drained by try_read_bulk_chunk"),
            Some(Frame::Agg(frame)) => {
                frame.items.push(v);
                if let Some(rem) = frame.remaining.as_mut() {
                    *rem = rem.saturating_sub(1);
                }
                None
            }
        }
    }

    fn push_frame(&mut self, frame: Frame) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(RedisCoreError::protocol("RESP nesting exceeds maximum depth"));
        }
        self.stack.push(frame);
        Ok(())
    }

    /// Reads one "unit" when not currently draining a streamed bulk string:
    /// either a complete scalar value, an aggregate/attribute header (which
    /// opens a frame and returns `FrameOpened`), or a stream terminator.
    fn try_read_one(&mut self, input: &mut BytesMut) -> Result<Option<StepOutcome>> {
        let Some(&prefix) = input.first() else { return Ok(None) };

        // Every unit except a streamed bulk chunk starts with a header line;
        // peek it without consuming in case the rest hasn't arrived yet.
        let Some(line_len) = find_line_len(&input[1..]) else { return Ok(None) };
        let header_owned = input[1..1 + line_len].to_vec();
        let header: &[u8] = &header_owned;

        match prefix {
            b'+' => {
                let text = decode_text(header);
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::simple_string(text))))
            }
            b'-' => {
                let text = decode_text(header);
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::error(text))))
            }
            b'!' => {
                // Blob error: $-style length-prefixed, but semantically an Error.
                let total_len = parse_len(header)?;
                let needed = 1 + line_len + 2 + total_len + 2;
                if input.len() < needed {
                    return Ok(None);
                }
                let body = Bytes::copy_from_slice(&input[1 + line_len + 2..1 + line_len + 2 + total_len]);
                consume(input, needed);
                Ok(Some(StepOutcome::Value(Value::error(decode_text(&body)))))
            }
            b':' => {
                let n = parse_i64(header)?;
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::integer(n))))
            }
            b',' => {
                let text = decode_text(header);
                let f: f64 = text.parse().map_err(|_| RedisCoreError::protocol("invalid double"))?;
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::new(ValueData::Double(f)))))
            }
            b'#' => {
                let b = match header {
                    b"t" => true,
                    b"f" => false,
                    _ => return Err(RedisCoreError::protocol("invalid boolean")),
                };
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::new(ValueData::Boolean(b)))))
            }
            b'(' => {
                let text = decode_text(header);
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::new(ValueData::BigNumber(text)))))
            }
            b'_' => {
                if !header.is_empty() {
                    return Err(RedisCoreError::protocol("invalid null frame"));
                }
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::Value(Value::null())))
            }
            b'.' => {
                if !header.is_empty() {
                    return Err(RedisCoreError::protocol("invalid stream terminator"));
                }
                consume(input, 1 + line_len + 2);
                Ok(Some(StepOutcome::StreamTerminator))
            }
            b'$' | b'=' => {
                if header == b"?" {
                    consume(input, 1 + line_len + 2);
                    self.push_frame(Frame::Bulk(BulkFrame::default()))?;
                    return Ok(Some(StepOutcome::FrameOpened));
                }
                let len = parse_len_allow_neg1(header)?;
                let Some(len) = len else {
                    consume(input, 1 + line_len + 2);
                    return Ok(Some(StepOutcome::Value(Value::bulk(None))));
                };
                let needed = 1 + line_len + 2 + len + 2;
                if input.len() < needed {
                    return Ok(None);
                }
                let mut body = Bytes::copy_from_slice(&input[1 + line_len + 2..1 + line_len + 2 + len]);
                consume(input, needed);
                if prefix == b'=' && body.len() >= 4 && body[3] == b':' {
                    // Verbatim string: strip the 3-byte type tag and colon.
                    body = body.slice(4..);
                }
                Ok(Some(StepOutcome::Value(Value::bulk(Some(body)))))
            }
            b'*' => self.open_aggregate(input, 1 + line_len, header, AggKind::Array, true),
            b'~' => self.open_aggregate(input, 1 + line_len, header, AggKind::Set, false),
            b'>' => self.open_aggregate(input, 1 + line_len, header, AggKind::Push, false),
            b'%' => self.open_pair_aggregate(input, 1 + line_len, header, AggKind::Map),
            b'|' => self.open_pair_aggregate(input, 1 + line_len, header, AggKind::Attributes),
            other => Err(RedisCoreError::protocol(format!("invalid frame type byte {:?}", other as char))),
        }
    }

    fn open_aggregate(
        &mut self,
        input: &mut BytesMut,
        header_end: usize,
        header: &[u8],
        kind: AggKind,
        allow_null: bool,
    ) -> Result<Option<StepOutcome>> {
        if header == b"?" {
            consume(input, header_end + 2);
            self.push_frame(Frame::Agg(AggFrame { kind, remaining: None, items: Vec::new() }))?;
            return Ok(Some(StepOutcome::FrameOpened));
        }
        let n = parse_i64(header)?;
        if n < 0 {
            if allow_null {
                consume(input, header_end + 2);
                return Ok(Some(StepOutcome::Value(Value::array(None))));
            }
            return Err(RedisCoreError::protocol("negative length not allowed for this aggregate type"));
        }
        consume(input, header_end + 2);
        self.push_frame(Frame::Agg(AggFrame { kind, remaining: Some(n as usize), items: Vec::with_capacity(n as usize) }))?;
        Ok(Some(StepOutcome::FrameOpened))
    }

    fn open_pair_aggregate(
        &mut self,
        input: &mut BytesMut,
        header_end: usize,
        header: &[u8],
        kind: AggKind,
    ) -> Result<Option<StepOutcome>> {
        if header == b"?" {
            consume(input, header_end + 2);
            self.push_frame(Frame::Agg(AggFrame { kind, remaining: None, items: Vec::new() }))?;
            return Ok(Some(StepOutcome::FrameOpened));
        }
        let n = parse_i64(header)?;
        if n < 0 {
            return Err(RedisCoreError::protocol("negative pair count"));
        }
        let pairs = n as usize;
        consume(input, header_end + 2);
        self.push_frame(Frame::Agg(AggFrame { kind, remaining: Some(pairs * 2), items: Vec::with_capacity(pairs * 2) }))?;
        Ok(Some(StepOutcome::FrameOpened))
    }

    /// Drains one streamed-bulk-string chunk (`;<len>\r\n<data>\r\n`), or
    /// finishes the frame when the terminating `;0\r\n` chunk arrives.
    fn try_read_bulk_chunk(&mut self, input: &mut BytesMut) -> Result<Option<StepOutcome>> {
        let Some(&prefix) = input.first() else { return Ok(None) };
        if prefix != b';' {
            return Err(RedisCoreError::protocol("expected streamed-string chunk marker ';'"));
        }
        let Some(line_len) = find_line_len(&input[1..]) else { return Ok(None) };
        let header = &input[1..1 + line_len];
        let chunk_len = parse_len(header)?;
        let header_end = 1 + line_len + 2;
        if chunk_len == 0 {
            consume(input, header_end);
            let Some(Frame::Bulk(frame)) = self.stack.pop() else {
                return Err(RedisCoreError::protocol("streamed-string chunk with no open frame"));
            };
            return Ok(Some(StepOutcome::BulkStreamFinished(frame.buf.freeze())));
        }
        let needed = header_end + chunk_len + 2;
        if input.len() < needed {
            return Ok(None);
        }
        let data = &input[header_end..header_end + chunk_len];
        if let Some(Frame::Bulk(frame)) = self.stack.last_mut() {
            frame.buf.extend_from_slice(data);
        }
        consume(input, needed);
        Ok(Some(StepOutcome::FrameOpened))
    }
}

fn finish_agg_frame(frame: AggFrame) -> FrameResult {
    match frame.kind {
        AggKind::Array => FrameResult::Value(Value::array(Some(frame.items))),
        AggKind::Set => FrameResult::Value(Value::new(ValueData::Set(frame.items))),
        AggKind::Push => FrameResult::Value(Value::new(ValueData::Push(frame.items))),
        AggKind::Map => FrameResult::Value(Value::new(ValueData::Map(pair_up(frame.items)))),
        AggKind::Attributes => FrameResult::Attrs(pair_up(frame.items)),
    }
}

fn pair_up(items: Vec<Value>) -> Vec<(Value, Value)> {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        pairs.push((k, v));
    }
    pairs
}

fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_i64(bytes: &[u8]) -> Result<i64> {
    atoi::atoi::<i64>(bytes).ok_or_else(|| RedisCoreError::protocol("protocol error; invalid integer"))
}

fn parse_len(bytes: &[u8]) -> Result<usize> {
    let n = parse_i64(bytes)?;
    usize::try_from(n).map_err(|_| RedisCoreError::protocol("protocol error; negative length"))
}

/// Parses a bulk/array length header that may legally be `-1` (null).
fn parse_len_allow_neg1(bytes: &[u8]) -> Result<Option<usize>> {
    let n = parse_i64(bytes)?;
    if n == -1 {
        return Ok(None);
    }
    usize::try_from(n).map(Some).map_err(|_| RedisCoreError::protocol("protocol error; invalid length"))
}

/// Finds the length of the line (excluding the trailing `\r\n`) starting at
/// the front of `rest`, or `None` if no `\r\n` has arrived yet.
fn find_line_len(rest: &[u8]) -> Option<usize> {
    rest.windows(2).position(|w| w == b"\r\n")
}

fn consume(input: &mut BytesMut, n: usize) {
    input.advance(n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::encoder::{Argument, Encoder};

    fn feed(decoder: &mut Decoder, bytes: &[u8]) -> Option<Value> {
        let mut buf = BytesMut::from(bytes);
        decoder.extract(&mut buf).unwrap()
    }

    #[test]
    fn decodes_simple_string() {
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b"+OK\r\n"), Some(Value::simple_string("OK")));
    }

    #[test]
    fn decodes_error() {
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b"-ERR bad\r\n"), Some(Value::error("ERR bad")));
    }

    #[test]
    fn decodes_integer() {
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b":-42\r\n"), Some(Value::integer(-42)));
    }

    #[test]
    fn decodes_legacy_null_bulk_and_array() {
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b"$-1\r\n"), Some(Value::bulk(None)));
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b"*-1\r\n"), Some(Value::array(None)));
    }

    #[test]
    fn decodes_resp3_null_double_boolean_bignum() {
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b"_\r\n"), Some(Value::null()));
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b",3.14\r\n"), Some(Value::new(ValueData::Double(3.14))));
        let mut d = Decoder::default();
        assert_eq!(feed(&mut d, b"#t\r\n"), Some(Value::new(ValueData::Boolean(true))));
        let mut d = Decoder::default();
        assert_eq!(
            feed(&mut d, b"(3492890328409238509324850943850943825024385\r\n"),
            Some(Value::new(ValueData::BigNumber("3492890328409238509324850943850943825024385".into())))
        );
    }

    #[test]
    fn decodes_nested_array() {
        let mut d = Decoder::default();
        let v = feed(&mut d, b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n").unwrap();
        assert_eq!(v, Value::array(Some(vec![Value::integer(1), Value::array(Some(vec![Value::integer(2), Value::integer(3)]))])));
    }

    #[test]
    fn decodes_map_and_set() {
        let mut d = Decoder::default();
        let v = feed(&mut d, b"%2\r\n+a\r\n:1\r\n+b\r\n:2\r\n").unwrap();
        assert_eq!(v, Value::new(ValueData::Map(vec![(Value::simple_string("a"), Value::integer(1)), (Value::simple_string("b"), Value::integer(2))])));

        let mut d = Decoder::default();
        let v = feed(&mut d, b"~2\r\n+a\r\n+b\r\n").unwrap();
        assert_eq!(v, Value::new(ValueData::Set(vec![Value::simple_string("a"), Value::simple_string("b")])));
    }

    #[test]
    fn decodes_push_distinctly() {
        let mut d = Decoder::default();
        let v = feed(&mut d, b">3\r\n+message\r\n+hi\r\n+there\r\n").unwrap();
        assert!(v.is_push());
    }

    #[test]
    fn decodes_streamed_array() {
        let mut d = Decoder::default();
        let v = feed(&mut d, b"*?\r\n:1\r\n:2\r\n.\r\n").unwrap();
        assert_eq!(v, Value::array(Some(vec![Value::integer(1), Value::integer(2)])));
    }

    #[test]
    fn decodes_streamed_bulk_string() {
        let mut d = Decoder::default();
        let v = feed(&mut d, b"$?\r\n;4\r\nHell\r\n;1\r\no\r\n;0\r\n").unwrap();
        assert_eq!(v, Value::bulk(Some(Bytes::from_static(b"Hello"))));
    }

    #[test]
    fn strips_attributes_by_default() {
        let mut d = Decoder::new(false);
        let v = feed(&mut d, b"|1\r\n+ttl\r\n:10\r\n+value\r\n").unwrap();
        assert_eq!(v, Value::simple_string("value"));
        assert!(v.attributes.is_none());
    }

    #[test]
    fn preserves_attributes_when_configured() {
        let mut d = Decoder::new(true);
        let v = feed(&mut d, b"|1\r\n+ttl\r\n:10\r\n+value\r\n").unwrap();
        assert_eq!(v.data, ValueData::SimpleString("value".into()));
        assert_eq!(v.attributes, Some(vec![(Value::simple_string("ttl"), Value::integer(10))]));
    }

    #[test]
    fn attributes_inside_array_attach_to_element_not_whole_array() {
        let mut d = Decoder::new(true);
        let v = feed(&mut d, b"*1\r\n|1\r\n+k\r\n:1\r\n+v\r\n").unwrap();
        let ValueData::Array(Some(items)) = v.data else { panic!("expected array") };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attributes, Some(vec![(Value::simple_string("k"), Value::integer(1))]));
        assert!(v.attributes.is_none());
    }

    #[test]
    fn liveness_truncated_prefix_yields_only_need_more_data() {
        let mut d = Decoder::default();
        let full = b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        for cut in 1..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            let mut d2 = Decoder::default();
            assert_eq!(d2.extract(&mut buf).unwrap(), None, "prefix of length {cut} should be incomplete");
        }
        let v = feed(&mut d, full).unwrap();
        assert_eq!(v, Value::array(Some(vec![Value::bulk(Some(Bytes::from_static(b"foo"))), Value::bulk(Some(Bytes::from_static(b"bar")))])));
    }

    #[test]
    fn chunked_feed_matches_whole_feed() {
        let full = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n+OK\r\n:7\r\n";
        let mut whole_buf = BytesMut::from(&full[..]);
        let mut whole_decoder = Decoder::default();
        let mut whole_values = Vec::new();
        while let Some(v) = whole_decoder.extract(&mut whole_buf).unwrap() {
            whole_values.push(v);
        }

        for split_points in [vec![5, 9, 20], vec![1, 2, 3, 4, 5, 6, 7], vec![full.len() - 1]] {
            let mut buf = BytesMut::new();
            let mut decoder = Decoder::default();
            let mut values = Vec::new();
            let mut pos = 0;
            let mut points = split_points.clone();
            points.push(full.len());
            for p in points {
                buf.extend_from_slice(&full[pos..p]);
                pos = p;
                while let Some(v) = decoder.extract(&mut buf).unwrap() {
                    values.push(v);
                }
            }
            assert_eq!(values, whole_values);
        }
    }

    #[test]
    fn unknown_prefix_is_a_protocol_error_and_poisons_decoder() {
        let mut d = Decoder::default();
        let mut buf = BytesMut::from(&b"@nope\r\n"[..]);
        assert!(d.extract(&mut buf).is_err());
        assert!(d.poisoned());
        let mut buf2 = BytesMut::from(&b"+OK\r\n"[..]);
        assert!(d.extract(&mut buf2).is_err());
    }

    #[test]
    fn round_trip_through_encoder() {
        let enc = Encoder::default();
        let chunks = enc.encode_command(&[Argument::from("SET"), Argument::from("k"), Argument::from("v")]).unwrap();
        let mut buf = BytesMut::new();
        for c in chunks {
            buf.extend_from_slice(&c);
        }
        let mut d = Decoder::default();
        let v = d.extract(&mut buf).unwrap().unwrap();
        assert_eq!(
            v,
            Value::array(Some(vec![
                Value::bulk(Some(Bytes::from_static(b"SET"))),
                Value::bulk(Some(Bytes::from_static(b"k"))),
                Value::bulk(Some(Bytes::from_static(b"v"))),
            ]))
        );
    }
}
