use std::collections::BTreeMap;

use crate::varint::read_varint;

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(u64),
    Fixed64(u64),
    Fixed32(u32),
    Text(String),
    Message(Message),
}

/// A decoded message: field number to values in wire order. Repeated
/// occurrences of the same field number collect into one ordered list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    fields: BTreeMap<u32, Vec<Value>>,
}

impl Message {
    /// Decodes a response body. Lenient at the top level: decoding stops at
    /// the first malformed tag and keeps everything before it, so a bad
    /// tail reads as missing fields rather than an error.
    pub fn decode(buf: &[u8]) -> Message {
        let mut msg = Message::default();
        msg.consume(buf);
        msg
    }

    /// Strict variant used to classify nested payloads: the whole buffer
    /// must be a well-formed field stream.
    fn decode_strict(buf: &[u8]) -> Option<Message> {
        let mut msg = Message::default();
        if msg.consume(buf) { Some(msg) } else { None }
    }

    fn consume(&mut self, buf: &[u8]) -> bool {
        let mut pos = 0;
        while pos < buf.len() {
            let Some((field, value, next)) = read_field(buf, pos) else {
                return false;
            };
            if let Some(v) = value {
                self.fields.entry(field).or_default().push(v);
            }
            pos = next;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First varint value of `field`, if present.
    pub fn int(&self, field: u32) -> Option<u64> {
        self.values(field).find_map(|v| match v {
            Value::Int(n) => Some(*n),
            _ => None,
        })
    }

    /// First text value of `field`, if present.
    pub fn text(&self, field: u32) -> Option<&str> {
        self.values(field).find_map(|v| match v {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// First nested message at `field`, if present.
    pub fn message(&self, field: u32) -> Option<&Message> {
        self.messages(field).next()
    }

    /// All nested messages at `field`, in wire order.
    pub fn messages(&self, field: u32) -> impl Iterator<Item = &Message> {
        self.values(field).filter_map(|v| match v {
            Value::Message(m) => Some(m),
            _ => None,
        })
    }

    fn values(&self, field: u32) -> std::slice::Iter<'_, Value> {
        self.fields
            .get(&field)
            .map(|v| v.iter())
            .unwrap_or_default()
    }
}

// Tag layout: (field << 3) | wire_type. The upstream emits wire types
// 0 (varint), 1 (64-bit), 2 (length-delimited) and 5 (32-bit); anything
// else ends the stream.
fn read_field(buf: &[u8], pos: usize) -> Option<(u32, Option<Value>, usize)> {
    let (tag, at) = read_varint(buf, pos)?;
    let field = u32::try_from(tag >> 3).ok()?;
    if field == 0 {
        return None;
    }
    match tag & 0x07 {
        0 => {
            let (v, next) = read_varint(buf, at)?;
            Some((field, Some(Value::Int(v)), next))
        }
        1 => {
            let raw = buf.get(at..at + 8)?;
            let v = u64::from_le_bytes(raw.try_into().ok()?);
            Some((field, Some(Value::Fixed64(v)), at + 8))
        }
        2 => {
            let (len, body_at) = read_varint(buf, at)?;
            let len = usize::try_from(len).ok()?;
            let end = body_at.checked_add(len)?;
            let body = buf.get(body_at..end)?;
            Some((field, classify(body), end))
        }
        5 => {
            let raw = buf.get(at..at + 4)?;
            let v = u32::from_le_bytes(raw.try_into().ok()?);
            Some((field, Some(Value::Fixed32(v)), at + 4))
        }
        _ => None,
    }
}

/// Length-delimited payloads carry no type marker. Non-empty printable
/// UTF-8 (tab, CR and LF allowed) reads as text; otherwise the payload
/// must parse fully as a non-empty nested field stream to count as a
/// message. Payloads that are neither read as absent.
fn classify(body: &[u8]) -> Option<Value> {
    if let Ok(text) = std::str::from_utf8(body) {
        if !text.is_empty() && text.chars().all(is_printable) {
            return Some(Value::Text(text.to_owned()));
        }
    }
    match Message::decode_strict(body) {
        Some(m) if !m.is_empty() => Some(Value::Message(m)),
        _ => None,
    }
}

fn is_printable(c: char) -> bool {
    !c.is_control() || matches!(c, '\n' | '\r' | '\t')
}

#[cfg(test)]
mod tests {
    use super::Message;
    use crate::encode::{put_bool_field, put_bytes_field, put_int_field, put_text_field};

    #[test]
    fn utf8_payload_reads_as_text() {
        let mut buf = Vec::new();
        put_text_field(&mut buf, 3, "hello@example.com");
        let msg = Message::decode(&buf);
        assert_eq!(msg.text(3), Some("hello@example.com"));
        assert!(msg.message(3).is_none());
    }

    #[test]
    fn text_wins_over_message_when_both_parse() {
        // "(A" is printable ASCII and also a valid field stream
        // (field 5, varint 0x41). Text takes precedence.
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 1, b"(A");
        let msg = Message::decode(&buf);
        assert_eq!(msg.text(1), Some("(A"));
        assert!(msg.message(1).is_none());
    }

    #[test]
    fn non_utf8_field_stream_reads_as_nested_message() {
        let mut inner = Vec::new();
        put_int_field(&mut inner, 28, 123_400);
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 1, &inner);

        let msg = Message::decode(&buf);
        let nested = msg.message(1).expect("nested message");
        assert_eq!(nested.int(28), Some(123_400));
    }

    #[test]
    fn junk_payload_reads_as_absent() {
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 2, &[0xff, 0xfe, 0xfd]);
        let msg = Message::decode(&buf);
        assert_eq!(msg.text(2), None);
        assert!(msg.message(2).is_none());
    }

    #[test]
    fn empty_payload_reads_as_absent() {
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 2, b"");
        let msg = Message::decode(&buf);
        assert_eq!(msg.text(2), None);
        assert!(msg.message(2).is_none());
    }

    #[test]
    fn partially_valid_nested_payload_reads_as_absent() {
        // A valid varint field followed by a truncated length-delimited
        // field. The strict nested parse rejects the whole payload.
        let mut inner = Vec::new();
        put_int_field(&mut inner, 1, 7);
        inner.extend_from_slice(&[0x12, 0x0a, 0x00]); // field 2, len 10, 1 byte
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 4, &inner);

        let msg = Message::decode(&buf);
        assert!(msg.message(4).is_none());
    }

    #[test]
    fn repeated_submessages_coalesce_in_wire_order() {
        let mut buf = Vec::new();
        for used in [100u64, 200, 300] {
            let mut inner = Vec::new();
            put_int_field(&mut inner, 2, used);
            put_bytes_field(&mut buf, 4, &inner);
        }

        let msg = Message::decode(&buf);
        let seen: Vec<u64> = msg.messages(4).filter_map(|m| m.int(2)).collect();
        assert_eq!(seen, vec![100, 200, 300]);
        assert_eq!(msg.message(4).and_then(|m| m.int(2)), Some(100));
    }

    #[test]
    fn malformed_tail_keeps_leading_fields() {
        let mut buf = Vec::new();
        put_int_field(&mut buf, 6, 42);
        buf.extend_from_slice(&[0x3b]); // wire type 3: unsupported
        buf.extend_from_slice(&[0x01, 0x02]);

        let msg = Message::decode(&buf);
        assert_eq!(msg.int(6), Some(42));
    }

    #[test]
    fn high_field_numbers_use_multi_byte_tags() {
        let mut buf = Vec::new();
        put_int_field(&mut buf, 28, 1);
        assert_eq!(buf[..2], [0xe0, 0x01]);
        assert_eq!(Message::decode(&buf).int(28), Some(1));
    }

    #[test]
    fn fixed_width_values_decode() {
        let mut buf = Vec::new();
        put_int_field(&mut buf, 1, 9);
        buf.push((2 << 3) | 1); // field 2, fixed64
        buf.extend_from_slice(&7u64.to_le_bytes());
        buf.push((3 << 3) | 5); // field 3, fixed32
        buf.extend_from_slice(&5u32.to_le_bytes());

        let msg = Message::decode(&buf);
        assert_eq!(msg.int(1), Some(9));
        // Fixed-width fields are carried but not surfaced as varints.
        assert_eq!(msg.int(2), None);
        assert_eq!(msg.int(3), None);
    }

    #[test]
    fn bool_fields_decode_as_ints() {
        let mut buf = Vec::new();
        put_bool_field(&mut buf, 3, true);
        assert_eq!(Message::decode(&buf).int(3), Some(1));
    }
}
