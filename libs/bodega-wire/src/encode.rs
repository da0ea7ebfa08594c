use crate::varint::put_varint;

/// Appends a length-delimited field (wire type 2).
pub fn put_bytes_field(buf: &mut Vec<u8>, field: u32, value: &[u8]) {
    put_varint(buf, tag(field, 2));
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Appends a UTF-8 string field (wire type 2).
pub fn put_text_field(buf: &mut Vec<u8>, field: u32, value: &str) {
    put_bytes_field(buf, field, value.as_bytes());
}

/// Appends a varint field (wire type 0).
pub fn put_int_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_varint(buf, tag(field, 0));
    put_varint(buf, value);
}

/// Appends a bool field, encoded as varint 0 or 1.
pub fn put_bool_field(buf: &mut Vec<u8>, field: u32, value: bool) {
    put_int_field(buf, field, u64::from(value));
}

fn tag(field: u32, wire_type: u64) -> u64 {
    (u64::from(field) << 3) | wire_type
}

#[cfg(test)]
mod tests {
    use super::{put_bool_field, put_text_field};

    #[test]
    fn short_text_field_layout() {
        let mut buf = Vec::new();
        put_text_field(&mut buf, 1, "ab");
        assert_eq!(buf, vec![0x0a, 0x02, b'a', b'b']);
    }

    #[test]
    fn long_text_uses_multi_byte_length() {
        let value = "x".repeat(200);
        let mut buf = Vec::new();
        put_text_field(&mut buf, 1, &value);
        assert_eq!(buf[..3], [0x0a, 0xc8, 0x01]);
        assert_eq!(buf.len(), 3 + 200);
    }

    #[test]
    fn bool_trailer_fields_match_expected_bytes() {
        // Fields 2..=4 set true is the fixed trailer the profile request
        // carries after the bearer token.
        let mut buf = Vec::new();
        put_bool_field(&mut buf, 2, true);
        put_bool_field(&mut buf, 3, true);
        put_bool_field(&mut buf, 4, true);
        assert_eq!(buf, vec![0x10, 0x01, 0x18, 0x01, 0x20, 0x01]);
    }

    #[test]
    fn false_bool_encodes_zero() {
        let mut buf = Vec::new();
        put_bool_field(&mut buf, 3, false);
        assert_eq!(buf, vec![0x18, 0x00]);
    }
}
