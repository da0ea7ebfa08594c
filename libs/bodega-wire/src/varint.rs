/// Reads a LEB128 varint starting at `pos`. Returns the value and the
/// offset of the first byte after it, or `None` on a truncated or
/// over-long encoding.
pub(crate) fn read_varint(buf: &[u8], pos: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut at = pos;
    loop {
        let byte = *buf.get(at)?;
        at += 1;
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, at));
        }
        shift += 7;
    }
}

pub(crate) fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value > 0x7f {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::{put_varint, read_varint};

    #[test]
    fn single_byte_values_round_trip() {
        for v in [0u64, 1, 127] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            assert_eq!(buf.len(), 1);
            assert_eq!(read_varint(&buf, 0), Some((v, 1)));
        }
    }

    #[test]
    fn multi_byte_encoding_matches_wire_format() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);
        assert_eq!(read_varint(&buf, 0), Some((300, 2)));
    }

    #[test]
    fn max_value_round_trips() {
        let mut buf = Vec::new();
        put_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_varint(&buf, 0), Some((u64::MAX, 10)));
    }

    #[test]
    fn truncated_input_is_rejected() {
        // Continuation bit set but no following byte.
        assert_eq!(read_varint(&[0x80], 0), None);
        assert_eq!(read_varint(&[], 0), None);
    }

    #[test]
    fn over_long_encoding_is_rejected() {
        let buf = [0x80u8; 11];
        assert_eq!(read_varint(&buf, 0), None);
    }

    #[test]
    fn reads_at_offset() {
        let buf = [0xff, 0x05];
        assert_eq!(read_varint(&buf, 1), Some((5, 2)));
    }
}
