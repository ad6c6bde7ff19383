//! Field encodings used by spill headers, and truncation handling.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(encode_to_vec(&0xDEAD_BEEFu32).unwrap(), [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(
            encode_to_vec(&0x0102_0304_0506_0708u64).unwrap(),
            [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(encode_to_vec(&7u8).unwrap(), [7]);
    }

    #[test]
    fn negative_keys_survive() {
        for key in [i64::MIN, -1, 0, 1, i64::MAX] {
            let bytes = encode_to_vec(&key).unwrap();
            assert_eq!(bytes.len(), 8);
            assert_eq!(i64::decode_from(&bytes).unwrap(), (key, 8));
        }
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        assert_eq!(u32::decode_from(&[1, 0, 0, 0, 0xFF, 0xFF]).unwrap(), (1, 4));
    }

    /// # Scenario
    /// A `u64` field cut short after three bytes.
    ///
    /// # Expected behavior
    /// `UnexpectedEof` reports both the field size and what was left.
    #[test]
    fn truncated_field_reports_needed_and_available() {
        let err = u64::decode_from(&[1, 2, 3]).unwrap_err();
        assert!(
            matches!(err, EncodingError::UnexpectedEof { needed: 8, available: 3 }),
            "unexpected error: {err:?}"
        );
        assert!(matches!(
            u8::decode_from(&[]),
            Err(EncodingError::UnexpectedEof { needed: 1, available: 0 })
        ));
    }

    #[test]
    fn magic_has_no_length_prefix() {
        let bytes = encode_to_vec(b"HJSG").unwrap();
        assert_eq!(bytes, b"HJSG");
        assert_eq!(<[u8; 4]>::decode_from(&bytes).unwrap(), (*b"HJSG", 4));
    }

    /// # Scenario
    /// Three fields read in sequence, then a fourth past the end.
    ///
    /// # Expected behavior
    /// The reader advances by each field's size and fails cleanly at the
    /// end without moving.
    #[test]
    fn field_reader_walks_a_header() {
        let mut buf = Vec::new();
        b"HJSG".encode_to(&mut buf).unwrap();
        3u32.encode_to(&mut buf).unwrap();
        (-5i64).encode_to(&mut buf).unwrap();

        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.read::<[u8; 4]>().unwrap(), *b"HJSG");
        assert_eq!(reader.read::<u32>().unwrap(), 3);
        assert_eq!(reader.read::<i64>().unwrap(), -5);
        assert_eq!(reader.position(), 16);

        assert!(reader.read::<u8>().is_err());
        assert_eq!(reader.position(), 16);
    }

    #[test]
    fn len_to_u32_overflow() {
        assert_eq!(len_to_u32(42).unwrap(), 42);
        if usize::BITS > 32 {
            let len = u32::MAX as usize + 1;
            assert!(matches!(len_to_u32(len), Err(EncodingError::LengthOverflow(l)) if l == len));
        }
    }
}
