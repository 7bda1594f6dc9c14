//! Fixed-capacity wide-string helpers.
//!
//! The driver writes `wchar_t[N]` buffers that are either NUL-terminated or
//! completely filled. Decoding stops at the first zero unit or the end of the
//! buffer, whichever comes first.

/// Decode a UTF-16 buffer up to its first NUL.
pub fn decode_units(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Decode little-endian UTF-16 bytes (`2 * capacity` of them) up to the first NUL.
pub fn decode_le_bytes(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encode `s` into exactly `capacity` UTF-16 units.
///
/// Longer strings are truncated at `capacity` (no terminator then), shorter
/// ones are zero-padded.
pub fn encode_units(s: &str, capacity: usize) -> Vec<u16> {
    let mut out: Vec<u16> = s.encode_utf16().take(capacity).collect();
    out.resize(capacity, 0);
    out
}

/// Same as [`encode_units`] but already laid out as little-endian bytes.
pub fn encode_le_bytes(s: &str, capacity: usize) -> Vec<u8> {
    encode_units(s, capacity)
        .into_iter()
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_embedded_zero() {
        let mut units = encode_units("notepad.exe", 16);
        units[4] = 0;
        // garbage after the terminator must be ignored
        units[5] = b'X' as u16;
        assert_eq!(decode_units(&units), "note");
        assert_eq!(decode_units(&units).len(), 4);
    }

    #[test]
    fn full_buffer_without_terminator_uses_whole_capacity() {
        let units: Vec<u16> = "abcdefgh".encode_utf16().collect();
        assert_eq!(decode_units(&units), "abcdefgh");

        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(decode_le_bytes(&bytes), "abcdefgh");
    }

    #[test]
    fn encode_truncates_and_pads() {
        let units = encode_units("abcdef", 4);
        assert_eq!(units.len(), 4);
        assert_eq!(decode_units(&units), "abcd");

        let bytes = encode_le_bytes("ab", 4);
        assert_eq!(bytes, vec![b'a', 0, b'b', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn empty_buffer_is_empty_string() {
        assert_eq!(decode_units(&[]), "");
        assert_eq!(decode_units(&[0, 65, 66]), "");
    }
}
