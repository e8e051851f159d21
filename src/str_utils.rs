/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Splits `s` so that the second half holds at least the last `min_tail_bytes`
/// bytes, widened backwards to the nearest character boundary.
pub fn split_keep_tail(s: &str, min_tail_bytes: usize) -> (&str, &str) {
    if s.len() <= min_tail_bytes {
        return ("", s);
    }
    let mut idx = s.len() - min_tail_bytes;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.split_at(idx)
}

/// Longest prefix of `bytes` that is valid UTF-8, plus the number of trailing
/// bytes that form an incomplete (not invalid) sequence.
pub fn utf8_valid_prefix(bytes: &[u8]) -> (usize, usize) {
    match std::str::from_utf8(bytes) {
        Ok(_) => (bytes.len(), 0),
        Err(e) => match e.error_len() {
            // truncated sequence at the end: wait for more bytes
            None => (e.valid_up_to(), bytes.len() - e.valid_up_to()),
            Some(_) => (e.valid_up_to(), 0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keep_tail_respects_char_boundaries() {
        let s = "ab思考";
        // "思" starts at byte 2 and "考" at byte 5; a 4-byte tail widens to 6
        let (head, tail) = split_keep_tail(s, 4);
        assert_eq!(head, "ab");
        assert_eq!(tail, "思考");
    }

    #[test]
    fn split_keep_tail_short_input_is_all_tail() {
        assert_eq!(split_keep_tail("abc", 21), ("", "abc"));
    }

    #[test]
    fn utf8_prefix_detects_truncated_sequence() {
        let bytes = "a思".as_bytes();
        assert_eq!(utf8_valid_prefix(&bytes[..2]), (1, 1));
        assert_eq!(utf8_valid_prefix(bytes), (4, 0));
    }
}
