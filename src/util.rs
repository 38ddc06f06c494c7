use std::ascii;

/// Escapes arbitrary bytes into a printable string for logging.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_human_str() {
        assert_eq!(bytes_to_human_str(b"put 0 0 1 5"), "put 0 0 1 5");
        assert_eq!(bytes_to_human_str(b"a\r\n\x00"), "a\\r\\n\\x00");
    }
}
