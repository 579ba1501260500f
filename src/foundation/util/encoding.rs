use crate::foundation::{Hash32, KernelError};

/// Parse a 32-byte value from hex, with or without a `0x` prefix.
pub fn parse_hex_32bytes(s: &str) -> Result<Hash32, KernelError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| KernelError::EncodingError(format!("expected 32 bytes, got {}", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_32bytes_roundtrip() {
        let value = [0x5Au8; 32];
        let parsed = parse_hex_32bytes(&hex::encode(value)).expect("parse");
        assert_eq!(parsed, value);
        assert!(parse_hex_32bytes("abcd").is_err());
        assert!(parse_hex_32bytes("zz").is_err());
    }
}
