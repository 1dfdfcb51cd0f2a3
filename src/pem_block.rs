//! PEM envelope helpers shared by the CA store and the certificate factory

use pem::{EncodeConfig, LineEnding, Pem};

pub const CERTIFICATE_TAG: &str = "CERTIFICATE";
pub const RSA_PRIVATE_KEY_TAG: &str = "RSA PRIVATE KEY";

const ENCODE_CONFIG: EncodeConfig = EncodeConfig::new().set_line_ending(LineEnding::LF);

/// Wrap `der` in a PEM block labelled `tag`
pub fn encode(tag: &str, der: Vec<u8>) -> String {
    pem::encode_config(&Pem::new(tag, der), ENCODE_CONFIG)
}

/// Decode the first PEM block in `raw` after trimming surrounding whitespace
///
/// The label is not checked; the payload parser decides whether the contents
/// make sense.
pub fn decode_first(raw: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    pem::parse(text).ok().map(Pem::into_contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_unix_line_endings() {
        let pem = encode(CERTIFICATE_TAG, vec![1, 2, 3]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
        assert!(!pem.contains('\r'));
    }

    #[test]
    fn test_decode_tolerates_surrounding_whitespace() {
        let pem = format!("\n\n  {}  \n", encode(RSA_PRIVATE_KEY_TAG, vec![9, 8, 7]));
        assert_eq!(decode_first(pem.as_bytes()), Some(vec![9, 8, 7]));
    }

    #[test]
    fn test_decode_rejects_non_pem() {
        assert_eq!(decode_first(b"just some text"), None);
        assert_eq!(decode_first(&[0xff, 0xfe, 0x00]), None);
    }
}
