use sha2::{Digest, Sha256};

/// Stable identity of a remembered target: case-insensitive over both the
/// query and the context, with an empty context treated as absent.
pub fn element_id(query: &str, context: Option<&str>) -> String {
    let mut combined = query.to_lowercase();
    if let Some(context) = context.filter(|value| !value.is_empty()) {
        combined.push_str("||");
        combined.push_str(&context.to_lowercase());
    }
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of an already down-sampled greyscale pixel buffer.
pub fn screen_fingerprint_digest(luma: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(luma);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{element_id, screen_fingerprint_digest};

    #[test]
    fn element_id_ignores_case() {
        assert_eq!(
            element_id("Submit", Some("Bottom-Right Button")),
            element_id("submit", Some("bottom-right button"))
        );
    }

    #[test]
    fn element_id_treats_empty_context_as_absent() {
        assert_eq!(element_id("Submit", Some("")), element_id("Submit", None));
        assert_ne!(
            element_id("Submit", Some("footer")),
            element_id("Submit", None)
        );
    }

    #[test]
    fn element_id_is_hex_sha256() {
        let id = element_id("Submit", None);
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_digest_distinguishes_buffers() {
        assert_ne!(
            screen_fingerprint_digest(&[0, 1, 2]),
            screen_fingerprint_digest(&[0, 1, 3])
        );
    }
}
