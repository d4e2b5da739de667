use anyhow::{bail, Result};
use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

/// Validates presented bearer tokens against a configured SHA-256 digest of
/// the shared secret. With no digest configured, every request passes.
#[derive(Clone)]
pub struct TokenVerifier {
    digest_hex: Option<String>,
}

impl TokenVerifier {
    pub fn new(digest_hex: Option<String>) -> Self {
        Self { digest_hex }
    }

    pub fn verify(&self, raw_token: Option<&str>) -> bool {
        let Some(expected) = self.digest_hex.as_deref() else {
            return true;
        };
        let Some(token) = raw_token else {
            return false;
        };
        if token.is_empty() {
            return false;
        }
        timing_safe_equal(sha256_hex(token).as_bytes(), expected.as_bytes())
    }
}

/// Parse the configured digest: empty disables auth, anything else must be
/// a 64-character hex SHA-256.
pub fn parse_digest(raw: &str) -> Result<Option<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("SIGNAL_TOKEN_SHA256 must be a 64-character hex SHA-256 digest");
    }
    Ok(Some(trimmed.to_ascii_lowercase()))
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `Authorization: Bearer <t>` wins over the `token` query parameter.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(bearer) = text.strip_prefix("Bearer ") {
                return Some(bearer.trim().to_string());
            }
        }
    }
    query_token.map(|t| t.to_string())
}

fn timing_safe_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_verifier_accepts_anything() {
        let verifier = TokenVerifier::new(None);
        assert!(verifier.verify(None));
        assert!(verifier.verify(Some("anything")));
        assert!(verifier.verify(Some("")));
    }

    #[test]
    fn configured_verifier_matches_only_the_secret() {
        let verifier = TokenVerifier::new(Some(sha256_hex("s3cret")));
        assert!(verifier.verify(Some("s3cret")));
        assert!(!verifier.verify(Some("wrong")));
        assert!(!verifier.verify(Some("")));
        assert!(!verifier.verify(None));
    }

    #[test]
    fn equal_length_mismatch_is_rejected() {
        let verifier = TokenVerifier::new(Some(sha256_hex("aaaa")));
        // Same digest length, different content.
        assert!(!verifier.verify(Some("aaab")));
    }

    #[test]
    fn digest_parsing_rejects_malformed_values() {
        assert!(parse_digest("").unwrap().is_none());
        assert!(parse_digest("   ").unwrap().is_none());
        assert!(parse_digest("deadbeef").is_err());
        assert!(parse_digest(&"z".repeat(64)).is_err());
        let digest = sha256_hex("s3cret");
        assert_eq!(
            parse_digest(&digest.to_ascii_uppercase()).unwrap(),
            Some(digest)
        );
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(
            extract_token(&headers, Some("from-query")),
            Some("abc".to_string())
        );
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("from-query")),
            Some("from-query".to_string())
        );
        assert_eq!(extract_token(&HeaderMap::new(), None), None);
    }
}
