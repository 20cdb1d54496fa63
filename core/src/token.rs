use rand::Rng;
use sha2::{Digest, Sha256};

/// Generate a resume token for an in-flight attempt. Returns `(full_token, sha256_hash)`.
/// Format: `skala_rt_` + 32 random bytes hex-encoded. Only the hash is ever stored.
pub fn generate_resume_token() -> (String, String) {
    let raw = random_hex(32);
    let full_token = format!("skala_rt_{raw}");
    let hash = hash_token(&full_token);
    (full_token, hash)
}

/// Generate a session token for an authenticated user. Returns `(full_token, sha256_hash)`.
/// Format: `skala_st_` + 32 random bytes hex-encoded.
pub fn generate_session_token() -> (String, String) {
    let raw = random_hex(32);
    let full_token = format!("skala_st_{raw}");
    let hash = hash_token(&full_token);
    (full_token, hash)
}

/// Generate an invite token bound to a B2B credit. Returns `(full_token, sha256_hash)`.
/// Format: `skala_inv_` + 32 random bytes hex-encoded.
pub fn generate_invite_token() -> (String, String) {
    let raw = random_hex(32);
    let full_token = format!("skala_inv_{raw}");
    let hash = hash_token(&full_token);
    (full_token, hash)
}

/// SHA-256 hex digest; only hashes are stored server-side.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// First 8 chars after the prefix, for logs and display. Never log full tokens.
pub fn token_prefix(full_token: &str) -> String {
    full_token
        .rsplit_once('_')
        .map(|(_, rest)| rest.chars().take(8).collect())
        .unwrap_or_default()
}

/// `n` random bytes, hex-encoded.
fn random_hex(n: usize) -> String {
    let bytes: Vec<u8> = (0..n).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    hex::encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_token_roundtrip() {
        let (token, hash) = generate_resume_token();
        assert!(token.starts_with("skala_rt_"));
        assert_eq!(hash, hash_token(&token));
        assert_eq!(token_prefix(&token).len(), 8);
    }

    #[test]
    fn session_token_roundtrip() {
        let (token, hash) = generate_session_token();
        assert!(token.starts_with("skala_st_"));
        assert_eq!(hash, hash_token(&token));
    }

    #[test]
    fn invite_token_roundtrip() {
        let (token, hash) = generate_invite_token();
        assert!(token.starts_with("skala_inv_"));
        assert_eq!(hash, hash_token(&token));
    }

    #[test]
    fn hashes_are_stable_and_distinct() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }

    #[test]
    fn prefix_of_unprefixed_string_is_empty() {
        assert_eq!(token_prefix("nounderscores"), "");
    }
}
