use sha2::{Digest, Sha256};

/// Mint a heartbeat ping token. The raw value is returned to the caller
/// exactly once at monitor creation; only the hash is stored.
pub fn generate_token() -> String {
    format!("hb_{}", hex::encode(rand::random::<[u8; 16]>()))
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
