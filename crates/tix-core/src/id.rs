//! ID generation for tix tickets
//!
//! Hash-based IDs so independent replicas never need to coordinate.
//! Format: <prefix>-xxxx (4 lowercase base32 chars)

use sha2::{Digest, Sha256};
use uuid::Uuid;

const HASH_CHARS: usize = 4;

/// Generate a ticket ID
///
/// Random UUID and clock are hashed together and the first bytes are
/// rendered as lowercase Crockford base32. Collisions are possible with
/// so few characters; callers check the store and draw again.
pub fn generate_id(prefix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    let hash = hasher.finalize();

    let mut suffix = base32::encode(base32::Alphabet::Crockford, &hash[..HASH_CHARS]);
    suffix.truncate(HASH_CHARS);
    format!("{}-{}", prefix, suffix.to_lowercase())
}

/// Check that an ID is safe to use as a document name
///
/// IDs end up as file names inside the store, so anything that could
/// escape the tickets directory is refused.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && !id.starts_with(['.', '-'])
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id("tix");
        assert!(id.starts_with("tix-"));
        assert_eq!(id.len(), 8);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(".hidden"));
        assert!(is_valid_id("tix-0a9z"));
    }
}
