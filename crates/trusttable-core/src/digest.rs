use sha2::{Digest, Sha256};

/// SHA-256 content digest, hex encoded.
///
/// Keys the query-synthesis cache and seals persisted audit artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of several parts, each length-prefixed so `("ab", "c")` and
    /// `("a", "bc")` never collide.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_sha256_hex() {
        let d = ContentDigest::from_bytes(b"hello");
        assert_eq!(
            d.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(d.short(), "2cf24dba5fb0");
    }

    #[test]
    fn parts_are_unambiguous() {
        let a = ContentDigest::from_parts(&[b"ab", b"c"]);
        let b = ContentDigest::from_parts(&[b"a", b"bc"]);
        assert_ne!(a, b);
        assert_eq!(a, ContentDigest::from_parts(&[b"ab", b"c"]));
    }
}
