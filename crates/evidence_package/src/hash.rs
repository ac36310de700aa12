// Content hashing for archive entries and manifest signing targets

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

/// SHA-256 digest of a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex digest (either case)
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a byte slice
pub fn digest(bytes: &[u8]) -> ContentHash {
    ContentHash(Sha256::digest(bytes).into())
}

/// Hash everything a reader yields, in fixed-size chunks
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(ContentHash(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_known_vector() {
        assert_eq!(
            digest(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn reader_and_slice_agree() {
        let data = vec![7u8; 20_000];
        let streamed = digest_reader(&data[..]).expect("digest reader");
        assert_eq!(streamed, digest(&data));
    }

    #[test]
    fn hex_parsing_accepts_uppercase_and_rejects_short() {
        let h = digest(b"abc");
        let upper = h.to_hex().to_uppercase();
        assert_eq!(ContentHash::from_hex(&upper), Some(h));
        assert_eq!(ContentHash::from_hex("abcd"), None);
        assert_eq!(ContentHash::from_hex("zz"), None);
    }
}
