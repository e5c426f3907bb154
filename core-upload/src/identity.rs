//! Content identity of upload payloads.
//!
//! A task is keyed by the SHA-1 digest of its full payload, rendered as 40
//! lowercase hex characters. The server uses the same digest as the task id
//! and as the checksum it verifies after the last chunk. The digest is an
//! identifier only and is never relied on for security.

use crate::error::{Result, UploadError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

const DIGEST_HEX_LEN: usize = 40;

/// Hex digest identifying an upload payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Parse the textual form, accepting either hex case.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidContentId`] unless the input is exactly
    /// 40 hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != DIGEST_HEX_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UploadError::InvalidContentId(value.to_string()));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContentId {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentId {
    type Error = UploadError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

/// Compute the identifier of a payload.
pub fn identify(payload: &[u8]) -> ContentId {
    let mut hasher = Sha1::new();
    hasher.update(payload);
    ContentId(hex::encode(hasher.finalize()))
}

/// Compute the identifier on the blocking pool.
///
/// Large media files take long enough to hash that doing it inline would
/// stall the notification loop.
pub async fn identify_async(payload: Bytes) -> Result<ContentId> {
    tokio::task::spawn_blocking(move || identify(&payload))
        .await
        .map_err(|e| UploadError::Identity(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            identify(b"abc").as_str(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            identify(b"").as_str(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            identify(b"The quick brown fox jumps over the lazy dog").as_str(),
            "2fd4e1c67a2d28fced849ee1bb76e7391b93eb12"
        );
    }

    #[test]
    fn test_identify_is_deterministic_and_distinct() {
        let a = identify(b"cover art bytes");
        let b = identify(b"cover art bytes");
        let c = identify(b"cover art bytez");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let id = ContentId::parse("A9993E364706816ABA3E25717850C26C9CD0D89D").unwrap();
        assert_eq!(id, identify(b"abc"));
        assert_eq!(id.short(), "a9993e36");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(matches!(
            ContentId::parse("a9993e36"),
            Err(UploadError::InvalidContentId(_))
        ));
        assert!(ContentId::parse("z9993e364706816aba3e25717850c26c9cd0d89d").is_err());
        assert!(ContentId::parse("").is_err());
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let id = identify(b"abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a9993e364706816aba3e25717850c26c9cd0d89d\"");

        let parsed: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
        assert!(serde_json::from_str::<ContentId>("\"nothex\"").is_err());
    }

    #[tokio::test]
    async fn test_identify_async_matches_sync() {
        let payload = Bytes::from(vec![7u8; 64 * 1024]);
        let expected = identify(&payload);
        let id = identify_async(payload).await.unwrap();
        assert_eq!(id, expected);
    }
}
