//! Registry content digests.
//!
//! An [`ImageDigest`] is what a push-by-digest returns: `<algorithm>:<hex>`.
//! Markers in the digest collection are named by the hex payload alone, so a
//! digest must round-trip through [`ImageDigest::marker_name`] and
//! [`ImageDigest::from_marker`] without losing or gaining characters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::domain::error::{FanoutError, Result};

/// Hash algorithms accepted in registry digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded payload.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(DigestAlgorithm::Sha256),
            128 => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Content digest of one pushed platform image.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl ImageDigest {
    /// Parse `<algorithm>:<hex>`. Hex is normalized to lowercase.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| FanoutError::InvalidDigest {
            digest: s.to_string(),
            reason: reason.to_string(),
        };

        let (algo, hex) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("missing algorithm prefix"))?;
        let algorithm =
            DigestAlgorithm::from_name(algo).ok_or_else(|| invalid("unsupported algorithm"))?;
        Self::from_parts(algorithm, hex).map_err(|_| invalid("malformed hex payload"))
    }

    /// Rebuild a digest from a marker name (hex payload only).
    ///
    /// The algorithm is inferred from the payload length.
    pub fn from_marker(name: &str) -> Result<Self> {
        let algorithm =
            DigestAlgorithm::from_hex_len(name.len()).ok_or_else(|| FanoutError::InvalidDigest {
                digest: name.to_string(),
                reason: format!("marker length {} matches no algorithm", name.len()),
            })?;
        Self::from_parts(algorithm, name)
    }

    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    fn from_parts(algorithm: DigestAlgorithm, hex: &str) -> Result<Self> {
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FanoutError::InvalidDigest {
                digest: format!("{}:{}", algorithm.name(), hex),
                reason: format!("expected {} hex characters", algorithm.hex_len()),
            });
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Name of the marker recording this digest: the hex payload, untruncated.
    pub fn marker_name(&self) -> &str {
        &self.hex
    }

    /// Short form (first 12 hex chars), for logs.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl fmt::Debug for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageDigest({}:{})", self.algorithm.name(), self.short())
    }
}

impl FromStr for ImageDigest {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageDigest {
    type Error = FanoutError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ImageDigest> for String {
    fn from(d: ImageDigest) -> Self {
        d.to_string()
    }
}
