//! Hash newtypes, outpoints and block locators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("invalid hash length: expected 32 bytes, got {0}")]
    Length(usize),
}

macro_rules! hash_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const ZERO: $name = $name([0u8; 32]);

            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = HashParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| HashParseError::Hex(e.to_string()))?;
                if bytes.len() != 32 {
                    return Err(HashParseError::Length(bytes.len()));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok($name(arr))
            }
        }
    };
}

hash_newtype!(Txid, "A transaction id.");
hash_newtype!(BlockHash, "A block hash.");

/// A reference to a specific transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        OutPoint { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A block position: hash plus height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashHeight {
    pub hash: BlockHash,
    pub height: i64,
}

impl HashHeight {
    pub fn new(hash: BlockHash, height: i64) -> Self {
        HashHeight { hash, height }
    }

    /// The position just before genesis. Wallets with nothing synced sit here.
    pub fn start() -> Self {
        HashHeight { hash: BlockHash::ZERO, height: -1 }
    }
}

impl fmt::Display for HashHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// Ordered list of ancestor block positions, newest first.
///
/// Used to find the fork point between a wallet and a moving chain tip and
/// to validate rewind targets. Recent ancestors are dense, older ones
/// exponentially spaced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockLocator(pub Vec<HashHeight>);

/// Number of consecutive recent ancestors a locator keeps before the
/// spacing starts doubling.
const LOCATOR_DENSE_WINDOW: i64 = 10;

impl BlockLocator {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Newest entry, if any.
    pub fn tip(&self) -> Option<HashHeight> {
        self.0.first().copied()
    }

    /// Whether the locator records `position` as an ancestor.
    pub fn contains(&self, position: &HashHeight) -> bool {
        self.0.iter().any(|p| p == position)
    }

    /// Returns a new locator with `tip` prepended and older entries thinned
    /// to the dense-then-exponential spacing.
    pub fn advanced_to(&self, tip: HashHeight) -> BlockLocator {
        let mut entries = vec![tip];
        let mut step = 1i64;
        let mut next_height = tip.height - 1;

        for entry in self.0.iter().filter(|e| e.height < tip.height) {
            if entry.height > next_height {
                continue;
            }
            entries.push(*entry);
            if tip.height - entry.height >= LOCATOR_DENSE_WINDOW {
                step *= 2;
            }
            next_height = entry.height - step;
        }

        BlockLocator(entries)
    }

    /// Drops entries above `height`, for rewinds.
    pub fn truncated_to(&self, height: i64) -> BlockLocator {
        BlockLocator(self.0.iter().copied().filter(|e| e.height <= height).collect())
    }

    /// Comma-separated `hash:height` form, as persisted in the wallet row.
    pub fn to_text(&self) -> String {
        self.0
            .iter()
            .map(|p| format!("{}:{}", p.hash.to_hex(), p.height))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_text(s: &str) -> Result<Self, HashParseError> {
        let mut entries = Vec::new();
        for part in s.split(',').filter(|p| !p.is_empty()) {
            let (hash_part, height_part) = part
                .split_once(':')
                .ok_or_else(|| HashParseError::Hex(part.to_string()))?;
            let hash = BlockHash::from_str(hash_part)?;
            let height = height_part
                .parse::<i64>()
                .map_err(|_| HashParseError::Hex(height_part.to_string()))?;
            entries.push(HashHeight::new(hash, height));
        }
        Ok(BlockLocator(entries))
    }
}
