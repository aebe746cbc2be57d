use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sequential block identifier, rendered as 4 lowercase hex digits.
///
/// Ids are 1-based; `0000` means "no committed blocks".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockId(u16);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockIdError {
    #[error("block id must be 4 lowercase hex digits, got '{0}'")]
    Malformed(String),
}

impl BlockId {
    pub const NONE: BlockId = BlockId(0);
    pub const MAX: BlockId = BlockId(u16::MAX);

    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Id of the `count`-th block, or `None` when out of range.
    pub fn from_count(count: u32) -> Option<Self> {
        u16::try_from(count).ok().map(Self)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Ids `0001..=self` in order.
    pub fn sequence_through(self) -> Vec<BlockId> {
        (1..=self.0).map(BlockId).collect()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = BlockIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed =
            s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(BlockIdError::Malformed(s.to_string()));
        }
        u16::from_str_radix(s, 16)
            .map(BlockId)
            .map_err(|_| BlockIdError::Malformed(s.to_string()))
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: BlockId,
    pub size: u64,
    pub committed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockListFilter {
    Committed,
    Uncommitted,
    All,
}

impl BlockListFilter {
    pub fn includes(self, committed: bool) -> bool {
        match self {
            BlockListFilter::Committed => committed,
            BlockListFilter::Uncommitted => !committed,
            BlockListFilter::All => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_format() {
        assert_eq!(BlockId::NONE.to_string(), "0000");
        assert_eq!(BlockId::new(1).to_string(), "0001");
        assert_eq!(BlockId::new(0x2af).to_string(), "02af");
        assert_eq!(BlockId::MAX.to_string(), "ffff");
    }

    #[test]
    fn test_block_id_parse() {
        assert_eq!("00ff".parse::<BlockId>().unwrap(), BlockId::new(255));
        assert!("00FF".parse::<BlockId>().is_err());
        assert!("fff".parse::<BlockId>().is_err());
        assert!("0g00".parse::<BlockId>().is_err());
    }

    #[test]
    fn test_block_id_sequence() {
        let ids = BlockId::new(3).sequence_through();
        let rendered: Vec<_> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(rendered, vec!["0001", "0002", "0003"]);
        assert!(BlockId::NONE.sequence_through().is_empty());
        assert!(BlockId::MAX.next().is_none());
        assert_eq!(BlockId::from_count(70_000), None);
    }
}
