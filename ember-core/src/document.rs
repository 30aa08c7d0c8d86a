//! Document addressing and durability types shared by the client and codec.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EmberError, Result};

/// Name of the default scope and collection.
pub const DEFAULT_NAME: &str = "_default";

/// Expiry values above this many seconds are absolute Unix timestamps on the wire.
pub const RELATIVE_EXPIRY_LIMIT_SECS: u64 = 30 * 24 * 60 * 60;

/// A `scope.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionName {
    scope: String,
    collection: String,
}

impl CollectionName {
    /// Creates a collection name.
    pub fn new(scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Returns the scope part.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns the collection part.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns `true` for `_default._default`.
    pub fn is_default(&self) -> bool {
        self.scope == DEFAULT_NAME && self.collection == DEFAULT_NAME
    }
}

impl Default for CollectionName {
    fn default() -> Self {
        Self::new(DEFAULT_NAME, DEFAULT_NAME)
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.collection)
    }
}

impl FromStr for CollectionName {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((scope, collection))
                if !scope.is_empty() && !collection.is_empty() && !collection.contains('.') =>
            {
                Ok(Self::new(scope, collection))
            }
            None if !s.is_empty() => Ok(Self::new(DEFAULT_NAME, s)),
            _ => Err(EmberError::InvalidArgument(format!(
                "invalid collection name '{}'",
                s
            ))),
        }
    }
}

/// A fully qualified document address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId {
    collection: CollectionName,
    key: String,
}

impl DocumentId {
    /// Creates a document id.
    pub fn new(collection: CollectionName, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    /// Creates an id in the default collection.
    pub fn in_default(key: impl Into<String>) -> Self {
        Self::new(CollectionName::default(), key)
    }

    /// Returns the collection.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Returns the key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// Synchronous replication requirement attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DurabilityLevel {
    /// No synchronous replication.
    #[default]
    None,
    /// Replicated to a majority of nodes.
    Majority,
    /// Replicated to a majority and persisted on the active node.
    MajorityAndPersistActive,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}

impl DurabilityLevel {
    /// Wire value used in the durability framing extra, or `None` when no
    /// requirement is sent.
    pub fn code(self) -> Option<u8> {
        match self {
            Self::None => None,
            Self::Majority => Some(0x01),
            Self::MajorityAndPersistActive => Some(0x02),
            Self::PersistToMajority => Some(0x03),
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Majority),
            0x02 => Some(Self::MajorityAndPersistActive),
            0x03 => Some(Self::PersistToMajority),
            _ => None,
        }
    }
}

impl FromStr for DurabilityLevel {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "majority" => Ok(Self::Majority),
            "majority_and_persist_active" | "majority_and_persist_to_active" => {
                Ok(Self::MajorityAndPersistActive)
            }
            "persist_to_majority" => Ok(Self::PersistToMajority),
            other => Err(EmberError::InvalidArgument(format!(
                "unknown durability level '{}'",
                other
            ))),
        }
    }
}

/// Converts a relative expiry into the wire representation.
///
/// Durations up to 30 days are sent as relative seconds; longer ones become an
/// absolute Unix timestamp computed from `now_unix_secs`.
pub fn expiry_to_wire(expiry: Duration, now_unix_secs: u64) -> u32 {
    let secs = expiry.as_secs();
    if secs == 0 && expiry.subsec_nanos() > 0 {
        return 1;
    }
    if secs <= RELATIVE_EXPIRY_LIMIT_SECS {
        return secs as u32;
    }
    u32::try_from(now_unix_secs.saturating_add(secs)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_parse() {
        let name: CollectionName = "inventory.hotels".parse().unwrap();
        assert_eq!(name.scope(), "inventory");
        assert_eq!(name.collection(), "hotels");
        assert_eq!(name.to_string(), "inventory.hotels");

        let bare: CollectionName = "users".parse().unwrap();
        assert_eq!(bare.scope(), DEFAULT_NAME);

        assert!("".parse::<CollectionName>().is_err());
        assert!("a.".parse::<CollectionName>().is_err());
        assert!("a.b.c".parse::<CollectionName>().is_err());
    }

    #[test]
    fn test_default_collection() {
        assert!(CollectionName::default().is_default());
        assert!(!CollectionName::new("_default", "other").is_default());
    }

    #[test]
    fn test_document_id_display() {
        let id = DocumentId::new(CollectionName::new("s", "c"), "k1");
        assert_eq!(id.to_string(), "s.c/k1");
        assert_eq!(id.key(), "k1");
    }

    #[test]
    fn test_durability_codes() {
        assert_eq!(DurabilityLevel::None.code(), None);
        assert_eq!(DurabilityLevel::Majority.code(), Some(1));
        assert_eq!(DurabilityLevel::from_code(3), Some(DurabilityLevel::PersistToMajority));
        assert_eq!(DurabilityLevel::from_code(9), None);
    }

    #[test]
    fn test_durability_parse() {
        assert_eq!(
            "persist-to-majority".parse::<DurabilityLevel>().unwrap(),
            DurabilityLevel::PersistToMajority
        );
        assert_eq!("MAJORITY".parse::<DurabilityLevel>().unwrap(), DurabilityLevel::Majority);
        assert!("quorum".parse::<DurabilityLevel>().is_err());
    }

    #[test]
    fn test_expiry_to_wire() {
        assert_eq!(expiry_to_wire(Duration::ZERO, 1_000), 0);
        assert_eq!(expiry_to_wire(Duration::from_millis(10), 1_000), 1);
        assert_eq!(expiry_to_wire(Duration::from_secs(60), 1_000), 60);
        let long = Duration::from_secs(RELATIVE_EXPIRY_LIMIT_SECS + 1);
        assert_eq!(
            expiry_to_wire(long, 1_000),
            (1_000 + RELATIVE_EXPIRY_LIMIT_SECS + 1) as u32
        );
    }
}
