//! Collection manifest: maps `scope.collection` names to collection ids.

use std::collections::HashMap;

use serde::Deserialize;

use ember_core::{CollectionName, EmberError, Result};

#[derive(Debug, Deserialize)]
struct RawManifest {
    uid: String,
    scopes: Vec<RawScope>,
}

#[derive(Debug, Deserialize)]
struct RawScope {
    name: String,
    collections: Vec<RawCollection>,
}

#[derive(Debug, Deserialize)]
struct RawCollection {
    name: String,
    uid: String,
}

fn parse_hex(value: &str, what: &str) -> Result<u64> {
    u64::from_str_radix(value, 16)
        .map_err(|_| EmberError::Protocol(format!("invalid {} uid '{}'", what, value)))
}

/// Collection ids known to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionManifest {
    uid: u64,
    ids: HashMap<CollectionName, u32>,
}

impl CollectionManifest {
    /// A manifest holding only `_default._default` with id 0.
    ///
    /// Used when the cluster does not support collections.
    pub fn default_only() -> Self {
        let mut ids = HashMap::new();
        ids.insert(CollectionName::default(), 0);
        Self { uid: 0, ids }
    }

    /// Parses the JSON manifest returned by `GetCollectionsManifest`.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(json)
            .map_err(|e| EmberError::Protocol(format!("invalid collections manifest: {}", e)))?;

        let uid = parse_hex(&raw.uid, "manifest")?;
        let mut ids = HashMap::new();
        for scope in raw.scopes {
            for collection in scope.collections {
                let id = u32::try_from(parse_hex(&collection.uid, "collection")?)
                    .map_err(|_| EmberError::Protocol("collection uid overflows u32".to_string()))?;
                ids.insert(CollectionName::new(&scope.name, collection.name), id);
            }
        }
        Ok(Self { uid, ids })
    }

    /// Manifest revision.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Id of `name`, if the manifest contains it.
    pub fn collection_id(&self, name: &CollectionName) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Number of collections in the manifest.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let json = br#"{
            "uid": "1a",
            "scopes": [
                {"name": "_default", "uid": "0", "collections": [{"name": "_default", "uid": "0"}]},
                {"name": "inventory", "uid": "8", "collections": [
                    {"name": "hotels", "uid": "9"},
                    {"name": "airlines", "uid": "a"}
                ]}
            ]
        }"#;
        let manifest = CollectionManifest::parse(json).unwrap();
        assert_eq!(manifest.uid(), 0x1a);
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.collection_id(&CollectionName::default()), Some(0));
        assert_eq!(
            manifest.collection_id(&CollectionName::new("inventory", "airlines")),
            Some(10)
        );
        assert_eq!(
            manifest.collection_id(&CollectionName::new("inventory", "routes")),
            None
        );
    }

    #[test]
    fn test_bad_uid() {
        let json = br#"{"uid": "zz", "scopes": []}"#;
        assert!(CollectionManifest::parse(json).is_err());
    }

    #[test]
    fn test_default_only() {
        let manifest = CollectionManifest::default_only();
        assert_eq!(manifest.collection_id(&CollectionName::default()), Some(0));
        assert!(!manifest.is_empty());
    }
}
