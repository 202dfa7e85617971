/*
    metadata.rs - Metadata-bearing records

    Chain metadata is keyed by chain selector, contract metadata by
    (chain selector, address), and environment metadata is a singleton.
    The metadata payload itself is opaque JSON chosen by the caller.
*/

use crate::datastore::errors::EntityKind;
use super::{deserialize_present, Metadata, MetadataRecord, Record};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata attached to one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMetadata {
    pub chain_selector: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub metadata: Metadata,
}

impl ChainMetadata {
    pub fn new(chain_selector: u64, metadata: Metadata) -> Self {
        ChainMetadata {
            chain_selector,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMetadataKey {
    pub chain_selector: u64,
}

impl ChainMetadataKey {
    pub fn new(chain_selector: u64) -> Self {
        ChainMetadataKey { chain_selector }
    }
}

impl fmt::Display for ChainMetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain_selector)
    }
}

impl Record for ChainMetadata {
    type Key = ChainMetadataKey;

    const KIND: EntityKind = EntityKind::ChainMetadata;

    fn key(&self) -> ChainMetadataKey {
        ChainMetadataKey::new(self.chain_selector)
    }
}

impl MetadataRecord for ChainMetadata {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn from_parts(key: ChainMetadataKey, metadata: Metadata) -> Self {
        ChainMetadata::new(key.chain_selector, metadata)
    }
}

/// Metadata attached to one deployed contract instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractMetadata {
    pub chain_selector: u64,
    pub address: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub metadata: Metadata,
}

impl ContractMetadata {
    pub fn new(chain_selector: u64, address: impl Into<String>, metadata: Metadata) -> Self {
        ContractMetadata {
            chain_selector,
            address: address.into(),
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractMetadataKey {
    pub chain_selector: u64,
    pub address: String,
}

impl ContractMetadataKey {
    pub fn new(chain_selector: u64, address: impl Into<String>) -> Self {
        ContractMetadataKey {
            chain_selector,
            address: address.into(),
        }
    }
}

impl fmt::Display for ContractMetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.chain_selector, self.address)
    }
}

impl Record for ContractMetadata {
    type Key = ContractMetadataKey;

    const KIND: EntityKind = EntityKind::ContractMetadata;

    fn key(&self) -> ContractMetadataKey {
        ContractMetadataKey::new(self.chain_selector, self.address.clone())
    }
}

impl MetadataRecord for ContractMetadata {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn from_parts(key: ContractMetadataKey, metadata: Metadata) -> Self {
        ContractMetadata::new(key.chain_selector, key.address, metadata)
    }
}

/// The environment's singleton metadata record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvMetadata {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub metadata: Metadata,
}

impl EnvMetadata {
    pub fn new(metadata: Metadata) -> Self {
        EnvMetadata { metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_metadata_is_omitted() {
        let record = ChainMetadata::new(1, None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, json!({ "chainSelector": 1 }));

        let back: ChainMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.metadata, None);
    }

    #[test]
    fn test_explicit_null_is_preserved() {
        let back: ContractMetadata =
            serde_json::from_str(r#"{"chainSelector":1,"address":"0x1","metadata":null}"#)
                .unwrap();
        assert_eq!(back.metadata, Some(serde_json::Value::Null));

        let json = serde_json::to_string(&back).unwrap();
        assert!(json.contains("\"metadata\":null"));
    }

    #[test]
    fn test_integer_metadata_stays_integer() {
        let record = EnvMetadata::new(Some(json!({ "decimals": 6, "ratio": 1.5 })));
        let text = serde_json::to_string(&record).unwrap();
        let back: EnvMetadata = serde_json::from_str(&text).unwrap();

        let metadata = back.metadata.unwrap();
        assert!(metadata["decimals"].is_u64());
        assert!(metadata["ratio"].is_f64());
    }

    #[test]
    fn test_contract_key_from_parts() {
        let key = ContractMetadataKey::new(5, "0xdead");
        let record = ContractMetadata::from_parts(key.clone(), Some(json!([1, 2])));
        assert_eq!(record.key(), key);
        assert_eq!(record.metadata(), &Some(json!([1, 2])));
    }
}
