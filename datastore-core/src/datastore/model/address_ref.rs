/*
    address_ref.rs - Address references

    An address reference identifies one deployed contract/program instance on
    one chain. It is keyed by (chain selector, contract type, version,
    qualifier); the same (chain, type, version) may be deployed several times
    under different qualifiers.
*/

use super::labels::LabelSet;
use crate::datastore::errors::EntityKind;
use super::Record;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A deployed contract instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRef {
    pub address: String,
    pub chain_selector: u64,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub version: Version,
    #[serde(default)]
    pub qualifier: String,
    #[serde(default)]
    pub labels: LabelSet,
}

impl AddressRef {
    pub fn new(
        address: impl Into<String>,
        chain_selector: u64,
        contract_type: impl Into<String>,
        version: Version,
    ) -> Self {
        AddressRef {
            address: address.into(),
            chain_selector,
            contract_type: contract_type.into(),
            version,
            qualifier: String::new(),
            labels: LabelSet::new(),
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }
}

impl Record for AddressRef {
    type Key = AddressRefKey;

    const KIND: EntityKind = EntityKind::AddressRef;

    fn key(&self) -> AddressRefKey {
        AddressRefKey {
            chain_selector: self.chain_selector,
            contract_type: self.contract_type.clone(),
            version: self.version.clone(),
            qualifier: self.qualifier.clone(),
        }
    }
}

/// Composite key of an address reference
///
/// The version participates through its canonical semver rendering, so two
/// keys are equal exactly when their rendered versions are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRefKey {
    pub chain_selector: u64,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub version: Version,
    #[serde(default)]
    pub qualifier: String,
}

impl AddressRefKey {
    pub fn new(
        chain_selector: u64,
        contract_type: impl Into<String>,
        version: Version,
        qualifier: impl Into<String>,
    ) -> Self {
        AddressRefKey {
            chain_selector,
            contract_type: contract_type.into(),
            version,
            qualifier: qualifier.into(),
        }
    }
}

impl fmt::Display for AddressRefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.chain_selector, self.contract_type, self.version, self.qualifier
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation() {
        let record = AddressRef::new("0xabc", 3, "TestContract", Version::new(3, 0, 0))
            .with_qualifier("new");
        let key = record.key();

        assert_eq!(
            key,
            AddressRefKey::new(3, "TestContract", Version::new(3, 0, 0), "new")
        );
        assert_eq!(key.to_string(), "3-TestContract-3.0.0-new");
    }

    #[test]
    fn test_qualifier_distinguishes_keys() {
        let a = AddressRef::new("0x1", 1, "Router", Version::new(1, 0, 0)).with_qualifier("a");
        let b = AddressRef::new("0x2", 1, "Router", Version::new(1, 0, 0)).with_qualifier("b");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_prerelease_is_part_of_key() {
        let release = AddressRefKey::new(1, "Router", Version::parse("1.2.0").unwrap(), "");
        let pre = AddressRefKey::new(1, "Router", Version::parse("1.2.0-rc.1").unwrap(), "");
        assert_ne!(release, pre);
    }

    #[test]
    fn test_json_shape() {
        let record = AddressRef::new("0xabc", 3, "TestContract", Version::new(3, 0, 0))
            .with_labels(LabelSet::from(vec!["x"]));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["address"], "0xabc");
        assert_eq!(json["chainSelector"], 3);
        assert_eq!(json["type"], "TestContract");
        assert_eq!(json["version"], "3.0.0");
        assert_eq!(json["qualifier"], "");
        assert_eq!(json["labels"], serde_json::json!(["x"]));
    }

    #[test]
    fn test_large_chain_selector_round_trips() {
        let record = AddressRef::new("0x1", u64::MAX, "Token", Version::new(1, 0, 0));
        let json = serde_json::to_string(&record).unwrap();
        let back: AddressRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chain_selector, u64::MAX);
    }
}
