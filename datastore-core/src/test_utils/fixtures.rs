//! Test fixtures for creating common test records
//!
//! Builders default every field to something valid so tests only spell
//! out what they care about.

use crate::datastore::context::Context;
use crate::datastore::errors::StoreResult;
use crate::datastore::model::{AddressRef, ChainMetadata, ContractMetadata, LabelSet};
use crate::datastore::store::{DataStore, UpdateOptions};
use semver::Version;
use serde_json::json;

/// Builder for address references
pub struct TestAddressRefBuilder {
    address: String,
    chain_selector: u64,
    contract_type: String,
    version: Version,
    qualifier: String,
    labels: Vec<String>,
}

impl TestAddressRefBuilder {
    pub fn new(chain_selector: u64) -> Self {
        Self {
            address: format!("0x{:040x}", chain_selector),
            chain_selector,
            contract_type: "TestContract".to_string(),
            version: Version::new(1, 0, 0),
            qualifier: String::new(),
            labels: Vec::new(),
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = contract_type.into();
        self
    }

    pub fn version(mut self, major: u64, minor: u64, patch: u64) -> Self {
        self.version = Version::new(major, minor, patch);
        self
    }

    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn build(self) -> AddressRef {
        AddressRef::new(self.address, self.chain_selector, self.contract_type, self.version)
            .with_qualifier(self.qualifier)
            .with_labels(LabelSet::from(self.labels))
    }
}

/// Chain metadata carrying a recognizable name
pub fn test_chain_metadata(chain_selector: u64) -> ChainMetadata {
    ChainMetadata::new(
        chain_selector,
        Some(json!({"name": format!("chain-{}", chain_selector)})),
    )
}

/// Contract metadata for the address a default builder would produce
pub fn test_contract_metadata(chain_selector: u64) -> ContractMetadata {
    ContractMetadata::new(
        chain_selector,
        format!("0x{:040x}", chain_selector),
        Some(json!({"deployer": "test"})),
    )
}

/// Fill `store` with `chains` chains' worth of records of every kind
pub async fn populate<S>(ctx: &Context, store: &S, chains: u64) -> StoreResult<()>
where
    S: DataStore + ?Sized,
{
    for chain in 1..=chains {
        store
            .addresses()
            .add(ctx, TestAddressRefBuilder::new(chain).build())
            .await?;
        store.chain_metadata().add(ctx, test_chain_metadata(chain)).await?;
        store
            .contract_metadata()
            .add(ctx, test_contract_metadata(chain))
            .await?;
    }
    store
        .env_metadata()
        .set(ctx, Some(json!({"chains": chains})), UpdateOptions::default())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDataStore;
    use crate::datastore::model::Record;

    #[test]
    fn test_builder_defaults() {
        let record = TestAddressRefBuilder::new(7).qualifier("blue").label("x").build();
        assert_eq!(record.key().to_string(), "7-TestContract-1.0.0-blue");
        assert_eq!(record.address.len(), 42);
        assert!(record.labels.contains("x"));
    }

    #[tokio::test]
    async fn test_populate() {
        let ctx = Context::background();
        let store = MemoryDataStore::new();
        populate(&ctx, &store, 3).await.unwrap();
        assert_eq!(store.addresses().fetch(&ctx).await.unwrap().len(), 3);
        assert_eq!(store.contract_metadata().fetch(&ctx).await.unwrap().len(), 3);
    }
}
