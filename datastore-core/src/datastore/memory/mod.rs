/*
    memory - Local in-memory data store

    A private scratch store owned by one caller, typically the output of a
    single deployment operation before it is merged into the catalog.
    Mutations are visible to the next read immediately. Nothing persists
    past the process lifetime; use an archive to keep a copy on disk.
*/

mod env;
mod table;

pub use env::MemoryEnvMetadataStore;
pub use table::{MemoryAddressRefStore, MemoryMetadataStore};
pub(crate) use table::WriteMode;

use super::archive::DataStoreArchive;
use super::context::Context;
use super::errors::StoreResult;
use super::model::{ChainMetadata, ContractMetadata, EnvMetadata};
use super::store::{
    AddressRefStore, ChainMetadataStore, ContractMetadataStore, DataStore, EnvMetadataStore,
    TransactionalDataStore,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

pub type MemoryChainMetadataStore = MemoryMetadataStore<ChainMetadata>;
pub type MemoryContractMetadataStore = MemoryMetadataStore<ContractMetadata>;

#[derive(Default)]
struct MemoryState {
    addresses: MemoryAddressRefStore,
    chain_metadata: MemoryChainMetadataStore,
    contract_metadata: MemoryContractMetadataStore,
    env_metadata: MemoryEnvMetadataStore,
}

/// In-memory aggregate of the four per-entity stores
///
/// Clones share the same underlying records.
#[derive(Clone, Default)]
pub struct MemoryDataStore {
    state: Arc<MemoryState>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated from an archive
    pub fn from_archive(archive: DataStoreArchive) -> StoreResult<Self> {
        let store = Self::new();
        let state = &store.state;
        for record in archive.address_refs {
            state.addresses.table().insert_new(record)?;
        }
        for record in archive.chain_metadata {
            state.chain_metadata.table().insert_new(record)?;
        }
        for record in archive.contract_metadata {
            state.contract_metadata.table().insert_new(record)?;
        }
        if let Some(EnvMetadata { metadata }) = archive.env_metadata {
            state.env_metadata.replace(metadata)?;
        }
        Ok(store)
    }
}

impl DataStore for MemoryDataStore {
    fn addresses(&self) -> &dyn AddressRefStore {
        &self.state.addresses
    }

    fn chain_metadata(&self) -> &ChainMetadataStore {
        &self.state.chain_metadata
    }

    fn contract_metadata(&self) -> &ContractMetadataStore {
        &self.state.contract_metadata
    }

    fn env_metadata(&self) -> &dyn EnvMetadataStore {
        &self.state.env_metadata
    }
}

#[async_trait]
impl TransactionalDataStore for MemoryDataStore {
    /// No isolation: `f` operates on the live store and its writes stay
    /// even when it fails
    async fn with_transaction<F, Fut, T>(&self, ctx: &Context, f: F) -> StoreResult<T>
    where
        F: FnOnce(Self) -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        ctx.run(f(self.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::model::{AddressRef, Record};
    use crate::datastore::store::{GetOptions, UpdateOptions};
    use semver::Version;
    use serde_json::json;

    #[tokio::test]
    async fn test_clones_share_state() {
        let ctx = Context::background();
        let store = MemoryDataStore::new();
        let other = store.clone();

        let record = AddressRef::new("0x1", 1, "Router", Version::new(1, 0, 0));
        store.addresses().add(&ctx, record.clone()).await.unwrap();

        let found = other
            .addresses()
            .get(&ctx, &record.key(), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(found, record);
    }

    #[tokio::test]
    async fn test_transaction_is_passthrough() {
        let ctx = Context::background();
        let store = MemoryDataStore::new();

        let result: StoreResult<()> = store
            .with_transaction(&ctx, |tx| async move {
                tx.env_metadata()
                    .set(&Context::background(), Some(json!(1)), UpdateOptions::default())
                    .await?;
                Err(crate::datastore::errors::StoreError::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());

        // No rollback in the local backend
        let env = store
            .env_metadata()
            .get(&ctx, GetOptions::default())
            .await
            .unwrap();
        assert_eq!(env.metadata, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_from_archive_rejects_duplicate_keys() {
        let record = AddressRef::new("0x1", 1, "Router", Version::new(1, 0, 0));
        let archive = DataStoreArchive {
            address_refs: vec![record.clone(), record],
            ..Default::default()
        };
        let err = MemoryDataStore::from_archive(archive).err().unwrap();
        assert!(err.is_already_exists());
    }
}
