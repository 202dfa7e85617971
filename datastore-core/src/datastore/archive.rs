/*
    archive.rs - JSON snapshots of a data store

    An archive holds every record of every kind, in key order, so that a
    local store can be written to disk after a deployment step and loaded
    again (or merged into the catalog) later.

    File writes go to a sibling temp file first and are renamed into place,
    so a crash never leaves a truncated archive behind.
*/

use super::context::Context;
use super::errors::{ResultExt, StoreError, StoreResult};
use super::model::{AddressRef, ChainMetadata, ContractMetadata, EnvMetadata, Record};
use super::store::{DataStore, GetOptions, UpdateOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreArchive {
    #[serde(default)]
    pub address_refs: Vec<AddressRef>,
    #[serde(default)]
    pub chain_metadata: Vec<ChainMetadata>,
    #[serde(default)]
    pub contract_metadata: Vec<ContractMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_metadata: Option<EnvMetadata>,
}

impl DataStoreArchive {
    /// Snapshot every record in `store`
    pub async fn capture<S>(ctx: &Context, store: &S) -> StoreResult<Self>
    where
        S: DataStore + ?Sized,
    {
        let mut address_refs = store.addresses().fetch(ctx).await.context("capture address references")?;
        let mut chain_metadata = store
            .chain_metadata()
            .fetch(ctx)
            .await
            .context("capture chain metadata")?;
        let mut contract_metadata = store
            .contract_metadata()
            .fetch(ctx)
            .await
            .context("capture contract metadata")?;
        let env_metadata = match store.env_metadata().get(ctx, GetOptions::default()).await {
            Ok(env) => Some(env),
            Err(e) if e.is_env_metadata_not_set() => None,
            Err(e) => return Err(e.context("capture environment metadata")),
        };

        address_refs.sort_by_key(Record::key);
        chain_metadata.sort_by_key(Record::key);
        contract_metadata.sort_by_key(Record::key);

        Ok(DataStoreArchive {
            address_refs,
            chain_metadata,
            contract_metadata,
            env_metadata,
        })
    }

    /// Upsert every archived record into `store`
    ///
    /// Not atomic on its own; wrap in a transaction when the target offers one.
    pub async fn restore_into<S>(&self, ctx: &Context, store: &S) -> StoreResult<()>
    where
        S: DataStore + ?Sized,
    {
        for record in &self.address_refs {
            store.addresses().upsert(ctx, record.clone()).await?;
        }
        for record in &self.chain_metadata {
            store
                .chain_metadata()
                .upsert(ctx, &record.key(), record.metadata.clone(), UpdateOptions::default())
                .await?;
        }
        for record in &self.contract_metadata {
            store
                .contract_metadata()
                .upsert(ctx, &record.key(), record.metadata.clone(), UpdateOptions::default())
                .await?;
        }
        if let Some(env) = &self.env_metadata {
            store
                .env_metadata()
                .set(ctx, env.metadata.clone(), UpdateOptions::default())
                .await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.address_refs.len()
            + self.chain_metadata.len()
            + self.contract_metadata.len()
            + self.env_metadata.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> StoreResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| StoreError::Serialization(format!("invalid archive: {}", e)))
    }

    /// Write atomically via a temp file in the same directory
    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rename {} into place", tmp.display()))?;

        info!(path = %path.display(), records = self.len(), "Wrote data store archive");
        Ok(())
    }

    pub async fn read_from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let archive = Self::from_json(&text)?;
        debug!(path = %path.display(), records = archive.len(), "Read data store archive");
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDataStore;
    use semver::Version;
    use serde_json::json;
    use tempfile::TempDir;

    async fn populated() -> MemoryDataStore {
        let ctx = Context::background();
        let store = MemoryDataStore::new();
        store
            .addresses()
            .add(&ctx, AddressRef::new("0x2", 2, "Router", Version::new(1, 0, 0)))
            .await
            .unwrap();
        store
            .addresses()
            .add(&ctx, AddressRef::new("0x1", 1, "Router", Version::new(1, 0, 0)))
            .await
            .unwrap();
        store
            .contract_metadata()
            .add(&ctx, ContractMetadata::new(1, "0x1", None))
            .await
            .unwrap();
        store
            .env_metadata()
            .set(&ctx, Some(json!({"env": "staging"})), UpdateOptions::default())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_capture_is_key_ordered() {
        let ctx = Context::background();
        let archive = DataStoreArchive::capture(&ctx, &populated().await).await.unwrap();
        assert_eq!(archive.len(), 4);
        assert_eq!(archive.address_refs[0].chain_selector, 1);
        assert_eq!(archive.address_refs[1].chain_selector, 2);
    }

    #[tokio::test]
    async fn test_file_round_trip_restores_store() {
        let ctx = Context::background();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");

        let archive = DataStoreArchive::capture(&ctx, &populated().await).await.unwrap();
        archive.write_to_file(&path).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = DataStoreArchive::read_from_file(&path).await.unwrap();
        assert_eq!(loaded, archive);

        let restored = MemoryDataStore::new();
        loaded.restore_into(&ctx, &restored).await.unwrap();
        let again = DataStoreArchive::capture(&ctx, &restored).await.unwrap();
        assert_eq!(again, archive);
    }

    #[tokio::test]
    async fn test_missing_file_names_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");

        let err = DataStoreArchive::read_from_file(&path).await.unwrap_err();
        assert!(matches!(err.root(), StoreError::Storage(_)));
        assert!(err.to_string().starts_with(&format!("read {}", path.display())));
    }

    #[tokio::test]
    async fn test_write_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent").join("snapshot.json");

        let err = DataStoreArchive::default().write_to_file(&path).await.unwrap_err();
        assert!(err.to_string().starts_with("write "));
    }

    #[test]
    fn test_absent_sections_default_to_empty() {
        let archive = DataStoreArchive::from_json(r#"{"addressRefs": []}"#).unwrap();
        assert!(archive.is_empty());
        assert!(DataStoreArchive::from_json("[1, 2]").is_err());
    }
}
