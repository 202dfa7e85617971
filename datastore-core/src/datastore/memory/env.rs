/*
    env.rs - In-memory environment metadata
*/

use crate::datastore::context::Context;
use crate::datastore::errors::{handle_poison, StoreError, StoreResult};
use crate::datastore::model::{EnvMetadata, Metadata};
use crate::datastore::store::{EnvMetadataStore, GetOptions, UpdateOptions};
use crate::metrics::{record_counter, STORE_READS, STORE_WRITES};
use async_trait::async_trait;
use std::sync::RwLock;

/// Holds zero or one environment metadata record
#[derive(Default)]
pub struct MemoryEnvMetadataStore {
    record: RwLock<Option<EnvMetadata>>,
}

impl MemoryEnvMetadataStore {
    pub(crate) fn replace(&self, metadata: Metadata) -> StoreResult<()> {
        *self.record.write().map_err(handle_poison)? = Some(EnvMetadata::new(metadata));
        Ok(())
    }
}

#[async_trait]
impl EnvMetadataStore for MemoryEnvMetadataStore {
    async fn get(&self, ctx: &Context, _opts: GetOptions) -> StoreResult<EnvMetadata> {
        ctx.check()?;
        record_counter(STORE_READS, 1);
        self.record
            .read()
            .map_err(handle_poison)?
            .clone()
            .ok_or(StoreError::EnvMetadataNotSet)
    }

    async fn set(
        &self,
        ctx: &Context,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()> {
        ctx.check()?;
        let mut record = self.record.write().map_err(handle_poison)?;
        let merged = match record.as_ref() {
            Some(existing) => opts.apply(existing.metadata.clone(), metadata)?,
            None => metadata,
        };
        *record = Some(EnvMetadata::new(merged));
        record_counter(STORE_WRITES, 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_failed_updater_keeps_existing() {
        let ctx = Context::background();
        let store = MemoryEnvMetadataStore::default();
        store
            .set(&ctx, Some(json!({"env": "prod"})), UpdateOptions::default())
            .await
            .unwrap();

        let failing = |_: Metadata, _: Metadata| -> StoreResult<Metadata> {
            Err(StoreError::InvalidArgument("rejected".into()))
        };
        assert!(store
            .set(&ctx, Some(json!(1)), UpdateOptions::with_updater(failing))
            .await
            .is_err());

        let current = store.get(&ctx, GetOptions::default()).await.unwrap();
        assert_eq!(current.metadata, Some(json!({"env": "prod"})));
    }
}
