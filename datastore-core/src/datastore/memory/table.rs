/*
    table.rs - Keyed in-memory tables

    A MemoryTable holds at most one record per key. The per-entity memory
    stores are thin async wrappers over it; every call takes the lock once,
    so each operation is atomic with respect to other callers.
*/

use crate::datastore::context::Context;
use crate::datastore::errors::{handle_poison, StoreResult};
use crate::datastore::model::{AddressRef, AddressRefKey, Metadata, MetadataRecord, Record};
use crate::datastore::store::{AddressRefStore, GetOptions, MetadataStore, UpdateOptions};
use crate::metrics::{record_counter, STORE_DELETES, STORE_READS, STORE_WRITES};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

/// Whether a metadata write may create a missing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    MustExist,
    CreateIfMissing,
}

pub(crate) struct MemoryTable<R: Record> {
    records: RwLock<BTreeMap<R::Key, R>>,
}

impl<R: Record> Default for MemoryTable<R> {
    fn default() -> Self {
        MemoryTable {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<R: Record> MemoryTable<R> {
    pub(crate) fn get(&self, key: &R::Key) -> StoreResult<R> {
        record_counter(STORE_READS, 1);
        self.records
            .read()
            .map_err(handle_poison)?
            .get(key)
            .cloned()
            .ok_or_else(|| R::KIND.not_found(key))
    }

    pub(crate) fn fetch(&self) -> StoreResult<Vec<R>> {
        record_counter(STORE_READS, 1);
        Ok(self
            .records
            .read()
            .map_err(handle_poison)?
            .values()
            .cloned()
            .collect())
    }

    pub(crate) fn insert_new(&self, record: R) -> StoreResult<()> {
        let key = record.key();
        let mut records = self.records.write().map_err(handle_poison)?;
        if records.contains_key(&key) {
            return Err(R::KIND.already_exists(&key));
        }
        debug!(kind = ?R::KIND, %key, "Adding record");
        records.insert(key, record);
        record_counter(STORE_WRITES, 1);
        Ok(())
    }

    pub(crate) fn replace_existing(&self, record: R) -> StoreResult<()> {
        let key = record.key();
        let mut records = self.records.write().map_err(handle_poison)?;
        match records.get_mut(&key) {
            Some(slot) => {
                *slot = record;
                record_counter(STORE_WRITES, 1);
                Ok(())
            }
            None => Err(R::KIND.not_found(&key)),
        }
    }

    pub(crate) fn put(&self, record: R) -> StoreResult<()> {
        let key = record.key();
        self.records
            .write()
            .map_err(handle_poison)?
            .insert(key, record);
        record_counter(STORE_WRITES, 1);
        Ok(())
    }

    pub(crate) fn remove(&self, key: &R::Key) -> StoreResult<()> {
        let removed = self.records.write().map_err(handle_poison)?.remove(key);
        match removed {
            Some(_) => {
                debug!(kind = ?R::KIND, %key, "Deleted record");
                record_counter(STORE_DELETES, 1);
                Ok(())
            }
            None => Err(R::KIND.not_found(key)),
        }
    }
}

impl<R: MetadataRecord> MemoryTable<R> {
    /// Merge `incoming` into the stored metadata under one write lock
    pub(crate) fn write_metadata(
        &self,
        key: &R::Key,
        incoming: Metadata,
        opts: &UpdateOptions,
        mode: WriteMode,
    ) -> StoreResult<()> {
        let mut records = self.records.write().map_err(handle_poison)?;
        let merged = match records.get(key) {
            Some(existing) => opts.apply(existing.metadata().clone(), incoming)?,
            None if mode == WriteMode::MustExist => return Err(R::KIND.not_found(key)),
            None => incoming,
        };
        records.insert(key.clone(), R::from_parts(key.clone(), merged));
        record_counter(STORE_WRITES, 1);
        Ok(())
    }
}

/// In-memory address reference store
#[derive(Default)]
pub struct MemoryAddressRefStore {
    table: MemoryTable<AddressRef>,
}

impl MemoryAddressRefStore {
    pub(crate) fn table(&self) -> &MemoryTable<AddressRef> {
        &self.table
    }
}

#[async_trait]
impl AddressRefStore for MemoryAddressRefStore {
    async fn get(
        &self,
        ctx: &Context,
        key: &AddressRefKey,
        _opts: GetOptions,
    ) -> StoreResult<AddressRef> {
        ctx.check()?;
        self.table.get(key)
    }

    async fn fetch(&self, ctx: &Context) -> StoreResult<Vec<AddressRef>> {
        ctx.check()?;
        self.table.fetch()
    }

    async fn add(&self, ctx: &Context, record: AddressRef) -> StoreResult<()> {
        ctx.check()?;
        self.table.insert_new(record)
    }

    async fn upsert(&self, ctx: &Context, record: AddressRef) -> StoreResult<()> {
        ctx.check()?;
        self.table.put(record)
    }

    async fn update(&self, ctx: &Context, record: AddressRef) -> StoreResult<()> {
        ctx.check()?;
        self.table.replace_existing(record)
    }

    async fn delete(&self, ctx: &Context, key: &AddressRefKey) -> StoreResult<()> {
        ctx.check()?;
        self.table.remove(key)
    }
}

/// In-memory store for chain or contract metadata
pub struct MemoryMetadataStore<R: MetadataRecord> {
    table: MemoryTable<R>,
}

impl<R: MetadataRecord> Default for MemoryMetadataStore<R> {
    fn default() -> Self {
        MemoryMetadataStore {
            table: MemoryTable::default(),
        }
    }
}

impl<R: MetadataRecord> MemoryMetadataStore<R> {
    pub(crate) fn table(&self) -> &MemoryTable<R> {
        &self.table
    }
}

#[async_trait]
impl<R: MetadataRecord> MetadataStore<R> for MemoryMetadataStore<R> {
    async fn get(&self, ctx: &Context, key: &R::Key, _opts: GetOptions) -> StoreResult<R> {
        ctx.check()?;
        self.table.get(key)
    }

    async fn fetch(&self, ctx: &Context) -> StoreResult<Vec<R>> {
        ctx.check()?;
        self.table.fetch()
    }

    async fn add(&self, ctx: &Context, record: R) -> StoreResult<()> {
        ctx.check()?;
        self.table.insert_new(record)
    }

    async fn upsert(
        &self,
        ctx: &Context,
        key: &R::Key,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()> {
        ctx.check()?;
        self.table
            .write_metadata(key, metadata, &opts, WriteMode::CreateIfMissing)
    }

    async fn update(
        &self,
        ctx: &Context,
        key: &R::Key,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()> {
        ctx.check()?;
        self.table
            .write_metadata(key, metadata, &opts, WriteMode::MustExist)
    }

    async fn delete(&self, ctx: &Context, key: &R::Key) -> StoreResult<()> {
        ctx.check()?;
        self.table.remove(key)
    }
}
