/*
    store.rs - Store capabilities shared by every backend

    Per-entity stores expose Get / Fetch / Filter / Add / Update / Upsert /
    Delete (environment metadata: Get / Set). An aggregate DataStore bundles
    the four, and a TransactionalDataStore can run a closure atomically.

    Callers depend on these traits only; the memory and catalog backends are
    chosen at construction time.
*/

use super::context::Context;
use super::errors::StoreResult;
use super::filter::{apply_filters, FilterFunc};
use super::model::{
    AddressRef, AddressRefKey, ChainMetadata, ContractMetadata, EnvMetadata, Metadata,
    MetadataRecord,
};
use super::updater::{MetadataUpdater, ReplaceUpdater};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Options for single-record reads
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Read the last committed state, bypassing any open transaction
    pub ignore_transaction: bool,
}

impl GetOptions {
    pub fn ignore_transaction() -> Self {
        GetOptions {
            ignore_transaction: true,
        }
    }
}

/// Options for metadata writes
#[derive(Clone, Default)]
pub struct UpdateOptions {
    /// Merge strategy; `None` replaces the stored metadata
    pub updater: Option<Arc<dyn MetadataUpdater>>,
}

impl UpdateOptions {
    pub fn with_updater(updater: impl MetadataUpdater + 'static) -> Self {
        UpdateOptions {
            updater: Some(Arc::new(updater)),
        }
    }

    /// Merge `incoming` into `latest` with the configured updater
    pub fn apply(&self, latest: Metadata, incoming: Metadata) -> StoreResult<Metadata> {
        match &self.updater {
            Some(updater) => updater.update(latest, incoming),
            None => ReplaceUpdater.update(latest, incoming),
        }
    }
}

impl fmt::Debug for UpdateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateOptions")
            .field("updater", &self.updater.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Address reference store
#[async_trait]
pub trait AddressRefStore: Send + Sync {
    async fn get(
        &self,
        ctx: &Context,
        key: &AddressRefKey,
        opts: GetOptions,
    ) -> StoreResult<AddressRef>;

    /// All records; empty when nothing is stored
    async fn fetch(&self, ctx: &Context) -> StoreResult<Vec<AddressRef>>;

    async fn filter(
        &self,
        ctx: &Context,
        filters: &[FilterFunc<AddressRef>],
    ) -> StoreResult<Vec<AddressRef>> {
        Ok(apply_filters(self.fetch(ctx).await?, filters))
    }

    /// Insert; fails with AddressRefExists if the key is taken
    async fn add(&self, ctx: &Context, record: AddressRef) -> StoreResult<()>;

    /// Insert or replace the record under its key
    async fn upsert(&self, ctx: &Context, record: AddressRef) -> StoreResult<()>;

    /// Replace; fails with AddressRefNotFound if the key is absent
    async fn update(&self, ctx: &Context, record: AddressRef) -> StoreResult<()>;

    async fn delete(&self, ctx: &Context, key: &AddressRefKey) -> StoreResult<()>;
}

/// Store for a keyed metadata record kind
#[async_trait]
pub trait MetadataStore<R: MetadataRecord>: Send + Sync {
    async fn get(&self, ctx: &Context, key: &R::Key, opts: GetOptions) -> StoreResult<R>;

    async fn fetch(&self, ctx: &Context) -> StoreResult<Vec<R>>;

    async fn filter(&self, ctx: &Context, filters: &[FilterFunc<R>]) -> StoreResult<Vec<R>> {
        Ok(apply_filters(self.fetch(ctx).await?, filters))
    }

    async fn add(&self, ctx: &Context, record: R) -> StoreResult<()>;

    /// Merge into an existing record, or store `metadata` as-is when absent
    async fn upsert(
        &self,
        ctx: &Context,
        key: &R::Key,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()>;

    /// Merge into an existing record; fails with not-found when absent
    async fn update(
        &self,
        ctx: &Context,
        key: &R::Key,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()>;

    async fn delete(&self, ctx: &Context, key: &R::Key) -> StoreResult<()>;
}

pub type ChainMetadataStore = dyn MetadataStore<ChainMetadata>;
pub type ContractMetadataStore = dyn MetadataStore<ContractMetadata>;

/// Singleton environment metadata store
#[async_trait]
pub trait EnvMetadataStore: Send + Sync {
    /// Fails with EnvMetadataNotSet until the first `set`
    async fn get(&self, ctx: &Context, opts: GetOptions) -> StoreResult<EnvMetadata>;

    async fn set(&self, ctx: &Context, metadata: Metadata, opts: UpdateOptions)
        -> StoreResult<()>;
}

/// The four per-entity stores behind one handle
pub trait DataStore: Send + Sync {
    fn addresses(&self) -> &dyn AddressRefStore;

    fn chain_metadata(&self) -> &ChainMetadataStore;

    fn contract_metadata(&self) -> &ContractMetadataStore;

    fn env_metadata(&self) -> &dyn EnvMetadataStore;
}

/// A data store that can run a unit of work atomically
#[async_trait]
pub trait TransactionalDataStore: DataStore + Clone + Sized + 'static {
    /// Run `f` against a transaction-scoped handle
    ///
    /// Commits when `f` returns Ok. Rolls back when `f` fails, when `ctx`
    /// is cancelled, or when `f` panics (the panic then resumes).
    async fn with_transaction<F, Fut, T>(&self, ctx: &Context, f: F) -> StoreResult<T>
    where
        F: FnOnce(Self) -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send;
}
