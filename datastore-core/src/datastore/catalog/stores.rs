/*
    stores.rs - Per-entity stores over a catalog client

    Metadata writes are read-merge-write with optimistic concurrency:

    1. Read the current row and its row version
    2. Merge the incoming metadata into it with the caller's updater
    3. Write the merged record, stating the row version observed in (1)

    If another writer got there first the service answers with a version
    conflict and the cycle restarts from (1), up to the session's retry
    limit. Once retries run out the caller sees StoreError::Conflict.

    The retry loop is a trade-off. Callers never see a lost race as long
    as every racing writer could finish within the limit: each conflict
    means some other writer succeeded, so N concurrent writers need at
    most N - 1 retries. The default covers ordinary contention and
    sequential handles always get last-write-wins. A Conflict means the
    key is contended past `max_conflict_retries`, which is configurable,
    and is surfaced rather than retried forever.

    Deletes are not offered by the catalog and fail locally without a
    round trip.
*/

use super::client::CatalogClient;
use super::protocol::{CatalogOp, CatalogReply, EditSemantics, TransactionId, Versioned};
use crate::datastore::context::Context;
use crate::datastore::errors::{handle_poison, EntityKind, StoreError, StoreResult};
use crate::datastore::memory::WriteMode;
use crate::datastore::model::{
    AddressRef, AddressRefKey, ChainMetadata, ContractMetadata, EnvMetadata, Metadata,
    MetadataRecord, Record,
};
use crate::datastore::store::{
    AddressRefStore, EnvMetadataStore, GetOptions, MetadataStore, UpdateOptions,
};
use crate::metrics::{record_counter, CATALOG_CONFLICT_RETRIES};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default number of re-read attempts after a version conflict
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 10;

/// What every per-entity store shares: the client and, inside a
/// transaction, its id
#[derive(Debug, Clone)]
pub(crate) struct CatalogSession {
    pub(crate) client: Arc<CatalogClient>,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) max_conflict_retries: u32,
}

impl CatalogSession {
    async fn call(
        &self,
        ctx: &Context,
        op: CatalogOp,
        kind: EntityKind,
        opts: GetOptions,
    ) -> StoreResult<CatalogReply> {
        let transaction = if opts.ignore_transaction {
            None
        } else {
            self.transaction.as_ref()
        };
        self.client.call(ctx, transaction, op, Some(kind)).await
    }
}

fn unexpected(reply: CatalogReply, wanted: &str) -> StoreError {
    StoreError::Internal(format!(
        "catalog answered {} where {} was expected",
        reply.variant(),
        wanted
    ))
}

fn delete_unsupported(kind: EntityKind) -> StoreError {
    StoreError::UnsupportedOperation(format!(
        "delete not supported for {} in the catalog",
        kind.describe()
    ))
}

fn written(reply: CatalogReply) -> StoreResult<u64> {
    match reply {
        CatalogReply::Written { row_version } => Ok(row_version),
        other => Err(unexpected(other, "written")),
    }
}

pub struct CatalogAddressRefStore {
    session: CatalogSession,
}

impl CatalogAddressRefStore {
    pub(crate) fn new(session: CatalogSession) -> Self {
        CatalogAddressRefStore { session }
    }

    async fn edit(&self, ctx: &Context, record: AddressRef, semantics: EditSemantics) -> StoreResult<()> {
        let reply = self
            .session
            .call(
                ctx,
                CatalogOp::EditAddressRef { record, semantics },
                EntityKind::AddressRef,
                GetOptions::default(),
            )
            .await?;
        written(reply).map(|_| ())
    }
}

#[async_trait]
impl AddressRefStore for CatalogAddressRefStore {
    async fn get(&self, ctx: &Context, key: &AddressRefKey, opts: GetOptions) -> StoreResult<AddressRef> {
        let op = CatalogOp::GetAddressRef { key: key.clone() };
        match self.session.call(ctx, op, EntityKind::AddressRef, opts).await? {
            CatalogReply::AddressRef(record) => Ok(record),
            other => Err(unexpected(other, "address_ref")),
        }
    }

    async fn fetch(&self, ctx: &Context) -> StoreResult<Vec<AddressRef>> {
        let reply = self
            .session
            .call(ctx, CatalogOp::ListAddressRefs, EntityKind::AddressRef, GetOptions::default())
            .await?;
        match reply {
            CatalogReply::AddressRefs(mut records) => {
                records.sort_by_key(Record::key);
                Ok(records)
            }
            other => Err(unexpected(other, "address_refs")),
        }
    }

    async fn add(&self, ctx: &Context, record: AddressRef) -> StoreResult<()> {
        self.edit(ctx, record, EditSemantics::Insert).await
    }

    async fn upsert(&self, ctx: &Context, record: AddressRef) -> StoreResult<()> {
        self.edit(ctx, record, EditSemantics::Upsert).await
    }

    async fn update(&self, ctx: &Context, record: AddressRef) -> StoreResult<()> {
        self.edit(ctx, record, EditSemantics::Update).await
    }

    async fn delete(&self, _ctx: &Context, _key: &AddressRefKey) -> StoreResult<()> {
        Err(delete_unsupported(EntityKind::AddressRef))
    }
}

/// Wire mapping for a keyed metadata record
pub trait CatalogRecord: MetadataRecord {
    fn get_op(key: Self::Key) -> CatalogOp;

    fn list_op() -> CatalogOp;

    fn edit_op(record: Self, semantics: EditSemantics, row_version: Option<u64>) -> CatalogOp;

    fn from_get_reply(reply: CatalogReply) -> StoreResult<Versioned<Self>>;

    fn from_list_reply(reply: CatalogReply) -> StoreResult<Vec<Versioned<Self>>>;
}

impl CatalogRecord for ChainMetadata {
    fn get_op(key: Self::Key) -> CatalogOp {
        CatalogOp::GetChainMetadata { key }
    }

    fn list_op() -> CatalogOp {
        CatalogOp::ListChainMetadata
    }

    fn edit_op(record: Self, semantics: EditSemantics, row_version: Option<u64>) -> CatalogOp {
        CatalogOp::EditChainMetadata {
            record,
            semantics,
            row_version,
        }
    }

    fn from_get_reply(reply: CatalogReply) -> StoreResult<Versioned<Self>> {
        match reply {
            CatalogReply::ChainMetadata(versioned) => Ok(versioned),
            other => Err(unexpected(other, "chain_metadata")),
        }
    }

    fn from_list_reply(reply: CatalogReply) -> StoreResult<Vec<Versioned<Self>>> {
        match reply {
            CatalogReply::ChainMetadataList(rows) => Ok(rows),
            other => Err(unexpected(other, "chain_metadata_list")),
        }
    }
}

impl CatalogRecord for ContractMetadata {
    fn get_op(key: Self::Key) -> CatalogOp {
        CatalogOp::GetContractMetadata { key }
    }

    fn list_op() -> CatalogOp {
        CatalogOp::ListContractMetadata
    }

    fn edit_op(record: Self, semantics: EditSemantics, row_version: Option<u64>) -> CatalogOp {
        CatalogOp::EditContractMetadata {
            record,
            semantics,
            row_version,
        }
    }

    fn from_get_reply(reply: CatalogReply) -> StoreResult<Versioned<Self>> {
        match reply {
            CatalogReply::ContractMetadata(versioned) => Ok(versioned),
            other => Err(unexpected(other, "contract_metadata")),
        }
    }

    fn from_list_reply(reply: CatalogReply) -> StoreResult<Vec<Versioned<Self>>> {
        match reply {
            CatalogReply::ContractMetadataList(rows) => Ok(rows),
            other => Err(unexpected(other, "contract_metadata_list")),
        }
    }
}

/// Outcome of one compare-and-write attempt
enum Attempt {
    Done,
    Retry(StoreError),
}

/// Decide whether a failed write is worth another read-merge-write cycle
///
/// A conflict means the row moved under us; already-exists means another
/// writer created it between our read and our insert.
fn classify(err: StoreError) -> StoreResult<Attempt> {
    if err.is_conflict() || err.is_already_exists() {
        Ok(Attempt::Retry(err))
    } else {
        Err(err)
    }
}

fn exhausted(description: &str, attempts: u32, last: StoreError) -> StoreError {
    StoreError::Conflict(format!(
        "{} still contended after {} attempts: {}",
        description, attempts, last
    ))
}

pub struct CatalogMetadataStore<R: CatalogRecord> {
    session: CatalogSession,
    versions: Mutex<HashMap<R::Key, u64>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: CatalogRecord> CatalogMetadataStore<R> {
    pub(crate) fn new(session: CatalogSession) -> Self {
        CatalogMetadataStore {
            session,
            versions: Mutex::new(HashMap::new()),
            _record: PhantomData,
        }
    }

    /// Row version this handle last saw for `key`
    pub fn observed_version(&self, key: &R::Key) -> Option<u64> {
        self.versions.lock().ok().and_then(|v| v.get(key).copied())
    }

    fn remember(&self, key: R::Key, row_version: u64) -> StoreResult<()> {
        self.versions
            .lock()
            .map_err(handle_poison)?
            .insert(key, row_version);
        Ok(())
    }

    async fn read(&self, ctx: &Context, key: &R::Key, opts: GetOptions) -> StoreResult<Versioned<R>> {
        let reply = self
            .session
            .call(ctx, R::get_op(key.clone()), R::KIND, opts)
            .await?;
        let versioned = R::from_get_reply(reply)?;
        self.remember(key.clone(), versioned.row_version)?;
        Ok(versioned)
    }

    async fn try_write(
        &self,
        ctx: &Context,
        key: &R::Key,
        incoming: &Metadata,
        opts: &UpdateOptions,
        mode: WriteMode,
    ) -> StoreResult<Attempt> {
        let current = match self.read(ctx, key, GetOptions::default()).await {
            Ok(current) => Some(current),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let (metadata, semantics, expected) = match current {
            Some(Versioned {
                record,
                row_version,
            }) => (
                opts.apply(record.metadata().clone(), incoming.clone())?,
                EditSemantics::Update,
                Some(row_version),
            ),
            None if mode == WriteMode::MustExist => return Err(R::KIND.not_found(key)),
            None => (incoming.clone(), EditSemantics::Insert, None),
        };

        let op = R::edit_op(R::from_parts(key.clone(), metadata), semantics, expected);
        match self.session.call(ctx, op, R::KIND, GetOptions::default()).await {
            Ok(reply) => {
                self.remember(key.clone(), written(reply)?)?;
                Ok(Attempt::Done)
            }
            Err(e) => classify(e),
        }
    }

    async fn write(
        &self,
        ctx: &Context,
        key: &R::Key,
        incoming: Metadata,
        opts: UpdateOptions,
        mode: WriteMode,
    ) -> StoreResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write(ctx, key, &incoming, &opts, mode).await? {
                Attempt::Done => return Ok(()),
                Attempt::Retry(err) if attempt > self.session.max_conflict_retries => {
                    return Err(exhausted(
                        &format!("{} {}", R::KIND.describe(), key),
                        attempt,
                        err,
                    ));
                }
                Attempt::Retry(err) => {
                    record_counter(CATALOG_CONFLICT_RETRIES, 1);
                    debug!(%key, attempt, error = %err, "Retrying contended metadata write");
                }
            }
        }
    }
}

#[async_trait]
impl<R: CatalogRecord> MetadataStore<R> for CatalogMetadataStore<R> {
    async fn get(&self, ctx: &Context, key: &R::Key, opts: GetOptions) -> StoreResult<R> {
        Ok(self.read(ctx, key, opts).await?.record)
    }

    async fn fetch(&self, ctx: &Context) -> StoreResult<Vec<R>> {
        let reply = self
            .session
            .call(ctx, R::list_op(), R::KIND, GetOptions::default())
            .await?;
        let mut records = Vec::new();
        for Versioned {
            record,
            row_version,
        } in R::from_list_reply(reply)?
        {
            self.remember(record.key(), row_version)?;
            records.push(record);
        }
        records.sort_by_key(Record::key);
        Ok(records)
    }

    async fn add(&self, ctx: &Context, record: R) -> StoreResult<()> {
        let key = record.key();
        let op = R::edit_op(record, EditSemantics::Insert, None);
        let reply = self
            .session
            .call(ctx, op, R::KIND, GetOptions::default())
            .await?;
        self.remember(key, written(reply)?)
    }

    async fn upsert(
        &self,
        ctx: &Context,
        key: &R::Key,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()> {
        self.write(ctx, key, metadata, opts, WriteMode::CreateIfMissing)
            .await
    }

    async fn update(
        &self,
        ctx: &Context,
        key: &R::Key,
        metadata: Metadata,
        opts: UpdateOptions,
    ) -> StoreResult<()> {
        self.write(ctx, key, metadata, opts, WriteMode::MustExist).await
    }

    async fn delete(&self, _ctx: &Context, _key: &R::Key) -> StoreResult<()> {
        Err(delete_unsupported(R::KIND))
    }
}

pub struct CatalogEnvMetadataStore {
    session: CatalogSession,
    version: Mutex<Option<u64>>,
}

impl CatalogEnvMetadataStore {
    pub(crate) fn new(session: CatalogSession) -> Self {
        CatalogEnvMetadataStore {
            session,
            version: Mutex::new(None),
        }
    }

    pub fn observed_version(&self) -> Option<u64> {
        self.version.lock().ok().and_then(|v| *v)
    }

    fn remember(&self, row_version: u64) -> StoreResult<()> {
        *self.version.lock().map_err(handle_poison)? = Some(row_version);
        Ok(())
    }

    async fn read(&self, ctx: &Context, opts: GetOptions) -> StoreResult<Versioned<EnvMetadata>> {
        let reply = self
            .session
            .call(ctx, CatalogOp::GetEnvMetadata, EntityKind::EnvMetadata, opts)
            .await?;
        match reply {
            CatalogReply::EnvMetadata(versioned) => {
                self.remember(versioned.row_version)?;
                Ok(versioned)
            }
            other => Err(unexpected(other, "env_metadata")),
        }
    }

    async fn try_set(
        &self,
        ctx: &Context,
        incoming: &Metadata,
        opts: &UpdateOptions,
    ) -> StoreResult<Attempt> {
        let (metadata, semantics, expected) = match self.read(ctx, GetOptions::default()).await {
            Ok(Versioned {
                record,
                row_version,
            }) => (
                opts.apply(record.metadata, incoming.clone())?,
                EditSemantics::Update,
                Some(row_version),
            ),
            Err(e) if e.is_env_metadata_not_set() => (incoming.clone(), EditSemantics::Insert, None),
            Err(e) => return Err(e),
        };

        let op = CatalogOp::EditEnvMetadata {
            record: EnvMetadata::new(metadata),
            semantics,
            row_version: expected,
        };
        match self
            .session
            .call(ctx, op, EntityKind::EnvMetadata, GetOptions::default())
            .await
        {
            Ok(reply) => {
                self.remember(written(reply)?)?;
                Ok(Attempt::Done)
            }
            Err(e) => classify(e),
        }
    }
}

#[async_trait]
impl EnvMetadataStore for CatalogEnvMetadataStore {
    async fn get(&self, ctx: &Context, opts: GetOptions) -> StoreResult<EnvMetadata> {
        Ok(self.read(ctx, opts).await?.record)
    }

    async fn set(&self, ctx: &Context, metadata: Metadata, opts: UpdateOptions) -> StoreResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_set(ctx, &metadata, &opts).await? {
                Attempt::Done => return Ok(()),
                Attempt::Retry(err) if attempt > self.session.max_conflict_retries => {
                    return Err(exhausted(EntityKind::EnvMetadata.describe(), attempt, err));
                }
                Attempt::Retry(err) => {
                    record_counter(CATALOG_CONFLICT_RETRIES, 1);
                    debug!(attempt, error = %err, "Retrying contended environment metadata write");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::catalog::protocol::{
        CatalogFrame, CatalogResponse, RpcError, Selector, ERR_VERSION_CONFLICT,
    };
    use crate::datastore::catalog::transport::CatalogTransport;
    use crate::datastore::model::ChainMetadataKey;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A contended row: reads succeed, edits conflict until `losses` of
    /// them have been lost (forever when unset)
    #[derive(Default)]
    struct ContendedTransport {
        edits: AtomicU32,
        losses: Option<u32>,
    }

    #[async_trait]
    impl CatalogTransport for ContendedTransport {
        async fn round_trip(&self, frame: Vec<u8>) -> StoreResult<Vec<u8>> {
            let CatalogFrame::Request(request) = serde_json::from_slice(&frame)? else {
                return Err(StoreError::Transport("expected a request".into()));
            };
            let result = match request.op {
                CatalogOp::GetChainMetadata { key } => {
                    let row_version = self.edits.load(Ordering::SeqCst) as u64 + 1;
                    Ok(CatalogReply::ChainMetadata(Versioned {
                        record: ChainMetadata::new(key.chain_selector, Some(json!(row_version))),
                        row_version,
                    }))
                }
                CatalogOp::EditChainMetadata { .. } => {
                    let seen = self.edits.fetch_add(1, Ordering::SeqCst);
                    match self.losses {
                        Some(losses) if seen >= losses => Ok(CatalogReply::Written {
                            row_version: seen as u64 + 2,
                        }),
                        _ => Err(RpcError::new(ERR_VERSION_CONFLICT, "row moved")),
                    }
                }
                other => Err(RpcError::new(ERR_VERSION_CONFLICT, other.method())),
            };
            let response = CatalogFrame::Response(CatalogResponse {
                id: request.id,
                result,
            });
            Ok(serde_json::to_vec(&response)?)
        }
    }

    fn store(
        transport: Arc<ContendedTransport>,
        max_conflict_retries: u32,
    ) -> CatalogMetadataStore<ChainMetadata> {
        let client = CatalogClient::new(transport, Selector::new("ccip", "testnet"));
        CatalogMetadataStore::new(CatalogSession {
            client: Arc::new(client),
            transaction: None,
            max_conflict_retries,
        })
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_retries() {
        let transport = Arc::new(ContendedTransport::default());
        let store = store(transport.clone(), 2);
        let key = ChainMetadataKey::new(1);

        let err = store
            .upsert(&Context::background(), &key, Some(json!("mine")), UpdateOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(transport.edits.load(Ordering::SeqCst), 3);
        // The last read is what the handle remembers
        assert_eq!(store.observed_version(&key), Some(3));
    }

    #[tokio::test]
    async fn test_default_limit_rides_out_eight_writers() {
        // The last of eight racing writers loses to each of the other seven
        let transport = Arc::new(ContendedTransport {
            losses: Some(7),
            ..ContendedTransport::default()
        });
        let store = store(transport.clone(), DEFAULT_MAX_CONFLICT_RETRIES);
        let key = ChainMetadataKey::new(1);

        store
            .upsert(&Context::background(), &key, Some(json!("mine")), UpdateOptions::default())
            .await
            .unwrap();

        assert_eq!(transport.edits.load(Ordering::SeqCst), 8);
        assert_eq!(store.observed_version(&key), Some(9));
    }

    #[tokio::test]
    async fn test_no_retry_when_disabled() {
        let transport = Arc::new(ContendedTransport::default());
        let store = store(transport.clone(), 0);

        let err = store
            .update(
                &Context::background(),
                &ChainMetadataKey::new(1),
                None,
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(transport.edits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_rejected_without_round_trip() {
        let transport = Arc::new(ContendedTransport::default());
        let store = store(transport.clone(), 0);
        let err = store
            .delete(&Context::background(), &ChainMetadataKey::new(1))
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("delete not supported"));
        assert_eq!(transport.edits.load(Ordering::SeqCst), 0);
    }
}
