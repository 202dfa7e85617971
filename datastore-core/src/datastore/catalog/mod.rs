/*
    catalog - Remote, shared data store

    The catalog is the authoritative record of an environment's deployed
    contracts and metadata, served over request/response RPC and shared by
    every tool working on that (domain, environment). Client-side stores
    translate trait calls into catalog ops; the service side applies them
    to SQLite.

    Transactions are server-side: BeginTransaction pins a database
    connection, every op inside carries the transaction id, and
    Commit/Rollback release it. A transaction-scoped CatalogDataStore is a
    clone of the outer one that stamps its id on each request. If the
    caller drops a with_transaction future part way, the rollback is sent
    from a spawned task instead.
*/

mod backend;
mod client;
pub mod migrations;
pub mod protocol;
mod queries;
mod server;
mod service;
mod stores;
mod transport;

pub use backend::CatalogBackend;
pub use client::{CatalogClient, DEFAULT_REQUEST_TIMEOUT};
pub use protocol::{Selector, TransactionId};
pub use server::CatalogServer;
pub use service::{
    CatalogService, ConnectionTransactions, DEFAULT_SEEN_REQUESTS, DEFAULT_TRANSACTION_IDLE_TIMEOUT,
};
pub use stores::{
    CatalogAddressRefStore, CatalogEnvMetadataStore, CatalogMetadataStore, CatalogRecord,
    DEFAULT_MAX_CONFLICT_RETRIES,
};
pub use transport::{
    read_frame, write_frame, CatalogTransport, ChannelTransport, TcpTransport,
    DEFAULT_MAX_FRAME_SIZE,
};

use self::protocol::{CatalogOp, CatalogReply};
use self::stores::CatalogSession;
use super::context::Context;
use super::errors::{StoreError, StoreResult};
use super::model::{ChainMetadata, ContractMetadata};
use super::store::{
    AddressRefStore, ChainMetadataStore, ContractMetadataStore, DataStore, EnvMetadataStore,
    TransactionalDataStore,
};
use crate::config::CatalogConfig;
use crate::metrics::{
    record_counter, CATALOG_TRANSACTIONS_COMMITTED, CATALOG_TRANSACTIONS_ROLLED_BACK,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

pub type CatalogChainMetadataStore = CatalogMetadataStore<ChainMetadata>;
pub type CatalogContractMetadataStore = CatalogMetadataStore<ContractMetadata>;

struct CatalogStores {
    session: CatalogSession,
    addresses: CatalogAddressRefStore,
    chain_metadata: CatalogChainMetadataStore,
    contract_metadata: CatalogContractMetadataStore,
    env_metadata: CatalogEnvMetadataStore,
}

/// Catalog-backed aggregate of the four per-entity stores
#[derive(Clone)]
pub struct CatalogDataStore {
    inner: Arc<CatalogStores>,
}

impl CatalogDataStore {
    pub fn new(client: CatalogClient) -> Self {
        Self::from_session(CatalogSession {
            client: Arc::new(client),
            transaction: None,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        })
    }

    /// Connect over TCP using `config`
    pub async fn connect(config: &CatalogConfig) -> StoreResult<Self> {
        let transport = TcpTransport::connect(config.address.clone())
            .await?
            .with_max_frame_size(config.max_frame_size);
        let mut client = CatalogClient::new(
            Arc::new(transport),
            Selector::new(config.domain.clone(), config.environment.clone()),
        )
        .with_request_timeout(config.request_timeout);
        if let Some(token) = &config.auth_token {
            client = client.with_auth_token(token.clone());
        }
        Ok(Self::new(client).with_max_conflict_retries(config.max_conflict_retries))
    }

    pub fn with_max_conflict_retries(self, max_conflict_retries: u32) -> Self {
        Self::from_session(CatalogSession {
            max_conflict_retries,
            ..self.inner.session.clone()
        })
    }

    fn from_session(session: CatalogSession) -> Self {
        CatalogDataStore {
            inner: Arc::new(CatalogStores {
                addresses: CatalogAddressRefStore::new(session.clone()),
                chain_metadata: CatalogMetadataStore::new(session.clone()),
                contract_metadata: CatalogMetadataStore::new(session.clone()),
                env_metadata: CatalogEnvMetadataStore::new(session.clone()),
                session,
            }),
        }
    }

    pub fn client(&self) -> &CatalogClient {
        &self.inner.session.client
    }

    /// Id of the transaction this handle is bound to, if any
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.inner.session.transaction.as_ref()
    }

    /// Concrete chain metadata store, for row version inspection
    pub fn catalog_chain_metadata(&self) -> &CatalogChainMetadataStore {
        &self.inner.chain_metadata
    }

    pub fn catalog_contract_metadata(&self) -> &CatalogContractMetadataStore {
        &self.inner.contract_metadata
    }

    pub fn catalog_env_metadata(&self) -> &CatalogEnvMetadataStore {
        &self.inner.env_metadata
    }

    async fn control(&self, ctx: &Context, id: &TransactionId, op: CatalogOp) -> StoreResult<()> {
        let method = op.method();
        match self.client().call(ctx, Some(id), op, None).await {
            Ok(CatalogReply::Ack) => Ok(()),
            Ok(other) => Err(StoreError::Transaction(format!(
                "{} answered with {}",
                method,
                other.variant()
            ))),
            Err(e) => Err(StoreError::Transaction(format!("{} {}: {}", method, id, e))),
        }
    }

    /// Roll back on a fresh context; the caller's may already be cancelled
    async fn rollback(&self, id: &TransactionId) -> StoreResult<()> {
        let result = self
            .control(&Context::background(), id, CatalogOp::RollbackTransaction)
            .await;
        record_counter(CATALOG_TRANSACTIONS_ROLLED_BACK, 1);
        result
    }
}

/// Rolls back a transaction whose `with_transaction` future was dropped
/// before it could commit or roll back itself
struct RollbackOnDrop {
    store: Option<CatalogDataStore>,
    id: TransactionId,
}

impl RollbackOnDrop {
    fn new(store: &CatalogDataStore, id: &TransactionId) -> Self {
        RollbackOnDrop {
            store: Some(store.clone()),
            id: id.clone(),
        }
    }

    fn disarm(&mut self) {
        self.store = None;
    }
}

impl Drop for RollbackOnDrop {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(transaction = %id, "Transaction abandoned; rolling back");
                handle.spawn(async move {
                    if let Err(e) = store.rollback(&id).await {
                        debug!(transaction = %id, error = %e, "Rollback of abandoned transaction");
                    }
                });
            }
            Err(_) => {
                warn!(transaction = %id, "Transaction abandoned outside a runtime; left to expire")
            }
        }
    }
}

impl DataStore for CatalogDataStore {
    fn addresses(&self) -> &dyn AddressRefStore {
        &self.inner.addresses
    }

    fn chain_metadata(&self) -> &ChainMetadataStore {
        &self.inner.chain_metadata
    }

    fn contract_metadata(&self) -> &ContractMetadataStore {
        &self.inner.contract_metadata
    }

    fn env_metadata(&self) -> &dyn EnvMetadataStore {
        &self.inner.env_metadata
    }
}

#[async_trait]
impl TransactionalDataStore for CatalogDataStore {
    async fn with_transaction<F, Fut, T>(&self, ctx: &Context, f: F) -> StoreResult<T>
    where
        F: FnOnce(Self) -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        // Nested calls join the enclosing transaction
        if self.transaction_id().is_some() {
            return ctx.run(f(self.clone())).await;
        }

        let id = match self
            .client()
            .call(ctx, None, CatalogOp::BeginTransaction, None)
            .await
        {
            Ok(CatalogReply::Transaction { id }) => id,
            Ok(other) => {
                return Err(StoreError::Transaction(format!(
                    "begin_transaction answered with {}",
                    other.variant()
                )))
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Err(StoreError::Transaction(format!("begin_transaction: {}", e))),
        };
        debug!(transaction = %id, "Opened catalog transaction");
        let mut guard = RollbackOnDrop::new(self, &id);

        let scoped = Self::from_session(CatalogSession {
            transaction: Some(id.clone()),
            ..self.inner.session.clone()
        });
        let outcome = AssertUnwindSafe(async move { ctx.run(f(scoped)).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                if let Err(commit_err) = self.control(ctx, &id, CatalogOp::CommitTransaction).await {
                    warn!(transaction = %id, error = %commit_err, "Commit failed; rolling back");
                    if let Err(rollback_err) = self.rollback(&id).await {
                        debug!(transaction = %id, error = %rollback_err, "Rollback after failed commit");
                    }
                    guard.disarm();
                    return Err(commit_err);
                }
                guard.disarm();
                record_counter(CATALOG_TRANSACTIONS_COMMITTED, 1);
                debug!(transaction = %id, "Committed catalog transaction");
                Ok(value)
            }
            Ok(Err(err)) => {
                debug!(transaction = %id, error = %err, "Rolling back catalog transaction");
                let rolled_back = self.rollback(&id).await;
                guard.disarm();
                match rolled_back {
                    Ok(()) => Err(err),
                    Err(rollback_err) => Err(StoreError::Transaction(format!(
                        "rollback after \"{}\" failed: {}",
                        err, rollback_err
                    ))),
                }
            }
            Err(panic) => {
                warn!(transaction = %id, "Transaction body panicked; rolling back");
                if let Err(rollback_err) = self.rollback(&id).await {
                    warn!(transaction = %id, error = %rollback_err, "Rollback after panic failed");
                }
                guard.disarm();
                std::panic::resume_unwind(panic)
            }
        }
    }
}
