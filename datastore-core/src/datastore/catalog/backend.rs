/*
    backend.rs - SQLite storage behind the catalog service

    Connections come from an r2d2 pool. Requests outside a transaction run
    on any pooled connection; writes among them take a short IMMEDIATE
    transaction of their own. A client transaction pins one pooled
    connection for its whole lifetime, opened with BEGIN IMMEDIATE so that
    concurrent writers queue on SQLite's write lock instead of failing
    halfway through.

    A pinned connection holds the write lock for every (domain,
    environment), so transactions nobody finishes are reaped once they
    have been idle for longer than the service's lease.

    All SQLite work runs on the blocking thread pool.
*/

use super::migrations;
use super::protocol::{CatalogOp, CatalogReply, Selector, TransactionId};
use super::queries;
use crate::datastore::errors::{handle_poison, StoreError, StoreResult};
use crate::metrics::{record_gauge, SERVICE_OPEN_TRANSACTIONS};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a connection waits on SQLite's write lock
///
/// Must stay below the client's request timeout, so a queued writer is
/// answered before its caller gives up on it.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pooled connection that is never handed back mid-transaction
///
/// If the owner goes away without committing, the open transaction is
/// rolled back before the connection returns to the pool.
struct TxConnection {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl Deref for TxConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for TxConnection {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}

struct OpenTransaction {
    selector: Selector,
    conn: Arc<Mutex<TxConnection>>,
    last_used: Instant,
}

impl OpenTransaction {
    /// Idle and not currently running an operation
    fn expired(&self, now: Instant, idle: Duration) -> bool {
        Arc::strong_count(&self.conn) == 1 && now.duration_since(self.last_used) >= idle
    }
}

/// SQLite-backed catalog storage
pub struct CatalogBackend {
    pool: Pool<SqliteConnectionManager>,
    transactions: Mutex<HashMap<TransactionId, OpenTransaction>>,
}

impl CatalogBackend {
    /// Open (or create) the catalog database at `path` and migrate it
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")
        });
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        migrations::migrate(&pool)?;

        info!(
            path = %path.as_ref().display(),
            pool_size,
            "Opened catalog database"
        );

        Ok(CatalogBackend {
            pool,
            transactions: Mutex::new(HashMap::new()),
        })
    }

    /// Number of transactions currently open
    pub fn open_transactions(&self) -> StoreResult<usize> {
        Ok(self.transactions.lock().map_err(handle_poison)?.len())
    }

    /// Start a transaction scoped to `selector`
    pub async fn begin(&self, selector: Selector) -> StoreResult<TransactionId> {
        let pool = self.pool.clone();
        let conn = tokio::task::spawn_blocking(move || -> StoreResult<TxConnection> {
            let conn = TxConnection { conn: pool.get()? };
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(conn)
        })
        .await??;

        let id = Uuid::new_v4().to_string();
        let mut transactions = self.transactions.lock().map_err(handle_poison)?;
        transactions.insert(
            id.clone(),
            OpenTransaction {
                selector,
                conn: Arc::new(Mutex::new(conn)),
                last_used: Instant::now(),
            },
        );
        record_gauge(SERVICE_OPEN_TRANSACTIONS, transactions.len() as f64);
        debug!(transaction = %id, "Began catalog transaction");
        Ok(id)
    }

    pub async fn commit(&self, selector: &Selector, id: &TransactionId) -> StoreResult<()> {
        let txn = self.take(selector, id)?;
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = txn.conn.lock().map_err(handle_poison)?;
            conn.execute_batch("COMMIT")
                .map_err(|e| StoreError::Transaction(format!("commit failed: {}", e)))
        })
        .await??;
        debug!(transaction = %id, "Committed catalog transaction");
        Ok(())
    }

    pub async fn rollback(&self, selector: &Selector, id: &TransactionId) -> StoreResult<()> {
        let txn = self.take(selector, id)?;
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = txn.conn.lock().map_err(handle_poison)?;
            conn.execute_batch("ROLLBACK")
                .map_err(|e| StoreError::Transaction(format!("rollback failed: {}", e)))
        })
        .await??;
        debug!(transaction = %id, "Rolled back catalog transaction");
        Ok(())
    }

    /// Run a data operation, inside transaction `txn` when given
    pub async fn execute(
        &self,
        selector: Selector,
        txn: Option<TransactionId>,
        op: CatalogOp,
    ) -> StoreResult<CatalogReply> {
        match txn {
            Some(id) => {
                let conn = self.pinned(&selector, &id)?;
                tokio::task::spawn_blocking(move || {
                    let conn = conn.lock().map_err(handle_poison)?;
                    queries::apply(&conn, &selector, op)
                })
                .await?
            }
            None => {
                let pool = self.pool.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    if !op.is_write() {
                        return queries::apply(&conn, &selector, op);
                    }
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let reply = queries::apply(&tx, &selector, op)?;
                    tx.commit()?;
                    Ok(reply)
                })
                .await?
            }
        }
    }

    /// Roll back every transaction idle for at least `idle`
    pub async fn reap_idle(&self, idle: Duration) -> StoreResult<usize> {
        let now = Instant::now();
        let expired: Vec<(TransactionId, OpenTransaction)> = {
            let mut transactions = self.transactions.lock().map_err(handle_poison)?;
            let ids: Vec<TransactionId> = transactions
                .iter()
                .filter(|(_, txn)| txn.expired(now, idle))
                .map(|(id, _)| id.clone())
                .collect();
            let expired = ids
                .into_iter()
                .filter_map(|id| transactions.remove(&id).map(|txn| (id, txn)))
                .collect();
            record_gauge(SERVICE_OPEN_TRANSACTIONS, transactions.len() as f64);
            expired
        };
        if expired.is_empty() {
            return Ok(0);
        }

        let reaped = expired.len();
        for (id, txn) in &expired {
            warn!(
                transaction = %id,
                selector = %txn.selector,
                idle_ms = now.duration_since(txn.last_used).as_millis() as u64,
                "Rolling back idle catalog transaction"
            );
        }
        // Dropping the pinned connections issues the ROLLBACKs
        tokio::task::spawn_blocking(move || drop(expired)).await?;
        Ok(reaped)
    }

    fn pinned(&self, selector: &Selector, id: &TransactionId) -> StoreResult<Arc<Mutex<TxConnection>>> {
        let mut transactions = self.transactions.lock().map_err(handle_poison)?;
        match transactions.get_mut(id) {
            Some(txn) if &txn.selector == selector => {
                txn.last_used = Instant::now();
                Ok(txn.conn.clone())
            }
            Some(txn) => Err(StoreError::Transaction(format!(
                "transaction {} belongs to {}, not {}",
                id, txn.selector, selector
            ))),
            None => Err(StoreError::Transaction(format!("unknown transaction {}", id))),
        }
    }

    fn take(&self, selector: &Selector, id: &TransactionId) -> StoreResult<OpenTransaction> {
        self.pinned(selector, id)?;
        let mut transactions = self.transactions.lock().map_err(handle_poison)?;
        let txn = transactions
            .remove(id)
            .ok_or_else(|| StoreError::Transaction(format!("unknown transaction {}", id)))?;
        record_gauge(SERVICE_OPEN_TRANSACTIONS, transactions.len() as f64);
        Ok(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::catalog::protocol::EditSemantics;
    use crate::datastore::model::{ChainMetadata, ChainMetadataKey};
    use serde_json::json;
    use tempfile::TempDir;

    fn open() -> (TempDir, CatalogBackend) {
        let dir = TempDir::new().unwrap();
        let backend = CatalogBackend::open(dir.path().join("catalog.db"), 4).unwrap();
        (dir, backend)
    }

    fn selector() -> Selector {
        Selector::new("ccip", "testnet")
    }

    fn upsert_chain(chain: u64) -> CatalogOp {
        CatalogOp::EditChainMetadata {
            record: ChainMetadata::new(chain, Some(json!({"chain": chain}))),
            semantics: EditSemantics::Upsert,
            row_version: None,
        }
    }

    fn get_chain(chain: u64) -> CatalogOp {
        CatalogOp::GetChainMetadata {
            key: ChainMetadataKey::new(chain),
        }
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (_dir, backend) = open();
        let id = backend.begin(selector()).await.unwrap();
        backend
            .execute(selector(), Some(id.clone()), upsert_chain(1))
            .await
            .unwrap();

        // Visible inside, invisible outside
        assert!(backend
            .execute(selector(), Some(id.clone()), get_chain(1))
            .await
            .is_ok());
        assert!(backend
            .execute(selector(), None, get_chain(1))
            .await
            .unwrap_err()
            .is_not_found());

        backend.rollback(&selector(), &id).await.unwrap();
        assert!(backend
            .execute(selector(), None, get_chain(1))
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(backend.open_transactions().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let (_dir, backend) = open();
        let id = backend.begin(selector()).await.unwrap();
        backend
            .execute(selector(), Some(id.clone()), upsert_chain(2))
            .await
            .unwrap();
        backend.commit(&selector(), &id).await.unwrap();

        assert!(backend.execute(selector(), None, get_chain(2)).await.is_ok());
        assert!(matches!(
            backend.commit(&selector(), &id).await.unwrap_err(),
            StoreError::Transaction(_)
        ));
    }

    #[tokio::test]
    async fn test_transaction_bound_to_selector() {
        let (_dir, backend) = open();
        let id = backend.begin(selector()).await.unwrap();
        let other = Selector::new("ccip", "mainnet");

        let err = backend
            .execute(other.clone(), Some(id.clone()), get_chain(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
        assert!(backend.rollback(&other, &id).await.is_err());
        backend.rollback(&selector(), &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_transaction_reaped() {
        let (_dir, backend) = open();
        let id = backend.begin(selector()).await.unwrap();
        backend
            .execute(selector(), Some(id.clone()), upsert_chain(3))
            .await
            .unwrap();

        assert_eq!(backend.reap_idle(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(backend.open_transactions().unwrap(), 1);

        assert_eq!(backend.reap_idle(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(backend.open_transactions().unwrap(), 0);
        assert!(backend
            .execute(selector(), None, get_chain(3))
            .await
            .unwrap_err()
            .is_not_found());

        // The write lock is free again
        backend.execute(selector(), None, upsert_chain(4)).await.unwrap();
        assert!(matches!(
            backend.commit(&selector(), &id).await.unwrap_err(),
            StoreError::Transaction(_)
        ));
    }

    #[test]
    fn test_busy_timeout_below_request_timeout() {
        assert!(BUSY_TIMEOUT < crate::datastore::catalog::DEFAULT_REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_dropped_backend_abandons_open_transaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let backend = CatalogBackend::open(&path, 2).unwrap();
            let id = backend.begin(selector()).await.unwrap();
            backend
                .execute(selector(), Some(id), upsert_chain(5))
                .await
                .unwrap();
        }

        let backend = CatalogBackend::open(&path, 2).unwrap();
        assert!(backend
            .execute(selector(), None, get_chain(5))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
