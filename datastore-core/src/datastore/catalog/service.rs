/*
    service.rs - Catalog request handling

    Decodes request frames, authenticates them, rejects replays, routes
    transaction control to the backend and everything else to the query
    layer. Every failure becomes an RpcError in the response frame; the
    service itself never tears down a connection over a bad request.

    Open transactions are leased. One idle for longer than the lease is
    rolled back, and so is every transaction a closed connection began.
*/

use super::backend::CatalogBackend;
use super::protocol::{
    CatalogFrame, CatalogOp, CatalogReply, CatalogRequest, CatalogResponse, RpcError, Selector,
    TransactionId, ERR_DUPLICATE_REQUEST, ERR_INVALID_ARGUMENT, ERR_UNAUTHENTICATED,
};
use super::transport::DEFAULT_MAX_FRAME_SIZE;
use crate::config::ServiceConfig;
use crate::datastore::context::Context;
use crate::datastore::errors::{StoreError, StoreResult};
use crate::metrics::{
    record_counter, record_histogram, SERVICE_FRAME_BYTES, SERVICE_REJECTED, SERVICE_REQUESTS,
    SERVICE_TRANSACTIONS_REAPED,
};
use hashlink::LruCache;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Default number of request ids remembered for replay protection
pub const DEFAULT_SEEN_REQUESTS: usize = 10_000;

/// Default lease of an open transaction between two of its requests
pub const DEFAULT_TRANSACTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Transactions begun over one connection and not yet finished
#[derive(Debug, Default)]
pub struct ConnectionTransactions {
    open: HashMap<TransactionId, Selector>,
}

impl ConnectionTransactions {
    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    fn track(&mut self, selector: &Selector, ended: Option<&TransactionId>, response: &CatalogResponse) {
        if let Some(id) = ended {
            self.open.remove(id);
        }
        if let Ok(CatalogReply::Transaction { id }) = &response.result {
            self.open.insert(id.clone(), selector.clone());
        }
    }
}

pub struct CatalogService {
    backend: CatalogBackend,
    auth_token: Option<SecretString>,
    seen_requests: Mutex<LruCache<String, ()>>,
    max_frame_size: usize,
    transaction_idle_timeout: Duration,
}

impl CatalogService {
    pub fn new(backend: CatalogBackend) -> Self {
        CatalogService {
            backend,
            auth_token: None,
            seen_requests: Mutex::new(LruCache::new(DEFAULT_SEEN_REQUESTS)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            transaction_idle_timeout: DEFAULT_TRANSACTION_IDLE_TIMEOUT,
        }
    }

    /// Open the backend and apply every service setting from `config`
    pub fn from_config(config: &ServiceConfig) -> StoreResult<Self> {
        let backend = CatalogBackend::open(&config.db_path, config.pool_size)?;
        let mut service = CatalogService::new(backend)
            .with_seen_requests_capacity(config.seen_requests_capacity)
            .with_max_frame_size(config.max_frame_size)
            .with_transaction_idle_timeout(config.transaction_idle_timeout);
        if let Some(token) = &config.auth_token {
            service = service.with_auth_token(token.clone());
        }
        Ok(service)
    }

    /// Require every request to carry `token`
    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_seen_requests_capacity(mut self, capacity: usize) -> Self {
        self.seen_requests = Mutex::new(LruCache::new(capacity));
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Roll back transactions left idle for longer than `timeout`
    pub fn with_transaction_idle_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_idle_timeout = timeout;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn transaction_idle_timeout(&self) -> Duration {
        self.transaction_idle_timeout
    }

    pub fn backend(&self) -> &CatalogBackend {
        &self.backend
    }

    /// Roll back every transaction idle past the lease
    pub async fn reap_idle_transactions(&self) -> StoreResult<usize> {
        let reaped = self.backend.reap_idle(self.transaction_idle_timeout).await?;
        if reaped > 0 {
            record_counter(SERVICE_TRANSACTIONS_REAPED, reaped as u64);
        }
        Ok(reaped)
    }

    /// Reap idle transactions periodically until `ctx` is cancelled
    pub fn spawn_reaper(self: &Arc<Self>, ctx: &Context) -> JoinHandle<()> {
        let service = self.clone();
        let ctx = ctx.clone();
        let period = (self.transaction_idle_timeout / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = service.reap_idle_transactions().await {
                            warn!(error = %e, "Failed to reap idle transactions");
                        }
                    }
                }
            }
        })
    }

    /// Handle one encoded request frame, producing one encoded response
    pub async fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
        let response = self.respond(frame, None).await;
        encode(response)
    }

    /// Like `handle_frame`, recording which transactions the connection
    /// begins and finishes in `owned`
    pub async fn handle_connection_frame(
        &self,
        frame: &[u8],
        owned: &mut ConnectionTransactions,
    ) -> Vec<u8> {
        let response = self.respond(frame, Some(owned)).await;
        encode(response)
    }

    /// Roll back what a closed connection left open
    pub async fn release(&self, owned: ConnectionTransactions) {
        for (id, selector) in owned.open {
            match self.backend.rollback(&selector, &id).await {
                Ok(()) => {
                    record_counter(SERVICE_TRANSACTIONS_REAPED, 1);
                    warn!(transaction = %id, %selector, "Rolled back transaction of a closed connection");
                }
                // Already reaped or finished by another connection
                Err(e) => debug!(transaction = %id, error = %e, "Nothing to release"),
            }
        }
    }

    async fn respond(&self, frame: &[u8], owned: Option<&mut ConnectionTransactions>) -> CatalogResponse {
        record_histogram(SERVICE_FRAME_BYTES, frame.len() as f64);
        match self.decode(frame) {
            Ok(request) => {
                let selector = request.selector.clone();
                let ended = match request.op {
                    CatalogOp::CommitTransaction | CatalogOp::RollbackTransaction => {
                        request.transaction.clone()
                    }
                    _ => None,
                };
                let response = self.handle_request(request).await;
                if let Some(owned) = owned {
                    owned.track(&selector, ended.as_ref(), &response);
                }
                response
            }
            Err((id, error)) => {
                record_counter(SERVICE_REJECTED, 1);
                warn!(code = error.code, "Rejected undecodable frame: {}", error.message);
                CatalogResponse {
                    id,
                    result: Err(error),
                }
            }
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<CatalogRequest, (String, RpcError)> {
        if frame.len() > self.max_frame_size {
            return Err((
                String::new(),
                RpcError::new(
                    ERR_INVALID_ARGUMENT,
                    format!("frame of {} bytes exceeds {}", frame.len(), self.max_frame_size),
                ),
            ));
        }
        match serde_json::from_slice::<CatalogFrame>(frame) {
            Ok(CatalogFrame::Request(request)) => Ok(request),
            Ok(CatalogFrame::Response(response)) => Err((
                response.id,
                RpcError::new(ERR_INVALID_ARGUMENT, "expected a request frame"),
            )),
            Err(e) => Err((
                String::new(),
                RpcError::new(ERR_INVALID_ARGUMENT, format!("malformed frame: {}", e)),
            )),
        }
    }

    #[instrument(skip(self, request), fields(id = %request.id, method = request.op.method(), selector = %request.selector))]
    pub async fn handle_request(&self, request: CatalogRequest) -> CatalogResponse {
        record_counter(SERVICE_REQUESTS, 1);
        let id = request.id.clone();

        if let Err(error) = self.admit(&request).await {
            record_counter(SERVICE_REJECTED, 1);
            warn!(code = error.code, "Rejected request: {}", error.message);
            return CatalogResponse {
                id,
                result: Err(error),
            };
        }

        let result = self.dispatch(request).await.map_err(|e| {
            if matches!(e.root(), StoreError::Storage(_) | StoreError::Internal(_)) {
                warn!(error = %e, "Catalog request failed");
            } else {
                debug!(error = %e, "Catalog request refused");
            }
            RpcError::from(&e)
        });
        CatalogResponse { id, result }
    }

    /// Authentication, replay and selector checks
    async fn admit(&self, request: &CatalogRequest) -> Result<(), RpcError> {
        if let Some(expected) = &self.auth_token {
            let presented = request.auth_token.as_deref().unwrap_or_default();
            if !tokens_match(presented, expected.expose_secret()) {
                return Err(RpcError::new(ERR_UNAUTHENTICATED, "invalid or missing auth token"));
            }
        }

        if request.id.is_empty() {
            return Err(RpcError::new(ERR_INVALID_ARGUMENT, "request id is empty"));
        }
        if request.selector.domain.is_empty() || request.selector.environment.is_empty() {
            return Err(RpcError::new(
                ERR_INVALID_ARGUMENT,
                "domain and environment are required",
            ));
        }

        let mut seen = self.seen_requests.lock().await;
        if seen.contains_key(&request.id) {
            return Err(RpcError::new(
                ERR_DUPLICATE_REQUEST,
                format!("duplicate request id {}", request.id),
            ));
        }
        seen.insert(request.id.clone(), ());
        Ok(())
    }

    async fn dispatch(&self, request: CatalogRequest) -> StoreResult<CatalogReply> {
        let CatalogRequest {
            selector,
            transaction,
            op,
            ..
        } = request;

        match op {
            CatalogOp::BeginTransaction => {
                if let Some(open) = transaction {
                    return Err(StoreError::InvalidArgument(format!(
                        "request is already bound to transaction {}",
                        open
                    )));
                }
                if let Err(e) = self.reap_idle_transactions().await {
                    warn!(error = %e, "Failed to reap idle transactions");
                }
                let id = self.backend.begin(selector).await?;
                Ok(CatalogReply::Transaction { id })
            }
            CatalogOp::CommitTransaction => {
                let id = transaction.ok_or_else(|| {
                    StoreError::InvalidArgument("commit without a transaction".to_string())
                })?;
                self.backend.commit(&selector, &id).await?;
                Ok(CatalogReply::Ack)
            }
            CatalogOp::RollbackTransaction => {
                let id = transaction.ok_or_else(|| {
                    StoreError::InvalidArgument("rollback without a transaction".to_string())
                })?;
                self.backend.rollback(&selector, &id).await?;
                Ok(CatalogReply::Ack)
            }
            op => self.backend.execute(selector, transaction, op).await,
        }
    }
}

fn encode(response: CatalogResponse) -> Vec<u8> {
    serde_json::to_vec(&CatalogFrame::Response(response)).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode catalog response");
        Vec::new()
    })
}

/// Compare tokens in time independent of where they differ
fn tokens_match(presented: &str, expected: &str) -> bool {
    // blake3::Hash equality is constant-time
    blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes())
}
