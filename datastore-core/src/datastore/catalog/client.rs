/*
    client.rs - Request/response calls against a catalog service

    Each call gets a fresh request id, is bounded by the request timeout
    and by the caller's context, and has its RpcError mapped back into the
    store error for the record kind involved.
*/

use super::protocol::{
    CatalogFrame, CatalogOp, CatalogReply, CatalogRequest, CatalogResponse, Selector,
    TransactionId,
};
use super::transport::CatalogTransport;
use crate::datastore::context::Context;
use crate::datastore::errors::{EntityKind, StoreError, StoreResult};
use crate::metrics::{
    record_counter, Timer, CATALOG_REQUESTS, CATALOG_REQUESTS_FAILED, CATALOG_REQUEST_DURATION,
};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CatalogClient {
    transport: Arc<dyn CatalogTransport>,
    selector: Selector,
    auth_token: Option<SecretString>,
    request_timeout: Duration,
}

impl CatalogClient {
    pub fn new(transport: Arc<dyn CatalogTransport>, selector: Selector) -> Self {
        CatalogClient {
            transport,
            selector,
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Send `op`, optionally inside `transaction`
    ///
    /// `kind` names the record kind the op targets; transaction control
    /// passes `None`.
    pub async fn call(
        &self,
        ctx: &Context,
        transaction: Option<&TransactionId>,
        op: CatalogOp,
        kind: Option<EntityKind>,
    ) -> StoreResult<CatalogReply> {
        let id = Uuid::new_v4().to_string();
        let method = op.method();
        let frame = CatalogFrame::Request(CatalogRequest {
            id: id.clone(),
            selector: self.selector.clone(),
            auth_token: self
                .auth_token
                .as_ref()
                .map(|token| token.expose_secret().clone()),
            transaction: transaction.cloned(),
            op,
        });
        let bytes = serde_json::to_vec(&frame)?;

        record_counter(CATALOG_REQUESTS, 1);
        let timer = Timer::new(CATALOG_REQUEST_DURATION);
        let exchange = async {
            tokio::time::timeout(self.request_timeout, self.transport.round_trip(bytes))
                .await
                .map_err(|_| {
                    StoreError::Transport(format!(
                        "{} timed out after {:?}",
                        method, self.request_timeout
                    ))
                })?
        };
        let result = ctx
            .run(exchange)
            .await
            .and_then(|response| decode_reply(&id, &response, kind));
        timer.stop();

        if let Err(e) = &result {
            if !e.is_not_found() {
                record_counter(CATALOG_REQUESTS_FAILED, 1);
            }
            debug!(method, error = %e, "Catalog call failed");
        }
        result
    }
}

fn decode_reply(id: &str, bytes: &[u8], kind: Option<EntityKind>) -> StoreResult<CatalogReply> {
    let frame: CatalogFrame = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Transport(format!("malformed catalog response: {}", e)))?;
    match frame {
        CatalogFrame::Response(response) if response.id == id => {
            response.result.map_err(|e| e.into_store_error(kind))
        }
        // The service rejected the frame before it could read the request id
        CatalogFrame::Response(CatalogResponse {
            id: answered,
            result: Err(e),
        }) if answered.is_empty() => Err(e.into_store_error(kind)),
        CatalogFrame::Response(response) => Err(StoreError::Transport(format!(
            "response id {} does not match request {}",
            response.id, id
        ))),
        CatalogFrame::Request(_) => Err(StoreError::Transport(
            "catalog answered with a request frame".to_string(),
        )),
    }
}

impl fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogClient")
            .field("selector", &self.selector)
            .field("authenticated", &self.auth_token.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
