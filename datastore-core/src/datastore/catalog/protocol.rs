/*
    protocol.rs - Catalog wire protocol

    Every exchange is one JSON request frame answered by one JSON response
    frame carrying the same id. Requests are scoped by a (domain,
    environment) selector, optionally authenticated with a shared token,
    and optionally bound to a server-side transaction.

    Request:
    ```json
    {
        "type": "request",
        "id": "4f7c…",
        "selector": { "domain": "ccip", "environment": "testnet" },
        "transaction": "9a1e…",
        "op": {
            "method": "edit_chain_metadata",
            "params": { "record": {…}, "semantics": "upsert", "row_version": 3 }
        }
    }
    ```

    Response:
    ```json
    { "type": "response", "id": "4f7c…", "result": { "Ok": { "kind": "written", "data": { "row_version": 4 } } } }
    ```

    Metadata rows carry a row version. Writes send the version they expect
    to replace (absent for "expect no row"); the service answers a stale
    expectation with ERR_VERSION_CONFLICT.
*/

use crate::datastore::errors::{EntityKind, StoreError};
use crate::datastore::model::{
    AddressRef, AddressRefKey, ChainMetadata, ChainMetadataKey, ContractMetadata,
    ContractMetadataKey, EnvMetadata,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TransactionId = String;

/// The (domain, environment) pair every request is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub domain: String,
    pub environment: String,
}

impl Selector {
    pub fn new(domain: impl Into<String>, environment: impl Into<String>) -> Self {
        Selector {
            domain: domain.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.environment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CatalogFrame {
    #[serde(rename = "request")]
    Request(CatalogRequest),
    #[serde(rename = "response")]
    Response(CatalogResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRequest {
    pub id: String,
    pub selector: Selector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionId>,
    pub op: CatalogOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub id: String,
    pub result: Result<CatalogReply, RpcError>,
}

/// How an edit treats an existing row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditSemantics {
    /// Create; the row must not exist
    Insert,
    /// Replace; the row must exist
    Update,
    /// Create or replace
    Upsert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum CatalogOp {
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,

    GetAddressRef {
        key: AddressRefKey,
    },
    ListAddressRefs,
    EditAddressRef {
        record: AddressRef,
        semantics: EditSemantics,
    },
    DeleteAddressRef {
        key: AddressRefKey,
    },

    GetChainMetadata {
        key: ChainMetadataKey,
    },
    ListChainMetadata,
    EditChainMetadata {
        record: ChainMetadata,
        semantics: EditSemantics,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_version: Option<u64>,
    },
    DeleteChainMetadata {
        key: ChainMetadataKey,
    },

    GetContractMetadata {
        key: ContractMetadataKey,
    },
    ListContractMetadata,
    EditContractMetadata {
        record: ContractMetadata,
        semantics: EditSemantics,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_version: Option<u64>,
    },
    DeleteContractMetadata {
        key: ContractMetadataKey,
    },

    GetEnvMetadata,
    EditEnvMetadata {
        record: EnvMetadata,
        semantics: EditSemantics,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_version: Option<u64>,
    },
}

impl CatalogOp {
    /// Method name as it appears on the wire
    pub fn method(&self) -> &'static str {
        match self {
            CatalogOp::BeginTransaction => "begin_transaction",
            CatalogOp::CommitTransaction => "commit_transaction",
            CatalogOp::RollbackTransaction => "rollback_transaction",
            CatalogOp::GetAddressRef { .. } => "get_address_ref",
            CatalogOp::ListAddressRefs => "list_address_refs",
            CatalogOp::EditAddressRef { .. } => "edit_address_ref",
            CatalogOp::DeleteAddressRef { .. } => "delete_address_ref",
            CatalogOp::GetChainMetadata { .. } => "get_chain_metadata",
            CatalogOp::ListChainMetadata => "list_chain_metadata",
            CatalogOp::EditChainMetadata { .. } => "edit_chain_metadata",
            CatalogOp::DeleteChainMetadata { .. } => "delete_chain_metadata",
            CatalogOp::GetContractMetadata { .. } => "get_contract_metadata",
            CatalogOp::ListContractMetadata => "list_contract_metadata",
            CatalogOp::EditContractMetadata { .. } => "edit_contract_metadata",
            CatalogOp::DeleteContractMetadata { .. } => "delete_contract_metadata",
            CatalogOp::GetEnvMetadata => "get_env_metadata",
            CatalogOp::EditEnvMetadata { .. } => "edit_env_metadata",
        }
    }

    /// Whether the op mutates rows
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            CatalogOp::EditAddressRef { .. }
                | CatalogOp::DeleteAddressRef { .. }
                | CatalogOp::EditChainMetadata { .. }
                | CatalogOp::DeleteChainMetadata { .. }
                | CatalogOp::EditContractMetadata { .. }
                | CatalogOp::DeleteContractMetadata { .. }
                | CatalogOp::EditEnvMetadata { .. }
        )
    }
}

/// A record together with its current row version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<R> {
    pub record: R,
    pub row_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CatalogReply {
    Ack,
    Transaction { id: TransactionId },
    AddressRef(AddressRef),
    AddressRefs(Vec<AddressRef>),
    ChainMetadata(Versioned<ChainMetadata>),
    ChainMetadataList(Vec<Versioned<ChainMetadata>>),
    ContractMetadata(Versioned<ContractMetadata>),
    ContractMetadataList(Vec<Versioned<ContractMetadata>>),
    EnvMetadata(Versioned<EnvMetadata>),
    Written { row_version: u64 },
}

impl CatalogReply {
    pub fn variant(&self) -> &'static str {
        match self {
            CatalogReply::Ack => "ack",
            CatalogReply::Transaction { .. } => "transaction",
            CatalogReply::AddressRef(_) => "address_ref",
            CatalogReply::AddressRefs(_) => "address_refs",
            CatalogReply::ChainMetadata(_) => "chain_metadata",
            CatalogReply::ChainMetadataList(_) => "chain_metadata_list",
            CatalogReply::ContractMetadata(_) => "contract_metadata",
            CatalogReply::ContractMetadataList(_) => "contract_metadata_list",
            CatalogReply::EnvMetadata(_) => "env_metadata",
            CatalogReply::Written { .. } => "written",
        }
    }
}

/// Error codes for catalog RPC errors
pub const ERR_UNAUTHENTICATED: i32 = -32001;
pub const ERR_NOT_FOUND: i32 = -32004;
pub const ERR_ALREADY_EXISTS: i32 = -32009;
pub const ERR_VERSION_CONFLICT: i32 = -32010;
pub const ERR_UNSUPPORTED: i32 = -32011;
pub const ERR_TRANSACTION_NOT_FOUND: i32 = -32012;
pub const ERR_DUPLICATE_REQUEST: i32 = -32600;
pub const ERR_INVALID_ARGUMENT: i32 = -32602;
pub const ERR_INTERNAL_ERROR: i32 = -32603;

/// RPC error carried in a response frame
///
/// For not-found and already-exists the message is the record key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn internal_error(msg: &str) -> Self {
        RpcError::new(ERR_INTERNAL_ERROR, format!("Internal error: {}", msg))
    }

    pub fn is_version_conflict(&self) -> bool {
        self.code == ERR_VERSION_CONFLICT
    }

    /// Map to the client-side error for an operation on `kind`
    ///
    /// Transaction control ops pass `None`; record-level codes then surface
    /// as internal errors.
    pub fn into_store_error(self, kind: Option<EntityKind>) -> StoreError {
        match (self.code, kind) {
            (ERR_NOT_FOUND, Some(kind)) => return kind.not_found(self.message),
            (ERR_ALREADY_EXISTS, Some(kind)) => return kind.already_exists(self.message),
            _ => {}
        }
        match self.code {
            ERR_VERSION_CONFLICT => StoreError::Conflict(self.message),
            ERR_UNSUPPORTED => StoreError::UnsupportedOperation(self.message),
            ERR_UNAUTHENTICATED => StoreError::Unauthenticated(self.message),
            ERR_INVALID_ARGUMENT => StoreError::InvalidArgument(self.message),
            ERR_TRANSACTION_NOT_FOUND => StoreError::Transaction(self.message),
            ERR_DUPLICATE_REQUEST => StoreError::Transport(self.message),
            _ => StoreError::Internal(format!("catalog error {}: {}", self.code, self.message)),
        }
    }
}

impl From<&StoreError> for RpcError {
    fn from(err: &StoreError) -> Self {
        match err.root() {
            StoreError::AddressRefNotFound(key)
            | StoreError::ChainMetadataNotFound(key)
            | StoreError::ContractMetadataNotFound(key) => RpcError::new(ERR_NOT_FOUND, key.clone()),
            StoreError::EnvMetadataNotSet => RpcError::new(ERR_NOT_FOUND, ""),
            StoreError::AddressRefExists(key)
            | StoreError::ChainMetadataExists(key)
            | StoreError::ContractMetadataExists(key) => {
                RpcError::new(ERR_ALREADY_EXISTS, key.clone())
            }
            StoreError::Conflict(msg) => RpcError::new(ERR_VERSION_CONFLICT, msg.clone()),
            StoreError::UnsupportedOperation(msg) => RpcError::new(ERR_UNSUPPORTED, msg.clone()),
            StoreError::Unauthenticated(msg) => RpcError::new(ERR_UNAUTHENTICATED, msg.clone()),
            StoreError::InvalidArgument(msg) => RpcError::new(ERR_INVALID_ARGUMENT, msg.clone()),
            StoreError::Transaction(msg) => RpcError::new(ERR_TRANSACTION_NOT_FOUND, msg.clone()),
            other => RpcError::internal_error(&other.to_string()),
        }
    }
}
