//! Deployment record store
//!
//! Address references, chain metadata, contract metadata and environment
//! metadata behind a common set of store traits, with an in-memory backend,
//! a remote catalog backend with server-side transactions, and merge
//! procedures that copy one into the other atomically.

pub mod config;
pub mod datastore;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::{CatalogConfig, Config, ConfigError, ServiceConfig};
pub use datastore::{
    CatalogDataStore, Context, DataStore, DataStoreArchive, MemoryDataStore, StoreError,
    StoreResult, TransactionalDataStore,
};
pub use logging::{init_logging, LogLevel};
