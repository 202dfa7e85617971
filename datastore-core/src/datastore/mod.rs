/*
    datastore - Multi-entity transactional record store

    Four record kinds (address references, chain metadata, contract
    metadata, environment metadata) behind one set of store traits, with
    two backends:
    - memory: caller-owned scratch store
    - catalog: shared remote store with server-side transactions

    merge copies one aggregate into another inside a single transaction;
    archive snapshots an aggregate to JSON.
*/

pub mod archive;
pub mod catalog;
pub mod context;
pub mod errors;
pub mod filter;
pub mod memory;
pub mod merge;
pub mod model;
pub mod store;
pub mod updater;

pub use archive::DataStoreArchive;
pub use catalog::CatalogDataStore;
pub use context::Context;
pub use errors::{EntityKind, ResultExt, StoreError, StoreResult};
pub use memory::MemoryDataStore;
pub use merge::{merge_to_catalog, migrate_to_catalog, sync_to_catalog, MergeReport, SourceRole};
pub use store::{
    AddressRefStore, ChainMetadataStore, ContractMetadataStore, DataStore, EnvMetadataStore,
    GetOptions, MetadataStore, TransactionalDataStore, UpdateOptions,
};
pub use updater::{MergePatchUpdater, MetadataUpdater, ReplaceUpdater, TypedUpdater};
