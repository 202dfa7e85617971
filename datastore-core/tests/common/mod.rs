/*
    common - Shared harness for integration tests

    TestCatalog owns a throwaway SQLite file and a CatalogService; store
    handles talk to it in-process over ChannelTransport, exactly as they
    would over TCP minus the sockets.
*/

#![allow(dead_code)]

use datastore_core::datastore::catalog::{
    CatalogBackend, CatalogClient, CatalogService, ChannelTransport, Selector,
};
use datastore_core::CatalogDataStore;
use std::sync::Arc;
use tempfile::TempDir;

pub const DOMAIN: &str = "ccip";
pub const ENVIRONMENT: &str = "testnet";

pub struct TestCatalog {
    _dir: TempDir,
    pub service: Arc<CatalogService>,
}

impl TestCatalog {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let backend =
            CatalogBackend::open(dir.path().join("catalog.db"), 8).expect("open catalog");
        TestCatalog {
            _dir: dir,
            service: Arc::new(CatalogService::new(backend)),
        }
    }

    /// A fresh handle for (domain, environment); must be called inside a runtime
    pub fn store_for(&self, domain: &str, environment: &str) -> CatalogDataStore {
        let transport = ChannelTransport::spawn(self.service.clone());
        let client = CatalogClient::new(Arc::new(transport), Selector::new(domain, environment));
        CatalogDataStore::new(client)
    }

    pub fn store(&self) -> CatalogDataStore {
        self.store_for(DOMAIN, ENVIRONMENT)
    }

    pub fn open_transactions(&self) -> usize {
        self.service
            .backend()
            .open_transactions()
            .expect("transaction registry")
    }
}
