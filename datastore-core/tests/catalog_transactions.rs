/*
    catalog_transactions.rs - Server-side transactions and concurrent writers

    Commit, rollback on error, panic, cancellation or a dropped future,
    reads that bypass the open transaction, and writers racing on one row.
*/

mod common;

use common::TestCatalog;
use datastore_core::datastore::model::{
    ChainMetadata, ChainMetadataKey, ContractMetadataKey, Record,
};
use datastore_core::datastore::{GetOptions, UpdateOptions};
use datastore_core::test_utils::{assert_cancelled, assert_not_found, TestAddressRefBuilder};
use datastore_core::{
    CatalogDataStore, Context, DataStore, StoreError, StoreResult, TransactionalDataStore,
};
use serde_json::{json, Value};
use std::time::Duration;

async fn wait_until_released(catalog: &TestCatalog) {
    for _ in 0..100 {
        if catalog.open_transactions() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} transactions still open", catalog.open_transactions());
}

#[tokio::test]
async fn test_commit_publishes_every_kind() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let ctx = Context::background();
    let record = TestAddressRefBuilder::new(1).build();

    let written = record.clone();
    store
        .with_transaction(&ctx, |tx| async move {
            let ctx = Context::background();
            tx.addresses().add(&ctx, written).await?;
            tx.chain_metadata()
                .add(&ctx, ChainMetadata::new(1, Some(json!({"name": "Ethereum"}))))
                .await?;
            tx.env_metadata()
                .set(&ctx, Some(json!({"env": "prod"})), UpdateOptions::default())
                .await
        })
        .await
        .unwrap();

    assert_eq!(store.addresses().fetch(&ctx).await.unwrap(), vec![record]);
    assert_eq!(store.chain_metadata().fetch(&ctx).await.unwrap().len(), 1);
    assert!(store.env_metadata().get(&ctx, GetOptions::default()).await.is_ok());
    assert_eq!(catalog.open_transactions(), 0);
}

#[tokio::test]
async fn test_error_rolls_back() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let ctx = Context::background();
    let record = TestAddressRefBuilder::new(1).build();

    let written = record.clone();
    let err = store
        .with_transaction(&ctx, |tx| async move {
            tx.addresses().add(&Context::background(), written).await?;
            Err::<(), _>(StoreError::InvalidArgument("abandon".into()))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::InvalidArgument(ref m) if m == "abandon"));
    assert_not_found(
        store
            .addresses()
            .get(&ctx, &record.key(), GetOptions::default())
            .await,
    );
    assert_eq!(catalog.open_transactions(), 0);
}

#[tokio::test]
#[allow(unreachable_code)]
async fn test_panic_rolls_back_and_resumes() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let record = TestAddressRefBuilder::new(1).build();

    let tx_store = store.clone();
    let written = record.clone();
    let joined = tokio::spawn(async move {
        tx_store
            .with_transaction(&Context::background(), |tx| async move {
                tx.addresses().add(&Context::background(), written).await?;
                panic!("transaction body failed");
                Ok::<(), StoreError>(())
            })
            .await
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    assert_not_found(
        store
            .addresses()
            .get(&Context::background(), &record.key(), GetOptions::default())
            .await,
    );
    assert_eq!(catalog.open_transactions(), 0);
}

#[tokio::test]
async fn test_cancellation_rolls_back() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let ctx = Context::background();
    let record = TestAddressRefBuilder::new(1).build();

    let body_ctx = ctx.clone();
    let written = record.clone();
    let result = store
        .with_transaction(&ctx, move |tx| async move {
            tx.addresses().add(&body_ctx, written).await?;
            body_ctx.cancel();
            std::future::pending::<StoreResult<()>>().await
        })
        .await;

    assert_cancelled(result);
    let fresh = Context::background();
    assert_not_found(
        store
            .addresses()
            .get(&fresh, &record.key(), GetOptions::default())
            .await,
    );
    assert_eq!(catalog.open_transactions(), 0);
}

#[tokio::test]
async fn test_dropped_future_rolls_back_and_frees_writers() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let record = TestAddressRefBuilder::new(1).build();

    let written = record.clone();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        store.with_transaction(&Context::background(), |tx| async move {
            tx.addresses().add(&Context::background(), written).await?;
            std::future::pending::<StoreResult<()>>().await
        }),
    )
    .await;
    assert!(abandoned.is_err());

    wait_until_released(&catalog).await;
    let other = catalog.store();
    let ctx = Context::background();
    other
        .chain_metadata()
        .add(&ctx, ChainMetadata::new(2, None))
        .await
        .unwrap();
    assert_not_found(
        other
            .addresses()
            .get(&ctx, &record.key(), GetOptions::default())
            .await,
    );
}

#[tokio::test]
async fn test_begin_refused_on_cancelled_context() {
    let catalog = TestCatalog::new();
    let ctx = Context::background();
    ctx.cancel();

    let result = catalog
        .store()
        .with_transaction(&ctx, |_tx| async move { Ok(()) })
        .await;

    assert_cancelled(result);
    assert_eq!(catalog.open_transactions(), 0);
}

#[tokio::test]
async fn test_ignore_transaction_reads_committed_state() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let ctx = Context::background();
    let key = ChainMetadataKey::new(7);

    store
        .with_transaction(&ctx, |tx| async move {
            let ctx = Context::background();
            tx.chain_metadata()
                .add(&ctx, ChainMetadata::new(7, Some(json!("pending"))))
                .await?;

            // Visible inside, invisible to committed-state reads
            tx.chain_metadata().get(&ctx, &key, GetOptions::default()).await?;
            let outside = tx
                .chain_metadata()
                .get(&ctx, &key, GetOptions::ignore_transaction())
                .await;
            assert!(outside.unwrap_err().is_not_found());
            Ok(())
        })
        .await
        .unwrap();

    let committed = store
        .chain_metadata()
        .get(&ctx, &key, GetOptions::ignore_transaction())
        .await
        .unwrap();
    assert_eq!(committed.metadata, Some(json!("pending")));
}

#[tokio::test]
async fn test_nested_transaction_joins_outer() {
    let catalog = TestCatalog::new();
    let store = catalog.store();
    let ctx = Context::background();

    let outer_id = store
        .with_transaction(&ctx, |tx| async move {
            let outer = tx.transaction_id().cloned();
            let inner = tx
                .with_transaction(&Context::background(), |nested| async move {
                    Ok(nested.transaction_id().cloned())
                })
                .await?;
            assert_eq!(inner, outer);
            Ok(outer)
        })
        .await
        .unwrap();

    assert!(outer_id.is_some());
    assert!(store.transaction_id().is_none());
    assert_eq!(catalog.open_transactions(), 0);
}

fn append_owner(latest: Option<Value>, incoming: Option<Value>) -> StoreResult<Option<Value>> {
    let mut owners = latest
        .and_then(|v| v.get("owners").and_then(Value::as_array).cloned())
        .unwrap_or_default();
    if let Some(extra) = incoming.and_then(|v| v.get("owners").and_then(Value::as_array).cloned()) {
        owners.extend(extra);
    }
    Ok(Some(json!({ "owners": owners })))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_lose_nothing() {
    const WRITERS: u64 = 8;
    let catalog = TestCatalog::new();
    // Default retry limit
    let store: CatalogDataStore = catalog.store();
    let key = ContractMetadataKey::new(1, "0xabc");

    let mut handles = Vec::new();
    for owner in 0..WRITERS {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .contract_metadata()
                .upsert(
                    &Context::background(),
                    &key,
                    Some(json!({ "owners": [owner] })),
                    UpdateOptions::with_updater(append_owner),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = store
        .contract_metadata()
        .get(&Context::background(), &key, GetOptions::default())
        .await
        .unwrap();
    let mut owners: Vec<u64> = record.metadata.unwrap()["owners"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    owners.sort_unstable();
    assert_eq!(owners, (0..WRITERS).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_sequential_handles_last_write_wins() {
    let catalog = TestCatalog::new();
    let first = catalog.store();
    let second = catalog.store();
    let ctx = Context::background();
    let key = ChainMetadataKey::new(1);

    first
        .chain_metadata()
        .upsert(&ctx, &key, Some(json!("first")), UpdateOptions::default())
        .await
        .unwrap();
    let seen = first.catalog_chain_metadata().observed_version(&key).unwrap();

    second
        .chain_metadata()
        .upsert(&ctx, &key, Some(json!("second")), UpdateOptions::default())
        .await
        .unwrap();
    // The first handle's remembered version is stale, but its next write
    // re-reads and still succeeds
    first
        .chain_metadata()
        .upsert(&ctx, &key, Some(json!("third")), UpdateOptions::default())
        .await
        .unwrap();

    let record = second
        .chain_metadata()
        .get(&ctx, &key, GetOptions::default())
        .await
        .unwrap();
    assert_eq!(record.metadata, Some(json!("third")));
    assert!(first.catalog_chain_metadata().observed_version(&key).unwrap() > seen);
}
