/*
    merge.rs - Copying one data store into another

    Every procedure here reads all four record kinds from a source store
    and upserts them into a target inside a single target transaction:

    1. Fetch address references, chain metadata, contract metadata, then
       the environment metadata (not set is fine, that step is skipped)
    2. Upsert each record into the target with the default replace updater
    3. Set the environment metadata if the source had one

    The first failure aborts the transaction, so the target sees all of the
    source or none of it. Upserts are idempotent: merging an unchanged
    source twice leaves the target as after the first run.

    The procedures differ only in how they name the source in errors.
*/

use super::context::Context;
use super::errors::{ResultExt, StoreResult};
use super::model::Record;
use super::store::{DataStore, GetOptions, TransactionalDataStore, UpdateOptions};
use crate::metrics::{record_counter, MERGE_FAILURES, MERGE_RECORDS, MERGE_RUNS};
use tracing::{info, instrument, warn};

/// How a procedure refers to its source in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// A caller-owned scratch store being reconciled
    Local,
    /// A legacy store being migrated once
    Migration,
    /// Any other store
    Source,
}

impl SourceRole {
    pub fn describe(self) -> &'static str {
        match self {
            SourceRole::Local => "local store",
            SourceRole::Migration => "migration store",
            SourceRole::Source => "source store",
        }
    }
}

/// Counts of what a merge wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub address_refs: usize,
    pub chain_metadata: usize,
    pub contract_metadata: usize,
    pub env_metadata: bool,
}

impl MergeReport {
    pub fn total(&self) -> usize {
        self.address_refs + self.chain_metadata + self.contract_metadata + self.env_metadata as usize
    }
}

/// Push a local store into the catalog
pub async fn sync_to_catalog<S, T>(ctx: &Context, source: &S, target: &T) -> StoreResult<MergeReport>
where
    S: DataStore + ?Sized,
    T: TransactionalDataStore,
{
    merge(ctx, source, target, SourceRole::Local).await
}

/// One-shot migration of a legacy store into the catalog
pub async fn migrate_to_catalog<S, T>(ctx: &Context, source: &S, target: &T) -> StoreResult<MergeReport>
where
    S: DataStore + ?Sized,
    T: TransactionalDataStore,
{
    merge(ctx, source, target, SourceRole::Migration).await
}

/// Merge any store into the catalog
pub async fn merge_to_catalog<S, T>(ctx: &Context, source: &S, target: &T) -> StoreResult<MergeReport>
where
    S: DataStore + ?Sized,
    T: TransactionalDataStore,
{
    merge(ctx, source, target, SourceRole::Source).await
}

#[instrument(skip_all, fields(source = role.describe()))]
pub async fn merge<S, T>(
    ctx: &Context,
    source: &S,
    target: &T,
    role: SourceRole,
) -> StoreResult<MergeReport>
where
    S: DataStore + ?Sized,
    T: TransactionalDataStore,
{
    record_counter(MERGE_RUNS, 1);
    let result = target
        .with_transaction(ctx, move |tx| async move { copy_all(ctx, source, &tx, role).await })
        .await;

    match &result {
        Ok(report) => {
            record_counter(MERGE_RECORDS, report.total() as u64);
            info!(
                address_refs = report.address_refs,
                chain_metadata = report.chain_metadata,
                contract_metadata = report.contract_metadata,
                env_metadata = report.env_metadata,
                "Merge committed"
            );
        }
        Err(e) => {
            record_counter(MERGE_FAILURES, 1);
            warn!(error = %e, "Merge rolled back");
        }
    }
    result
}

async fn copy_all<S, T>(ctx: &Context, source: &S, target: &T, role: SourceRole) -> StoreResult<MergeReport>
where
    S: DataStore + ?Sized,
    T: DataStore,
{
    let from = role.describe();

    let address_refs = source
        .addresses()
        .fetch(ctx)
        .await
        .with_context(|| format!("failed to fetch address references from {}", from))?;
    let chain_metadata = source
        .chain_metadata()
        .fetch(ctx)
        .await
        .with_context(|| format!("failed to fetch chain metadata from {}", from))?;
    let contract_metadata = source
        .contract_metadata()
        .fetch(ctx)
        .await
        .with_context(|| format!("failed to fetch contract metadata from {}", from))?;
    let env_metadata = match source.env_metadata().get(ctx, GetOptions::default()).await {
        Ok(env) => Some(env),
        Err(e) if e.is_env_metadata_not_set() => None,
        Err(e) => {
            return Err(e.context(format!("failed to fetch environment metadata from {}", from)))
        }
    };

    let mut report = MergeReport::default();

    for record in address_refs {
        let key = record.key();
        target
            .addresses()
            .upsert(ctx, record)
            .await
            .with_context(|| format!("failed to upsert address reference {}", key))?;
        report.address_refs += 1;
    }

    for record in chain_metadata {
        let key = record.key();
        target
            .chain_metadata()
            .upsert(ctx, &key, record.metadata, UpdateOptions::default())
            .await
            .with_context(|| format!("failed to upsert chain metadata {}", key))?;
        report.chain_metadata += 1;
    }

    for record in contract_metadata {
        let key = record.key();
        target
            .contract_metadata()
            .upsert(ctx, &key, record.metadata, UpdateOptions::default())
            .await
            .with_context(|| format!("failed to upsert contract metadata {}", key))?;
        report.contract_metadata += 1;
    }

    if let Some(env) = env_metadata {
        target
            .env_metadata()
            .set(ctx, env.metadata, UpdateOptions::default())
            .await
            .context("failed to set environment metadata")?;
        report.env_metadata = true;
    }

    Ok(report)
}
