//! Database migrations for the catalog service
//!
//! Provides versioned migrations for the catalog schema. Each migration is
//! applied atomically and tracked in the catalog_schema_version table.

use crate::datastore::errors::StoreResult;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Current schema version for the catalog
pub const CURRENT_CATALOG_SCHEMA_VERSION: i32 = 1;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial catalog schema",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS catalog_schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );

            -- Deployed contract instances
            CREATE TABLE IF NOT EXISTS address_references (
                domain TEXT NOT NULL,
                environment TEXT NOT NULL,
                chain_selector TEXT NOT NULL,           -- u64 as decimal text
                contract_type TEXT NOT NULL,
                version TEXT NOT NULL,                  -- canonical semver
                qualifier TEXT NOT NULL,
                address TEXT NOT NULL,
                label_set TEXT NOT NULL DEFAULT '[]',   -- JSON array
                row_version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (domain, environment, chain_selector, contract_type, version, qualifier)
            );

            CREATE INDEX IF NOT EXISTS idx_address_references_address
                ON address_references(domain, environment, address);

            CREATE TABLE IF NOT EXISTS contract_metadata (
                domain TEXT NOT NULL,
                environment TEXT NOT NULL,
                chain_selector TEXT NOT NULL,
                address TEXT NOT NULL,
                metadata TEXT,                          -- JSON; NULL when absent
                row_version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (domain, environment, chain_selector, address)
            );

            CREATE TABLE IF NOT EXISTS chain_metadata (
                domain TEXT NOT NULL,
                environment TEXT NOT NULL,
                chain_selector TEXT NOT NULL,
                metadata TEXT,
                row_version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (domain, environment, chain_selector)
            );

            CREATE TABLE IF NOT EXISTS environment_metadata (
                domain TEXT NOT NULL,
                environment TEXT NOT NULL,
                id TEXT NOT NULL CHECK(id = 'singleton'),
                metadata TEXT,
                row_version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (domain, environment, id)
            );
        "#,
    }]
}

/// Get current schema version from database
fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> StoreResult<i32> {
    let conn = pool.get()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS catalog_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM catalog_schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> StoreResult<()> {
    let current_version = get_current_version(pool)?;
    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;
    for migration in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        tx.execute(
            "INSERT INTO catalog_schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, now],
        )?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied catalog migration"
        );
    }

    Ok(())
}

/// Get the latest migration version available
pub fn get_latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}
