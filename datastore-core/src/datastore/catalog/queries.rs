/*
    queries.rs - SQL for catalog operations

    Every function here runs synchronously against a connection that the
    caller has already placed in the right transaction state. All rows are
    scoped by the request's (domain, environment) selector.
*/

use super::protocol::{CatalogOp, CatalogReply, EditSemantics, Selector, Versioned};
use crate::datastore::errors::{EntityKind, StoreError, StoreResult};
use crate::datastore::model::{
    AddressRef, AddressRefKey, ChainMetadata, ChainMetadataKey, ContractMetadata,
    ContractMetadataKey, EnvMetadata, LabelSet, Metadata, MetadataRecord, Record,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use semver::Version;
use std::time::{SystemTime, UNIX_EPOCH};

const ENV_SINGLETON_ID: &str = "singleton";

/// Layout of a metadata-bearing table
struct MetadataTable {
    name: &'static str,
    kind: EntityKind,
    key_columns: &'static [&'static str],
}

const CHAIN_METADATA: MetadataTable = MetadataTable {
    name: "chain_metadata",
    kind: EntityKind::ChainMetadata,
    key_columns: &["chain_selector"],
};

const CONTRACT_METADATA: MetadataTable = MetadataTable {
    name: "contract_metadata",
    kind: EntityKind::ContractMetadata,
    key_columns: &["chain_selector", "address"],
};

const ENV_METADATA: MetadataTable = MetadataTable {
    name: "environment_metadata",
    kind: EntityKind::EnvMetadata,
    key_columns: &["id"],
};

impl MetadataTable {
    fn key_predicate(&self) -> String {
        let mut clause = String::from("domain = ?1 AND environment = ?2");
        for (i, column) in self.key_columns.iter().enumerate() {
            clause.push_str(&format!(" AND {} = ?{}", column, i + 3));
        }
        clause
    }

    fn scoped(selector: &Selector, key: &[String]) -> Vec<String> {
        let mut values = vec![selector.domain.clone(), selector.environment.clone()];
        values.extend(key.iter().cloned());
        values
    }

    fn get(
        &self,
        conn: &Connection,
        selector: &Selector,
        key: &[String],
    ) -> StoreResult<Option<(Metadata, u64)>> {
        let sql = format!(
            "SELECT metadata, row_version FROM {} WHERE {}",
            self.name,
            self.key_predicate()
        );
        let row = conn
            .query_row(&sql, params_from_iter(Self::scoped(selector, key)), |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;

        row.map(|(metadata, version)| Ok((decode_metadata(metadata)?, version as u64)))
            .transpose()
    }

    /// Every row as (key values, metadata, row version)
    fn list(
        &self,
        conn: &Connection,
        selector: &Selector,
    ) -> StoreResult<Vec<(Vec<String>, Metadata, u64)>> {
        let columns = self.key_columns.join(", ");
        let sql = format!(
            "SELECT {}, metadata, row_version FROM {} WHERE domain = ?1 AND environment = ?2 ORDER BY {}",
            columns, self.name, columns
        );
        let width = self.key_columns.len();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![selector.domain, selector.environment], |row| {
                let mut key = Vec::with_capacity(width);
                for i in 0..width {
                    key.push(row.get::<_, String>(i)?);
                }
                Ok((
                    key,
                    row.get::<_, Option<String>>(width)?,
                    row.get::<_, i64>(width + 1)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, metadata, version)| Ok((key, decode_metadata(metadata)?, version as u64)))
            .collect()
    }

    /// Compare-and-write one row, returning its new row version
    ///
    /// `expected` is the row version the writer observed, `None` meaning it
    /// observed no row at all.
    #[allow(clippy::too_many_arguments)]
    fn edit(
        &self,
        conn: &Connection,
        selector: &Selector,
        key: &[String],
        display_key: &str,
        metadata: &Metadata,
        semantics: EditSemantics,
        expected: Option<u64>,
    ) -> StoreResult<u64> {
        let current = self.get(conn, selector, key)?.map(|(_, version)| version);

        match (semantics, current) {
            (EditSemantics::Insert, Some(_)) => return Err(self.kind.already_exists(display_key)),
            (EditSemantics::Update, None) => return Err(self.kind.not_found(display_key)),
            (EditSemantics::Insert, None) => {}
            (_, current) if current != expected => {
                return Err(StoreError::Conflict(format!(
                    "{} {} is at row version {:?}, write expected {:?}",
                    self.kind.describe(),
                    display_key,
                    current,
                    expected
                )));
            }
            _ => {}
        }

        let encoded = encode_metadata(metadata)?;
        let now = now_millis();
        let mut values = Self::scoped(selector, key);

        match current {
            None => {
                let columns = self.key_columns.join(", ");
                let placeholders: Vec<String> =
                    (0..values.len()).map(|i| format!("?{}", i + 1)).collect();
                let sql = format!(
                    "INSERT INTO {} (domain, environment, {}, metadata, row_version, updated_at) VALUES ({}, ?{}, 1, ?{})",
                    self.name,
                    columns,
                    placeholders.join(", "),
                    values.len() + 1,
                    values.len() + 2
                );
                let mut bound: Vec<rusqlite::types::Value> =
                    values.drain(..).map(rusqlite::types::Value::from).collect();
                bound.push(encoded.into());
                bound.push(now.into());
                conn.execute(&sql, params_from_iter(bound))?;
                Ok(1)
            }
            Some(version) => {
                let next = version + 1;
                let sql = format!(
                    "UPDATE {} SET metadata = ?{}, row_version = ?{}, updated_at = ?{} WHERE {}",
                    self.name,
                    values.len() + 1,
                    values.len() + 2,
                    values.len() + 3,
                    self.key_predicate()
                );
                let mut bound: Vec<rusqlite::types::Value> =
                    values.drain(..).map(rusqlite::types::Value::from).collect();
                bound.push(encoded.into());
                bound.push((next as i64).into());
                bound.push(now.into());
                conn.execute(&sql, params_from_iter(bound))?;
                Ok(next)
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn encode_metadata(metadata: &Metadata) -> StoreResult<Option<String>> {
    metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn decode_metadata(column: Option<String>) -> StoreResult<Metadata> {
    column
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| StoreError::Storage(format!("corrupt metadata column: {}", e)))
}

fn parse_chain_selector(text: &str) -> StoreResult<u64> {
    text.parse()
        .map_err(|e| StoreError::Storage(format!("corrupt chain selector {:?}: {}", text, e)))
}

fn chain_key(key: &ChainMetadataKey) -> Vec<String> {
    vec![key.chain_selector.to_string()]
}

fn contract_key(key: &ContractMetadataKey) -> Vec<String> {
    vec![key.chain_selector.to_string(), key.address.clone()]
}

fn env_key() -> Vec<String> {
    vec![ENV_SINGLETON_ID.to_string()]
}

/// Raw address reference row before decoding
struct AddressRow {
    chain_selector: String,
    contract_type: String,
    version: String,
    qualifier: String,
    address: String,
    label_set: String,
}

impl AddressRow {
    const COLUMNS: &'static str =
        "chain_selector, contract_type, version, qualifier, address, label_set";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(AddressRow {
            chain_selector: row.get(0)?,
            contract_type: row.get(1)?,
            version: row.get(2)?,
            qualifier: row.get(3)?,
            address: row.get(4)?,
            label_set: row.get(5)?,
        })
    }

    fn decode(self) -> StoreResult<AddressRef> {
        let version = Version::parse(&self.version).map_err(|e| {
            StoreError::Storage(format!("corrupt version {:?}: {}", self.version, e))
        })?;
        let labels: LabelSet = serde_json::from_str(&self.label_set)
            .map_err(|e| StoreError::Storage(format!("corrupt label set: {}", e)))?;

        Ok(AddressRef {
            address: self.address,
            chain_selector: parse_chain_selector(&self.chain_selector)?,
            contract_type: self.contract_type,
            version,
            qualifier: self.qualifier,
            labels,
        })
    }
}

fn get_address_ref(
    conn: &Connection,
    selector: &Selector,
    key: &AddressRefKey,
) -> StoreResult<Option<AddressRef>> {
    let sql = format!(
        "SELECT {} FROM address_references
         WHERE domain = ?1 AND environment = ?2 AND chain_selector = ?3
           AND contract_type = ?4 AND version = ?5 AND qualifier = ?6",
        AddressRow::COLUMNS
    );
    conn.query_row(
        &sql,
        params![
            selector.domain,
            selector.environment,
            key.chain_selector.to_string(),
            key.contract_type,
            key.version.to_string(),
            key.qualifier,
        ],
        AddressRow::from_row,
    )
    .optional()?
    .map(AddressRow::decode)
    .transpose()
}

fn list_address_refs(conn: &Connection, selector: &Selector) -> StoreResult<Vec<AddressRef>> {
    let sql = format!(
        "SELECT {} FROM address_references WHERE domain = ?1 AND environment = ?2
         ORDER BY chain_selector, contract_type, version, qualifier",
        AddressRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![selector.domain, selector.environment],
            AddressRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(AddressRow::decode).collect()
}

fn edit_address_ref(
    conn: &Connection,
    selector: &Selector,
    record: &AddressRef,
    semantics: EditSemantics,
) -> StoreResult<u64> {
    let key = record.key();
    let exists = get_address_ref(conn, selector, &key)?.is_some();
    match semantics {
        EditSemantics::Insert if exists => {
            return Err(EntityKind::AddressRef.already_exists(&key))
        }
        EditSemantics::Update if !exists => return Err(EntityKind::AddressRef.not_found(&key)),
        _ => {}
    }

    let labels = serde_json::to_string(&record.labels)?;
    let row_version: i64 = conn.query_row(
        "INSERT INTO address_references
            (domain, environment, chain_selector, contract_type, version, qualifier,
             address, label_set, row_version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
         ON CONFLICT(domain, environment, chain_selector, contract_type, version, qualifier)
         DO UPDATE SET address = excluded.address,
                       label_set = excluded.label_set,
                       row_version = address_references.row_version + 1,
                       updated_at = excluded.updated_at
         RETURNING row_version",
        params![
            selector.domain,
            selector.environment,
            record.chain_selector.to_string(),
            record.contract_type,
            record.version.to_string(),
            record.qualifier,
            record.address,
            labels,
            now_millis(),
        ],
        |row| row.get(0),
    )?;
    Ok(row_version as u64)
}

fn versioned<R: MetadataRecord>(
    key: R::Key,
    row: Option<(Metadata, u64)>,
) -> StoreResult<Versioned<R>> {
    match row {
        Some((metadata, row_version)) => Ok(Versioned {
            record: R::from_parts(key, metadata),
            row_version,
        }),
        None => Err(R::KIND.not_found(&key)),
    }
}

/// Execute a data operation; transaction control is handled by the caller
pub(crate) fn apply(conn: &Connection, selector: &Selector, op: CatalogOp) -> StoreResult<CatalogReply> {
    match op {
        CatalogOp::BeginTransaction
        | CatalogOp::CommitTransaction
        | CatalogOp::RollbackTransaction => Err(StoreError::Internal(
            "transaction control reached the query layer".to_string(),
        )),

        CatalogOp::GetAddressRef { key } => get_address_ref(conn, selector, &key)?
            .map(CatalogReply::AddressRef)
            .ok_or_else(|| EntityKind::AddressRef.not_found(&key)),
        CatalogOp::ListAddressRefs => Ok(CatalogReply::AddressRefs(list_address_refs(
            conn, selector,
        )?)),
        CatalogOp::EditAddressRef { record, semantics } => {
            let row_version = edit_address_ref(conn, selector, &record, semantics)?;
            Ok(CatalogReply::Written { row_version })
        }

        CatalogOp::GetChainMetadata { key } => {
            let row = CHAIN_METADATA.get(conn, selector, &chain_key(&key))?;
            Ok(CatalogReply::ChainMetadata(versioned::<ChainMetadata>(key, row)?))
        }
        CatalogOp::ListChainMetadata => {
            let rows = CHAIN_METADATA
                .list(conn, selector)?
                .into_iter()
                .map(|(key, metadata, row_version)| {
                    let chain_selector = parse_chain_selector(&key[0])?;
                    Ok(Versioned {
                        record: ChainMetadata::new(chain_selector, metadata),
                        row_version,
                    })
                })
                .collect::<StoreResult<Vec<_>>>()?;
            Ok(CatalogReply::ChainMetadataList(rows))
        }
        CatalogOp::EditChainMetadata {
            record,
            semantics,
            row_version,
        } => {
            let key = record.key();
            let row_version = CHAIN_METADATA.edit(
                conn,
                selector,
                &chain_key(&key),
                &key.to_string(),
                &record.metadata,
                semantics,
                row_version,
            )?;
            Ok(CatalogReply::Written { row_version })
        }

        CatalogOp::GetContractMetadata { key } => {
            let row = CONTRACT_METADATA.get(conn, selector, &contract_key(&key))?;
            Ok(CatalogReply::ContractMetadata(versioned::<ContractMetadata>(key, row)?))
        }
        CatalogOp::ListContractMetadata => {
            let rows = CONTRACT_METADATA
                .list(conn, selector)?
                .into_iter()
                .map(|(mut key, metadata, row_version)| {
                    let address = key.pop().unwrap_or_default();
                    let chain_selector = parse_chain_selector(&key[0])?;
                    Ok(Versioned {
                        record: ContractMetadata::new(chain_selector, address, metadata),
                        row_version,
                    })
                })
                .collect::<StoreResult<Vec<_>>>()?;
            Ok(CatalogReply::ContractMetadataList(rows))
        }
        CatalogOp::EditContractMetadata {
            record,
            semantics,
            row_version,
        } => {
            let key = record.key();
            let row_version = CONTRACT_METADATA.edit(
                conn,
                selector,
                &contract_key(&key),
                &key.to_string(),
                &record.metadata,
                semantics,
                row_version,
            )?;
            Ok(CatalogReply::Written { row_version })
        }

        CatalogOp::GetEnvMetadata => match ENV_METADATA.get(conn, selector, &env_key())? {
            Some((metadata, row_version)) => Ok(CatalogReply::EnvMetadata(Versioned {
                record: EnvMetadata::new(metadata),
                row_version,
            })),
            None => Err(StoreError::EnvMetadataNotSet),
        },
        CatalogOp::EditEnvMetadata {
            record,
            semantics,
            row_version,
        } => {
            let row_version = ENV_METADATA.edit(
                conn,
                selector,
                &env_key(),
                ENV_SINGLETON_ID,
                &record.metadata,
                semantics,
                row_version,
            )?;
            Ok(CatalogReply::Written { row_version })
        }

        CatalogOp::DeleteAddressRef { .. } => Err(StoreError::UnsupportedOperation(
            "delete not supported for address references in the catalog".to_string(),
        )),
        CatalogOp::DeleteChainMetadata { .. } => Err(StoreError::UnsupportedOperation(
            "delete not supported for chain metadata in the catalog".to_string(),
        )),
        CatalogOp::DeleteContractMetadata { .. } => Err(StoreError::UnsupportedOperation(
            "delete not supported for contract metadata in the catalog".to_string(),
        )),
    }
}
