/*
    updater.rs - Metadata reconciliation on update, upsert and set

    An updater turns (latest stored metadata, incoming metadata) into the
    metadata that gets persisted. The default replaces wholesale.
*/

use super::errors::{StoreError, StoreResult};
use super::model::Metadata;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::marker::PhantomData;

/// Merge strategy applied when metadata is written over existing metadata
pub trait MetadataUpdater: Send + Sync {
    fn update(&self, latest: Metadata, incoming: Metadata) -> StoreResult<Metadata>;
}

/// Returns the incoming metadata and discards the stored value
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceUpdater;

impl MetadataUpdater for ReplaceUpdater {
    fn update(&self, _latest: Metadata, incoming: Metadata) -> StoreResult<Metadata> {
        Ok(incoming)
    }
}

/// Applies the incoming value as an RFC 7396 JSON merge patch
///
/// Object members present in the patch overwrite stored members, `null`
/// members delete them, and any non-object patch replaces the whole value.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePatchUpdater;

impl MetadataUpdater for MergePatchUpdater {
    fn update(&self, latest: Metadata, incoming: Metadata) -> StoreResult<Metadata> {
        match (latest, incoming) {
            (latest, None) => Ok(latest),
            (None, Some(patch)) => Ok(Some(merge_patch(Value::Null, patch))),
            (Some(target), Some(patch)) => Ok(Some(merge_patch(target, patch))),
        }
    }
}

fn merge_patch(target: Value, patch: Value) -> Value {
    let Value::Object(patch) = patch else {
        return patch;
    };

    let mut merged = match target {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (name, value) in patch {
        if value.is_null() {
            merged.remove(&name);
        } else {
            let current = merged.remove(&name).unwrap_or(Value::Null);
            merged.insert(name, merge_patch(current, value));
        }
    }
    Value::Object(merged)
}

impl<F> MetadataUpdater for F
where
    F: Fn(Metadata, Metadata) -> StoreResult<Metadata> + Send + Sync,
{
    fn update(&self, latest: Metadata, incoming: Metadata) -> StoreResult<Metadata> {
        self(latest, incoming)
    }
}

/// Adapts a function over a caller-defined metadata type
///
/// Stored and incoming JSON are decoded into `T` before `F` runs, and the
/// result is encoded back. Absent metadata decodes as `None`.
pub struct TypedUpdater<T, F> {
    merge: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypedUpdater<T, F>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Option<T>, T) -> T + Send + Sync,
{
    pub fn new(merge: F) -> Self {
        TypedUpdater {
            merge,
            _marker: PhantomData,
        }
    }
}

impl<T, F> MetadataUpdater for TypedUpdater<T, F>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Option<T>, T) -> T + Send + Sync,
{
    fn update(&self, latest: Metadata, incoming: Metadata) -> StoreResult<Metadata> {
        let Some(incoming) = incoming else {
            return Ok(latest);
        };
        let incoming: T = serde_json::from_value(incoming).map_err(|e| {
            StoreError::InvalidArgument(format!("incoming metadata has unexpected shape: {}", e))
        })?;
        let latest: Option<T> = latest
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                StoreError::InvalidArgument(format!("stored metadata has unexpected shape: {}", e))
            })?;

        let merged = (self.merge)(latest, incoming);
        Ok(Some(serde_json::to_value(merged)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_replace_discards_latest() {
        let merged = ReplaceUpdater
            .update(Some(json!({"name": "Ethereum"})), Some(json!({"decimals": 6})))
            .unwrap();
        assert_eq!(merged, Some(json!({"decimals": 6})));
    }

    #[test]
    fn test_replace_with_absent_clears() {
        let merged = ReplaceUpdater.update(Some(json!(1)), None).unwrap();
        assert_eq!(merged, None);
    }

    #[test]
    fn test_merge_patch() {
        let merged = MergePatchUpdater
            .update(
                Some(json!({"name": "Ethereum", "rpc": {"a": 1, "b": 2}, "old": true})),
                Some(json!({"decimals": 6, "rpc": {"b": null, "c": 3}, "old": null})),
            )
            .unwrap();
        assert_eq!(
            merged,
            Some(json!({"name": "Ethereum", "decimals": 6, "rpc": {"a": 1, "c": 3}}))
        );
    }

    #[test]
    fn test_merge_patch_scalar_replaces() {
        let merged = MergePatchUpdater
            .update(Some(json!({"a": 1})), Some(json!([1, 2])))
            .unwrap();
        assert_eq!(merged, Some(json!([1, 2])));
    }

    #[test]
    fn test_closure_updater() {
        let concat = |latest: Metadata, incoming: Metadata| -> StoreResult<Metadata> {
            let mut items = latest
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            items.extend(incoming.and_then(|v| v.as_array().cloned()).unwrap_or_default());
            Ok(Some(Value::Array(items)))
        };
        let merged = concat.update(Some(json!([1])), Some(json!([2]))).unwrap();
        assert_eq!(merged, Some(json!([1, 2])));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Deployment {
        owners: Vec<String>,
        paused: bool,
    }

    #[test]
    fn test_typed_updater_concatenates_lists() {
        let updater = TypedUpdater::new(|latest: Option<Deployment>, incoming: Deployment| {
            let mut owners = latest.map(|d| d.owners).unwrap_or_default();
            owners.extend(incoming.owners);
            Deployment {
                owners,
                paused: incoming.paused,
            }
        });

        let merged = updater
            .update(
                Some(json!({"owners": ["a"], "paused": false})),
                Some(json!({"owners": ["b"], "paused": true})),
            )
            .unwrap();
        assert_eq!(merged, Some(json!({"owners": ["a", "b"], "paused": true})));
    }

    #[test]
    fn test_typed_updater_rejects_wrong_shape() {
        let updater = TypedUpdater::new(|_: Option<Deployment>, incoming: Deployment| incoming);
        let err = updater.update(None, Some(json!("nope"))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
