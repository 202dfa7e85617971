/*
    model - Record and key types

    Four record kinds live in a data store:
    - AddressRef: a deployed contract instance
    - ChainMetadata: per-chain metadata
    - ContractMetadata: per-contract-instance metadata
    - EnvMetadata: singleton environment metadata
*/

pub mod address_ref;
pub mod labels;
pub mod metadata;

pub use address_ref::{AddressRef, AddressRefKey};
pub use labels::LabelSet;
pub use metadata::{
    ChainMetadata, ChainMetadataKey, ContractMetadata, ContractMetadataKey, EnvMetadata,
};

use super::errors::EntityKind;
use serde::{Deserialize, Deserializer};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Opaque caller-defined metadata
///
/// `None` means the record carries no metadata at all; `Some(Value::Null)`
/// means the caller explicitly stored JSON `null`.
pub type Metadata = Option<serde_json::Value>;

/// A record with a derivable unique key
pub trait Record: Clone + Debug + Send + Sync + 'static {
    type Key: Clone + Debug + Eq + Ord + Hash + Display + Send + Sync + 'static;

    const KIND: EntityKind;

    fn key(&self) -> Self::Key;
}

/// A keyed record whose only mutable payload is its metadata
pub trait MetadataRecord: Record {
    fn metadata(&self) -> &Metadata;

    fn from_parts(key: Self::Key, metadata: Metadata) -> Self;
}

/// Deserialize a present field as `Some`, including an explicit `null`
///
/// Combined with `#[serde(default)]` this keeps "field missing" and
/// "field is null" apart.
pub(crate) fn deserialize_present<'de, D>(deserializer: D) -> Result<Metadata, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}
