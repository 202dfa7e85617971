/*
    filter.rs - Composable filters over fetched records

    A filter takes a fetched collection and returns a (possibly) narrower
    one. Filters are applied left to right and never touch the store.
*/

use super::model::{AddressRef, ChainMetadata, ContractMetadata};
use semver::Version;
use std::sync::Arc;

/// A pure transformation over a fetched record collection
pub type FilterFunc<R> = Arc<dyn Fn(Vec<R>) -> Vec<R> + Send + Sync>;

/// Apply each filter in order; no filters returns the input unchanged
pub fn apply_filters<R>(records: Vec<R>, filters: &[FilterFunc<R>]) -> Vec<R> {
    filters.iter().fold(records, |records, filter| filter(records))
}

/// Lift a per-record predicate into a filter
pub fn predicate<R, P>(keep: P) -> FilterFunc<R>
where
    R: 'static,
    P: Fn(&R) -> bool + Send + Sync + 'static,
{
    Arc::new(move |records: Vec<R>| records.into_iter().filter(|r| keep(r)).collect())
}

pub fn address_ref_by_chain(chain_selector: u64) -> FilterFunc<AddressRef> {
    predicate(move |r: &AddressRef| r.chain_selector == chain_selector)
}

pub fn address_ref_by_type(contract_type: impl Into<String>) -> FilterFunc<AddressRef> {
    let contract_type = contract_type.into();
    predicate(move |r: &AddressRef| r.contract_type == contract_type)
}

pub fn address_ref_by_version(version: Version) -> FilterFunc<AddressRef> {
    predicate(move |r: &AddressRef| r.version == version)
}

pub fn address_ref_by_qualifier(qualifier: impl Into<String>) -> FilterFunc<AddressRef> {
    let qualifier = qualifier.into();
    predicate(move |r: &AddressRef| r.qualifier == qualifier)
}

/// Case-sensitive match on the deployed address
pub fn address_ref_by_address(address: impl Into<String>) -> FilterFunc<AddressRef> {
    let address = address.into();
    predicate(move |r: &AddressRef| r.address == address)
}

pub fn address_ref_by_label(label: impl Into<String>) -> FilterFunc<AddressRef> {
    let label = label.into();
    predicate(move |r: &AddressRef| r.labels.contains(&label))
}

pub fn chain_metadata_by_chain(chain_selector: u64) -> FilterFunc<ChainMetadata> {
    predicate(move |r: &ChainMetadata| r.chain_selector == chain_selector)
}

pub fn contract_metadata_by_chain(chain_selector: u64) -> FilterFunc<ContractMetadata> {
    predicate(move |r: &ContractMetadata| r.chain_selector == chain_selector)
}

pub fn contract_metadata_by_address(address: impl Into<String>) -> FilterFunc<ContractMetadata> {
    let address = address.into();
    predicate(move |r: &ContractMetadata| r.address == address)
}
