//! Assertions over store results
//!
//! Panic messages carry the actual error so failures read without a
//! debugger.

use crate::datastore::archive::DataStoreArchive;
use crate::datastore::context::Context;
use crate::datastore::errors::{StoreError, StoreResult};
use crate::datastore::store::DataStore;
use std::fmt::Debug;

/// Assert that a Result is Ok and return the value
pub fn assert_ok<T, E: Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

fn expect_err<T: Debug>(result: StoreResult<T>, what: &str, check: fn(&StoreError) -> bool) -> StoreError {
    match result {
        Ok(value) => panic!("Expected {}, got Ok: {:?}", what, value),
        Err(e) if check(&e) => e,
        Err(e) => panic!("Expected {}, got: {}", what, e),
    }
}

pub fn assert_not_found<T: Debug>(result: StoreResult<T>) -> StoreError {
    expect_err(result, "not found", StoreError::is_not_found)
}

pub fn assert_already_exists<T: Debug>(result: StoreResult<T>) -> StoreError {
    expect_err(result, "already exists", StoreError::is_already_exists)
}

pub fn assert_unsupported<T: Debug>(result: StoreResult<T>) -> StoreError {
    expect_err(result, "unsupported operation", StoreError::is_unsupported)
}

pub fn assert_cancelled<T: Debug>(result: StoreResult<T>) -> StoreError {
    expect_err(result, "cancelled", StoreError::is_cancelled)
}

/// Assert that two stores hold exactly the same records
pub async fn assert_same_contents<A, B>(ctx: &Context, left: &A, right: &B)
where
    A: DataStore + ?Sized,
    B: DataStore + ?Sized,
{
    let left = assert_ok(DataStoreArchive::capture(ctx, left).await);
    let right = assert_ok(DataStoreArchive::capture(ctx, right).await);
    assert_eq!(left, right, "stores differ");
}
