//! Test utilities shared by unit and integration tests
//!
//! Record builders and assertions over store errors.

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;
