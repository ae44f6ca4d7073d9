// Shared test support code for scenario tests.

pub mod common;
pub mod remote;

pub use common::*;
pub use remote::FlakyBackend;
