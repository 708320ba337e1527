//! Crate-wide error type, result alias, logging setup

pub mod error;
pub mod logging;
pub mod types;

pub use error::Error;
pub use types::*;
