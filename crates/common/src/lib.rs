//! Common utilities and types shared across the registry components.

pub mod error;
pub mod logging;

pub use error::{Error, Result, ResultExt};
