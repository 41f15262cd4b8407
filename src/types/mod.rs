//! Shared types

pub mod error;

pub use error::{DispatchError, Result};
