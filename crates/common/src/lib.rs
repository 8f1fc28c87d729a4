//! Shared error types and utilities used across the workspace.

pub mod error;

pub use error::{Error, FromMessage, Result};

impl_context!();
