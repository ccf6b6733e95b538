//! Core types for funcsim
//!
//! This crate provides the error taxonomy, environment staging, and
//! credential resolution shared by the funcsim runtime and CLI.

pub mod credentials;
pub mod env;
pub mod error;
pub mod invoke_id;

pub use credentials::load_credentials;
pub use env::{EnvSnapshot, StagedEnv};
pub use error::{ErrorKind, InvokeError};
pub use invoke_id::InvokeId;
