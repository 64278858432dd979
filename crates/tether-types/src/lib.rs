//! Core types shared across the Tether communication runtime.
//!
//! This crate contains only data structures and error types: no I/O and no
//! business logic.

pub mod config;
pub mod data_info;
pub mod error;

pub use error::{RemoteError, TetherError, TetherResult};
