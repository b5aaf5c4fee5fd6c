//! Core types and error handling for RaftForge.
//!
//! This crate holds the small vocabulary shared by every layer of the
//! system: identifier aliases, the replica role, and the error taxonomy
//! surfaced to task submitters.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
