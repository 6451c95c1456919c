//! # apilint-core
//!
//! Shared kernel for the apilint linting pipeline.
//!
//! This crate holds the pieces every other component depends on:
//!
//! - **Identifiers**: strongly-typed UUID wrappers that prevent mixing up
//!   task, ruleset, and executor ids at compile time
//! - **Errors**: the shared error type plus the structured wire shape
//!   surfaced at the HTTP boundary
//! - **Observability**: logging initialization and span constructors used
//!   consistently across worker processes

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, ErrorBody, ErrorCode, Result};
pub use id::{DocTaskId, ExecutorId, RulesetId, VersionTaskId};
