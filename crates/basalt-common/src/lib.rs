//! # basalt-common
//!
//! Shared identifier types and system-wide constants for BasaltDB.
//!
//! This crate has no dependencies on the rest of the system so every
//! other crate can use its types without pulling in storage or WAL
//! machinery.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// System-wide constants
pub mod constants;

/// Core identifier types
pub mod types;
