//! # sipdiag-types
//!
//! Shared types, errors, and configuration structures for the sipdiag
//! SIP dialog analyzer.
//!
//! This crate provides the foundational types used across all sipdiag
//! components, ensuring consistent data representation and serialization.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod config;
pub mod error;

pub use address::Address;
pub use error::{Error, Result};
