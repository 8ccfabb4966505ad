//! Foundation types for kiln.
//!
//! This crate provides the identity and value types shared by every other
//! kiln crate.
//!
//! # Key Types
//!
//! - [`Oid`]: Content-derived object identifier (SHA-1, 40 lowercase hex)
//! - [`Value`]: The artifact value model stored by analysis modules

pub mod error;
pub mod oid;
pub mod value;

pub use error::TypeError;
pub use oid::Oid;
pub use value::Value;
