//! Option handling for kiln modules.
//!
//! Each module declares an [`OptionSchema`]: for every option its type,
//! default, and whether it is a *mangle* option. Mangle options that differ
//! from their default form the artifact [fingerprint](fingerprint); all
//! other options leave the storage key untouched.
//!
//! - [`schema`]: [`OptSpec`], [`OptType`], and [`OptionSchema`] with full and
//!   mangle-only validation
//! - [`fingerprint`]: canonical encoding of the non-default mangle subset

pub mod error;
pub mod fingerprint;
pub mod schema;

pub use error::{OptionError, OptionResult};
pub use fingerprint::fingerprint;
pub use schema::{OptSpec, OptType, OptionSchema, Options};
