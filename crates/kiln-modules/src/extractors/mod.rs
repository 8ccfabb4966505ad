//! Built-in extractors.

pub mod byte_histogram;
pub mod entropy;

pub use byte_histogram::ByteHistogram;
pub use entropy::Entropy;
