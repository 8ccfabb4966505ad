//! Built-in map-reducers.

pub mod byte_frequency;

pub use byte_frequency::ByteFrequency;
