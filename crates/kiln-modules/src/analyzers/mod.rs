//! Built-in analyzers.

pub mod size_summary;

pub use size_summary::SizeSummary;
