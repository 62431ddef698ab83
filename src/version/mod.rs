//! Version parsing and comparison for agent releases.
//!
//! See [`comparison`] for the ordering rules.

pub mod comparison;

pub use comparison::{Version, VersionComparator, compare_versions};
