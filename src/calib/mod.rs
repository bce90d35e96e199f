//! Extrinsic bootstrap from per-sensor motion sequences.

pub mod initializer;

pub use initializer::{CalibStatistics, ExtrinsicInitializer};
