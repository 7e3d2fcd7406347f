//! Utility functions and helpers.

pub mod hash;
pub mod logging;

pub use hash::{HashCalculator, HashingWriter};
pub use logging::{init_logging, LogConfig};
