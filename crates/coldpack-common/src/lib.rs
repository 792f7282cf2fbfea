//! coldpack common - shared types and utilities
//!
//! Error taxonomy, configuration, identifiers, checksums and the clock used
//! by every coldpack crate.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
