pub mod chain;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod records;
pub mod registry;
pub mod retry;
pub mod serde_utils;
pub mod task;

pub use config::*;
pub use records::*;
pub use registry::*;
pub use retry::RetryPolicy;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub fn utcnow_sec() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Millis since the unix epoch.
pub fn utcnow_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}
