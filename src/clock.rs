//! Time helpers shared by the pipeline tasks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock unix time in milliseconds
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
