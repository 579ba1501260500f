use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => now.as_secs().saturating_mul(1_000_000_000).saturating_add(u64::from(now.subsec_nanos())),
        Err(_) => 0,
    }
}
