//! Millisecond epoch timestamps

/// Current time as a millisecond Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
