//! Monotonic-ish timestamps and id generation, kept behind a module so the
//! rest of the engine never calls `chrono`/`uuid` directly.

/// Microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
