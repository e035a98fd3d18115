//! Timestamp and id helpers shared by the trace layer.

use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Unix-epoch seconds with millisecond precision, as stored in the
/// `started_at`/`ended_at`/`created_at` trace columns.
pub fn now_epoch_secs() -> f64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    millis as f64 / 1000.0
}

/// Generates a task id for runtimes that have no upstream id to carry.
pub fn new_task_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_epoch_secs_is_recent() {
        let now = now_epoch_secs();
        // Well past 2020, well before year 3000.
        assert!(now > 1_577_836_800.0);
        assert!(now < 32_503_680_000.0);
    }

    #[test]
    fn test_new_task_id_is_unique_ulid() {
        let a = new_task_id();
        let b = new_task_id();
        assert_ne!(a, b);
        assert!(ulid::Ulid::from_string(&a).is_ok());
    }
}
