/// 获取当前 UTC 时间戳（毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds in one second
pub const MILLIS_PER_SEC: i64 = 1000;

/// Convert a seconds count (config value) to milliseconds
#[inline]
pub fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(MILLIS_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_recent() {
        // 2024-01-01 00:00:00 UTC
        assert!(now_millis() > 1_704_067_200_000);
    }

    #[test]
    fn test_secs_to_millis() {
        assert_eq!(secs_to_millis(0), 0);
        assert_eq!(secs_to_millis(60), 60_000);
        assert_eq!(secs_to_millis(u64::MAX), i64::MAX);
    }
}
