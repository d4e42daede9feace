use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Milliseconds elapsed since the supplied instant.
#[inline]
pub fn elapsed_ms(since: Instant) -> u64 {
    let elapsed = since.elapsed();
    elapsed.as_secs() * 1000 + u64::from(elapsed.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_past_2020() {
        assert!(timestamp_secs() > 1_577_836_800);
    }

    #[test]
    fn test_elapsed_ms_monotonic() {
        let start = Instant::now();
        assert!(elapsed_ms(start) < 1000);
    }
}
