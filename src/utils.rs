use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Millisecond clock used for window arithmetic.
///
/// The system variant reads wall-clock time. The manual variant starts at a
/// fixed instant and only moves when [`TimeSource::advance`] is called, which
/// lets window expiry be driven deterministically.
#[derive(Debug, Clone, Default)]
pub struct TimeSource {
    manual: Option<Arc<AtomicU64>>,
}

impl TimeSource {
    pub fn new() -> Self {
        Self { manual: None }
    }

    /// A clock frozen at `start_ms` (Unix milliseconds)
    pub fn manual(start_ms: u64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicU64::new(start_ms))),
        }
    }

    /// Get the current Unix timestamp in milliseconds
    pub fn now_ms(&self) -> u64 {
        match &self.manual {
            Some(now) => now.load(Ordering::SeqCst),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Move a manual clock forward. Has no effect on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(now) = &self.manual {
            now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }
}

/// Round milliseconds up to whole seconds, as rate-limit headers expect.
pub fn ms_to_header_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = TimeSource::manual(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(Duration::from_millis(2_500));
        assert_eq!(clock.now_ms(), 3_500);

        let shared = clock.clone();
        shared.advance(Duration::from_secs(1));
        assert_eq!(clock.now_ms(), 4_500);
    }

    #[test]
    fn test_system_clock_ignores_advance() {
        let clock = TimeSource::new();
        let before = clock.now_ms();
        clock.advance(Duration::from_secs(3600));
        assert!(clock.now_ms() < before + 3_600_000);
    }

    #[test]
    fn test_header_seconds_round_up() {
        assert_eq!(ms_to_header_secs(0), 0);
        assert_eq!(ms_to_header_secs(1), 1);
        assert_eq!(ms_to_header_secs(1_000), 1);
        assert_eq!(ms_to_header_secs(3_599_001), 3_600);
    }
}
