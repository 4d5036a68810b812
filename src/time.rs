use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn create_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_the_epoch| since_the_epoch.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall clock used for handshake timestamps, swappable in tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> u64;

    fn now_secs(&self) -> u32 {
        (self.now_millis() / 1000) as u32
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        create_timestamp()
    }
}

/// A manually advanced clock.
#[derive(Debug, Default)]
pub struct MockClock {
    millis: AtomicU64,
}

impl MockClock {
    pub fn new(millis: u64) -> Self {
        MockClock {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// True when `timestamp` is within `tolerance` seconds of `now`, in either direction.
pub fn within_tolerance(timestamp: u32, now: u32, tolerance: u32) -> bool {
    let (timestamp, now, tolerance) = (timestamp as u64, now as u64, tolerance as u64);
    timestamp + tolerance >= now && timestamp <= now + tolerance
}
