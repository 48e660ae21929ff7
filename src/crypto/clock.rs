use std::time::{SystemTime, UNIX_EPOCH};

/// Injected time source so expiry logic can be pinned in tests instead of
/// reaching for `SystemTime::now()` directly.
pub trait Clock: Send + Sync {
    /// Current time as Unix seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs() as i64
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FixedClock(pub std::sync::Arc<std::sync::atomic::AtomicI64>);

#[cfg(test)]
impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicI64::new(now)))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
