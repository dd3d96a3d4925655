use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Spaces out probe launches to at most `per_sec` per second.
///
/// Must be constructed inside a Tokio runtime.
#[derive(Clone)]
pub struct RateLimiter {
    ticker: Arc<Mutex<Interval>>,
}

impl RateLimiter {
    pub fn new(per_sec: u32) -> Self {
        // tokio intervals reject a zero period
        let period = Duration::from_micros(1_000_000 / per_sec.max(1) as u64).max(Duration::from_micros(1));
        let mut t = interval(period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        RateLimiter { ticker: Arc::new(Mutex::new(t)) }
    }

    /// `None` when pacing is disabled (`0` or absent).
    pub fn from_qps(qps: Option<u32>) -> Option<Self> {
        match qps {
            Some(q) if q > 0 => Some(Self::new(q)),
            _ => None,
        }
    }

    pub async fn acquire(&self) {
        self.ticker.lock().await.tick().await;
    }
}
