//! Explicit operation context passed into every long-running core call.
//!
//! The original design leaned on global singletons for time, counters and
//! shutdown flags; here each operation receives a [`Ctx`] carrying a
//! monotonic clock, a telemetry sink, and a cooperative cancel token.
//! Logging stays on `tracing` — its dispatcher is already the pluggable
//! seam, so `Ctx` does not duplicate it.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Monotonic time source. Cache TTLs and deadlines are computed against
/// this, never against wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Default clock backed by `Instant::now()`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Mutex::new(Instant::now()) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Named-counter sink. The core only increments; aggregation and export
/// live behind this trait.
pub trait TelemetrySink: Send + Sync {
    fn incr(&self, counter: &'static str, by: u64);
}

/// Discards everything.
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn incr(&self, _counter: &'static str, _by: u64) {}
}

/// In-memory counters, used by tests and the CLI summary line.
#[derive(Default)]
pub struct CounterTelemetry {
    counters: Mutex<BTreeMap<&'static str, AtomicU64>>,
}

impl CounterTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: &'static str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(counter)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of all counters, sorted by name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, c)| (*name, c.load(Ordering::Relaxed)))
            .collect()
    }
}

impl TelemetrySink for CounterTelemetry {
    fn incr(&self, counter: &'static str, by: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry(counter)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancel flag. Cloned freely; checked at batch boundaries in
/// sync and at stage boundaries in retrieval.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Ctx
// ---------------------------------------------------------------------------

/// Bundle handed to every core operation.
#[derive(Clone)]
pub struct Ctx {
    pub clock: Arc<dyn Clock>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub cancel: CancelToken,
}

impl Ctx {
    /// Production defaults: system clock, no telemetry, fresh token.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(NullTelemetry),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_telemetry(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { telemetry, ..Self::new() }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }

    #[test]
    fn cancel_checkpoint_fails_after_cancel() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(Error::Cancelled)));
    }

    #[test]
    fn counters_accumulate() {
        let t = CounterTelemetry::new();
        t.incr("provider.calls", 1);
        t.incr("provider.calls", 2);
        assert_eq!(t.get("provider.calls"), 3);
        assert_eq!(t.get("unknown"), 0);
    }
}
