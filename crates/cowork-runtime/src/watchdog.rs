//! Idle watchdog for agent sessions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Time of the last observed agent activity.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl ActivityClock {
    /// A clock that starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity.
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the watchdog loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogResult {
    /// No activity for at least the idle timeout.
    TimedOut,
    /// The watchdog was cancelled externally.
    Cancelled,
}

/// Check `clock` every `interval` until it has been idle for `timeout`.
pub async fn run_watchdog(
    clock: ActivityClock,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> WatchdogResult {
    let mut check = time::interval_at(Instant::now() + interval, interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = check.tick() => {
                if clock.idle_for() >= timeout {
                    return WatchdogResult::TimedOut;
                }
            }
            () = cancel.cancelled() => return WatchdogResult::Cancelled,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_without_activity() {
        let clock = ActivityClock::new();
        let started = Instant::now();
        let result = run_watchdog(
            clock,
            Duration::from_secs(30),
            Duration::from_secs(300),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, WatchdogResult::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_timeout() {
        let clock = ActivityClock::new();
        let watched = clock.clone();
        let handle = tokio::spawn(run_watchdog(
            watched,
            Duration::from_secs(1),
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        for _ in 0..4 {
            time::sleep(Duration::from_secs(3)).await;
            clock.touch();
        }
        assert!(!handle.is_finished());
        let started = Instant::now();
        assert_eq!(handle.await.unwrap(), WatchdogResult::TimedOut);
        assert!(started.elapsed() <= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_loop() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watchdog(
            ActivityClock::new(),
            Duration::from_secs(100),
            Duration::from_secs(300),
            cancel.clone(),
        ));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WatchdogResult::Cancelled);
    }
}
