//! Scheduler
//!
//! Single cooperative driver for the periodic decay pass. The first run is
//! aligned to a configured time of day (today if still ahead, otherwise
//! tomorrow); after that it repeats on a fixed interval. Stopping cancels
//! the pending timer; an in-flight pass always completes and is never
//! re-entered. Run failures are logged and counted, never fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::lifecycle::LifecycleEngine;

// ============================================================================
// CONFIG
// ============================================================================

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether the decay driver runs at all
    pub decay_enabled: bool,
    /// Interval between runs after the first
    pub decay_interval_hours: u64,
    /// Optional `HH:MM` (UTC) alignment for the first run
    pub decay_time_of_day: Option<NaiveTime>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decay_enabled: true,
            decay_interval_hours: 24,
            decay_time_of_day: None,
        }
    }
}

impl SchedulerConfig {
    /// Parse a `HH:MM` time-of-day string
    pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M").ok()
    }
}

/// Delay from `now` until the first run: the next occurrence of the
/// configured time of day, or one full interval when none is set
pub fn initial_delay(
    now: DateTime<Utc>,
    time_of_day: Option<NaiveTime>,
    interval: Duration,
) -> Duration {
    let Some(time_of_day) = time_of_day else {
        return interval;
    };
    let today = now.date_naive().and_time(time_of_day).and_utc();
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Scheduler error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `start` called twice on the same instance
    #[error("scheduler already started")]
    AlreadyStarted,
    /// Task handle lock poisoned
    #[error("scheduler handle lock poisoned")]
    LockPoisoned,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Owns the background decay task. Single-owner: starting a second instance
/// against the same store is a programming error.
pub struct DecayScheduler {
    lifecycle: Arc<LifecycleEngine>,
    config: SchedulerConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    runs: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl DecayScheduler {
    pub fn new(lifecycle: Arc<LifecycleEngine>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            lifecycle,
            config,
            handle: Mutex::new(None),
            shutdown,
            runs: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the driver task on the current runtime
    pub fn start(&self) -> Result<(), SchedulerError> {
        if !self.config.decay_enabled {
            tracing::info!("Decay scheduler disabled by configuration");
            return Ok(());
        }
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        if handle.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let interval = Duration::from_secs(self.config.decay_interval_hours.max(1) * 3600);
        let first_delay = initial_delay(Utc::now(), self.config.decay_time_of_day, interval);
        tracing::info!(
            first_run_in_secs = first_delay.as_secs(),
            interval_hours = self.config.decay_interval_hours,
            "Decay scheduler started"
        );

        let lifecycle = Arc::clone(&self.lifecycle);
        let runs = Arc::clone(&self.runs);
        let failures = Arc::clone(&self.failures);
        let mut shutdown = self.shutdown.subscribe();

        *handle = Some(tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }

                // The pass itself is never raced with shutdown; it finishes
                // naturally even if stop() fires mid-run.
                let engine = Arc::clone(&lifecycle);
                let result =
                    tokio::task::spawn_blocking(move || engine.run_decay_pass(None)).await;
                runs.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(summary) => {
                        if summary.errors > 0 {
                            failures.fetch_add(summary.errors, Ordering::Relaxed);
                        }
                        tracing::info!(
                            total = summary.total_memories,
                            decayed = summary.decayed,
                            archival = summary.archival_candidates,
                            expiring = summary.expiration_candidates,
                            expired_deleted = summary.expired_deleted,
                            errors = summary.errors,
                            duration_ms = summary.duration_ms,
                            "Decay pass finished"
                        );
                    }
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Decay pass panicked: {}", e);
                    }
                }

                if *shutdown.borrow() {
                    break;
                }
                delay = interval;
            }
            tracing::info!("Decay scheduler stopped");
        }));
        Ok(())
    }

    /// Cancel the pending timer. An in-flight pass completes naturally.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut handle) = self.handle.lock() {
            handle.take();
        }
    }

    /// Completed run count (including failed runs)
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Accumulated per-memory and per-run failure count
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::mock_embedding;
    use crate::memory::Memory;
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn test_initial_delay_without_time_of_day() {
        let interval = Duration::from_secs(6 * 3600);
        assert_eq!(initial_delay(Utc::now(), None, interval), interval);
    }

    #[test]
    fn test_initial_delay_today_when_ahead() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let delay = initial_delay(
            now,
            SchedulerConfig::parse_time_of_day("10:30"),
            Duration::from_secs(3600),
        );
        assert_eq!(delay, Duration::from_secs(2 * 3600 + 1800));
    }

    #[test]
    fn test_initial_delay_tomorrow_when_passed() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let delay = initial_delay(
            now,
            SchedulerConfig::parse_time_of_day("10:30"),
            Duration::from_secs(3600),
        );
        // 23.5 hours until tomorrow 10:30
        assert_eq!(delay, Duration::from_secs(23 * 3600 + 1800));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert!(SchedulerConfig::parse_time_of_day("03:15").is_some());
        assert!(SchedulerConfig::parse_time_of_day("27:00").is_none());
        assert!(SchedulerConfig::parse_time_of_day("noon").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(Some(dir.path().join("test.db"))).unwrap());
        let mut memory = Memory::new("agent1", "memory under decay");
        memory.embedding = mock_embedding("memory under decay");
        store.insert(memory).unwrap();

        let lifecycle = Arc::new(LifecycleEngine::new(store));
        let scheduler = DecayScheduler::new(
            lifecycle,
            SchedulerConfig {
                decay_enabled: true,
                decay_interval_hours: 1,
                decay_time_of_day: None,
            },
        );
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyStarted)
        ));

        // Jump past the first interval; the run happens on a real blocking
        // thread, so wait real time (paused-clock sleeps resolve instantly)
        tokio::time::advance(Duration::from_secs(3601)).await;
        for _ in 0..500 {
            if scheduler.runs() > 0 {
                break;
            }
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(10)))
                .await
                .unwrap();
        }
        assert!(scheduler.runs() >= 1);

        scheduler.stop();
    }

    #[tokio::test]
    async fn test_disabled_scheduler_never_spawns() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(Some(dir.path().join("test.db"))).unwrap());
        let lifecycle = Arc::new(LifecycleEngine::new(store));
        let scheduler = DecayScheduler::new(
            lifecycle,
            SchedulerConfig {
                decay_enabled: false,
                ..Default::default()
            },
        );
        scheduler.start().unwrap();
        assert_eq!(scheduler.runs(), 0);
        scheduler.stop();
    }
}
