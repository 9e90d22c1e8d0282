//! In-process storage backend.
//!
//! Request records and block state live in two maps behind a single lock, so
//! the block check and the count-and-insert of [`check_and_consume`] are one
//! atomic step. A background task periodically drops expired blocks and
//! request lists that have gone idle.
//!
//! Time is read from `tokio::time::Instant`, which follows the paused clock in
//! tests.
//!
//! [`check_and_consume`]: super::StorageBackend::check_and_consume

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{StorageBackend, Verdict};
use crate::error::{Result, TurnstileError};

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Blocks whose expiry had passed
    pub expired_blocks: usize,
    /// Keys whose request records had all aged past retention and window
    pub removed_keys: usize,
}

/// Admitted requests of one key.
#[derive(Debug, Default)]
struct KeyRecords {
    /// Admission timestamps, oldest first
    stamps: VecDeque<Instant>,
    /// Longest window this key has been checked against
    window: Duration,
}

impl KeyRecords {
    /// Drop stamps at least `age` old relative to `now`.
    fn expire(&mut self, now: Instant, age: Duration) {
        while self
            .stamps
            .front()
            .is_some_and(|ts| now.duration_since(*ts) >= age)
        {
            self.stamps.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Admitted requests per key
    requests: HashMap<String, KeyRecords>,
    /// Block expiry per key
    blocks: HashMap<String, Instant>,
}

impl MemoryState {
    fn sweep(&mut self, now: Instant, retention: Duration) -> SweepStats {
        let blocks_before = self.blocks.len();
        self.blocks.retain(|_, until| now < *until);

        let keys_before = self.requests.len();
        self.requests.retain(|_, records| {
            // Records still inside their window are live quota state.
            records.expire(now, retention.max(records.window));
            !records.stamps.is_empty()
        });

        SweepStats {
            expired_blocks: blocks_before - self.blocks.len(),
            removed_keys: keys_before - self.requests.len(),
        }
    }
}

/// Storage backend that keeps all state in process memory.
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    retention: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Create a backend and start its sweep task.
    ///
    /// Outside a tokio runtime no sweep task is started; [`sweep`](Self::sweep)
    /// can still be called manually.
    pub fn new(sweep_interval: Duration, retention: Duration) -> Self {
        let state = Arc::new(Mutex::new(MemoryState::default()));

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(run_sweeper(
                Arc::downgrade(&state),
                sweep_interval,
                retention,
            ))),
            Err(_) => {
                warn!("No tokio runtime available, in-process sweep task not started");
                None
            }
        };

        Self {
            state,
            retention,
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
        }
    }

    /// Drop expired blocks, and request records older than both the retention
    /// cutoff and the key's window.
    pub fn sweep(&self) -> SweepStats {
        self.state.lock().sweep(Instant::now(), self.retention)
    }

    /// Number of keys holding any request or block state.
    pub fn tracked_keys(&self) -> usize {
        let state = self.state.lock();
        state
            .requests
            .keys()
            .chain(state.blocks.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TurnstileError::BackendUnavailable(
                "memory backend is closed".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_sweeper(state: Weak<Mutex<MemoryState>>, interval: Duration, retention: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        let stats = state.lock().sweep(Instant::now(), retention);
        debug!(
            expired_blocks = stats.expired_blocks,
            removed_keys = stats.removed_keys,
            "In-process storage sweep complete"
        );
    }
}

fn deadline(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> Result<Verdict> {
        self.ensure_open()?;

        let mut guard = self.state.lock();
        // Read the clock under the lock so records stay ordered per key.
        let now = Instant::now();
        let MemoryState { requests, blocks } = &mut *guard;

        if let Some(until) = blocks.get(key).copied() {
            if now < until {
                trace!(key = %key, "Key is blocked");
                return Ok(Verdict::rejected(limit, until - now));
            }
            blocks.remove(key);
        }

        let records = requests.entry(key.to_string()).or_default();
        records.window = records.window.max(window);
        records.expire(now, window);

        let count = records.stamps.len() as u64;
        if count >= limit {
            debug!(key = %key, count, limit, "Rate limit exceeded, blocking key");
            requests.remove(key);
            blocks.insert(key.to_string(), deadline(now, block_duration));
            return Ok(Verdict::rejected(limit, block_duration));
        }

        records.stamps.push_back(now);
        let oldest = records.stamps.front().copied().unwrap_or(now);
        let reset_after = window.saturating_sub(now.duration_since(oldest));

        Ok(Verdict::allowed(
            limit,
            limit.saturating_sub(count + 1),
            reset_after,
        ))
    }

    async fn is_blocked(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        let now = Instant::now();
        match state.blocks.get(key).copied() {
            Some(until) if now < until => Ok(Some(until - now)),
            Some(_) => {
                state.blocks.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        let until = deadline(Instant::now(), duration);
        state.blocks.insert(key.to_string(), until);
        debug!(key = %key, duration = ?duration, "Key blocked");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        state.requests.clear();
        state.blocks.clear();
        debug!("In-process storage backend closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use tokio_test::assert_ok;

    const WINDOW: Duration = Duration::from_secs(1);
    const BLOCK: Duration = Duration::from_millis(100);

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_up_to_limit() {
        let store = backend();

        for i in 0..5u64 {
            let verdict = store.check_and_consume("k", 5, WINDOW, BLOCK).await.unwrap();
            assert!(verdict.allowed, "Request {} should be allowed", i + 1);
            assert_eq!(verdict.limit, 5);
            assert_eq!(verdict.remaining, 4 - i);
        }

        let verdict = store.check_and_consume("k", 5, WINDOW, BLOCK).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_then_fresh_window() {
        let store = backend();

        for expected in [2, 1, 0] {
            let verdict = store.check_and_consume("k", 3, WINDOW, BLOCK).await.unwrap();
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, expected);
        }

        let verdict = store.check_and_consume("k", 3, WINDOW, BLOCK).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, BLOCK);

        tokio::time::advance(Duration::from_millis(110)).await;

        let verdict = store.check_and_consume("k", 3, WINDOW, BLOCK).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_is_not_extended_by_rejections() {
        let store = backend();
        let block = Duration::from_secs(10);

        assert!(store.check_and_consume("k", 1, WINDOW, block).await.unwrap().allowed);
        assert!(!store.check_and_consume("k", 1, WINDOW, block).await.unwrap().allowed);

        tokio::time::advance(Duration::from_secs(4)).await;
        let verdict = store.check_and_consume("k", 1, WINDOW, block).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, Duration::from_secs(6));

        tokio::time::advance(Duration::from_millis(5_990)).await;
        assert!(!store.check_and_consume("k", 1, WINDOW, block).await.unwrap().allowed);

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(store.check_and_consume("k", 1, WINDOW, block).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let store = backend();

        assert!(store.check_and_consume("k", 2, WINDOW, BLOCK).await.unwrap().allowed);
        tokio::time::advance(Duration::from_millis(500)).await;
        let verdict = store.check_and_consume("k", 2, WINDOW, BLOCK).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.reset_after, Duration::from_millis(500));

        // The first record ages out; one slot frees up.
        tokio::time::advance(Duration::from_millis(500)).await;
        let verdict = store.check_and_consume("k", 2, WINDOW, BLOCK).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let store = backend();

        assert!(store.check_and_consume("a", 1, WINDOW, BLOCK).await.unwrap().allowed);
        assert!(!store.check_and_consume("a", 1, WINDOW, BLOCK).await.unwrap().allowed);
        assert!(store.check_and_consume("b", 1, WINDOW, BLOCK).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_block() {
        let store = backend();

        assert_ok!(store.block("k", BLOCK).await);
        let remaining = store.is_blocked("k").await.unwrap();
        assert_eq!(remaining, Some(BLOCK));

        let verdict = store.check_and_consume("k", 100, WINDOW, BLOCK).await.unwrap();
        assert!(!verdict.allowed);

        tokio::time::advance(Duration::from_millis(110)).await;
        assert_eq!(store.is_blocked("k").await.unwrap(), None);
        assert!(store.check_and_consume("k", 100, WINDOW, BLOCK).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_overwrites_existing_block() {
        let store = backend();

        store.block("k", Duration::from_secs(60)).await.unwrap();
        store.block("k", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.is_blocked("k").await.unwrap(), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_idle_keys() {
        let store = backend();

        store.check_and_consume("idle", 5, WINDOW, BLOCK).await.unwrap();
        store.block("blocked", BLOCK).await.unwrap();
        assert_eq!(store.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        store.check_and_consume("recent", 5, WINDOW, BLOCK).await.unwrap();

        // Past the block expiry but well inside retention.
        let stats = store.sweep();
        assert_eq!(stats.expired_blocks, 1);
        assert_eq!(stats.removed_keys, 0);

        tokio::time::advance(Duration::from_secs(590)).await;
        let stats = store.sweep();
        assert_eq!(stats.removed_keys, 1);
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_runs() {
        let store = MemoryBackend::new(Duration::from_secs(1), Duration::from_secs(5));

        store.check_and_consume("k", 5, WINDOW, BLOCK).await.unwrap();
        assert_eq!(store.tracked_keys(), 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_records_inside_long_window() {
        let store = MemoryBackend::new(Duration::from_secs(1), Duration::from_secs(5));
        let window = Duration::from_secs(60);

        assert!(store.check_and_consume("k", 2, window, BLOCK).await.unwrap().allowed);
        assert!(store.check_and_consume("k", 2, window, BLOCK).await.unwrap().allowed);

        // Several sweeps run past the retention cutoff, still inside the window.
        tokio::time::sleep(Duration::from_secs(7)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.tracked_keys(), 1);

        let verdict = store.check_and_consume("k", 2, window, BLOCK).await.unwrap();
        assert!(!verdict.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_long_window_after_it_passes() {
        // Hourly background sweeps stay out of the way of the manual ones.
        let store = MemoryBackend::new(Duration::from_secs(3600), Duration::from_secs(600));
        let window = Duration::from_secs(900);

        store.check_and_consume("k", 5, window, BLOCK).await.unwrap();

        tokio::time::advance(Duration::from_secs(700)).await;
        assert_eq!(store.sweep().removed_keys, 0);

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(store.sweep().removed_keys, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = backend();
        store.check_and_consume("k", 5, WINDOW, BLOCK).await.unwrap();

        assert_ok!(store.close().await);
        assert_ok!(store.close().await);

        assert!(store.sweeper.lock().is_none());
        assert_eq!(store.tracked_keys(), 0);
        let err = store.check_and_consume("k", 5, WINDOW, BLOCK).await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(store.health_check().await.is_err());
    }

    #[test]
    fn test_sweep_without_runtime() {
        let store = MemoryBackend::new(Duration::from_secs(1), Duration::from_secs(5));
        assert!(store.sweeper.lock().is_none());
        assert_eq!(store.sweep(), SweepStats::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_never_exceed_limit() {
        let store = Arc::new(backend());
        let limit = 50;

        let tasks = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut admitted = 0u64;
                for _ in 0..10 {
                    let verdict = store
                        .check_and_consume("shared", limit, Duration::from_secs(60), Duration::from_secs(60))
                        .await
                        .unwrap();
                    if verdict.allowed {
                        admitted += 1;
                    }
                }
                admitted
            })
        });

        let admitted: u64 = join_all(tasks).await.into_iter().map(|r| r.unwrap()).sum();
        assert_eq!(admitted, limit);
    }
}
