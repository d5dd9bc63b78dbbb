//! Counter Store
//!
//! Named, increment-only counters held in memory and persisted to a durable
//! backend. One lock serializes the map and the backend handle: counter
//! lookups, increments, snapshots, flushes and the final close all go
//! through it, and nothing else can reach the map.
//!
//! # Lifecycle
//!
//! ```text
//! open ──▶ load ──▶ (increments, auto-flush ticks) ──▶ close = stop + flush + release
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backend::{CounterBackend, SledBackend};
use crate::config::{StoreConfig, MAX_INTERVAL};
use crate::error::{Error, Result};
use crate::telemetry;

// =============================================================================
// Shared State
// =============================================================================

struct State {
    counters: BTreeMap<Arc<str>, u64>,
    backend: Option<Arc<dyn CounterBackend>>,
}

struct Shared {
    state: Mutex<State>,
    flusher: Mutex<Option<AutoFlush>>,
}

struct AutoFlush {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Counter
// =============================================================================

/// Handle to one named counter.
///
/// Handles are cheap to clone; all of them refer to the same value, which
/// only ever grows by one through [`Counter::inc`].
#[derive(Clone)]
pub struct Counter {
    name: Arc<str>,
    shared: Arc<Shared>,
}

impl Counter {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment by one; once the store is closed the increment is dropped
    pub fn inc(&self) {
        if let Err(e) = self.try_inc() {
            warn!("Dropped increment of {}: {}", self.name, e);
        }
    }

    /// Increment by one and return the new value
    pub fn try_inc(&self) -> Result<u64> {
        let mut state = self.shared.state.lock();
        if state.backend.is_none() {
            return Err(Error::StoreClosed);
        }
        let value = state.counters.entry(self.name.clone()).or_insert(0);
        *value = value.saturating_add(1);
        Ok(*value)
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.shared
            .state
            .lock()
            .counters
            .get(&self.name)
            .copied()
            .unwrap_or(0)
    }

    /// Whether both handles refer to the same counter of the same store
    pub fn same_as(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && Arc::ptr_eq(&self.name, &other.name)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter").field("name", &self.name).finish()
    }
}

// =============================================================================
// Flush Report
// =============================================================================

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Counters written successfully
    pub written: usize,
    /// Names whose write failed; they are retried on the next cycle
    pub failed: Vec<String>,
    /// Set when the writes could not be made durable
    pub sync_error: Option<String>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.sync_error.is_none()
    }
}

fn write_counters(
    counters: &BTreeMap<Arc<str>, u64>,
    backend: &dyn CounterBackend,
) -> FlushReport {
    let flush_writes = &telemetry::metrics().flush_writes;

    let mut report = FlushReport::default();
    for (name, value) in counters.iter() {
        match backend.put(name, *value) {
            Ok(()) => {
                flush_writes.with_label_values(&["ok"]).inc();
                report.written += 1;
            }
            Err(e) => {
                flush_writes.with_label_values(&["error"]).inc();
                warn!("Failed to persist counter {}: {}", name, e);
                report.failed.push(name.to_string());
            }
        }
    }
    report
}

fn sync_backend(backend: &dyn CounterBackend, report: &mut FlushReport) {
    if let Err(e) = backend.sync() {
        warn!("Failed to sync counter backend: {}", e);
        report.sync_error = Some(e.to_string());
    }
}

// =============================================================================
// Counter Store
// =============================================================================

/// Registry of durable counters
#[derive(Clone)]
pub struct CounterStore {
    shared: Arc<Shared>,
}

impl CounterStore {
    /// Open the sled database named by `config` and load it.
    ///
    /// Failing to open the database is fatal for the caller.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = SledBackend::open(&config.path)?;
        Self::with_backend(Box::new(backend))
    }

    /// Open with `config` and start flushing every `config.flush_interval()`
    pub fn open_with_auto_flush(config: &StoreConfig) -> Result<Self> {
        let store = Self::open(config)?;
        store.start_auto_flush(config.flush_interval());
        Ok(store)
    }

    /// Build a store over any backend, loading its records first
    pub fn with_backend(backend: Box<dyn CounterBackend>) -> Result<Self> {
        let records = backend.load()?;
        info!("Loaded {} counter(s) from backend", records.len());

        let counters = records
            .into_iter()
            .map(|(name, value)| (Arc::<str>::from(name), value))
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    counters,
                    backend: Some(Arc::from(backend)),
                }),
                flusher: Mutex::new(None),
            }),
        })
    }

    /// Existing counter for `name`, or a new zero-valued one
    pub fn get_or_create(&self, name: &str) -> Counter {
        let mut state = self.shared.state.lock();
        let name = match state.counters.get_key_value(name) {
            Some((key, _)) => key.clone(),
            None => {
                let key: Arc<str> = Arc::from(name);
                state.counters.insert(key.clone(), 0);
                debug!("Created counter {}", name);
                key
            }
        };

        Counter {
            name,
            shared: self.shared.clone(),
        }
    }

    /// Increment `counter` by one
    pub fn increment(&self, counter: &Counter) {
        counter.inc();
    }

    /// Current value of `name`, if it exists
    pub fn value(&self, name: &str) -> Option<u64> {
        self.shared.state.lock().counters.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of every counter, ascending by name
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.shared
            .state
            .lock()
            .counters
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    /// Snapshot rendered as a JSON object with keys in ascending order
    pub fn snapshot_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|(name, value)| (name, serde_json::Value::from(value)))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Write every counter to the backend, one independent write each,
    /// then sync the backend.
    ///
    /// Writes happen under the store lock; the sync runs after it is
    /// released and may block on disk. A failed write or sync is logged and
    /// reported, and failed counters are written again by the next flush.
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<FlushReport> {
        let (mut report, backend) = {
            let state = self.shared.state.lock();
            let backend = state.backend.clone().ok_or(Error::StoreClosed)?;
            (write_counters(&state.counters, backend.as_ref()), backend)
        };
        sync_backend(backend.as_ref(), &mut report);

        debug!(
            "Flushed {} counter(s), {} failed",
            report.written,
            report.failed.len()
        );
        Ok(report)
    }

    /// [`flush`](Self::flush) on the blocking thread pool
    pub async fn flush_async(&self) -> Result<FlushReport> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| Error::Internal(format!("Flush task failed: {}", e)))?
    }

    /// Start the background flush loop; a running loop is left untouched.
    ///
    /// The interval is clamped to between one millisecond and
    /// [`MAX_INTERVAL`].
    pub fn start_auto_flush(&self, interval: Duration) {
        let interval = interval.clamp(Duration::from_millis(1), MAX_INTERVAL);
        let mut flusher = self.shared.flusher.lock();
        if flusher.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let store = self.clone();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            store.auto_flush(interval, token).await;
        });

        *flusher = Some(AutoFlush { stop, handle });
    }

    async fn auto_flush(&self, interval: Duration, stop: CancellationToken) {
        info!("Auto-flushing counters every {:?}", interval);
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Auto-flush stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.flush_async().await {
                Ok(report) => debug!("Auto-flush wrote {} counter(s)", report.written),
                Err(Error::StoreClosed) => return,
                Err(e) => error!("Auto-flush failed: {}", e),
            }
        }
    }

    /// Stop the background flush loop and wait for it to finish
    pub async fn stop_auto_flush(&self) {
        let flusher = self.shared.flusher.lock().take();
        if let Some(AutoFlush { stop, handle }) = flusher {
            stop.cancel();
            if let Err(e) = handle.await {
                error!("Auto-flush task failed: {}", e);
            }
        }
    }

    /// Stop auto-flush, flush one last time, then release the backend.
    ///
    /// The final writes and the release share one lock hold, so every
    /// increment is either persisted or refused. Closing an already closed
    /// store returns `Error::StoreClosed`.
    pub async fn close(&self) -> Result<FlushReport> {
        self.stop_auto_flush().await;

        let store = self.clone();
        let report = tokio::task::spawn_blocking(move || store.close_blocking())
            .await
            .map_err(|e| Error::Internal(format!("Close task failed: {}", e)))??;

        info!("Counter store closed");
        Ok(report)
    }

    fn close_blocking(&self) -> Result<FlushReport> {
        let (mut report, backend) = {
            let mut state = self.shared.state.lock();
            let backend = state.backend.take().ok_or(Error::StoreClosed)?;
            (write_counters(&state.counters, backend.as_ref()), backend)
        };
        sync_backend(backend.as_ref(), &mut report);
        backend.close()?;
        Ok(report)
    }

    /// Whether the backend has been released
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().backend.is_none()
    }
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("counters", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend keeping records in memory, failing writes for chosen names
    #[derive(Default, Clone)]
    struct MemoryBackend {
        records: Arc<Mutex<BTreeMap<String, u64>>>,
        failing: Arc<Mutex<Vec<String>>>,
        sync_fails: Arc<AtomicBool>,
        /// Store whose lock is inspected on every sync
        watched: Arc<Mutex<Option<CounterStore>>>,
        /// Whether the store lock was free during each sync
        syncs_unlocked: Arc<Mutex<Vec<bool>>>,
    }

    impl CounterBackend for MemoryBackend {
        fn load(&self) -> Result<Vec<(String, u64)>> {
            Ok(self
                .records
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect())
        }

        fn put(&self, name: &str, value: u64) -> Result<()> {
            if self.failing.lock().iter().any(|n| n == name) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.records.lock().insert(name.to_string(), value);
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            if let Some(store) = self.watched.lock().as_ref() {
                let unlocked = store.shared.state.try_lock().is_some();
                self.syncs_unlocked.lock().push(unlocked);
            }
            if self.sync_fails.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "fsync failed",
                )));
            }
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn memory_store() -> (CounterStore, MemoryBackend) {
        let backend = MemoryBackend::default();
        let store = CounterStore::with_backend(Box::new(backend.clone())).unwrap();
        (store, backend)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (store, _) = memory_store();

        let first = store.get_or_create("ops");
        let second = store.get_or_create("ops");
        assert!(first.same_as(&second));

        first.inc();
        store.increment(&second);
        assert_eq!(first.get(), 2);
        assert_eq!(store.snapshot(), vec![("ops".to_string(), 2)]);
    }

    #[test]
    fn test_distinct_stores_do_not_share_identity() {
        let (a, _) = memory_store();
        let (b, _) = memory_store();
        assert!(!a.get_or_create("ops").same_as(&b.get_or_create("ops")));
    }

    #[test]
    fn test_snapshot_sorted() {
        let (store, _) = memory_store();
        for (name, n) in [("b", 2), ("a", 1), ("c", 3)] {
            let counter = store.get_or_create(name);
            for _ in 0..n {
                counter.inc();
            }
        }

        assert_eq!(
            store.snapshot(),
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 3),
            ]
        );
        assert_eq!(
            serde_json::to_string(&store.snapshot_json()).unwrap(),
            r#"{"a":1,"b":2,"c":3}"#
        );
    }

    #[test]
    fn test_load_restores_values() {
        let backend = MemoryBackend::default();
        backend.records.lock().insert("ops".to_string(), 7);

        let store = CounterStore::with_backend(Box::new(backend)).unwrap();
        let ops = store.get_or_create("ops");
        assert_eq!(ops.get(), 7);
        ops.inc();
        assert_eq!(store.value("ops"), Some(8));
    }

    #[test]
    fn test_flush_partial_failure() {
        let (store, backend) = memory_store();
        let x = store.get_or_create("x");
        let y = store.get_or_create("y");
        x.inc();
        y.inc();

        backend.failing.lock().push("x".to_string());
        let report = store.flush().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed, vec!["x".to_string()]);
        assert_eq!(backend.records.lock().get("y"), Some(&1));
        assert_eq!(backend.records.lock().get("x"), None);

        // Next cycle picks up the stale counter
        backend.failing.lock().clear();
        let report = store.flush().unwrap();
        assert!(report.is_complete());
        assert_eq!(backend.records.lock().get("x"), Some(&1));
    }

    #[tokio::test]
    async fn test_close_flushes_then_rejects() {
        let (store, backend) = memory_store();
        store.get_or_create("ops").inc();

        let report = store.close().await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(backend.records.lock().get("ops"), Some(&1));
        assert!(store.is_closed());

        assert_matches!(store.flush(), Err(Error::StoreClosed));
        assert_matches!(store.close().await, Err(Error::StoreClosed));
    }

    #[test]
    fn test_sync_failure_reported() {
        let (store, backend) = memory_store();
        store.get_or_create("ops").inc();

        backend.sync_fails.store(true, Ordering::SeqCst);
        let report = store.flush().unwrap();
        assert_eq!(report.written, 1);
        assert!(report.sync_error.is_some());
        assert!(!report.is_complete());

        backend.sync_fails.store(false, Ordering::SeqCst);
        assert!(store.flush().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_sync_runs_without_store_lock() {
        let (store, backend) = memory_store();
        store.get_or_create("ops").inc();
        *backend.watched.lock() = Some(store.clone());

        store.flush().unwrap();
        store.flush_async().await.unwrap();
        store.close().await.unwrap();

        *backend.watched.lock() = None;
        assert_eq!(*backend.syncs_unlocked.lock(), vec![true, true, true]);
    }

    #[tokio::test]
    async fn test_increments_after_close_are_refused() {
        let (store, backend) = memory_store();
        let ops = store.get_or_create("ops");
        ops.inc();
        assert_eq!(ops.try_inc().unwrap(), 2);

        store.close().await.unwrap();
        assert_eq!(backend.records.lock().get("ops"), Some(&2));

        ops.inc();
        assert_matches!(ops.try_inc(), Err(Error::StoreClosed));
        assert_eq!(ops.get(), 2);
        assert_eq!(store.value("ops"), Some(2));
    }

    #[tokio::test]
    async fn test_oversized_auto_flush_interval_is_clamped() {
        let (store, _) = memory_store();
        store.start_auto_flush(Duration::from_secs(u64::MAX));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = store
            .shared
            .flusher
            .lock()
            .as_ref()
            .map(|flusher| !flusher.handle.is_finished());
        assert_eq!(running, Some(true));

        store.stop_auto_flush().await;
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_flush_persists_periodically() {
        let (store, backend) = memory_store();
        store.get_or_create("ticks").inc();
        store.start_auto_flush(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.records.lock().get("ticks"), Some(&1));

        store.stop_auto_flush().await;
        store.close().await.unwrap();
    }

    #[test]
    fn test_concurrent_increments() {
        let (store, _) = memory_store();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let counter = store.get_or_create("shared");
                    for _ in 0..1000 {
                        counter.inc();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(store.value("shared"), Some(8000));
        assert_eq!(store.len(), 1);
    }

    proptest! {
        #[test]
        fn snapshot_is_sorted_and_unique(names in proptest::collection::vec("[a-z]{1,6}", 0..32)) {
            let (store, _) = memory_store();
            for name in &names {
                store.get_or_create(name).inc();
            }

            let snapshot = store.snapshot();
            let keys: Vec<&String> = snapshot.iter().map(|(k, _)| k).collect();
            let mut expected: Vec<&String> = names.iter().collect();
            expected.sort();
            expected.dedup();
            prop_assert_eq!(keys, expected);

            let total: u64 = snapshot.iter().map(|(_, v)| v).sum();
            prop_assert_eq!(total, names.len() as u64);
        }
    }
}
