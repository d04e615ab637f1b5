//! Bounded, persistent FIFO of envelopes that could not be delivered.
//!
//! Items are appended after a queueable failure and re-sent, oldest first,
//! after the next successful live send. The queue file is a JSON array that
//! is rewritten atomically (temp file + rename) after every mutation.
//!
//! Only one drain runs at a time. A drain never holds the queue lock across
//! a network call: it peeks the front item, sends it unlocked, then removes
//! it by id. New failures may be enqueued while a drain is in flight.
//!
//! File writes happen after the items lock is released. Each mutation stamps
//! its snapshot with a generation number and a snapshot older than the one
//! already on disk is never written.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{DispatchEnvelope, is_backdated};
use crate::error::QueueError;
use crate::transmit::{Deliver, Outcome};

/// Default number of items kept.
pub const DEFAULT_CAPACITY: usize = 100;

/// One undelivered envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub envelope: DispatchEnvelope,
    /// Original capture (aligned dispatch) time, Unix milliseconds.
    pub captured_at_ms: i64,
    /// Attempts already made before the item was queued.
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Last failure, for operators.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(envelope: DispatchEnvelope, retry_count: u32, last_error: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at_ms: envelope.timestamp_ms,
            envelope,
            retry_count,
            enqueued_at: Utc::now(),
            last_error,
        }
    }
}

/// What [`FailureQueue::enqueue`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest item.
    Evicted(Box<QueueItem>),
    /// Already past the backdate limit; not queued.
    Expired,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub sent: usize,
    /// Items dropped for exceeding the backdate limit.
    pub discarded: usize,
    /// Outcome that stopped the drain, if any.
    pub aborted: Option<Outcome>,
    /// Items left in the queue afterwards.
    pub remaining: usize,
}

impl std::fmt::Display for DrainReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {}, discarded {}, remaining {}",
            self.sent, self.discarded, self.remaining
        )?;
        if let Some(outcome) = &self.aborted {
            write!(f, " (stopped: {outcome})")?;
        }
        Ok(())
    }
}

/// Clears the drain flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Contents captured under the items lock, written after it is released.
struct Staged {
    generation: u64,
    items: Vec<QueueItem>,
}

pub struct FailureQueue {
    items: Mutex<VecDeque<QueueItem>>,
    /// Bumped under the items lock on every mutation.
    generation: AtomicU64,
    /// Generation currently on disk. Serialises file writes.
    written: Mutex<u64>,
    capacity: usize,
    path: Option<PathBuf>,
    draining: AtomicBool,
}

impl FailureQueue {
    /// In-memory queue (tests, one-shot commands).
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
            capacity: capacity.max(1),
            path: None,
            draining: AtomicBool::new(false),
        }
    }

    /// Open the queue backed by `path`, loading any saved items.
    ///
    /// A missing file is an empty queue. A corrupt file is logged and
    /// treated as empty; it is overwritten on the next mutation.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut items = match load_items(&path) {
            Ok(items) => items,
            Err(e) => {
                log::error!("failure queue: {e}; starting empty");
                VecDeque::new()
            }
        };
        if items.len() > capacity {
            let excess = items.len() - capacity;
            log::warn!(
                "failure queue: {} holds {} items, dropping the oldest {excess}",
                path.display(),
                items.len()
            );
            items.drain(..excess);
        }
        if !items.is_empty() {
            log::info!("failure queue: restored {} item(s)", items.len());
        }
        Self {
            items: Mutex::new(items),
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
            capacity,
            path: Some(path),
            draining: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current items, oldest first.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.lock().iter().cloned().collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an item, evicting the oldest one if the queue is full.
    pub fn enqueue(&self, item: QueueItem) -> EnqueueOutcome {
        if is_backdated(item.captured_at_ms, Utc::now()) {
            log::warn!(
                "failure queue: item {} is past the backdate limit, not queued",
                item.id
            );
            return EnqueueOutcome::Expired;
        }

        let mut items = self.lock();
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        log::info!(
            "failure queue: queued {} (ts {}, {} attempt(s))",
            item.id,
            item.captured_at_ms,
            item.retry_count
        );
        items.push_back(item);
        let staged = self.stage(&items);
        drop(items);
        self.write_staged(staged);

        match evicted {
            Some(old) => {
                log::warn!(
                    "failure queue: full ({}), evicted oldest item {} (ts {})",
                    self.capacity,
                    old.id,
                    old.captured_at_ms
                );
                EnqueueOutcome::Evicted(Box::new(old))
            }
            None => EnqueueOutcome::Queued,
        }
    }

    /// Remove every item. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let n = items.len();
        items.clear();
        let staged = self.stage(&items);
        drop(items);
        self.write_staged(staged);
        n
    }

    /// Write the current contents to disk.
    pub fn persist(&self) -> Result<(), QueueError> {
        let staged = {
            let items = self.lock();
            Staged {
                generation: self.generation.load(Ordering::Acquire),
                items: items.iter().cloned().collect(),
            }
        };
        self.write_snapshot(&staged)
    }

    /// Snapshot a mutation. Call with the items lock held.
    fn stage(&self, items: &VecDeque<QueueItem>) -> Option<Staged> {
        self.path.as_ref()?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Some(Staged {
            generation,
            items: items.iter().cloned().collect(),
        })
    }

    fn write_staged(&self, staged: Option<Staged>) {
        if let Some(staged) = staged {
            if let Err(e) = self.write_snapshot(&staged) {
                log::error!("failure queue: {e}");
            }
        }
    }

    fn write_snapshot(&self, staged: &Staged) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if *written > staged.generation {
            return Ok(());
        }
        write_items(path, &staged.items)?;
        *written = staged.generation;
        Ok(())
    }

    fn front(&self) -> Option<QueueItem> {
        self.lock().front().cloned()
    }

    fn remove(&self, id: Uuid) -> bool {
        let mut items = self.lock();
        let Some(pos) = items.iter().position(|item| item.id == id) else {
            return false;
        };
        items.remove(pos);
        let staged = self.stage(&items);
        drop(items);
        self.write_staged(staged);
        true
    }

    /// Re-send queued items oldest first, stopping at the first failure.
    ///
    /// Items past the backdate limit are discarded without a send. A failed
    /// item and everything behind it stay in the queue, unmodified.
    pub async fn drain<D: Deliver>(&self, transport: &D) -> Result<DrainReport, QueueError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(QueueError::DrainInProgress);
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        while let Some(item) = self.front() {
            if is_backdated(item.captured_at_ms, Utc::now()) {
                log::warn!(
                    "failure queue: discarding {} (ts {}), past the backdate limit",
                    item.id,
                    item.captured_at_ms
                );
                self.remove(item.id);
                report.discarded += 1;
                continue;
            }

            let outcome = transport.deliver(&item.envelope).await;
            if outcome.is_success() {
                log::info!("failure queue: delivered {} (ts {})", item.id, item.captured_at_ms);
                self.remove(item.id);
                report.sent += 1;
            } else {
                log::warn!("failure queue: drain stopped at {}: {outcome}", item.id);
                report.aborted = Some(outcome);
                break;
            }
        }
        report.remaining = self.len();
        Ok(report)
    }

    /// Start a background drain unless one is already running.
    ///
    /// Returns `false` when a drain was already active or the queue is empty.
    pub fn spawn_drain<D>(self: &Arc<Self>, transport: Arc<D>) -> bool
    where
        D: Deliver + 'static,
    {
        if self.is_empty() || self.is_draining() {
            return false;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            match queue.drain(transport.as_ref()).await {
                Ok(report) if report.sent + report.discarded > 0 || report.aborted.is_some() => {
                    log::info!("failure queue: drain finished: {report}");
                }
                Ok(_) => {}
                Err(QueueError::DrainInProgress) => {
                    log::debug!("failure queue: drain already running");
                }
                Err(e) => log::error!("failure queue: drain failed: {e}"),
            }
        });
        true
    }
}

impl std::fmt::Debug for FailureQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("path", &self.path)
            .field("draining", &self.is_draining())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn load_items(path: &Path) -> Result<VecDeque<QueueItem>, QueueError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(source) => {
            return Err(QueueError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if text.trim().is_empty() {
        return Ok(VecDeque::new());
    }
    serde_json::from_str::<Vec<QueueItem>>(&text)
        .map(VecDeque::from)
        .map_err(|source| QueueError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_items(path: &Path, items: &[QueueItem]) -> Result<(), QueueError> {
    let io_err = |source: std::io::Error| QueueError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let json = serde_json::to_vec_pretty(items).map_err(|e| io_err(std::io::Error::other(e)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::codec::{BACKDATE_LIMIT_MS, EnvelopeParam};

    fn envelope(ts_ms: i64) -> DispatchEnvelope {
        DispatchEnvelope {
            station_id: "stn".into(),
            device_id: "dev".into(),
            timestamp_ms: ts_ms,
            params: vec![EnvelopeParam {
                parameter: "pm25".into(),
                value: 1.0,
                unit: "ug/m3".into(),
                timestamp: ts_ms,
                flag: "U".into(),
            }],
        }
    }

    fn recent(offset_min: i64) -> i64 {
        let now = Utc::now().timestamp_millis();
        now - now % 60_000 - offset_min * 60_000
    }

    fn item(ts_ms: i64) -> QueueItem {
        QueueItem::new(envelope(ts_ms), 4, Some("server error (HTTP 503)".into()))
    }

    /// Scripted transport: answers from a list, then keeps failing.
    struct Scripted {
        outcomes: Mutex<VecDeque<Outcome>>,
        seen: Mutex<Vec<i64>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Deliver for Scripted {
        async fn deliver(&self, envelope: &DispatchEnvelope) -> Outcome {
            self.seen.lock().unwrap().push(envelope.timestamp_ms);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::ServerError(503))
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_and_keeps_order() {
        let queue = FailureQueue::in_memory(3);
        let ts: Vec<i64> = (0..4).map(|i| recent(10 - i)).collect();
        for t in &ts[..3] {
            assert_eq!(queue.enqueue(item(*t)), EnqueueOutcome::Queued);
        }
        let outcome = queue.enqueue(item(ts[3]));
        match outcome {
            EnqueueOutcome::Evicted(old) => assert_eq!(old.captured_at_ms, ts[0]),
            other => panic!("expected eviction, got {other:?}"),
        }
        let kept: Vec<i64> = queue.snapshot().iter().map(|i| i.captured_at_ms).collect();
        assert_eq!(kept, ts[1..].to_vec());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_expired_item_is_not_queued() {
        let queue = FailureQueue::in_memory(3);
        let old = Utc::now().timestamp_millis() - BACKDATE_LIMIT_MS - 60_000;
        assert_eq!(queue.enqueue(item(old)), EnqueueOutcome::Expired);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_sends_all_in_order() {
        let queue = FailureQueue::in_memory(10);
        let ts = [recent(3), recent(2), recent(1)];
        for t in ts {
            queue.enqueue(item(t));
        }
        let transport = Scripted::new(vec![Outcome::Success; 3]);
        let report = queue.drain(&transport).await.unwrap();
        assert_eq!(report.sent, 3);
        assert_eq!(report.remaining, 0);
        assert!(report.aborted.is_none());
        assert_eq!(transport.seen(), ts.to_vec());
    }

    #[tokio::test]
    async fn test_drain_halts_on_first_failure() {
        let queue = FailureQueue::in_memory(10);
        let ts = [recent(4), recent(3), recent(2), recent(1)];
        for t in ts {
            queue.enqueue(item(t));
        }
        let before = queue.snapshot();
        let transport = Scripted::new(vec![Outcome::Success, Outcome::ServerError(500)]);

        let report = queue.drain(&transport).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.aborted, Some(Outcome::ServerError(500)));
        assert_eq!(report.remaining, 3);
        // The failed item and all later items are untouched and in order.
        assert_eq!(queue.snapshot(), before[1..].to_vec());
        assert_eq!(transport.seen(), vec![ts[0], ts[1]]);
    }

    #[tokio::test]
    async fn test_drain_discards_backdated_without_sending() {
        let queue = FailureQueue::in_memory(10);
        let fresh = recent(1);
        // Queued while fresh, aged afterwards.
        queue.enqueue(item(recent(2)));
        queue.enqueue(item(fresh));
        {
            let mut items = queue.lock();
            items[0].captured_at_ms = Utc::now().timestamp_millis() - BACKDATE_LIMIT_MS - 1_000;
        }

        let transport = Scripted::new(vec![Outcome::Success]);
        let report = queue.drain(&transport).await.unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(transport.seen(), vec![fresh]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_refused() {
        let queue = Arc::new(FailureQueue::in_memory(10));
        queue.enqueue(item(recent(1)));
        let mut transport = Scripted::new(vec![Outcome::Success]);
        transport.delay = Duration::from_millis(200);
        let transport = Arc::new(transport);

        let first = {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { queue.drain(transport.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_draining());
        assert!(matches!(
            queue.drain(transport.as_ref()).await,
            Err(QueueError::DrainInProgress)
        ));
        assert!(!queue.spawn_drain(Arc::clone(&transport)));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.sent, 1);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_spawn_drain_runs_in_background() {
        let queue = Arc::new(FailureQueue::in_memory(10));
        queue.enqueue(item(recent(1)));
        let transport = Arc::new(Scripted::new(vec![Outcome::Success]));
        assert!(queue.spawn_drain(Arc::clone(&transport)));
        for _ in 0..100 {
            if queue.is_empty() && !queue.is_draining() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
        assert!(!queue.spawn_drain(transport));
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_queue.json");
        let queue = FailureQueue::open(&path, 5);
        queue.enqueue(item(recent(2)));
        queue.enqueue(item(recent(1)));
        let saved = queue.snapshot();
        drop(queue);

        let reopened = FailureQueue::open(&path, 5);
        assert_eq!(reopened.snapshot(), saved);
    }

    #[test]
    fn test_reload_truncates_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        let queue = FailureQueue::open(&path, 10);
        for i in (1..=6).rev() {
            queue.enqueue(item(recent(i)));
        }
        let newest: Vec<_> = queue.snapshot()[4..].to_vec();
        drop(queue);

        let reopened = FailureQueue::open(&path, 2);
        assert_eq!(reopened.snapshot(), newest);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        std::fs::write(&path, "{ not json").unwrap();
        let queue = FailureQueue::open(&path, 5);
        assert!(queue.is_empty());
        queue.enqueue(item(recent(1)));
        assert_eq!(FailureQueue::open(&path, 5).len(), 1);
    }

    #[test]
    fn test_concurrent_enqueues_leave_latest_contents_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        let queue = Arc::new(FailureQueue::open(&path, 100));
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        queue.enqueue(item(recent(i)));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(queue.len(), 40);
        assert_eq!(FailureQueue::open(&path, 100).snapshot(), queue.snapshot());
    }

    #[test]
    fn test_clear() {
        let queue = FailureQueue::in_memory(5);
        queue.enqueue(item(recent(1)));
        queue.enqueue(item(recent(2)));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
