//! A shared document: one text value, its clients, and a fan-out queue.
//!
//! Two locks, always taken in this order:
//!
//! ```text
//!  publisher: Mutex<Option<Sender<Update>>>   serialises writers, held
//!      │                                      across commit + enqueue
//!      └─► state: Mutex<DocumentState>        content, clients, phase;
//!                                             never held across an await
//! ```
//!
//! A writer commits under the state lock, releases it, and only then waits
//! for queue space while still holding the publisher lock. Queue order is
//! therefore commit order, and the broadcaster, which only needs the state
//! lock, can always drain the queue.
//!
//! Conflict policy is last-write-wins by arrival order at the publisher
//! lock. Each commit bumps an internal revision; it is used only to skip
//! updates a joining client already has in its snapshot, never to resolve
//! conflicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broadcast::{AtomicBroadcastStats, BroadcastStats, Broadcaster};
use crate::client::{ClientHandle, ClientId};
use crate::entry_code::EntryCode;

/// Lifecycle of a document. `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentPhase {
    Active,
    Deleted,
}

/// One committed update on its way to the broadcaster.
#[derive(Debug, Clone)]
pub(crate) struct Update {
    pub(crate) revision: u64,
    pub(crate) content: Arc<str>,
}

/// A registered client: display name plus the handle used to reach it.
#[derive(Debug)]
pub(crate) struct Member {
    pub(crate) name: String,
    pub(crate) handle: ClientHandle,
    /// Revision contained in the snapshot sent on join
    pub(crate) joined_at: u64,
}

/// Everything guarded by the document lock.
#[derive(Debug)]
pub(crate) struct DocumentState {
    pub(crate) content: Arc<str>,
    pub(crate) revision: u64,
    pub(crate) clients: HashMap<ClientId, Member>,
    pub(crate) phase: DocumentPhase,
}

impl DocumentState {
    /// Close and drop every client. Returns how many were dropped.
    pub(crate) fn disconnect_all(&mut self) -> usize {
        let count = self.clients.len();
        for (_, member) in self.clients.drain() {
            member.handle.close();
        }
        count
    }
}

/// One collaborative document.
pub struct Document {
    entry_code: EntryCode,
    state: Arc<Mutex<DocumentState>>,
    /// Producer side of the update queue; `None` once closed.
    publisher: Mutex<Option<mpsc::Sender<Update>>>,
    created: Instant,
    /// Nanoseconds after `created` of the last commit. Readable without a lock.
    touched: AtomicU64,
    stats: Arc<AtomicBroadcastStats>,
    broadcaster: JoinHandle<()>,
}

impl Document {
    /// Create an empty document and start its broadcaster.
    ///
    /// Must be called within a tokio runtime. `queue_capacity` bounds the
    /// number of committed updates awaiting fan-out.
    pub fn spawn(entry_code: EntryCode, queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let state = Arc::new(Mutex::new(DocumentState {
            content: Arc::from(""),
            revision: 0,
            clients: HashMap::new(),
            phase: DocumentPhase::Active,
        }));
        let stats = Arc::new(AtomicBroadcastStats::default());

        let broadcaster = Broadcaster::new(
            entry_code.clone(),
            Arc::downgrade(&state),
            rx,
            stats.clone(),
        );
        let task = tokio::spawn(broadcaster.run());

        Arc::new(Self {
            entry_code,
            state,
            publisher: Mutex::new(Some(tx)),
            created: Instant::now(),
            touched: AtomicU64::new(0),
            stats,
            broadcaster: task,
        })
    }

    pub fn entry_code(&self) -> &EntryCode {
        &self.entry_code
    }

    /// Register a client and send it the current content.
    ///
    /// The snapshot is sent under the lock and records the revision it
    /// carries, so the client only receives strictly newer updates
    /// afterwards. A failed snapshot send is logged and the client stays
    /// registered; the next broadcast drops it. Joining a deleted document
    /// closes the handle instead.
    pub async fn add_client(&self, handle: ClientHandle, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.state.lock().await;

        if state.phase == DocumentPhase::Deleted {
            log::debug!("Client {name} tried to join deleted document {}", self.entry_code);
            handle.close();
            return;
        }

        if let Err(e) = handle.send(state.content.clone()) {
            log::warn!(
                "Error sending initial content to client {name} on document {}: {e}",
                self.entry_code
            );
        }

        log::info!("Client {name} added to document {}", self.entry_code);
        let joined_at = state.revision;
        state.clients.insert(
            handle.id(),
            Member {
                name,
                handle,
                joined_at,
            },
        );
    }

    /// Remove a client. Removing an unknown client is a no-op.
    ///
    /// Returns whether the client was registered.
    pub async fn remove_client(&self, id: ClientId) -> bool {
        let mut state = self.state.lock().await;
        match state.clients.remove(&id) {
            Some(member) => {
                log::info!("Client {} removed from document {}", member.name, self.entry_code);
                true
            }
            None => false,
        }
    }

    /// Replace the content and queue it for fan-out.
    ///
    /// Waits for earlier writers and for queue space, never for delivery.
    /// Returns `false` when the document has been deleted, in which case
    /// nothing changes.
    pub async fn update_content(&self, content: impl Into<Arc<str>>) -> bool {
        let content = content.into();
        let publisher = self.publisher.lock().await;
        let Some(tx) = publisher.as_ref() else {
            log::debug!("Dropping update to deleted document {}", self.entry_code);
            return false;
        };

        let update = {
            let mut state = self.state.lock().await;
            if state.phase == DocumentPhase::Deleted {
                log::debug!("Dropping update to deleted document {}", self.entry_code);
                return false;
            }
            state.revision += 1;
            state.content = content.clone();
            self.touch();
            Update {
                revision: state.revision,
                content,
            }
        };

        // State lock released: the broadcaster keeps draining while we wait
        if tx.send(update).await.is_err() {
            log::warn!("Update queue closed for document {}", self.entry_code);
        }
        true
    }

    /// Close every client and stop the broadcaster. Idempotent.
    ///
    /// Returns the number of clients that were disconnected.
    pub(crate) async fn close(&self) -> usize {
        let disconnected = {
            let mut state = self.state.lock().await;
            if state.phase == DocumentPhase::Deleted {
                return 0;
            }
            state.phase = DocumentPhase::Deleted;
            state.disconnect_all()
        };
        // A writer blocked on a full queue is released once the broadcaster
        // sees the phase change and drops the receiver.
        self.publisher.lock().await.take();
        disconnected
    }

    fn touch(&self) {
        let nanos = u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.touched.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Snapshot of the current content.
    pub async fn content(&self) -> String {
        self.state.lock().await.content.to_string()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn has_client(&self, id: ClientId) -> bool {
        self.state.lock().await.clients.contains_key(&id)
    }

    /// Display names of all registered clients, in no particular order.
    pub async fn client_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .clients
            .values()
            .map(|m| m.name.clone())
            .collect()
    }

    /// When the content was last replaced (creation time if never).
    pub fn last_updated(&self) -> Instant {
        self.created + Duration::from_nanos(self.touched.load(Ordering::Relaxed))
    }

    /// How long the document has gone without an update as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_updated())
    }

    pub async fn phase(&self) -> DocumentPhase {
        self.state.lock().await.phase
    }

    pub async fn is_active(&self) -> bool {
        self.phase().await == DocumentPhase::Active
    }

    /// Whether the broadcaster task has exited.
    pub fn broadcaster_finished(&self) -> bool {
        self.broadcaster.is_finished()
    }

    /// Lock-free fan-out counters.
    pub fn broadcast_stats(&self) -> BroadcastStats {
        BroadcastStats {
            updates_broadcast: self.stats.updates_broadcast.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            dropped_clients: self.stats.dropped_clients.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, DocumentState> {
        self.state.lock().await
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("entry_code", &self.entry_code)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientLink;
    use tokio::time::{timeout, Duration};

    async fn next(link: &mut ClientLink) -> Option<String> {
        timeout(Duration::from_secs(1), link.recv())
            .await
            .expect("timed out waiting for message")
            .map(|s| s.to_string())
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_new_document_is_empty() {
        let doc = Document::spawn(EntryCode::from("AB12cd"), 8);
        assert_eq!(doc.entry_code().as_str(), "AB12cd");
        assert_eq!(doc.content().await, "");
        assert_eq!(doc.client_count().await, 0);
        assert!(doc.is_active().await);
        assert!(!doc.broadcaster_finished());
    }

    #[tokio::test]
    async fn test_add_client_receives_snapshot() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        doc.update_content("draft").await;

        let (handle, mut link) = ClientHandle::channel(8);
        let id = handle.id();
        doc.add_client(handle, "Alice").await;

        assert_eq!(next(&mut link).await.as_deref(), Some("draft"));
        assert!(doc.has_client(id).await);
        assert_eq!(doc.client_names().await, vec!["Alice".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_snapshot_keeps_client_registered() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        let (handle, link) = ClientHandle::channel(8);
        let id = handle.id();
        drop(link);

        doc.add_client(handle, "Ghost").await;
        assert!(doc.has_client(id).await);

        // The next broadcast notices the dead handle
        doc.update_content("ping").await;
        wait_until(|| async { !doc.has_client(id).await }).await;
    }

    #[tokio::test]
    async fn test_update_fans_out_in_order() {
        let doc = Document::spawn(EntryCode::generate(), 1);
        let (h1, mut l1) = ClientHandle::channel(64);
        let (h2, mut l2) = ClientHandle::channel(64);
        doc.add_client(h1, "A").await;
        doc.add_client(h2, "B").await;
        assert_eq!(next(&mut l1).await.as_deref(), Some(""));
        assert_eq!(next(&mut l2).await.as_deref(), Some(""));

        for i in 0..20 {
            doc.update_content(format!("v{i}")).await;
        }

        for i in 0..20 {
            let expected = format!("v{i}");
            assert_eq!(next(&mut l1).await, Some(expected.clone()));
            assert_eq!(next(&mut l2).await, Some(expected));
        }
        assert_eq!(doc.content().await, "v19");
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        doc.update_content("first").await;
        doc.update_content("second").await;
        assert_eq!(doc.content().await, "second");
    }

    #[tokio::test]
    async fn test_update_refreshes_last_updated() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        let created = doc.last_updated();
        tokio::time::sleep(Duration::from_millis(10)).await;
        doc.update_content("x").await;
        assert!(doc.last_updated() > created);
        assert!(doc.idle_for(Instant::now()) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_remove_client_is_idempotent() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        let (handle, _link) = ClientHandle::channel(8);
        let id = handle.id();
        doc.add_client(handle, "Alice").await;

        assert!(doc.remove_client(id).await);
        assert!(!doc.remove_client(id).await);
        assert!(!doc.remove_client(ClientId::new()).await);
        assert_eq!(doc.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_removed_client_gets_no_more_updates() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        let (h1, mut l1) = ClientHandle::channel(8);
        let (h2, mut l2) = ClientHandle::channel(8);
        let id1 = h1.id();
        doc.add_client(h1, "A").await;
        doc.add_client(h2, "B").await;
        next(&mut l1).await;
        next(&mut l2).await;

        doc.remove_client(id1).await;
        doc.update_content("after").await;

        assert_eq!(next(&mut l2).await.as_deref(), Some("after"));
        let res = timeout(Duration::from_millis(50), l1.recv()).await;
        assert!(res.is_err(), "removed client should not receive updates");
    }

    #[tokio::test]
    async fn test_close_disconnects_and_stops_broadcaster() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        let (handle, mut link) = ClientHandle::channel(8);
        doc.add_client(handle, "A").await;
        next(&mut link).await;

        assert_eq!(doc.close().await, 1);
        assert_eq!(next(&mut link).await, None);
        assert_eq!(doc.phase().await, DocumentPhase::Deleted);
        assert_eq!(doc.close().await, 0);

        wait_until(|| async { doc.broadcaster_finished() }).await;

        // Updates after deletion are rejected, never panic
        assert!(!doc.update_content("late").await);
        assert_eq!(doc.content().await, "");
    }

    #[tokio::test]
    async fn test_add_client_to_deleted_document_closes_handle() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        doc.close().await;

        let (handle, mut link) = ClientHandle::channel(8);
        let id = handle.id();
        doc.add_client(handle, "Late").await;

        assert_eq!(next(&mut link).await, None);
        assert!(!doc.has_client(id).await);
    }

    #[tokio::test]
    async fn test_dropping_document_stops_broadcaster() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        let task_done = {
            let weak = Arc::downgrade(&doc.state);
            drop(doc);
            weak
        };
        // State is released once the only strong owner is gone
        wait_until(|| async { task_done.upgrade().is_none() }).await;
    }

    /// Parse a `w{writer}:{seq}` payload.
    fn parse_write(s: &str) -> (usize, usize) {
        let (w, j) = s.trim_start_matches('w').split_once(':').unwrap();
        (w.parse().unwrap(), j.parse().unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_complete_and_stay_ordered() {
        const WRITERS: usize = 8;
        const WRITES: usize = 250;

        let doc = Document::spawn(EntryCode::generate(), 1);
        let mut links = Vec::new();
        for name in ["A", "B", "C"] {
            let (handle, mut link) = ClientHandle::channel(WRITERS * WRITES + 8);
            doc.add_client(handle, name).await;
            assert_eq!(next(&mut link).await.as_deref(), Some(""));
            links.push(link);
        }

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let doc = doc.clone();
                tokio::spawn(async move {
                    for j in 0..WRITES {
                        assert!(doc.update_content(format!("w{w}:{j}")).await);
                    }
                })
            })
            .collect();
        for writer in writers {
            timeout(Duration::from_secs(10), writer)
                .await
                .expect("writer wedged")
                .unwrap();
        }
        let final_content = timeout(Duration::from_secs(1), doc.content())
            .await
            .expect("document lock wedged");

        let mut sequences = Vec::new();
        for link in links.iter_mut() {
            let mut received = Vec::with_capacity(WRITERS * WRITES);
            for _ in 0..WRITERS * WRITES {
                received.push(next(link).await.unwrap());
            }
            sequences.push(received);
        }

        // Every client sees the same commit order
        assert!(sequences.iter().all(|seq| *seq == sequences[0]));
        assert_eq!(sequences[0].last(), Some(&final_content));

        // Each writer's own updates stay in submission order
        let mut last_seen = vec![None; WRITERS];
        for payload in &sequences[0] {
            let (w, j) = parse_write(payload);
            if let Some(prev) = last_seen[w] {
                assert!(j > prev, "writer {w} reordered: {j} after {prev}");
            }
            last_seen[w] = Some(j);
        }
        assert!(last_seen.iter().all(|j| *j == Some(WRITES - 1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_membership_churn_during_writes() {
        let doc = Document::spawn(EntryCode::generate(), 1);
        let (stable, mut stable_link) = ClientHandle::channel(4096);
        doc.add_client(stable, "stable").await;
        next(&mut stable_link).await;

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let doc = doc.clone();
                tokio::spawn(async move {
                    for j in 0..200 {
                        doc.update_content(format!("w{w}:{j}")).await;
                    }
                })
            })
            .collect();

        let joiners: Vec<_> = (0..4)
            .map(|i| {
                let doc = doc.clone();
                tokio::spawn(async move {
                    for round in 0..25 {
                        let (handle, mut link) = ClientHandle::channel(1024);
                        let id = handle.id();
                        doc.add_client(handle, format!("joiner{i}-{round}")).await;
                        // The snapshot always arrives first
                        assert!(link.recv().await.is_some());
                        doc.remove_client(id).await;
                    }
                })
            })
            .collect();

        for task in writers.into_iter().chain(joiners) {
            timeout(Duration::from_secs(10), task)
                .await
                .expect("task wedged")
                .unwrap();
        }

        let mut last_seen = [None; 4];
        for _ in 0..800 {
            let (w, j) = parse_write(&next(&mut stable_link).await.unwrap());
            if let Some(prev) = last_seen[w] {
                assert!(j > prev);
            }
            last_seen[w] = Some(j);
        }
        assert_eq!(doc.client_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_releases_blocked_writers() {
        let doc = Document::spawn(EntryCode::generate(), 1);
        let (handle, mut link) = ClientHandle::channel(2);
        doc.add_client(handle, "slow").await;

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let doc = doc.clone();
                tokio::spawn(async move {
                    for j in 0..100_000 {
                        if !doc.update_content(format!("w{w}:{j}")).await {
                            break;
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        timeout(Duration::from_secs(5), doc.close())
            .await
            .expect("close wedged");

        for writer in writers {
            timeout(Duration::from_secs(10), writer)
                .await
                .expect("writer wedged after close")
                .unwrap();
        }
        assert!(!doc.update_content("late").await);
        wait_until(|| async { doc.broadcaster_finished() }).await;

        // The slow client was either dropped as lagging or closed by delete
        loop {
            match timeout(Duration::from_secs(1), link.recv()).await.unwrap() {
                Some(_) => continue,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_client_dropped_others_keep_receiving() {
        let doc = Document::spawn(EntryCode::generate(), 64);
        let (fast, mut fast_link) = ClientHandle::channel(64);
        let (slow, mut slow_link) = ClientHandle::channel(2);
        let slow_id = slow.id();
        doc.add_client(fast, "fast").await;
        doc.add_client(slow, "slow").await;
        next(&mut fast_link).await;

        for i in 0..10 {
            doc.update_content(format!("v{i}")).await;
        }
        for i in 0..10 {
            assert_eq!(next(&mut fast_link).await, Some(format!("v{i}")));
        }

        // Snapshot plus one update filled the slow buffer; the next send failed
        assert!(!doc.has_client(slow_id).await);
        assert_eq!(slow_link.recv().await, None);
    }

    #[tokio::test]
    async fn test_late_joiner_skips_updates_in_its_snapshot() {
        let doc = Document::spawn(EntryCode::generate(), 8);
        // Both updates may still be queued when the client joins
        doc.update_content("one").await;
        doc.update_content("two").await;

        let (handle, mut link) = ClientHandle::channel(8);
        doc.add_client(handle, "late").await;
        assert_eq!(next(&mut link).await.as_deref(), Some("two"));

        doc.update_content("three").await;
        assert_eq!(next(&mut link).await.as_deref(), Some("three"));
    }
}
