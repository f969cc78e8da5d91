//! Document registry: entry code → live document.
//!
//! ```text
//!                     Arc<DocumentRegistry>
//!               ┌────────────────────────────────┐
//!               │ documents: RwLock<HashMap<     │
//!               │   EntryCode, Arc<Document>>>   │
//!               └───────┬───────────────┬────────┘
//!          read (get)   │               │  write (create/delete/reap)
//!                       ▼               ▼
//!                  [Gateway]        [Reaper] ── every reap_interval
//! ```
//!
//! Lookups share the read lock so concurrent joins never serialise against
//! each other. Create, delete and reaping take the write lock, which also
//! makes code generation collision-free: a candidate is checked and
//! inserted under the same guard. No document lock is ever awaited while
//! the registry lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::{ClientHandle, ClientLink};
use crate::document::Document;
use crate::entry_code::EntryCode;

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the reaper scans for idle documents
    pub reap_interval: Duration,
    /// Documents not updated for longer than this are reaped
    pub idle_threshold: Duration,
    /// Committed updates buffered per document before `update_content` waits
    pub update_queue_capacity: usize,
    /// Outbound messages buffered per client before it counts as lagging
    pub client_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30 * 60),
            idle_threshold: Duration::from_secs(24 * 60 * 60),
            update_queue_capacity: 64,
            client_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("document not found: {0}")]
    NotFound(EntryCode),
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_documents: usize,
    pub connected_clients: usize,
    pub documents_created: u64,
    pub documents_deleted: u64,
    pub documents_reaped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    deleted: AtomicU64,
    reaped: AtomicU64,
}

/// Process-wide map of live documents.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<EntryCode, Arc<Document>>>,
    config: RegistryConfig,
    counters: Counters,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create a document under a fresh, registry-unique entry code and start
    /// its broadcaster.
    pub async fn create(&self) -> Arc<Document> {
        let mut documents = self.documents.write().await;

        let entry_code = loop {
            let candidate = EntryCode::generate();
            if !documents.contains_key(&candidate) {
                break candidate;
            }
            log::debug!("Entry code {candidate} already in use, regenerating");
        };

        let doc = Document::spawn(entry_code.clone(), self.config.update_queue_capacity);
        documents.insert(entry_code.clone(), doc.clone());
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        log::info!("Document {entry_code} created");
        doc
    }

    /// Look up a live document.
    pub async fn get(&self, entry_code: &str) -> Result<Arc<Document>, RegistryError> {
        self.documents
            .read()
            .await
            .get(entry_code)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(EntryCode::from(entry_code)))
    }

    /// Delete a document: close its clients, stop its broadcaster, forget it.
    ///
    /// Deleting an unknown code is a no-op. Returns whether anything was
    /// deleted.
    pub async fn delete(&self, entry_code: &str) -> bool {
        let removed = self.documents.write().await.remove(entry_code);
        match removed {
            Some(doc) => {
                self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                Self::close_document(&doc).await;
                true
            }
            None => false,
        }
    }

    /// Runs after the map entry is gone and the registry lock released.
    async fn close_document(doc: &Document) {
        let disconnected = doc.close().await;
        log::info!(
            "Document {} deleted ({disconnected} clients disconnected)",
            doc.entry_code()
        );
    }

    /// One reaping pass: delete every document idle for longer than
    /// `idle_threshold`. Returns how many were reaped.
    ///
    /// Stale codes are collected first and removed afterwards, both under
    /// the write lock, so deleting during the pass never skips or revisits
    /// an entry. Idle time is read without touching document locks, and
    /// the reaped documents are closed after the registry lock is released.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let (reaped, remaining) = {
            let mut documents = self.documents.write().await;
            let stale: Vec<EntryCode> = documents
                .iter()
                .filter(|(_, doc)| doc.idle_for(now) > self.config.idle_threshold)
                .map(|(code, _)| code.clone())
                .collect();
            let reaped: Vec<Arc<Document>> = stale
                .iter()
                .filter_map(|code| documents.remove(code))
                .collect();
            (reaped, documents.len())
        };

        for doc in &reaped {
            Self::close_document(doc).await;
        }

        let count = reaped.len();
        if count > 0 {
            self.counters.reaped.fetch_add(count as u64, Ordering::Relaxed);
            self.counters.deleted.fetch_add(count as u64, Ordering::Relaxed);
            log::info!("Reaped {count} idle documents, {remaining} remain");
        }
        count
    }

    /// Spawn the periodic idle reaper.
    ///
    /// The first pass runs one `reap_interval` after spawning. The task stops
    /// when [`Reaper::stop`] is called or the [`Reaper`] is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> Reaper {
        let registry = Arc::clone(self);
        let period = registry.config.reap_interval;
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.reap_idle().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            log::debug!("Idle reaper stopped");
        });

        Reaper {
            stop: stop_tx,
            task,
        }
    }

    /// Delete every document. Used at process shutdown.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Arc<Document>> = self
            .documents
            .write()
            .await
            .drain()
            .map(|(_, doc)| doc)
            .collect();
        for doc in &drained {
            Self::close_document(doc).await;
        }
        self.counters
            .deleted
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.len()
    }

    /// New client handle/link pair sized by `client_buffer`.
    pub fn client_channel(&self) -> (ClientHandle, ClientLink) {
        ClientHandle::channel(self.config.client_buffer)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    pub async fn contains(&self, entry_code: &str) -> bool {
        self.documents.read().await.contains_key(entry_code)
    }

    /// All live entry codes, in no particular order.
    pub async fn entry_codes(&self) -> Vec<EntryCode> {
        self.documents.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let documents: Vec<Arc<Document>> =
            self.documents.read().await.values().cloned().collect();
        let mut connected_clients = 0;
        for doc in &documents {
            connected_clients += doc.client_count().await;
        }
        RegistryStats {
            active_documents: documents.len(),
            connected_clients,
            documents_created: self.counters.created.load(Ordering::Relaxed),
            documents_deleted: self.counters.deleted.load(Ordering::Relaxed),
            documents_reaped: self.counters.reaped.load(Ordering::Relaxed),
        }
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the background idle reaper.
#[derive(Debug)]
pub struct Reaper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Signal the reaper to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
