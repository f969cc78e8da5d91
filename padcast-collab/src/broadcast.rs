//! Per-document fan-out loop.
//!
//! Every document runs exactly one [`Broadcaster`]. It consumes committed
//! updates from the document's bounded queue one at a time, in submission
//! order, and hands each to every registered client.
//!
//! Content is shared as `Arc<str>`, so N clients cost N reference-count
//! bumps rather than N copies.
//!
//! A client whose send fails is closed and dropped from the set, and
//! delivery continues to the rest. One bad connection never blocks or
//! aborts delivery to the others. A full outbound buffer counts as a failed
//! send: a client that falls that far behind is disconnected rather than
//! allowed to stall the document.
//!
//! Clients whose join snapshot already carries an update's revision are
//! skipped for that update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};

use crate::client::ClientId;
use crate::document::{DocumentPhase, DocumentState, Member, Update};
use crate::entry_code::EntryCode;

/// Fan-out statistics for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Updates taken off the queue and fanned out
    pub updates_broadcast: u64,
    /// Successful per-client sends
    pub deliveries: u64,
    /// Clients dropped after a failed send
    pub dropped_clients: u64,
}

/// Atomic counters behind [`BroadcastStats`], updated without the document lock.
#[derive(Debug, Default)]
pub(crate) struct AtomicBroadcastStats {
    pub(crate) updates_broadcast: AtomicU64,
    pub(crate) deliveries: AtomicU64,
    pub(crate) dropped_clients: AtomicU64,
}

/// Outcome of fanning out one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// Send `update` to every member that joined before it, dropping the ones
/// whose send fails.
pub(crate) fn fan_out(
    entry_code: &EntryCode,
    clients: &mut HashMap<ClientId, Member>,
    update: &Update,
) -> FanOut {
    let mut outcome = FanOut::default();
    let mut failed = Vec::new();

    for (id, member) in clients.iter() {
        if member.joined_at >= update.revision {
            continue;
        }
        match member.handle.send(update.content.clone()) {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                log::warn!(
                    "Error broadcasting to client {} on document {entry_code}: {e}",
                    member.name
                );
                failed.push(*id);
            }
        }
    }

    for id in failed {
        if let Some(member) = clients.remove(&id) {
            member.handle.close();
            log::info!("Client {} removed from document {entry_code}", member.name);
            outcome.dropped += 1;
        }
    }

    outcome
}

/// The consumer side of a document's update queue.
pub(crate) struct Broadcaster {
    entry_code: EntryCode,
    /// Weak so that dropping the document releases its state and closes the queue
    state: Weak<Mutex<DocumentState>>,
    updates: mpsc::Receiver<Update>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    pub(crate) fn new(
        entry_code: EntryCode,
        state: Weak<Mutex<DocumentState>>,
        updates: mpsc::Receiver<Update>,
        stats: Arc<AtomicBroadcastStats>,
    ) -> Self {
        Self {
            entry_code,
            state,
            updates,
            stats,
        }
    }

    /// Run until the queue is closed or the document is deleted.
    pub(crate) async fn run(mut self) {
        log::debug!("Broadcaster started for document {}", self.entry_code);

        while let Some(update) = self.updates.recv().await {
            let Some(state) = self.state.upgrade() else {
                break;
            };
            let mut state = state.lock().await;
            if state.phase == DocumentPhase::Deleted {
                break;
            }

            let outcome = fan_out(&self.entry_code, &mut state.clients, &update);

            self.stats.updates_broadcast.fetch_add(1, Ordering::Relaxed);
            self.stats
                .deliveries
                .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
            self.stats
                .dropped_clients
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }

        log::debug!("Broadcaster stopped for document {}", self.entry_code);
    }
}
