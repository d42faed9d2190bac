// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The in-process/cluster message bus contract (spec.md §6). Concrete bus
//! backends are external collaborators; this module defines the contract
//! and ships an in-memory default so the crate is runnable standalone.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::packet::Packet;
use crate::topic::filter_matches;

pub type BusFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// A listener callback registered on a topic filter.
pub type Listener = Arc<dyn Fn(Packet) -> BusFuture + Send + Sync>;

/// Opaque handle returned by `Bus::on`, used to unsubscribe later.
pub type SubscriptionId = u64;

#[async_trait]
pub trait Bus: std::fmt::Debug + Send + Sync {
    /// Register `listener` on `topic_filter`. Returns a handle that
    /// `remove_listener` accepts.
    async fn on(&self, topic_filter: &str, listener: Listener) -> SubscriptionId;

    /// Unsubscribe a previously registered listener.
    async fn remove_listener(&self, topic_filter: &str, id: SubscriptionId);

    /// Dispatch `packet` to every currently-live subscriber whose filter
    /// matches its topic. Each matching listener is invoked at most once;
    /// completes only once every invoked listener's future has resolved.
    /// The first error returned by any listener is propagated.
    async fn emit(&self, packet: Packet) -> Result<(), Error>;
}

struct Entry {
    filter: String,
    id: SubscriptionId,
    listener: Listener,
}

/// Default in-memory bus: every matching listener runs concurrently.
#[derive(Debug, Default)]
pub struct MemoryBus {
    entries: Mutex<Vec<EntryDebug>>,
    next_id: AtomicU64,
}

// `Listener` (a trait object closure) has no useful `Debug` impl; wrap it
// so the surrounding `MemoryBus` can still derive `Debug` for parity with
// the rest of the crate's structs.
struct EntryDebug(Entry);

impl std::fmt::Debug for EntryDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("filter", &self.0.filter)
            .field("id", &self.0.id)
            .finish()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn on(&self, topic_filter: &str, listener: Listener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().await.push(EntryDebug(Entry {
            filter: topic_filter.to_string(),
            id,
            listener,
        }));
        id
    }

    async fn remove_listener(&self, topic_filter: &str, id: SubscriptionId) {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| !(e.0.filter == topic_filter && e.0.id == id));
    }

    async fn emit(&self, packet: Packet) -> Result<(), Error> {
        let matching: Vec<Listener> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|e| filter_matches(&e.0.filter, &packet.topic))
                .map(|e| e.0.listener.clone())
                .collect()
        };

        let mut futures = Vec::with_capacity(matching.len());
        for listener in matching {
            futures.push((listener)(packet.clone()));
        }

        let results = futures::future::join_all(futures).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}
