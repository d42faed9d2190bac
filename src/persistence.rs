// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The persistence contract (spec.md §6). Concrete backends (in-memory,
//! disk, distributed KV) are external collaborators; this module defines
//! the contract and ships the in-memory default.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::packet::{Packet, Subscription, Will};
use crate::topic::filter_matches;
use crate::types::BrokerId;

pub type PacketStream = Pin<Box<dyn Stream<Item = Packet> + Send>>;
pub type WillStream = Pin<Box<dyn Stream<Item = Will> + Send>>;

#[async_trait]
pub trait Persistence: std::fmt::Debug + Send + Sync {
    /// Upsert `packet` as the retained message for its topic. An empty
    /// payload deletes any prior retained message on that exact topic.
    async fn store_retained(&self, packet: Packet) -> Result<(), Error>;

    /// Lazy, non-restartable stream of retained packets whose topic
    /// matches `pattern` (an MQTT subscription filter).
    async fn create_retained_stream(&self, pattern: &str) -> PacketStream;

    async fn add_subscriptions(&self, subs: Vec<Subscription>) -> Result<(), Error>;

    async fn remove_subscriptions(&self, client_id: &str, topic_filters: &[String]) -> Result<(), Error>;

    async fn subscriptions_by_client(&self, client_id: &str) -> Result<Vec<Subscription>, Error>;

    /// Durable subscribers whose filter matches `topic` (MQTT wildcard
    /// rules honored).
    async fn subscriptions_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, Error>;

    /// Append `packet` to `sub`'s durable outbound queue.
    async fn outgoing_enqueue(&self, sub: &Subscription, packet: Packet) -> Result<(), Error>;

    /// Mark a previously-enqueued outgoing message (identified by
    /// `message_id`) as delivered/retransmitted, for QoS > 0
    /// retransmission bookkeeping. Opaque to the dispatcher core.
    async fn outgoing_update(&self, sub: &Subscription, message_id: u64) -> Result<(), Error>;

    /// Clear a previously-assigned outgoing message id once its
    /// handshake (PUBACK/PUBCOMP) has completed. Opaque to the
    /// dispatcher core.
    async fn outgoing_clear_message_id(&self, sub: &Subscription, message_id: u64) -> Result<(), Error>;

    /// Lazy, non-restartable stream of `sub`'s outstanding outgoing
    /// messages, for session resume on reconnect. Opaque to the
    /// dispatcher core.
    async fn outgoing_stream(&self, sub: &Subscription) -> PacketStream;

    async fn put_will(&self, will: Will) -> Result<(), Error>;

    async fn del_will(&self, client_id: &str) -> Result<(), Error>;

    /// Lazy stream of wills whose owning broker is not a key of
    /// `live_brokers`.
    async fn stream_will(&self, live_brokers: &[BrokerId]) -> WillStream;

    /// Set the owning broker back-reference, so a persistence backend
    /// that needs to call back into the dispatcher (e.g. to re-publish
    /// on backend-driven events) can reach it. Opaque to the dispatcher
    /// core, which never calls this itself.
    fn set_broker(&mut self, broker: std::sync::Weak<crate::broker::Broker>);
}

#[derive(Debug, Default)]
struct MemoryPersistenceState {
    retained: HashMap<String, Packet>,
    subscriptions: Vec<Subscription>,
    outgoing: Vec<(String, Packet)>,
    wills: HashMap<String, Will>,
}

/// In-memory default persistence backend.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryPersistenceState>,
    broker: Option<std::sync::Weak<crate::broker::Broker>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic helper: number of enqueued outgoing messages.
    pub async fn outgoing_len(&self) -> usize {
        self.state.lock().await.outgoing.len()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn store_retained(&self, packet: Packet) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if packet.payload.is_empty() {
            state.retained.remove(&packet.topic);
        } else {
            state.retained.insert(packet.topic.clone(), packet);
        }
        Ok(())
    }

    async fn create_retained_stream(&self, pattern: &str) -> PacketStream {
        let state = self.state.lock().await;
        let matches: Vec<Packet> = state
            .retained
            .values()
            .filter(|p| filter_matches(pattern, &p.topic))
            .cloned()
            .collect();
        Box::pin(stream::iter(matches))
    }

    async fn add_subscriptions(&self, subs: Vec<Subscription>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.subscriptions.extend(subs);
        Ok(())
    }

    async fn remove_subscriptions(&self, client_id: &str, topic_filters: &[String]) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .retain(|s| !(s.client_id == client_id && topic_filters.contains(&s.topic_filter)));
        Ok(())
    }

    async fn subscriptions_by_client(&self, client_id: &str) -> Result<Vec<Subscription>, Error> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn subscriptions_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, Error> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| filter_matches(&s.topic_filter, topic))
            .cloned()
            .collect())
    }

    async fn outgoing_enqueue(&self, sub: &Subscription, packet: Packet) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.outgoing.push((sub.client_id.clone(), packet));
        Ok(())
    }

    async fn outgoing_update(&self, _sub: &Subscription, _message_id: u64) -> Result<(), Error> {
        Ok(())
    }

    async fn outgoing_clear_message_id(&self, _sub: &Subscription, _message_id: u64) -> Result<(), Error> {
        Ok(())
    }

    async fn outgoing_stream(&self, sub: &Subscription) -> PacketStream {
        let state = self.state.lock().await;
        let matches: Vec<Packet> = state
            .outgoing
            .iter()
            .filter(|(client_id, _)| client_id == &sub.client_id)
            .map(|(_, packet)| packet.clone())
            .collect();
        Box::pin(stream::iter(matches))
    }

    async fn put_will(&self, will: Will) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.wills.insert(will.client_id.clone(), will);
        Ok(())
    }

    async fn del_will(&self, client_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.wills.remove(client_id);
        Ok(())
    }

    async fn stream_will(&self, live_brokers: &[BrokerId]) -> WillStream {
        let state = self.state.lock().await;
        let dead: Vec<Will> = state
            .wills
            .values()
            .filter(|w| !live_brokers.contains(&w.broker_id))
            .cloned()
            .collect();
        Box::pin(stream::iter(dead))
    }

    fn set_broker(&mut self, broker: std::sync::Weak<crate::broker::Broker>) {
        self.broker = Some(broker);
    }
}
