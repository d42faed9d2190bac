// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::bus::{Bus, MemoryBus};
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::hooks::Hooks;
use crate::persistence::{MemoryPersistence, Persistence};
use crate::session::ClientSession;
use crate::types::{now_millis, BrokerId, Millis};

const BROKER_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const BROKER_ID_LEN: usize = 12;

/// Process-wide broker object: the dispatcher's client registry, cluster
/// presence state, and the hooks/events surface the protocol layer talks
/// to (spec.md §3).
#[derive(Debug)]
pub struct Broker {
    pub(crate) id: BrokerId,
    pub(crate) counter: AtomicU64,

    pub(crate) clients: RwLock<HashMap<String, Arc<dyn ClientSession>>>,
    pub(crate) brokers: RwLock<HashMap<BrokerId, Millis>>,

    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) config: Config,
    pub(crate) hooks: Hooks,
    pub(crate) events: EventBus,

    pub(crate) closed: AtomicBool,
    pub(crate) timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Construct a broker with the given config, collaborators, and
    /// hooks (`Hooks::default()` for permit-all/no-op). Does not start
    /// the cluster-presence timers; call [`Broker::start`] once the
    /// broker is wrapped in an `Arc`.
    pub fn new(config: Config, persistence: Arc<dyn Persistence>, bus: Arc<dyn Bus>, hooks: Hooks) -> Arc<Self> {
        let id = config.broker_id.clone().unwrap_or_else(generate_broker_id);
        log::info!("broker: constructed with id {id}");
        Arc::new(Broker {
            id,
            counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            brokers: RwLock::new(HashMap::new()),
            persistence,
            bus,
            config,
            hooks,
            events: EventBus::new(),
            closed: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
        })
    }

    /// Construct a broker backed by the in-memory persistence and bus
    /// defaults and permit-all/no-op hooks, the way an embedding
    /// application with no configured backend gets one for free.
    pub fn with_defaults(config: Config) -> Arc<Self> {
        Broker::new(
            config,
            Arc::new(MemoryPersistence::new()),
            Arc::new(MemoryBus::new()),
            Hooks::default(),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(observer);
    }

    pub async fn connected_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    pub(crate) fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last-seen timestamp (ms since epoch) recorded for `peer_id`, if a
    /// heartbeat from it has been observed.
    pub async fn peer_last_seen(&self, peer_id: &str) -> Option<Millis> {
        self.brokers.read().await.get(peer_id).copied()
    }

    /// Number of cluster-presence timers still running. Zero after
    /// `close()` completes (spec.md §8).
    pub async fn timer_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// `registerClient` (spec.md §4.2). If a prior session is already
    /// registered under this id, it is closed first; until that close
    /// resolves the map entry still refers to the outgoing session. Only
    /// once the prior session has closed is the new one installed, after
    /// which the takeover is announced on `$SYS/<brokerId>/new/clients`
    /// so peer brokers can enforce the single-session-per-id invariant.
    pub async fn register_client(self: &Arc<Self>, session: Arc<dyn ClientSession>) -> Result<(), crate::error::Error> {
        let client_id = session.id().to_string();

        let prior = self.clients.read().await.get(&client_id).cloned();
        if let Some(prior) = prior {
            log::info!("broker: takeover of client {client_id}, closing prior session");
            prior.close().await;
        }

        self.clients.write().await.insert(client_id.clone(), session.clone());

        self.events.emit(Event::Client(session));
        log::info!("broker: client {client_id} registered, connected={}", self.connected_clients().await);

        self.publish_system(
            format!("$SYS/{}/new/clients", self.id),
            client_id.into_bytes(),
        )
        .await
    }

    /// `unregisterClient` (spec.md §4.2). Idempotent w.r.t. sessions
    /// already absent.
    pub async fn unregister_client(&self, client_id: &str) {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(client_id)
        };
        if let Some(session) = removed {
            self.events.emit(Event::ClientDisconnect(session));
            log::info!("broker: client {client_id} unregistered");
        }
    }

    /// `close(cb)` (spec.md §4.5): stop both timers, then close every
    /// registered session in parallel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("broker: closing");

        for handle in self.timers.lock().await.drain(..) {
            handle.abort();
        }

        let sessions: Vec<Arc<dyn ClientSession>> = self.clients.read().await.values().cloned().collect();
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        self.clients.write().await.clear();
        log::info!("broker: closed");
    }

    async fn publish_system(self: &Arc<Self>, topic: String, payload: Vec<u8>) -> Result<(), crate::error::Error> {
        use crate::packet::{PublishRequest, QoS};
        self.publish(
            PublishRequest {
                topic,
                payload,
                qos: QoS::AtMostOnce,
                retain: false,
            },
            None,
        )
        .await
        .map(|_| ())
    }
}

fn generate_broker_id() -> BrokerId {
    let mut rng = rand::thread_rng();
    (0..BROKER_ID_LEN)
        .map(|_| BROKER_ID_ALPHABET[rng.gen_range(0..BROKER_ID_ALPHABET.len())] as char)
        .collect()
}

pub(crate) fn is_peer_dead(last_seen: Millis, heartbeat_interval_ms: u64) -> bool {
    now_millis().saturating_sub(last_seen) > 3 * heartbeat_interval_ms
}
