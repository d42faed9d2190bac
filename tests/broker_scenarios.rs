// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! End-to-end scenarios from spec.md §8.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use hebo_dispatcher::bus::{Bus, MemoryBus};
use hebo_dispatcher::error::{Error, ErrorKind};
use hebo_dispatcher::persistence::{MemoryPersistence, PacketStream, Persistence, WillStream};
use hebo_dispatcher::{Broker, ClientSession, Config, Packet, PublishRequest, QoS, Subscription, Will};

#[derive(Debug)]
struct TestSession {
    id: String,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl TestSession {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientSession for TestSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

fn config_with_heartbeat(ms: u64) -> Config {
    Config {
        heartbeat_interval_ms: ms,
        ..Config::default()
    }
}

#[tokio::test]
async fn scenario_1_heartbeat() {
    let broker = Broker::with_defaults(config_with_heartbeat(50));
    broker.start().await;

    tokio::time::sleep(Duration::from_millis(120)).await;

    let last_seen = broker.peer_last_seen(broker.id()).await.expect("self heartbeat recorded");
    let now = hebo_dispatcher::types::now_millis();
    assert!(now.saturating_sub(last_seen) < 1000);
}

#[tokio::test]
async fn scenario_2_cross_broker_takeover() {
    let bus = Arc::new(MemoryBus::new());
    let persistence_a = Arc::new(MemoryPersistence::new());
    let persistence_b = Arc::new(MemoryPersistence::new());

    let broker_a = Broker::new(Config::default(), persistence_a, bus.clone(), Default::default());
    let broker_b = Broker::new(Config::default(), persistence_b, bus.clone(), Default::default());
    broker_a.start().await;
    broker_b.start().await;

    let session_a = TestSession::new("c1");
    broker_a.register_client(session_a.clone()).await.unwrap();
    assert_eq!(broker_a.connected_clients().await, 1);

    let session_b = TestSession::new("c1");
    broker_b.register_client(session_b).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session_a.is_closed());
    assert_eq!(broker_a.connected_clients().await, 0);
    assert_eq!(broker_b.connected_clients().await, 1);
}

#[tokio::test]
async fn scenario_3_qos1_offline_enqueue() {
    let persistence = Arc::new(MemoryPersistence::new());
    persistence
        .add_subscriptions(vec![Subscription {
            client_id: "c2".to_string(),
            topic_filter: "t/+".to_string(),
            qos: QoS::AtLeastOnce,
        }])
        .await
        .unwrap();

    let broker = Broker::new(Config::default(), persistence.clone(), Arc::new(MemoryBus::new()), Default::default());

    let result = broker
        .publish(
            PublishRequest {
                topic: "t/x".to_string(),
                payload: b"hi".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
            },
            None,
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(persistence.outgoing_len().await, 1);
}

#[tokio::test]
async fn scenario_4_sys_topic_wildcard_guard() {
    let persistence = Arc::new(MemoryPersistence::new());
    persistence
        .add_subscriptions(vec![Subscription {
            client_id: "spy".to_string(),
            topic_filter: "#".to_string(),
            qos: QoS::AtLeastOnce,
        }])
        .await
        .unwrap();

    let broker = Broker::new(Config::default(), persistence.clone(), Arc::new(MemoryBus::new()), Default::default());

    broker
        .publish(
            PublishRequest {
                topic: "$SYS/x/heartbeat".to_string(),
                payload: b"...".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(persistence.outgoing_len().await, 0);
}

#[tokio::test]
async fn scenario_5_will_recovery() {
    let persistence = Arc::new(MemoryPersistence::new());
    persistence
        .put_will(Will {
            client_id: "orphan".to_string(),
            broker_id: "dead".to_string(),
            packet: PublishRequest {
                topic: "last/will".to_string(),
                payload: b"bye".to_vec(),
                qos: QoS::AtMostOnce,
                retain: false,
            },
        })
        .await
        .unwrap();

    let bus = Arc::new(MemoryBus::new());
    let received = Arc::new(Mutex::new(Vec::<Packet>::new()));
    let received_clone = received.clone();
    bus.on(
        "last/will",
        Arc::new(move |packet: Packet| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.lock().await.push(packet);
                Ok(())
            })
        }),
    )
    .await;

    let broker = Broker::new(config_with_heartbeat(20), persistence.clone(), bus, Default::default());
    broker.start().await;

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(received.lock().await.len(), 1);
    let subs = persistence.subscriptions_by_client("orphan").await.unwrap();
    assert!(subs.is_empty());
    let remaining_wills = persistence.stream_will(&[]).await;
    use futures::StreamExt;
    let remaining: Vec<Will> = remaining_wills.collect().await;
    assert!(remaining.is_empty());
}

#[derive(Debug)]
struct FailingPersistence {
    inner: MemoryPersistence,
}

#[async_trait]
impl Persistence for FailingPersistence {
    async fn store_retained(&self, _packet: Packet) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Persistence, "E"))
    }

    async fn create_retained_stream(&self, pattern: &str) -> PacketStream {
        self.inner.create_retained_stream(pattern).await
    }

    async fn add_subscriptions(&self, subs: Vec<Subscription>) -> Result<(), Error> {
        self.inner.add_subscriptions(subs).await
    }

    async fn remove_subscriptions(&self, client_id: &str, topic_filters: &[String]) -> Result<(), Error> {
        self.inner.remove_subscriptions(client_id, topic_filters).await
    }

    async fn subscriptions_by_client(&self, client_id: &str) -> Result<Vec<Subscription>, Error> {
        self.inner.subscriptions_by_client(client_id).await
    }

    async fn subscriptions_by_topic(&self, topic: &str) -> Result<Vec<Subscription>, Error> {
        self.inner.subscriptions_by_topic(topic).await
    }

    async fn outgoing_enqueue(&self, sub: &Subscription, packet: Packet) -> Result<(), Error> {
        self.inner.outgoing_enqueue(sub, packet).await
    }

    async fn outgoing_update(&self, sub: &Subscription, message_id: u64) -> Result<(), Error> {
        self.inner.outgoing_update(sub, message_id).await
    }

    async fn outgoing_clear_message_id(&self, sub: &Subscription, message_id: u64) -> Result<(), Error> {
        self.inner.outgoing_clear_message_id(sub, message_id).await
    }

    async fn outgoing_stream(&self, sub: &Subscription) -> PacketStream {
        self.inner.outgoing_stream(sub).await
    }

    async fn put_will(&self, will: Will) -> Result<(), Error> {
        self.inner.put_will(will).await
    }

    async fn del_will(&self, client_id: &str) -> Result<(), Error> {
        self.inner.del_will(client_id).await
    }

    async fn stream_will(&self, live_brokers: &[String]) -> WillStream {
        self.inner.stream_will(live_brokers).await
    }

    fn set_broker(&mut self, broker: std::sync::Weak<hebo_dispatcher::Broker>) {
        self.inner.set_broker(broker)
    }
}

#[tokio::test]
async fn scenario_6_retained_store_failure_surfaces() {
    let persistence = Arc::new(FailingPersistence { inner: MemoryPersistence::new() });
    let bus = Arc::new(MemoryBus::new());
    let emitted = Arc::new(AtomicUsize::new(0));
    let emitted_clone = emitted.clone();
    bus.on(
        "r",
        Arc::new(move |_packet: Packet| {
            emitted_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }),
    )
    .await;

    let broker = Broker::new(Config::default(), persistence, bus, Default::default());

    let result = broker
        .publish(
            PublishRequest {
                topic: "r".to_string(),
                payload: b"p".to_vec(),
                qos: QoS::AtMostOnce,
                retain: true,
            },
            None,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(emitted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invariant_connected_clients_matches_map() {
    let broker = Broker::with_defaults(Config::default());
    broker.register_client(TestSession::new("a")).await.unwrap();
    broker.register_client(TestSession::new("b")).await.unwrap();
    assert_eq!(broker.connected_clients().await, 2);
    broker.unregister_client("a").await;
    assert_eq!(broker.connected_clients().await, 1);
}

#[tokio::test]
async fn invariant_register_client_idempotent_across_distinct_sessions() {
    let broker = Broker::with_defaults(Config::default());
    let first = TestSession::new("dup");
    let second = TestSession::new("dup");
    broker.register_client(first.clone()).await.unwrap();
    broker.register_client(second.clone()).await.unwrap();

    assert!(first.is_closed());
    assert_eq!(first.close_count(), 1);
    assert!(!second.is_closed());
    assert_eq!(broker.connected_clients().await, 1);
}

#[tokio::test]
async fn retained_publish_then_subscribe_round_trip() {
    let persistence = Arc::new(MemoryPersistence::new());
    let broker = Broker::new(Config::default(), persistence.clone(), Arc::new(MemoryBus::new()), Default::default());

    broker
        .publish(
            PublishRequest {
                topic: "a/b".to_string(),
                payload: b"v1".to_vec(),
                qos: QoS::AtMostOnce,
                retain: true,
            },
            None,
        )
        .await
        .unwrap();

    use futures::StreamExt;
    let retained: Vec<Packet> = persistence.create_retained_stream("a/b").await.collect().await;
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].payload, b"v1");

    broker
        .publish(
            PublishRequest {
                topic: "a/b".to_string(),
                payload: Vec::new(),
                qos: QoS::AtMostOnce,
                retain: true,
            },
            None,
        )
        .await
        .unwrap();

    let retained_after_clear: Vec<Packet> = persistence.create_retained_stream("a/b").await.collect().await;
    assert!(retained_after_clear.is_empty());
}

#[tokio::test]
async fn close_releases_sessions_and_timers() {
    let broker = Broker::with_defaults(config_with_heartbeat(30));
    broker.start().await;
    let session = TestSession::new("only");
    broker.register_client(session.clone()).await.unwrap();

    broker.close().await;

    assert!(session.is_closed());
    assert_eq!(broker.connected_clients().await, 0);
    assert_eq!(broker.timer_count().await, 0);
}
