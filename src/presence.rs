// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Cluster presence (spec.md §4.3): heartbeat emission, peer-liveness
//! tracking, and last-will recovery. The broker subscribes its own
//! callbacks onto the bus for the two reserved `$SYS` filters, unifying
//! cluster presence with normal topic routing (spec.md §9).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::interval;

use crate::broker::{is_peer_dead, Broker};
use crate::packet::{Packet, PublishRequest, QoS};
use crate::types::now_millis;

const WILL_SWEEP_CHUNK_SIZE: usize = 16;

impl Broker {
    /// Start the heartbeat and will-sweep timers, and subscribe the
    /// broker's own presence callbacks onto the bus. Call once, after
    /// construction.
    pub async fn start(self: &Arc<Self>) {
        self.subscribe_presence_topics().await;

        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let heartbeat_broker = self.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                heartbeat_broker.emit_heartbeat().await;
            }
        });

        let sweep_interval = Duration::from_millis(4 * self.config.heartbeat_interval_ms);
        let sweep_broker = self.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweep_broker.sweep_wills().await;
            }
        });

        self.timers.lock().await.extend([heartbeat_handle, sweep_handle]);
        log::info!("broker: presence timers started (heartbeat={:?})", heartbeat_interval);
    }

    async fn subscribe_presence_topics(self: &Arc<Self>) {
        let heartbeat_broker = self.clone();
        self.bus
            .on(
                "$SYS/+/heartbeat",
                Arc::new(move |packet: Packet| {
                    let broker = heartbeat_broker.clone();
                    Box::pin(async move {
                        let peer_id = String::from_utf8_lossy(&packet.payload).to_string();
                        broker.brokers.write().await.insert(peer_id, now_millis());
                        Ok(())
                    })
                }),
            )
            .await;

        let takeover_broker = self.clone();
        self.bus
            .on(
                "$SYS/+/new/clients",
                Arc::new(move |packet: Packet| {
                    let broker = takeover_broker.clone();
                    Box::pin(async move {
                        broker.handle_new_client_announcement(&packet).await;
                        Ok(())
                    })
                }),
            )
            .await;
    }

    async fn handle_new_client_announcement(self: &Arc<Self>, packet: &Packet) {
        let origin = match packet.topic.split('/').nth(1) {
            Some(origin) => origin,
            None => return,
        };
        if origin == self.id {
            return;
        }
        let client_id = String::from_utf8_lossy(&packet.payload).to_string();

        let local_session = self.clients.read().await.get(&client_id).cloned();
        if let Some(session) = local_session {
            log::info!("broker: peer {origin} took over client {client_id}, closing local copy");
            session.close().await;
            self.unregister_client(&client_id).await;
        }
    }

    async fn emit_heartbeat(self: &Arc<Self>) {
        let topic = format!("$SYS/{}/heartbeat", self.id);
        let payload = self.id.clone().into_bytes();
        if let Err(err) = self
            .publish(
                PublishRequest {
                    topic,
                    payload,
                    qos: QoS::AtMostOnce,
                    retain: false,
                },
                None,
            )
            .await
        {
            log::error!("broker: failed to emit heartbeat: {err}");
        }
    }

    /// Will-sweep timer body (spec.md §4.3): GC stale peers, then
    /// republish and delete any will whose owning broker is still
    /// absent/stale by the time its batch is processed.
    async fn sweep_wills(self: &Arc<Self>) {
        let heartbeat_interval_ms = self.config.heartbeat_interval_ms;
        {
            let mut brokers = self.brokers.write().await;
            brokers.retain(|_, last_seen| !is_peer_dead(*last_seen, heartbeat_interval_ms));
        }

        let live_brokers: Vec<String> = self.brokers.read().await.keys().cloned().collect();
        let mut wills = self.persistence.stream_will(&live_brokers).await.chunks(WILL_SWEEP_CHUNK_SIZE);

        while let Some(batch) = wills.next().await {
            for will in batch {
                let still_absent = {
                    let brokers = self.brokers.read().await;
                    match brokers.get(&will.broker_id) {
                        Some(last_seen) => is_peer_dead(*last_seen, heartbeat_interval_ms),
                        None => true,
                    }
                };
                if !still_absent {
                    continue;
                }

                let result = self
                    .publish(
                        PublishRequest {
                            topic: will.packet.topic.clone(),
                            payload: will.packet.payload.clone(),
                            qos: will.packet.qos,
                            retain: will.packet.retain,
                        },
                        None,
                    )
                    .await;

                match result {
                    Ok(_) => {
                        if let Err(err) = self.persistence.del_will(&will.client_id).await {
                            log::error!("broker: failed to delete will for {}: {err}", will.client_id);
                        }
                    }
                    Err(err) => {
                        log::error!("broker: failed to republish will for {}: {err}", will.client_id);
                    }
                }
            }
        }
    }
}
