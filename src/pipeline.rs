// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The publish pipeline (spec.md §4.1): an ordered stage list executed
//! per publish. Re-expressed from the source's callback-chain series
//! runner as a small async state machine sharing one `Packet` context.

use std::sync::Arc;

use crate::broker::Broker;
use crate::error::{Error, ErrorKind};
use crate::events::Event;
use crate::packet::{Packet, PublishRequest};
use crate::session::ClientSession;
use crate::topic::is_sys_topic;

impl Broker {
    /// `publish(packet, client?, done?)` (spec.md §4.1). Allocates a
    /// fresh `(brokerId, brokerCounter)`, then runs the simple
    /// (qos 0) or durable (qos > 0) stage sequence strictly in order.
    pub async fn publish(
        self: &Arc<Self>,
        request: PublishRequest,
        client: Option<Arc<dyn ClientSession>>,
    ) -> Result<Packet, Error> {
        let packet = Packet::from_request(request, self.id.clone(), self.next_counter());
        log::debug!("pipeline: publish {} qos={:?} retain={}", packet.topic, packet.qos, packet.retain);

        self.store_retained(&packet).await?;

        if packet.qos.is_durable() {
            if let Err(err) = self.enqueue_offline(&packet).await {
                // Fatal: emit `error` on the broker in addition to
                // returning it to the caller (spec.md §7).
                self.events.emit(Event::Error(err.clone()));
                return Err(err);
            }
        }

        if let Err(err) = self.bus.emit(packet.clone()).await {
            let err = Error::from_string(ErrorKind::Bus, err.to_string());
            return Err(err);
        }

        self.call_published(packet.clone(), client).await;

        Ok(packet)
    }

    async fn store_retained(&self, packet: &Packet) -> Result<(), Error> {
        if !packet.retain {
            return Ok(());
        }
        self.persistence
            .store_retained(packet.clone())
            .await
            .map_err(|err| Error::from_string(ErrorKind::Persistence, err.to_string()))
    }

    async fn enqueue_offline(&self, packet: &Packet) -> Result<(), Error> {
        let subs = self
            .persistence
            .subscriptions_by_topic(&packet.topic)
            .await
            .map_err(|err| Error::from_string(ErrorKind::Persistence, err.to_string()))?;

        let subs: Vec<_> = if is_sys_topic(&packet.topic) {
            subs.into_iter().filter(|s| s.topic_filter != "#").collect()
        } else {
            subs
        };

        let enqueues = subs
            .iter()
            .map(|sub| self.persistence.outgoing_enqueue(sub, packet.clone()));
        let results = futures::future::join_all(enqueues).await;
        for result in results {
            result.map_err(|err| Error::from_string(ErrorKind::Persistence, err.to_string()))?;
        }
        Ok(())
    }

    async fn call_published(&self, packet: Packet, client: Option<Arc<dyn ClientSession>>) {
        // Synchronous with the hook invocation, before the hook's future
        // has necessarily resolved relative to other broker activity:
        // observers should not assume the publish has been
        // user-acknowledged (spec.md §9, open question a).
        self.events.emit(Event::Publish(packet.clone(), client.clone()));
        (self.hooks.published)(packet, client).await;
    }
}
