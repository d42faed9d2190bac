// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Authorization hooks (spec.md §4.4). Called by the protocol layer, not
//! the pipeline; their contracts live here because the core invokes
//! `published` directly from `callPublished`.

use std::sync::Arc;

use crate::error::Error;
use crate::packet::{Packet, Subscription};
use crate::session::ClientSession;

pub type AuthenticateHook =
    Arc<dyn Fn(Arc<dyn ClientSession>, String, Vec<u8>) -> futures::future::BoxFuture<'static, Result<bool, Error>> + Send + Sync>;

pub type AuthorizePublishHook =
    Arc<dyn Fn(Arc<dyn ClientSession>, Packet) -> futures::future::BoxFuture<'static, Result<(), Error>> + Send + Sync>;

pub type AuthorizeSubscribeHook = Arc<
    dyn Fn(Arc<dyn ClientSession>, Subscription) -> futures::future::BoxFuture<'static, Option<Subscription>>
        + Send
        + Sync,
>;

pub type AuthorizeForwardHook = Arc<dyn Fn(Arc<dyn ClientSession>, Packet) -> Option<Packet> + Send + Sync>;

pub type PublishedHook =
    Arc<dyn Fn(Packet, Option<Arc<dyn ClientSession>>) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Permit-all / no-op default hook set (spec.md §6: "defaults permit-all / no-op").
#[derive(Clone)]
pub struct Hooks {
    pub authenticate: AuthenticateHook,
    pub authorize_publish: AuthorizePublishHook,
    pub authorize_subscribe: AuthorizeSubscribeHook,
    pub authorize_forward: AuthorizeForwardHook,
    pub published: PublishedHook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            authenticate: Arc::new(|_session, _username, _password| Box::pin(async { Ok(true) })),
            authorize_publish: Arc::new(|_session, _packet| Box::pin(async { Ok(()) })),
            authorize_subscribe: Arc::new(|_session, sub| Box::pin(async { Some(sub) })),
            authorize_forward: Arc::new(|_session, packet| Some(packet)),
            published: Arc::new(|_packet, _client| Box::pin(async {})),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
