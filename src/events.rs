// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Explicit observer registration standing in for the source broker's
//! event emitter (spec.md §9): invoke all registered listeners in
//! registration order, synchronously with the event source.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::Packet;
use crate::session::ClientSession;

#[derive(Clone)]
pub enum Event {
    Client(Arc<dyn ClientSession>),
    ClientDisconnect(Arc<dyn ClientSession>),
    Publish(Packet, Option<Arc<dyn ClientSession>>),
    Error(Error),
}

type Observer = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<Observer>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.observers.lock().expect("event bus poisoned").push(Box::new(observer));
    }

    pub fn emit(&self, event: Event) {
        let observers = self.observers.lock().expect("event bus poisoned");
        for observer in observers.iter() {
            observer(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.observers.lock().map(|o| o.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("observers", &count).finish()
    }
}
