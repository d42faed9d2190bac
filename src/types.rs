// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

/// Short opaque id assigned to a broker instance at construction time.
pub type BrokerId = String;

/// Monotonic per-broker publish sequence number.
pub type BrokerCounter = u64;

/// Milliseconds since the Unix epoch, used for peer liveness bookkeeping.
pub type Millis = u64;

pub fn now_millis() -> Millis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as Millis
}
