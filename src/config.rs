// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;

/// Broker construction options. Every field is optional and carries the
/// default documented in spec.md §6.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Max parallel per-connection operations hint.
    ///
    /// Default is 100.
    #[serde(default = "Config::default_concurrency")]
    pub concurrency: usize,

    /// Period, in milliseconds, between cluster heartbeats.
    ///
    /// Default is 60 000.
    #[serde(default = "Config::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout, in milliseconds, for the CONNECT handshake.
    ///
    /// Enforced by the protocol layer, not the dispatcher itself; carried
    /// here because it is part of the broker's configuration surface.
    ///
    /// Default is 30 000.
    #[serde(default = "Config::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Override the generated broker id. `None` means autogenerate a
    /// short collision-resistant id at construction time.
    #[serde(default)]
    pub broker_id: Option<String>,
}

impl Config {
    pub const fn default_concurrency() -> usize {
        100
    }

    pub const fn default_heartbeat_interval_ms() -> u64 {
        60_000
    }

    pub const fn default_connect_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            broker_id: None,
        }
    }
}
