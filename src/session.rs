// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use async_trait::async_trait;

/// A live client connection, owned by the protocol layer. Opaque to the
/// dispatcher: the core only needs an id and a way to tear one down
/// during takeover or shutdown.
#[async_trait]
pub trait ClientSession: std::fmt::Debug + Send + Sync {
    /// Stable client id this session was registered under.
    fn id(&self) -> &str;

    /// Drain and release this session's resources. Must be safe to call
    /// more than once; the second call should be a no-op.
    async fn close(&self);
}
