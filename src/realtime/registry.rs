//! Live connections per endpoint, and best-effort fan-out to them.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_tungstenite::tungstenite::Message;

use super::connection::{ConnectionId, Outbound};

/// Endpoint path → live connections.
///
/// Cloning is cheap and every clone sees the same sets. Each path's set is
/// guarded by its map shard, so traffic on `/chat` does not serialize with
/// traffic on `/metrics` unless the two paths share a shard.
///
/// A delivery failure during [`broadcast`](Self::broadcast) evicts that
/// connection as though it had closed; the remaining connections still
/// receive the message and the caller never sees an error.
#[derive(Clone, Default)]
pub struct BroadcastRegistry {
    endpoints: Arc<DashMap<String, HashMap<ConnectionId, Outbound>>>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an accepted connection to `path`'s set.
    pub fn on_connect(&self, path: &str, id: ConnectionId, outbound: Outbound) {
        self.endpoints
            .entry(path.to_owned())
            .or_default()
            .insert(id, outbound);
        tracing::debug!(path, connection = %id, "connection registered");
    }

    /// Removes a connection. Returns `false` if it was not registered, e.g.
    /// because a failed broadcast already evicted it.
    pub fn on_close(&self, path: &str, id: ConnectionId) -> bool {
        let removed = self
            .endpoints
            .get_mut(path)
            .is_some_and(|mut set| set.remove(&id).is_some());
        self.endpoints.remove_if(path, |_, set| set.is_empty());
        if removed {
            tracing::debug!(path, connection = %id, "connection unregistered");
        }
        removed
    }

    /// Sends `message` to every live connection on `path`.
    ///
    /// Returns how many connections accepted it. A path with no connections
    /// yields zero.
    pub fn broadcast(&self, path: &str, message: impl Into<String>) -> usize {
        self.fan_out(path, Message::text(message.into()), None)
    }

    /// Like [`broadcast`](Self::broadcast) but skips `sender`, for relaying a
    /// client's message to everyone else.
    pub fn broadcast_except(
        &self,
        path: &str,
        message: impl Into<String>,
        sender: ConnectionId,
    ) -> usize {
        self.fan_out(path, Message::text(message.into()), Some(sender))
    }

    fn fan_out(&self, path: &str, message: Message, skip: Option<ConnectionId>) -> usize {
        let Some(mut set) = self.endpoints.get_mut(path) else {
            return 0;
        };

        let mut delivered = 0;
        set.retain(|id, outbound| {
            if Some(*id) == skip {
                return true;
            }
            match outbound.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::warn!(path, connection = %id, "delivery failed, evicting connection");
                    false
                }
            }
        });
        let now_empty = set.is_empty();
        drop(set);

        if now_empty {
            self.endpoints.remove_if(path, |_, set| set.is_empty());
        }
        delivered
    }

    /// Number of live connections on `path`.
    pub fn len(&self, path: &str) -> usize {
        self.endpoints.get(path).map_or(0, |set| set.len())
    }

    pub fn is_empty(&self, path: &str) -> bool {
        self.len(path) == 0
    }

    pub fn contains(&self, path: &str, id: ConnectionId) -> bool {
        self.endpoints
            .get(path)
            .is_some_and(|set| set.contains_key(&id))
    }
}
