//! Presence registry: the authoritative map of online users to connections.
//!
//! At most one live connection per user. Registering a user who already has
//! a connection evicts the old one (last connection wins); the evicted handle
//! is told to close before the new registration's broadcast goes out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use studyhall_common::protocol::{close_code, ServerEvent};

/// A frame queued for a single connection's socket task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized event to send as a text frame.
    Frame(Arc<str>),
    /// Close the connection with an application close code.
    Close { code: u16, reason: &'static str },
}

/// The registry's end of one connection: the outbound queue plus the tag
/// that distinguishes this connection from any later one for the same user.
struct ConnectionHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Thread-safe map of `user_id` → live connection.
///
/// All mutation goes through `register`/`unregister`; per-key operations on
/// the underlying `DashMap` are atomic, so two rapid reconnects by the same
/// user serialize on the key.
pub struct PresenceRegistry {
    conns: DashMap<String, ConnectionHandle>,
    next_conn_id: AtomicU64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Install a connection for `user_id`, evicting any prior one.
    ///
    /// The evicted handle receives a `SUPERSEDED` close before the updated
    /// online set is broadcast, so the old client observes its close ahead of
    /// any client observing the new registration. Returns the `conn_id` the
    /// caller must pass back to `unregister`.
    pub fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<Outbound>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let evicted = self
            .conns
            .insert(user_id.to_string(), ConnectionHandle { conn_id, tx });

        if let Some(old) = evicted {
            tracing::info!(
                user_id,
                old_conn = old.conn_id,
                new_conn = conn_id,
                "evicting superseded connection"
            );
            let _ = old.tx.send(Outbound::Close {
                code: close_code::SUPERSEDED,
                reason: "superseded by a newer connection",
            });
        }

        self.broadcast_presence();
        conn_id
    }

    /// Remove the connection for `user_id` if it is still the one tagged
    /// `conn_id`, and broadcast the updated set.
    ///
    /// A stale `conn_id` (the handle was evicted and replaced) or an unknown
    /// user is a no-op with no broadcast: an evicted connection's cleanup
    /// must never remove its successor's entry.
    pub fn unregister(&self, user_id: &str, conn_id: u64) {
        let removed = self
            .conns
            .remove_if(user_id, |_, handle| handle.conn_id == conn_id);
        if removed.is_some() {
            self.broadcast_presence();
        }
    }

    /// Push an event to every registered connection, best-effort.
    ///
    /// The event is serialized once. A recipient whose queue is gone is
    /// logged and skipped; delivery to the rest proceeds.
    pub fn broadcast(&self, event: &ServerEvent) {
        let json: Arc<str> = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(err) => {
                tracing::error!(?err, "failed to serialize broadcast event");
                return;
            }
        };
        for entry in self.conns.iter() {
            if entry.value().tx.send(Outbound::Frame(json.clone())).is_err() {
                tracing::debug!(user_id = %entry.key(), "dropping event for closed connection");
            }
        }
    }

    /// Push an event to a single user's connection.
    ///
    /// Returns `false` when the user is offline or the queue is gone; the
    /// caller decides what to do about an undelivered push (this system
    /// drops it).
    pub fn send_to(&self, user_id: &str, event: &ServerEvent) -> bool {
        let Some(handle) = self.conns.get(user_id) else {
            return false;
        };
        let json = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(?err, "failed to serialize targeted event");
                return false;
            }
        };
        handle.tx.send(Outbound::Frame(json.into())).is_ok()
    }

    /// Snapshot of the currently online user IDs.
    pub fn online_users(&self) -> Vec<String> {
        self.conns.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.conns.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn broadcast_presence(&self) {
        self.broadcast(&ServerEvent::PresenceUpdate(self.online_users()));
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
