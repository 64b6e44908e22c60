//! Live presence: who is connected and who is studying right now.
//!
//! The table is a process-wide, in-memory view of liveness only. It is
//! rebuilt empty on restart and must never be treated as authoritative for
//! accumulated study time; the session ledger owns that.

mod socket;

pub use socket::handler;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DEFAULT_SUBJECT: &str = "General Study";

/// Messages a client may send over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    StartStudy {
        subject: Option<String>,
        target: Option<i64>,
    },
    StopStudy,
    GetOnlineFriends {
        friend_ids: Vec<Uuid>,
    },
}

/// Messages pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    FriendStartedStudying {
        user_id: Uuid,
        start_time: DateTime<Utc>,
        subject: String,
    },
    FriendStoppedStudying {
        user_id: Uuid,
        /// Elapsed milliseconds since the live session started.
        duration: i64,
    },
    OnlineFriends {
        friend_ids: Vec<Uuid>,
    },
}

/// A study session announced over the live channel, not yet persisted.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub start_time: DateTime<Utc>,
    pub subject: String,
}

struct PresenceEntry {
    socket_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
    study_session: Option<LiveSession>,
    last_seen: DateTime<Utc>,
}

/// Process-wide table of connected users, keyed by user id.
///
/// Entries are independent; handlers only rely on the map's atomic per-entry
/// operations, so one connection's failure never corrupts another's state.
#[derive(Default)]
pub struct PresenceTable {
    entries: DashMap<Uuid, PresenceEntry>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh connection, replacing any stale entry for the user.
    pub fn connect(
        &self,
        user_id: Uuid,
        socket_id: Uuid,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        self.entries.insert(
            user_id,
            PresenceEntry {
                socket_id,
                tx,
                study_session: None,
                last_seen: Utc::now(),
            },
        );
    }

    /// Remove the user's entry, but only if it still belongs to this socket;
    /// a reconnect may already have replaced it.
    pub fn disconnect(&self, user_id: Uuid, socket_id: Uuid) {
        self.entries
            .remove_if(&user_id, |_, entry| entry.socket_id == socket_id);
    }

    /// Mark the user as studying and return the event to fan out to friends.
    pub fn start_study(
        &self,
        user_id: Uuid,
        subject: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<ServerEvent> {
        let mut entry = self.entries.get_mut(&user_id)?;
        let subject = subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_owned());

        entry.study_session = Some(LiveSession {
            start_time: now,
            subject: subject.clone(),
        });
        entry.last_seen = now;

        Some(ServerEvent::FriendStartedStudying {
            user_id,
            start_time: now,
            subject,
        })
    }

    /// Clear the live session and return the departure event with the
    /// elapsed duration. Returns `None` when the user was not studying.
    ///
    /// Never persists anything: the HTTP stop-session call owns the ledger.
    pub fn stop_study(&self, user_id: Uuid, now: DateTime<Utc>) -> Option<ServerEvent> {
        let mut entry = self.entries.get_mut(&user_id)?;
        let session = entry.study_session.take()?;
        entry.last_seen = now;

        Some(ServerEvent::FriendStoppedStudying {
            user_id,
            duration: (now - session.start_time).num_milliseconds(),
        })
    }

    /// When the user last connected or touched their live session, if they
    /// are connected at all.
    pub fn last_seen(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.get(&user_id).map(|entry| entry.last_seen)
    }

    /// Subset of `friend_ids` currently connected.
    pub fn online_friends(&self, friend_ids: &[Uuid]) -> Vec<Uuid> {
        friend_ids
            .iter()
            .copied()
            .filter(|id| self.entries.contains_key(id))
            .collect()
    }

    /// Best-effort fan-out to the given users; offline recipients and closed
    /// channels are silently skipped.
    pub fn broadcast(&self, recipients: &[Uuid], event: &ServerEvent) {
        for id in recipients {
            if let Some(entry) = self.entries.get(id) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Push an event to a single connected user.
    pub fn send_to(&self, user_id: Uuid, event: ServerEvent) {
        if let Some(entry) = self.entries.get(&user_id) {
            let _ = entry.tx.send(event);
        }
    }
}
