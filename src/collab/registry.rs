use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::ServerEvent;
use crate::services::auth_service::AuthUser;

/// One live, authenticated connection.
///
/// The sender half is the session's delivery channel: everything the server
/// emits to this client goes through it, so tests can observe traffic by
/// draining the paired receiver without a socket.
#[derive(Clone)]
pub struct SessionHandle {
    pub conn_id: Uuid,
    pub user: AuthUser,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionHandle {
    /// Create a session for an authenticated user, returning the receiver
    /// the transport (or a test) drains.
    pub fn new(user: AuthUser) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                user,
                tx,
            },
            rx,
        )
    }

    /// Queue an event for this client. A closed receiver means the
    /// connection is already tearing down, so the event is dropped.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

#[derive(Default)]
struct RoomsInner {
    /// group code -> connection id -> session
    members: HashMap<String, HashMap<Uuid, SessionHandle>>,
    /// connection id -> group codes it joined
    joined: HashMap<Uuid, HashSet<String>>,
}

/// Live room membership, derived purely from connected sessions.
///
/// Membership is never persisted: a room's member set is exactly the
/// sessions that joined it and have not left or disconnected.
pub struct RoomRegistry {
    rooms: RwLock<RoomsInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(RoomsInner::default()),
        }
    }

    /// Add a session to a room. Returns false if it was already a member.
    pub async fn join(&self, group_code: &str, session: &SessionHandle) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms
            .joined
            .entry(session.conn_id)
            .or_default()
            .insert(group_code.to_string());
        rooms
            .members
            .entry(group_code.to_string())
            .or_default()
            .insert(session.conn_id, session.clone())
            .is_none()
    }

    /// Remove a session from a room. Returns true if it was a member.
    pub async fn leave(&self, group_code: &str, conn_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(codes) = rooms.joined.get_mut(&conn_id) {
            codes.remove(group_code);
            if codes.is_empty() {
                rooms.joined.remove(&conn_id);
            }
        }
        let (was_member, emptied) = match rooms.members.get_mut(group_code) {
            Some(room) => {
                let was = room.remove(&conn_id).is_some();
                (was, room.is_empty())
            }
            None => (false, false),
        };
        if emptied {
            rooms.members.remove(group_code);
        }
        was_member
    }

    /// Remove a session from every room it joined. Returns the rooms it
    /// actually left, sorted for deterministic notification order.
    pub async fn drop_connection(&self, conn_id: Uuid) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let codes = rooms.joined.remove(&conn_id).unwrap_or_default();
        let mut left = Vec::new();
        for code in codes {
            let (was_member, emptied) = match rooms.members.get_mut(&code) {
                Some(room) => {
                    let was = room.remove(&conn_id).is_some();
                    (was, room.is_empty())
                }
                None => (false, false),
            };
            if emptied {
                rooms.members.remove(&code);
            }
            if was_member {
                left.push(code);
            }
        }
        left.sort();
        left
    }

    /// Distinct emails of the sessions currently in a room, sorted.
    ///
    /// The roster models people, not connections: one user joined from two
    /// devices is a single entry.
    pub async fn active_emails(&self, group_code: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut emails: Vec<String> = rooms
            .members
            .get(group_code)
            .map(|room| {
                room.values()
                    .map(|session| session.user.email.clone())
                    .collect::<HashSet<String>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        emails.sort();
        emails
    }

    /// Send an event to every member of a room, optionally skipping one
    /// connection (the originator of the event).
    pub async fn broadcast(&self, group_code: &str, event: &ServerEvent, skip: Option<Uuid>) {
        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.members.get(group_code) {
            for (conn_id, member) in room.iter() {
                if Some(*conn_id) == skip {
                    continue;
                }
                member.send(event.clone());
            }
        }
    }

    /// Number of connections currently in at least one room.
    pub async fn connection_count(&self) -> usize {
        self.rooms.read().await.joined.len()
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.members.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
