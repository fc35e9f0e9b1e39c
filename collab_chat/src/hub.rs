//! Process-local room registry.
//!
//! A room is a set of connection outboxes keyed by a room name such as
//! `user:{id}` or `conv:{id}`. The registry lock is only taken to add or
//! remove members; delivery clones the room handle and locks just that room.

use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Process-local connection identifier.
pub type ConnId = u64;

/// Encoded frames waiting to be written to one socket.
pub type Outbox = mpsc::Sender<Arc<str>>;

type Room = Arc<Mutex<HashMap<ConnId, Outbox>>>;

pub fn user_room(user: &chat_protocol::UserId) -> String {
    format!("user:{user}")
}

pub fn conversation_room(id: &chat_protocol::ConversationId) -> String {
    format!("conv:{id}")
}

#[derive(Default)]
pub struct Hub {
    rooms: RwLock<HashMap<String, Room>>,
    next_conn: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn join(&self, room: &str, conn: ConnId, outbox: Outbox) {
        let mut rooms = self.rooms.write();
        rooms
            .entry(room.to_string())
            .or_default()
            .lock()
            .insert(conn, outbox);
    }

    pub fn leave(&self, room: &str, conn: ConnId) {
        let mut rooms = self.rooms.write();
        let empty = match rooms.get(room) {
            Some(members) => {
                let mut members = members.lock();
                members.remove(&conn);
                members.is_empty()
            }
            None => false,
        };
        if empty {
            rooms.remove(room);
        }
    }

    /// Drop a connection from every room it is in.
    pub fn leave_all(&self, conn: ConnId) {
        let mut rooms = self.rooms.write();
        rooms.retain(|_, members| {
            let mut members = members.lock();
            members.remove(&conn);
            !members.is_empty()
        });
    }

    /// Queue `payload` for every member of `room` except `except`. Returns
    /// how many outboxes accepted the frame; a full outbox drops it.
    pub fn deliver(&self, room: &str, except: Option<ConnId>, payload: &Arc<str>) -> usize {
        let Some(members) = self.rooms.read().get(room).cloned() else {
            return 0;
        };
        let members = members.lock();
        let mut delivered = 0;
        for (conn, outbox) in members.iter() {
            if Some(*conn) == except {
                continue;
            }
            match outbox.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(room, conn, "outbox full; frame dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(room, conn, "outbox closed");
                }
            }
        }
        delivered
    }

    pub fn is_member(&self, room: &str, conn: ConnId) -> bool {
        self.rooms
            .read()
            .get(room)
            .map_or(false, |members| members.lock().contains_key(&conn))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}
