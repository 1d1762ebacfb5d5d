//! Connection registry and presence tracker.
//!
//! Room state lives in a sharded map keyed by room id, so joins, leaves and
//! broadcasts in different rooms don't serialize against each other. Nothing
//! in here awaits while a room entry is held.
//!
//! Writers take the room's sequence lock around saving a message and
//! broadcasting it, so `new_message` events leave in id order.

use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use uuid::Uuid;

use crate::{
    db::{PersonaId, RoomId, UserId},
    error::RelayError,
    protocol::ServerEvent,
};

/// One serialized event on its way to a socket.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Membership epoch the frame was addressed to. `None` for unicast replies.
    pub(crate) epoch: Option<u64>,
    pub text: Arc<str>,
}

impl Frame {
    pub fn unicast(event: &ServerEvent) -> Self {
        Frame { epoch: None, text: event.to_json().into() }
    }

    pub fn event(&self) -> Result<ServerEvent, serde_json::Error> {
        serde_json::from_str(&self.text)
    }
}

pub type Outbox = mpsc::UnboundedSender<Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub user_id: UserId,
    pub room_id: RoomId,
}

/// The registry's handle on one live socket.
pub struct Connection {
    pub id: Uuid,
    outbox: Outbox,
    epoch: Arc<AtomicU64>,
    membership: Option<Membership>,
}

impl Connection {
    pub fn new(outbox: Outbox) -> Self {
        Connection {
            id: Uuid::now_v7(),
            outbox,
            epoch: Arc::new(AtomicU64::new(0)),
            membership: None,
        }
    }

    pub fn membership(&self) -> Option<Membership> {
        self.membership
    }

    /// Shared with the socket writer so it can drop frames addressed to a
    /// membership this connection no longer holds.
    pub fn epoch(&self) -> Arc<AtomicU64> {
        self.epoch.clone()
    }

    pub fn send(&self, event: &ServerEvent) {
        if self.outbox.send(Frame::unicast(event)).is_err() {
            tracing::debug!(connection = %self.id, "outbox closed, dropping unicast");
        }
    }
}

/// Whether a frame should still reach the socket.
pub fn is_current(frame: &Frame, epoch: &AtomicU64) -> bool {
    frame.epoch.is_none_or(|e| e == epoch.load(Ordering::Acquire))
}

struct Member {
    user_id: UserId,
    outbox: Outbox,
    epoch: u64,
    /// Frames parked until the member's history has been sent.
    held: Option<Vec<Frame>>,
}

impl Member {
    fn deliver(&mut self, text: &Arc<str>) -> bool {
        let frame = Frame { epoch: Some(self.epoch), text: text.clone() };
        match &mut self.held {
            Some(held) => {
                held.push(frame);
                true
            }
            None => self.outbox.send(frame).is_ok(),
        }
    }
}

#[derive(Default)]
struct Room {
    members: HashMap<Uuid, Member>,
    presence: HashMap<UserId, usize>,
    generating: HashSet<PersonaId>,
    sequence: Arc<Mutex<()>>,
}

impl Room {
    fn is_idle(&self) -> bool {
        self.members.is_empty() && self.generating.is_empty()
    }

    fn active_users(&self) -> Vec<UserId> {
        let mut user_ids: Vec<UserId> = self.presence.keys().copied().collect();
        user_ids.sort_unstable();
        user_ids
    }

    fn broadcast(&mut self, room_id: RoomId, event: &ServerEvent) {
        let text: Arc<str> = event.to_json().into();
        for (id, member) in self.members.iter_mut() {
            if !member.deliver(&text) {
                tracing::debug!(room_id, connection = %id, "outbox closed, skipping member");
            }
        }
    }
}

#[derive(Default)]
pub struct Registry {
    rooms: DashMap<RoomId, Room>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts the connection in the room and returns the room's presence set.
    ///
    /// The connection's own copy of every broadcast is held back until
    /// [`Registry::release`] hands it its history.
    pub fn join(&self, conn: &mut Connection, user_id: UserId, room_id: RoomId) -> Result<Vec<UserId>, RelayError> {
        if conn.membership.is_some() {
            return Err(RelayError::AlreadyJoined);
        }

        let epoch = conn.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        conn.membership = Some(Membership { user_id, room_id });

        let mut room = self.rooms.entry(room_id).or_default();
        room.members.insert(conn.id, Member {
            user_id,
            outbox: conn.outbox.clone(),
            epoch,
            held: Some(Vec::new()),
        });

        let count = room.presence.entry(user_id).or_insert(0);
        *count += 1;
        let first = *count == 1;

        if first {
            room.broadcast(room_id, &ServerEvent::UserJoined { room_id, user_id });
        }
        let active = room.active_users();
        room.broadcast(room_id, &ServerEvent::ActiveUsers { room_id, user_ids: active.clone() });

        tracing::info!(room_id, user_id, connection = %conn.id, connections = *room.presence.get(&user_id).unwrap_or(&0), "joined");
        Ok(active)
    }

    /// Sends `history` to a freshly joined connection, followed by whatever was
    /// broadcast to the room in the meantime.
    pub fn release(&self, conn: &Connection, history: &ServerEvent) {
        let Some(Membership { room_id, .. }) = conn.membership else {
            return;
        };
        let Some(mut room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(member) = room.members.get_mut(&conn.id) else {
            return;
        };

        let _ = member.outbox.send(Frame { epoch: Some(member.epoch), text: history.to_json().into() });
        for frame in member.held.take().unwrap_or_default() {
            let _ = member.outbox.send(frame);
        }
    }

    /// Idempotent. Returns the membership that was given up, if any.
    pub fn leave(&self, conn: &mut Connection) -> Option<Membership> {
        let membership = conn.membership.take()?;
        let Membership { user_id, room_id } = membership;
        conn.epoch.fetch_add(1, Ordering::AcqRel);

        let Some(mut room) = self.rooms.get_mut(&room_id) else {
            return Some(membership);
        };

        if room.members.remove(&conn.id).is_some() {
            let gone = match room.presence.entry(user_id) {
                Entry::Occupied(mut count) if *count.get() > 1 => {
                    *count.get_mut() -= 1;
                    false
                }
                Entry::Occupied(count) => {
                    count.remove();
                    true
                }
                Entry::Vacant(_) => false,
            };

            if gone {
                room.broadcast(room_id, &ServerEvent::UserLeft { room_id, user_id });
            }
            let user_ids = room.active_users();
            room.broadcast(room_id, &ServerEvent::ActiveUsers { room_id, user_ids });

            tracing::info!(room_id, user_id, connection = %conn.id, last_connection = gone, "left");
        }

        drop(room);
        self.rooms.remove_if(&room_id, |_, room| room.is_idle());
        Some(membership)
    }

    /// Same as [`Registry::leave`]; called when the transport goes away.
    pub fn on_disconnect(&self, conn: &mut Connection) {
        if let Some(Membership { user_id, room_id }) = self.leave(conn) {
            tracing::debug!(room_id, user_id, connection = %conn.id, "cleaned up after disconnect");
        }
    }

    /// Delivers `event` to every connection in the room at this instant.
    pub fn broadcast_to_room(&self, room_id: RoomId, event: &ServerEvent) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.broadcast(room_id, event);
        }
    }

    pub fn active_users(&self, room_id: RoomId) -> Vec<UserId> {
        self.rooms.get(&room_id).map(|room| room.active_users()).unwrap_or_default()
    }

    pub fn connection_count(&self, room_id: RoomId, user_id: UserId) -> usize {
        self.rooms
            .get(&room_id)
            .and_then(|room| room.presence.get(&user_id).copied())
            .unwrap_or(0)
    }

    /// Held while a message is saved and broadcast. Never hold it across a
    /// generation call.
    pub async fn sequence(&self, room_id: RoomId) -> OwnedMutexGuard<()> {
        // a room nobody is in has nobody to order messages for
        let lock = self.rooms.get(&room_id).map(|room| room.sequence.clone()).unwrap_or_default();
        lock.lock_owned().await
    }

    /// Marks `(room, persona)` as generating until the returned guard drops.
    pub fn begin_generation(self: &Arc<Self>, room_id: RoomId, persona_id: PersonaId) -> Result<GenerationGuard, RelayError> {
        let mut room = self.rooms.entry(room_id).or_default();
        if !room.generating.insert(persona_id) {
            return Err(RelayError::GenerationBusy(persona_id));
        }
        Ok(GenerationGuard { registry: self.clone(), room_id, persona_id })
    }

    pub fn is_generating(&self, room_id: RoomId, persona_id: PersonaId) -> bool {
        self.rooms.get(&room_id).is_some_and(|room| room.generating.contains(&persona_id))
    }

    fn end_generation(&self, room_id: RoomId, persona_id: PersonaId) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.generating.remove(&persona_id);
        }
        self.rooms.remove_if(&room_id, |_, room| room.is_idle());
    }
}

/// Held for as long as a persona is generating in a room.
pub struct GenerationGuard {
    registry: Arc<Registry>,
    room_id: RoomId,
    persona_id: PersonaId,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.registry.end_generation(self.room_id, self.persona_id);
    }
}
