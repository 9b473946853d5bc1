//! Room registry: which connections belong to which room.
//!
//! Every read and mutation goes through one `parking_lot::Mutex`. Rooms are
//! created on first join and removed the moment their last member leaves, so
//! the map never holds an empty room.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::ids::{ConnectionId, RoomId};

use crate::connection::Connection;

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<RoomId, HashMap<ConnectionId, Arc<Connection>>>,
    /// Reverse index; a connection has at most one entry here.
    memberships: HashMap<ConnectionId, RoomId>,
}

impl RegistryState {
    fn insert(&mut self, room: &RoomId, conn: Arc<Connection>) -> bool {
        let id = conn.id().clone();
        if let Some(current) = self.memberships.get(&id).cloned() {
            if &current == room {
                return false;
            }
            self.remove(&current, &id);
        }
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(id.clone(), conn);
        self.memberships.insert(id, room.clone());
        true
    }

    fn remove(&mut self, room: &RoomId, id: &ConnectionId) -> Option<Arc<Connection>> {
        let members = self.rooms.get_mut(room)?;
        let removed = members.remove(id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        if removed.is_some() {
            self.memberships.remove(id);
        }
        removed
    }
}

/// Outcome of one [`RoomRegistry::fan_out`] pass.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Members whose send failed; already removed from the room, not yet closed.
    pub evicted: Vec<Arc<Connection>>,
}

#[derive(Default)]
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`, creating the room if needed. A connection already
    /// in another room is moved. Returns `false` if it was already a member.
    pub fn join(&self, room: &RoomId, conn: Arc<Connection>) -> bool {
        self.state.lock().insert(room, conn)
    }

    /// Remove a connection from a room. Absent room or connection is a no-op.
    pub fn leave(&self, room: &RoomId, id: &ConnectionId) -> bool {
        self.state.lock().remove(room, id).is_some()
    }

    /// Snapshot of the current members of `room`.
    pub fn members_of(&self, room: &RoomId) -> Vec<Arc<Connection>> {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Call `attempt` once for every member of `room`, then drop the members
    /// for which it returned `false`. Snapshot, attempts and eviction all run
    /// under a single lock acquisition, so `attempt` must not block.
    pub fn fan_out<F>(&self, room: &RoomId, attempt: F) -> FanOutReport
    where
        F: FnMut(&Connection) -> bool,
    {
        self.fan_out_then(room, attempt, || {})
    }

    /// [`RoomRegistry::fan_out`], then run `then` before the lock is released.
    /// `then` runs even when the room does not exist.
    pub fn fan_out_then<F, G>(&self, room: &RoomId, mut attempt: F, then: G) -> FanOutReport
    where
        F: FnMut(&Connection) -> bool,
        G: FnOnce(),
    {
        let mut state = self.state.lock();
        let RegistryState { rooms, memberships } = &mut *state;

        let mut report = FanOutReport::default();
        if let Some(members) = rooms.get_mut(room) {
            let mut failed = Vec::new();
            for (id, conn) in members.iter() {
                report.attempted += 1;
                if attempt(&**conn) {
                    report.delivered += 1;
                } else {
                    failed.push(id.clone());
                }
            }

            for id in failed {
                if let Some(conn) = members.remove(&id) {
                    memberships.remove(&id);
                    report.evicted.push(conn);
                }
            }
            if members.is_empty() {
                rooms.remove(room);
            }
        }

        then();
        report
    }

    pub fn room_of(&self, id: &ConnectionId) -> Option<RoomId> {
        self.state.lock().memberships.get(id).cloned()
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.state.lock().rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    pub fn member_count(&self, room: &RoomId) -> usize {
        self.state.lock().rooms.get(room).map_or(0, HashMap::len)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().memberships.len()
    }

    /// True when no room is empty and the room map and reverse index agree.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let member_total: usize = state.rooms.values().map(HashMap::len).sum();
        state.rooms.values().all(|members| !members.is_empty())
            && member_total == state.memberships.len()
            && state.memberships.iter().all(|(id, room)| {
                state
                    .rooms
                    .get(room)
                    .is_some_and(|members| members.contains_key(id))
            })
    }
}
