// Publish/subscribe fan-out keyed by room id.
//
// Each member registers an unbounded outbound sender; broadcasts are queued
// onto every other member's sender and drained by that member's socket task.
// A room is dropped as soon as its last member leaves.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use crate::metrics::{self, RoomKind};

pub struct RoomHub<M> {
    kind: RoomKind,
    rooms: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<M>>>>,
}

impl<M> RoomHub<M> {
    pub fn new(kind: RoomKind) -> Self {
        Self { kind, rooms: RwLock::new(HashMap::new()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub was_member: bool,
    /// The room no longer exists after this departure.
    pub room_closed: bool,
}

impl<M: Clone> RoomHub<M> {
    /// Returns `false` if `member` was already in the room. The sender is
    /// replaced either way.
    pub async fn join(&self, room: &str, member: &str, sender: mpsc::UnboundedSender<M>) -> bool {
        let mut rooms = self.rooms.write().await;
        let newly_joined = rooms
            .entry(room.to_owned())
            .or_default()
            .insert(member.to_owned(), sender)
            .is_none();
        metrics::set_active_rooms(self.kind, rooms.len());
        newly_joined
    }

    pub async fn leave(&self, room: &str, member: &str) -> Departure {
        let mut rooms = self.rooms.write().await;
        let departure = remove_member(&mut rooms, room, member);
        metrics::set_active_rooms(self.kind, rooms.len());
        departure
    }

    /// Remove `member` from every room. Returns the rooms it was in and whether
    /// each one closed.
    pub async fn leave_all(&self, member: &str) -> Vec<(String, Departure)> {
        let mut rooms = self.rooms.write().await;
        let joined: Vec<String> = rooms
            .iter()
            .filter(|(_, members)| members.contains_key(member))
            .map(|(room, _)| room.clone())
            .collect();
        let departures = joined
            .into_iter()
            .map(|room| {
                let departure = remove_member(&mut rooms, &room, member);
                (room, departure)
            })
            .collect();
        metrics::set_active_rooms(self.kind, rooms.len());
        departures
    }

    /// Queue `message` for every member except `exclude`. Members whose
    /// receiver is gone are pruned. Returns the number of deliveries.
    pub async fn broadcast(&self, room: &str, exclude: Option<&str>, message: M) -> usize {
        let mut stale = Vec::new();
        let mut delivered = 0;
        {
            let rooms = self.rooms.read().await;
            let Some(members) = rooms.get(room) else {
                return 0;
            };
            for (member, sender) in members {
                if Some(member.as_str()) == exclude {
                    continue;
                }
                if sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale.push(member.clone());
                }
            }
        }

        if !stale.is_empty() {
            let mut rooms = self.rooms.write().await;
            for member in stale {
                remove_member(&mut rooms, room, &member);
            }
            metrics::set_active_rooms(self.kind, rooms.len());
        }
        delivered
    }

    pub async fn is_member(&self, room: &str, member: &str) -> bool {
        self.rooms.read().await.get(room).is_some_and(|members| members.contains_key(member))
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

fn remove_member<M>(
    rooms: &mut HashMap<String, HashMap<String, mpsc::UnboundedSender<M>>>,
    room: &str,
    member: &str,
) -> Departure {
    let Some(members) = rooms.get_mut(room) else {
        return Departure { was_member: false, room_closed: false };
    };
    let was_member = members.remove(member).is_some();
    let room_closed = members.is_empty();
    if room_closed {
        rooms.remove(room);
    }
    Departure { was_member, room_closed }
}
