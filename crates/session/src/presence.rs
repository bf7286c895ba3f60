// Presence projection: the peer list a UI renders, derived from awareness.
//
// Entries are keyed by awareness client id but projected one per logical
// user. A peer whose awareness clock stops advancing is dropped after the
// presence timeout. When the transport drops, the last known list is held
// for a grace window so a quick reconnect does not make avatars flicker.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::engine::awareness::PresencePeer;

/// Stable hue (0..360) for a user id.
pub fn color_seed(user_id: &str) -> u16 {
    let digest = Sha256::digest(user_id.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]]) % 360
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub client_id: u64,
    pub user_id: String,
    pub display_name: String,
    pub color_seed: u16,
    pub last_seen_at: Instant,
}

#[derive(Debug, Clone)]
struct Tracked {
    entry: PresenceEntry,
    clock: u32,
}

#[derive(Debug, Default)]
pub struct PresenceProjection {
    tracked: HashMap<u64, Tracked>,
    hold_until: Option<Instant>,
}

impl PresenceProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile with the current awareness peers. Returns true if the
    /// projected list changed.
    pub fn observe(&mut self, peers: &[PresencePeer], now: Instant) -> bool {
        let before = self.snapshot();

        self.tracked.retain(|client_id, _| peers.iter().any(|peer| peer.client_id == *client_id));
        for peer in peers {
            let user = &peer.presence.user;
            match self.tracked.get_mut(&peer.client_id) {
                Some(tracked) => {
                    if tracked.clock != peer.clock {
                        tracked.clock = peer.clock;
                        tracked.entry.last_seen_at = now;
                    }
                    tracked.entry.user_id.clone_from(&user.id);
                    tracked.entry.display_name.clone_from(&user.name);
                    tracked.entry.color_seed = user.color_seed;
                }
                None => {
                    self.tracked.insert(
                        peer.client_id,
                        Tracked {
                            entry: PresenceEntry {
                                client_id: peer.client_id,
                                user_id: user.id.clone(),
                                display_name: user.name.clone(),
                                color_seed: user.color_seed,
                                last_seen_at: now,
                            },
                            clock: peer.clock,
                        },
                    );
                }
            }
        }

        before != self.snapshot()
    }

    /// Client ids whose last announcement is older than `timeout`. The caller
    /// hides them from the peer list and then calls `observe` again.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<u64> {
        if self.hold_until.is_some() {
            return Vec::new();
        }
        let mut expired: Vec<u64> = self
            .tracked
            .values()
            .filter(|tracked| now.saturating_duration_since(tracked.entry.last_seen_at) >= timeout)
            .map(|tracked| tracked.entry.client_id)
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Keep the current list for `grace` after a transport loss.
    pub fn hold(&mut self, now: Instant, grace: Duration) {
        self.hold_until = Some(now + grace);
    }

    /// Called once the transport is back; fresh awareness takes over.
    pub fn release_hold(&mut self, now: Instant) {
        self.hold_until = None;
        for tracked in self.tracked.values_mut() {
            tracked.entry.last_seen_at = now;
        }
    }

    pub fn is_holding(&self) -> bool {
        self.hold_until.is_some()
    }

    /// Drop everything once an unanswered grace window has passed. Returns
    /// true if entries were cleared.
    pub fn expire_hold(&mut self, now: Instant) -> bool {
        match self.hold_until {
            Some(deadline) if now >= deadline => {
                self.hold_until = None;
                let had_entries = !self.tracked.is_empty();
                self.tracked.clear();
                had_entries
            }
            _ => false,
        }
    }

    pub fn hold_deadline(&self) -> Option<Instant> {
        self.hold_until
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
        self.hold_until = None;
    }

    /// One entry per user (most recently seen client wins), sorted by display
    /// name then user id.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut by_user: HashMap<&str, &PresenceEntry> = HashMap::new();
        for tracked in self.tracked.values() {
            let entry = &tracked.entry;
            by_user
                .entry(entry.user_id.as_str())
                .and_modify(|current| {
                    if (entry.last_seen_at, entry.client_id) > (current.last_seen_at, current.client_id) {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }

        let mut entries: Vec<PresenceEntry> = by_user.into_values().cloned().collect();
        entries.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        entries
    }
}
