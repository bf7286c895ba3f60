use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use yrs::sync::awareness::AwarenessUpdateSummary;
use yrs::sync::{Awareness, AwarenessUpdate};

/// Who a peer is, as announced over the awareness channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    pub color_seed: u16,
}

/// Caret/selection in body offsets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceState {
    pub user: PresenceUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePeer {
    pub client_id: u64,
    pub clock: u32,
    pub presence: PresenceState,
}

pub fn set_local_presence(awareness: &Awareness, presence: &PresenceState) -> Result<()> {
    awareness.set_local_state(presence).context("failed to encode local presence state")?;
    Ok(())
}

pub fn clear_local_presence(awareness: &Awareness) {
    awareness.clean_local_state();
}

/// Remote peers with a decodable presence state, ordered by client id.
/// States that fail to decode are skipped rather than surfaced.
pub fn remote_peers(awareness: &Awareness) -> Vec<PresencePeer> {
    let local = awareness.client_id();
    let mut peers: Vec<PresencePeer> = awareness
        .iter()
        .filter(|(client_id, _)| *client_id != local)
        .filter_map(|(client_id, state)| {
            let raw = state.data?;
            let presence: PresenceState = serde_json::from_str(raw.as_ref()).ok()?;
            Some(PresencePeer { client_id, clock: state.clock, presence })
        })
        .collect();

    peers.sort_by_key(|peer| peer.client_id);
    peers
}

/// Apply a remote awareness update. `None` means nothing changed.
pub fn apply_remote_update(
    awareness: &Awareness,
    update: AwarenessUpdate,
) -> Result<Option<AwarenessUpdateSummary>> {
    awareness.apply_update_summary(update).context("failed to apply awareness update")
}

/// Remote peers dropped from the local view until they announce again.
///
/// yrs can only clear a remote entry by raising its clock, after which the
/// peer's next announcement at its current clock is discarded as stale. The
/// awareness entries are therefore left alone and hidden here instead.
#[derive(Debug, Default)]
pub struct ForgottenPeers {
    client_ids: HashSet<u64>,
}

impl ForgottenPeers {
    pub fn forget(&mut self, client_ids: impl IntoIterator<Item = u64>) {
        self.client_ids.extend(client_ids);
    }

    /// Un-hide every client that `update` carries a live state for.
    pub fn heard_from(&mut self, update: &AwarenessUpdate) {
        for (client_id, entry) in &update.clients {
            if entry.json.as_ref() != "null" {
                self.client_ids.remove(client_id);
            }
        }
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.client_ids.contains(&client_id)
    }

    /// `remote_peers` minus the hidden ones.
    pub fn visible(&self, awareness: &Awareness) -> Vec<PresencePeer> {
        let mut peers = remote_peers(awareness);
        peers.retain(|peer| !self.contains(peer.client_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, Options};

    fn awareness_with_client_id(client_id: u64) -> Awareness {
        let options = Options { client_id, ..Default::default() };
        Awareness::new(Doc::with_options(options))
    }

    fn sample_presence(id: &str, name: &str) -> PresenceState {
        PresenceState {
            user: PresenceUser { id: id.to_string(), name: name.to_string(), color_seed: 210 },
            cursor: Some(CursorRange { anchor: 3, head: 9 }),
        }
    }

    #[test]
    fn presence_state_uses_camel_case_on_the_wire() {
        let value = serde_json::to_value(sample_presence("u1", "Ana")).expect("serialize");
        assert_eq!(value["user"]["colorSeed"], 210);
        assert_eq!(value["cursor"]["head"], 9);
    }

    #[test]
    fn remote_update_is_listed_and_local_state_is_not() {
        let local = awareness_with_client_id(1);
        let remote = awareness_with_client_id(2);
        set_local_presence(&local, &sample_presence("user-alice", "Alice")).expect("local");
        set_local_presence(&remote, &sample_presence("user-bob", "Bob")).expect("remote");

        let update = remote.update().expect("remote update should encode");
        let summary = apply_remote_update(&local, update).expect("update should apply");
        assert!(summary.is_some());

        let peers = remote_peers(&local);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].client_id, 2);
        assert_eq!(peers[0].presence.user.name, "Bob");
    }

    #[test]
    fn stale_update_reports_no_change() {
        let local = awareness_with_client_id(1);
        let remote = awareness_with_client_id(2);
        set_local_presence(&remote, &sample_presence("user-bob", "Bob")).expect("remote");
        let update = remote.update().expect("remote update should encode");

        assert!(apply_remote_update(&local, update.clone()).expect("first").is_some());
        assert!(apply_remote_update(&local, update).expect("second").is_none());
    }

    #[test]
    fn forgotten_peers_stay_hidden_until_they_announce_again() {
        let local = awareness_with_client_id(1);
        let remote = awareness_with_client_id(2);
        set_local_presence(&remote, &sample_presence("user-bob", "Bob")).expect("remote");
        let update = remote.update().expect("encode");
        apply_remote_update(&local, update.clone()).expect("apply");

        let mut forgotten = ForgottenPeers::default();
        forgotten.forget([2]);
        assert!(forgotten.visible(&local).is_empty());

        // The same announcement replayed at the same clock brings Bob back.
        forgotten.heard_from(&update);
        assert!(apply_remote_update(&local, update).expect("replay").is_none());
        let peers = forgotten.visible(&local);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].presence.user.name, "Bob");
    }

    #[test]
    fn departure_does_not_unhide_a_peer() {
        let local = awareness_with_client_id(1);
        let remote = awareness_with_client_id(2);
        set_local_presence(&remote, &sample_presence("user-bob", "Bob")).expect("remote");
        apply_remote_update(&local, remote.update().expect("encode")).expect("apply");

        let mut forgotten = ForgottenPeers::default();
        forgotten.forget([2]);
        remote.clean_local_state();
        forgotten.heard_from(&remote.update_with_clients([2]).expect("encode departure"));
        assert!(forgotten.contains(2));
    }
}
