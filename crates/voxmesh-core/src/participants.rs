use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a channel member, as assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque identifier of a voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// UI-facing view of one channel member.
///
/// Each status flag is written by its own event stream: mute and deafen
/// by relay broadcasts, speaking by voice activity, screen sharing by
/// share start/stop signals.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantView {
    pub user_id: ParticipantId,
    pub display_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub is_local: bool,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_speaking: bool,
    pub is_sharing_screen: bool,
}

impl ParticipantView {
    pub fn new(user_id: ParticipantId, display_name: Option<String>) -> Self {
        Self {
            user_id,
            display_name,
            joined_at: Utc::now(),
            is_local: false,
            is_muted: false,
            is_deafened: false,
            is_speaking: false,
            is_sharing_screen: false,
        }
    }

    pub fn local(user_id: ParticipantId, display_name: Option<String>) -> Self {
        Self {
            is_local: true,
            ..Self::new(user_id, display_name)
        }
    }
}

/// Ordered list of channel members.
///
/// The local member is pinned first; remote members follow in join order.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    participants: Vec<ParticipantView>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the local member at the head of the list.
    pub fn set_local(&mut self, view: ParticipantView) {
        self.participants.retain(|p| !p.is_local && p.user_id != view.user_id);
        self.participants.insert(0, view);
    }

    /// Append a remote member. Returns false if the id is already present.
    pub fn add(&mut self, view: ParticipantView) -> bool {
        if self.contains(&view.user_id) {
            return false;
        }
        self.participants.push(view);
        true
    }

    pub fn remove(&mut self, user_id: &ParticipantId) -> Option<ParticipantView> {
        let index = self.participants.iter().position(|p| &p.user_id == user_id)?;
        Some(self.participants.remove(index))
    }

    pub fn contains(&self, user_id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.user_id == user_id)
    }

    pub fn get(&self, user_id: &ParticipantId) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn get_mut(&mut self, user_id: &ParticipantId) -> Option<&mut ParticipantView> {
        self.participants.iter_mut().find(|p| &p.user_id == user_id)
    }

    pub fn local_mut(&mut self) -> Option<&mut ParticipantView> {
        self.participants.iter_mut().find(|p| p.is_local)
    }

    pub fn views(&self) -> &[ParticipantView] {
        &self.participants
    }

    pub fn remote_ids(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| !p.is_local)
            .map(|p| p.user_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: &str) -> ParticipantView {
        ParticipantView::new(ParticipantId::from(id), Some(format!("name-{id}")))
    }

    #[test]
    fn add_and_retrieve_participant() {
        let mut roster = ParticipantRoster::new();
        assert!(roster.add(remote("p1")));
        assert_eq!(roster.len(), 1);
        assert_eq!(
            roster.get(&"p1".into()).unwrap().display_name.as_deref(),
            Some("name-p1")
        );
    }

    #[test]
    fn no_duplicate_participants() {
        let mut roster = ParticipantRoster::new();
        assert!(roster.add(remote("p1")));
        assert!(!roster.add(remote("p1")));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn local_is_pinned_first() {
        let mut roster = ParticipantRoster::new();
        roster.add(remote("p1"));
        roster.add(remote("p2"));
        roster.set_local(ParticipantView::local("me".into(), None));

        let ids: Vec<&str> = roster.views().iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["me", "p1", "p2"]);
        assert_eq!(roster.remote_ids(), vec![ParticipantId::from("p1"), "p2".into()]);
    }

    #[test]
    fn remove_keeps_join_order() {
        let mut roster = ParticipantRoster::new();
        roster.add(remote("p1"));
        roster.add(remote("p2"));
        roster.add(remote("p3"));

        assert!(roster.remove(&"p2".into()).is_some());
        assert!(roster.remove(&"p2".into()).is_none());

        let ids: Vec<&str> = roster.views().iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[test]
    fn flags_update_independently() {
        let mut roster = ParticipantRoster::new();
        roster.add(remote("p1"));
        roster.get_mut(&"p1".into()).unwrap().is_muted = true;
        roster.get_mut(&"p1".into()).unwrap().is_speaking = true;

        let view = roster.get(&"p1".into()).unwrap();
        assert!(view.is_muted);
        assert!(view.is_speaking);
        assert!(!view.is_deafened);
        assert!(!view.is_sharing_screen);
    }

    #[test]
    fn clear_resets_everything() {
        let mut roster = ParticipantRoster::new();
        roster.set_local(ParticipantView::local("me".into(), None));
        roster.add(remote("p1"));
        roster.clear();
        assert!(roster.is_empty());
        assert!(roster.local_mut().is_none());
    }
}
