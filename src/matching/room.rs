//! Rooms, room codes and queue events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{Identity, Role};

/// Queue-assigned id of a waiting entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Length of the human-readable room code suffix
const DISPLAY_SUFFIX_LEN: usize = 6;

/// Opaque, unguessable room code.
///
/// Consumers must not parse it; [`RoomCode::display_suffix`] is the only
/// derived form meant for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a fresh room code from 122 random bits
    pub fn generate() -> Self {
        Self(format!("room_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short suffix for status bars and logs
    pub fn display_suffix(&self) -> &str {
        let start = self.0.len().saturating_sub(DISPLAY_SUFFIX_LEN);
        self.0.get(start..).unwrap_or(&self.0)
    }
}

impl From<String> for RoomCode {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed pairing of exactly two participants.
///
/// Rooms are deactivated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub code: RoomCode,
    /// Participant whose match attempt committed the pair
    pub member_a: Identity,
    /// Longest-waiting partner selected by the attempt
    pub member_b: Identity,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Room {
    pub(crate) fn new(member_a: Identity, member_b: Identity) -> Self {
        Self {
            code: RoomCode::generate(),
            member_a,
            member_b,
            created_at: Utc::now(),
            active: true,
            ended_at: None,
        }
    }

    pub fn has_member(&self, identity: &Identity) -> bool {
        &self.member_a == identity || &self.member_b == identity
    }

    /// The other member, if `identity` belongs to this room
    pub fn counterpart_of(&self, identity: &Identity) -> Option<&Identity> {
        if &self.member_a == identity {
            Some(&self.member_b)
        } else if &self.member_b == identity {
            Some(&self.member_a)
        } else {
            None
        }
    }

    /// Whether the room pairs exactly `a` and `b`, in either order
    pub fn is_between(&self, a: &Identity, b: &Identity) -> bool {
        (&self.member_a == a && &self.member_b == b) || (&self.member_a == b && &self.member_b == a)
    }

    pub fn members(&self) -> [Identity; 2] {
        [self.member_a.clone(), self.member_b.clone()]
    }

    /// Mark the room inactive; returns false if it already was
    pub(crate) fn deactivate(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.ended_at = Some(Utc::now());
        true
    }
}

/// Events published by the matching queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A room was committed. `initiator` is decided once, at commit time.
    Matched {
        room_code: RoomCode,
        members: [Identity; 2],
        initiator: Identity,
    },
    /// A room was deactivated by one of its members
    RoomEnded {
        room_code: RoomCode,
        members: [Identity; 2],
        ended_by: Identity,
    },
}

impl QueueEvent {
    pub fn room_code(&self) -> &RoomCode {
        match self {
            QueueEvent::Matched { room_code, .. } | QueueEvent::RoomEnded { room_code, .. } => {
                room_code
            }
        }
    }

    pub fn involves(&self, identity: &Identity) -> bool {
        let members = match self {
            QueueEvent::Matched { members, .. } | QueueEvent::RoomEnded { members, .. } => members,
        };
        members.contains(identity)
    }

    /// Per-participant view of a `Matched` event
    pub fn match_notice_for(&self, identity: &Identity) -> Option<MatchNotice> {
        let QueueEvent::Matched {
            room_code,
            members,
            initiator,
        } = self
        else {
            return None;
        };

        let peer = if &members[0] == identity {
            &members[1]
        } else if &members[1] == identity {
            &members[0]
        } else {
            return None;
        };

        let role = if initiator == identity {
            Role::Initiator
        } else {
            Role::Responder
        };

        Some(MatchNotice {
            room_code: room_code.clone(),
            peer: peer.clone(),
            role,
        })
    }
}

/// What one participant learns from a match: same content for both sides,
/// delivered to each independently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchNotice {
    pub room_code: RoomCode,
    pub peer: Identity,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_room_codes_are_unique() {
        let a = RoomCode::generate();
        let b = RoomCode::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("room_"));
        assert_eq!(a.display_suffix().len(), DISPLAY_SUFFIX_LEN);
    }

    #[test]
    fn test_room_membership_is_order_insensitive() {
        let one = Room::new(id("alice@uni.edu"), id("bob@uni.edu"));
        let two = Room::new(id("bob@uni.edu"), id("alice@uni.edu"));
        assert!(one.is_between(&id("bob@uni.edu"), &id("alice@uni.edu")));
        assert!(two.is_between(&id("bob@uni.edu"), &id("alice@uni.edu")));
        assert!(!one.is_between(&id("alice@uni.edu"), &id("carol@uni.edu")));
        assert_eq!(one.counterpart_of(&id("bob@uni.edu")), Some(&id("alice@uni.edu")));
        assert_eq!(one.counterpart_of(&id("carol@uni.edu")), None);
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let mut room = Room::new(id("a@x"), id("b@x"));
        assert!(room.deactivate());
        let ended_at = room.ended_at;
        assert!(!room.deactivate());
        assert_eq!(room.ended_at, ended_at);
        assert!(!room.active);
    }

    #[test]
    fn test_match_notice_is_symmetric() {
        let alice = id("alice@uni.edu");
        let bob = id("bob@uni.edu");
        let event = QueueEvent::Matched {
            room_code: RoomCode::generate(),
            members: [bob.clone(), alice.clone()],
            initiator: alice.clone(),
        };

        let for_alice = event.match_notice_for(&alice).unwrap();
        let for_bob = event.match_notice_for(&bob).unwrap();

        assert_eq!(for_alice.room_code, for_bob.room_code);
        assert_eq!(for_alice.peer, bob);
        assert_eq!(for_bob.peer, alice);
        assert_eq!(for_alice.role, Role::Initiator);
        assert_eq!(for_bob.role, Role::Responder);
        assert!(event.match_notice_for(&id("carol@uni.edu")).is_none());
    }
}
