//! Participant identity and negotiation roles
//!
//! Initiator selection is coordination-free: both peers feed the same two
//! identities into [`Role::for_pair`] and arrive at the same answer. The order
//! used is byte-wise comparison of the UTF-8 encoding, which is independent of
//! locale and normalisation settings on either side.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::matching::MatchError;

/// A participant identity (e.g. an institutional e-mail address).
///
/// Deserialization applies the same blank check as [`Identity::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity, rejecting empty or whitespace-only strings
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Part before the `@`, used for display only
    pub fn display_name(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = MatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(MatchError::InvalidIdentity)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Identity {
    /// Byte-wise lexical order over the UTF-8 encoding
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Negotiation role within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates the data channel and the offer
    Initiator,
    /// Waits for the offer and answers it
    Responder,
}

impl Role {
    /// Role of `me` when paired with `peer`.
    ///
    /// The smaller identity under the byte-wise order initiates. Equal
    /// identities never share a room, so the tie case is unreachable in
    /// practice; it resolves to `Responder` for both.
    pub fn for_pair(me: &Identity, peer: &Identity) -> Self {
        match me.cmp(peer) {
            Ordering::Less => Role::Initiator,
            _ => Role::Responder,
        }
    }

    /// The initiator of a pair, if the identities differ
    pub fn initiator_of<'a>(a: &'a Identity, b: &'a Identity) -> Option<&'a Identity> {
        match a.cmp(b) {
            Ordering::Less => Some(a),
            Ordering::Greater => Some(b),
            Ordering::Equal => None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(Identity::new("").is_none());
        assert!(Identity::new("   ").is_none());
        assert!(Identity::new("alice@uni.edu").is_some());
    }

    #[test]
    fn test_blank_identity_rejected_on_deserialize() {
        let parsed: Identity = serde_json::from_str(r#""alice@uni.edu""#).unwrap();
        assert_eq!(parsed, id("alice@uni.edu"));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), r#""alice@uni.edu""#);

        assert!(serde_json::from_str::<Identity>(r#""   ""#).is_err());
        assert!(serde_json::from_str::<Identity>(r#""""#).is_err());
        assert_eq!(
            Identity::try_from(" ".to_string()),
            Err(MatchError::InvalidIdentity)
        );
    }

    #[test]
    fn test_alice_initiates_with_bob() {
        let alice = id("alice@uni.edu");
        let bob = id("bob@uni.edu");

        assert_eq!(Role::for_pair(&alice, &bob), Role::Initiator);
        assert_eq!(Role::for_pair(&bob, &alice), Role::Responder);
        assert_eq!(Role::initiator_of(&bob, &alice), Some(&alice));
    }

    #[test]
    fn test_order_is_bytewise() {
        // Uppercase sorts before lowercase in byte order
        let upper = id("Zed@uni.edu");
        let lower = id("amy@uni.edu");
        assert_eq!(Role::for_pair(&upper, &lower), Role::Initiator);

        // Non-ASCII bytes sort after ASCII
        let accented = id("émile@uni.edu");
        let plain = id("zoe@uni.edu");
        assert_eq!(Role::for_pair(&plain, &accented), Role::Initiator);
    }

    #[test]
    fn test_exactly_one_initiator_per_pair() {
        let names = ["a@x", "b@x", "aa@x", "A@x", "ä@x", "0@x"];
        for a in names {
            for b in names {
                if a == b {
                    continue;
                }
                let (a, b) = (id(a), id(b));
                let roles = (Role::for_pair(&a, &b), Role::for_pair(&b, &a));
                assert!(
                    roles.0.is_initiator() ^ roles.1.is_initiator(),
                    "{} / {} produced {:?}",
                    a,
                    b,
                    roles
                );
            }
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(id("alice@uni.edu").display_name(), "alice");
        assert_eq!(id("nobody").display_name(), "nobody");
    }
}
