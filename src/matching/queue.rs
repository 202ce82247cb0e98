//! In-process matching queue
//!
//! The waiting pool and the room table live behind one mutex. Pairing is split
//! into a selection step and a commit step; the commit re-checks that both
//! entries are still waiting (compare-and-swap on "still unmatched"), so a
//! candidate that was claimed or left in between makes the commit fail with
//! [`MatchError::RaceLost`] and the attempt is retried.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::error::MatchError;
use super::room::{EntryId, QueueEvent, Room, RoomCode};
use super::Matchmaker;
use crate::identity::{Identity, Role};

/// Number of select/commit rounds before the caller is left waiting
pub const MAX_MATCH_ATTEMPTS: usize = 3;

/// Capacity of the queue event channel
const EVENT_CAPACITY: usize = 256;

/// A participant waiting for a partner
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub id: EntryId,
    pub identity: Identity,
    pub joined_at: DateTime<Utc>,
    /// Monotonic join order; breaks joined-at ties
    seq: u64,
}

/// Outcome of the selection step
#[derive(Debug, Clone)]
struct Candidate {
    caller_seq: u64,
    caller: Identity,
    partner_seq: u64,
    partner: Identity,
}

#[derive(Default)]
struct QueueState {
    /// Waiting entries in FIFO order
    waiting: BTreeMap<u64, WaitingEntry>,
    by_identity: HashMap<Identity, u64>,
    rooms: HashMap<RoomCode, Room>,
    active_by_identity: HashMap<Identity, RoomCode>,
    next_seq: u64,
}

impl QueueState {
    fn insert_waiting(&mut self, identity: &Identity) -> EntryId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = WaitingEntry {
            id: EntryId::new(),
            identity: identity.clone(),
            joined_at: Utc::now(),
            seq,
        };
        let id = entry.id;

        self.by_identity.insert(identity.clone(), seq);
        self.waiting.insert(seq, entry);
        id
    }

    fn remove_waiting(&mut self, identity: &Identity) -> Option<WaitingEntry> {
        let seq = self.by_identity.remove(identity)?;
        self.waiting.remove(&seq)
    }

    fn is_waiting(&self, seq: u64, identity: &Identity) -> bool {
        self.waiting
            .get(&seq)
            .is_some_and(|entry| &entry.identity == identity)
    }

    fn deactivate_room_of(&mut self, identity: &Identity) -> Option<Room> {
        let code = self.active_by_identity.remove(identity)?;
        let room = self.rooms.get_mut(&code)?;
        room.deactivate();

        if let Some(other) = room.counterpart_of(identity) {
            if self.active_by_identity.get(other) == Some(&code) {
                self.active_by_identity.remove(other);
            }
        }

        Some(room.clone())
    }
}

/// Waiting pool plus room table with linearizable pairing
pub struct MatchingQueue {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl MatchingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    /// Enter the waiting pool and attempt a match.
    ///
    /// Any earlier waiting entry for `identity` is replaced. If the identity is
    /// still a member of an active room, that room is ended first so that an
    /// identity never holds two active rooms.
    pub fn enqueue(&self, identity: &Identity) -> EntryId {
        let (entry_id, waiting) = {
            let mut state = self.state.lock();

            if let Some(stale) = state.remove_waiting(identity) {
                debug!("Replaced stale waiting entry {} for {}", stale.id, identity);
            }

            if let Some(room) = state.deactivate_room_of(identity) {
                warn!(
                    "{} re-joined while in room {}, ending it",
                    identity,
                    room.code.display_suffix()
                );
                self.publish_ended(&room, identity);
            }

            let id = state.insert_waiting(identity);
            (id, state.waiting.len())
        };

        info!("{} joined the queue ({} waiting)", identity, waiting);

        self.attempt_match(identity);
        entry_id
    }

    /// Pair `identity` with the longest-waiting other participant.
    ///
    /// Returns the committed room, or `None` if the caller is not waiting or
    /// nobody else is. Lost races are retried up to [`MAX_MATCH_ATTEMPTS`].
    pub fn attempt_match(&self, identity: &Identity) -> Option<Room> {
        for attempt in 1..=MAX_MATCH_ATTEMPTS {
            let candidate = self.select_candidate(identity)?;

            match self.commit_pair(&candidate) {
                Ok(room) => return Some(room),
                Err(MatchError::RaceLost) => {
                    debug!(
                        "Match attempt {} for {} lost race on {}",
                        attempt, identity, candidate.partner
                    );
                }
                Err(e) => {
                    warn!("Match commit for {} failed: {}", identity, e);
                    return None;
                }
            }
        }

        debug!(
            "{} left waiting after {} match attempts",
            identity, MAX_MATCH_ATTEMPTS
        );
        None
    }

    fn select_candidate(&self, identity: &Identity) -> Option<Candidate> {
        let state = self.state.lock();
        let caller_seq = *state.by_identity.get(identity)?;

        // BTreeMap iteration is FIFO by join order
        let partner = state
            .waiting
            .values()
            .find(|entry| &entry.identity != identity)?;

        Some(Candidate {
            caller_seq,
            caller: identity.clone(),
            partner_seq: partner.seq,
            partner: partner.identity.clone(),
        })
    }

    fn commit_pair(&self, candidate: &Candidate) -> Result<Room, MatchError> {
        let mut state = self.state.lock();

        if !state.is_waiting(candidate.caller_seq, &candidate.caller)
            || !state.is_waiting(candidate.partner_seq, &candidate.partner)
        {
            return Err(MatchError::RaceLost);
        }

        let initiator = Role::initiator_of(&candidate.caller, &candidate.partner)
            .cloned()
            .ok_or(MatchError::RaceLost)?;

        state.remove_waiting(&candidate.caller);
        state.remove_waiting(&candidate.partner);

        let room = Room::new(candidate.caller.clone(), candidate.partner.clone());
        state
            .active_by_identity
            .insert(room.member_a.clone(), room.code.clone());
        state
            .active_by_identity
            .insert(room.member_b.clone(), room.code.clone());
        state.rooms.insert(room.code.clone(), room.clone());

        info!(
            "Room {} created for {} and {} ({} initiates)",
            room.code.display_suffix(),
            room.member_a,
            room.member_b,
            initiator
        );

        // Published under the lock so event order matches commit order
        let _ = self.events.send(QueueEvent::Matched {
            room_code: room.code.clone(),
            members: room.members(),
            initiator,
        });

        Ok(room)
    }

    /// Remove the waiting entry for `identity`; returns whether one existed
    pub fn remove(&self, identity: &Identity) -> bool {
        let removed = self.state.lock().remove_waiting(identity);
        if let Some(entry) = &removed {
            info!("{} left the queue (entry {})", identity, entry.id);
        }
        removed.is_some()
    }

    /// Deactivate the active room of `identity` and drop it from the pool.
    ///
    /// Returns the code of the room that was ended by this call, if any.
    pub fn end_room_of(&self, identity: &Identity) -> Option<RoomCode> {
        let mut state = self.state.lock();
        state.remove_waiting(identity);

        let room = state.deactivate_room_of(identity)?;
        info!("Room {} ended by {}", room.code.display_suffix(), identity);
        self.publish_ended(&room, identity);
        Some(room.code)
    }

    /// Deactivate `code` only if it is the active room of `identity`.
    ///
    /// Unlike [`Self::end_room_of`] the waiting pool is left alone, so a
    /// participant already searching again keeps its place.
    pub fn end_room_code(&self, identity: &Identity, code: &RoomCode) -> bool {
        let mut state = self.state.lock();
        if state.active_by_identity.get(identity) != Some(code) {
            return false;
        }

        let Some(room) = state.deactivate_room_of(identity) else {
            return false;
        };
        info!("Room {} ended by {}", room.code.display_suffix(), identity);
        self.publish_ended(&room, identity);
        true
    }

    fn publish_ended(&self, room: &Room, ended_by: &Identity) {
        let _ = self.events.send(QueueEvent::RoomEnded {
            room_code: room.code.clone(),
            members: room.members(),
            ended_by: ended_by.clone(),
        });
    }

    /// Number of unmatched waiting entries
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_waiting(&self, identity: &Identity) -> bool {
        self.state.lock().by_identity.contains_key(identity)
    }

    /// Look up a room by code, active or not
    pub fn room(&self, code: &RoomCode) -> Option<Room> {
        self.state.lock().rooms.get(code).cloned()
    }

    pub fn active_room_of(&self, identity: &Identity) -> Option<Room> {
        let state = self.state.lock();
        let code = state.active_by_identity.get(identity)?;
        state.rooms.get(code).cloned()
    }

    pub fn active_rooms(&self) -> Vec<Room> {
        self.state
            .lock()
            .rooms
            .values()
            .filter(|room| room.active)
            .cloned()
            .collect()
    }

    /// Every room ever shared by `a` and `b`, oldest first
    pub fn rooms_between(&self, a: &Identity, b: &Identity) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .state
            .lock()
            .rooms
            .values()
            .filter(|room| room.is_between(a, b))
            .cloned()
            .collect();
        // A pair's active room is always its newest
        rooms.sort_by_key(|room| (room.active, room.created_at));
        rooms
    }

    /// Number of rooms ever created, active or ended
    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

impl Default for MatchingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Matchmaker for MatchingQueue {
    async fn join(&self, identity: &Identity) -> Result<EntryId, MatchError> {
        Ok(self.enqueue(identity))
    }

    async fn leave(&self, identity: &Identity) -> Result<(), MatchError> {
        self.remove(identity);
        Ok(())
    }

    async fn end_room(&self, identity: &Identity) -> Result<Option<RoomCode>, MatchError> {
        Ok(self.end_room_of(identity))
    }

    async fn close_room(
        &self,
        identity: &Identity,
        room_code: &RoomCode,
    ) -> Result<bool, MatchError> {
        Ok(self.end_room_code(identity, room_code))
    }

    async fn count_waiting(&self) -> Result<usize, MatchError> {
        Ok(self.waiting_count())
    }

    fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.subscribe()
    }
}
