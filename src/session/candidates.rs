//! Pending remote candidates
//!
//! Candidates can arrive before the remote description they belong to. They
//! are held here and released in arrival order once the description is set.

use std::collections::VecDeque;

use super::capability::IceCandidate;

#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate if it can be applied now, otherwise buffers it
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.queue.push_back(candidate);
            None
        }
    }

    /// Record that the remote description is set and release the buffer
    pub fn remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.queue.drain(..).collect()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
