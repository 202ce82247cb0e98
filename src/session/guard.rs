//! Stale-session guard
//!
//! Leaving, skipping or ending bumps the epoch synchronously, before the
//! session task gets to the request. Any asynchronous step that completes
//! afterwards holds a token from the old epoch and becomes a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct SessionGuard {
    epoch: Arc<AtomicU64>,
}

impl SessionGuard {
    /// Token for work started in the current epoch
    pub fn token(&self) -> SessionToken {
        SessionToken {
            epoch: self.epoch.load(Ordering::SeqCst),
            current: self.epoch.clone(),
        }
    }

    /// Invalidate every outstanding token; returns the new epoch
    pub fn invalidate(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl SessionToken {
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_stales_old_tokens() {
        let guard = SessionGuard::default();
        let old = guard.token();
        assert!(old.is_current());

        guard.invalidate();
        let new = guard.token();

        assert!(!old.is_current());
        assert!(new.is_current());
        assert_eq!(new.epoch(), old.epoch() + 1);
    }
}
