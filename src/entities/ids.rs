//! Opaque identities for cache owners and playback clocks.
//!
//! Owners are issued by [`OwnerRegistry`] so a session never has to invent
//! its own key (no window addresses, no sentinel values).

use indexmap::IndexSet;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a cache client (one per playback session/window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner:{}", self.0)
    }
}

/// Identity of a playback clock registered with the timer hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockId(Uuid);

impl ClockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock:{}", self.0)
    }
}

/// Issues owner identities and tracks which ones are still live.
#[derive(Debug, Default)]
pub struct OwnerRegistry {
    live: IndexSet<OwnerId>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh owner identity.
    pub fn issue(&mut self) -> OwnerId {
        let id = OwnerId(Uuid::new_v4());
        self.live.insert(id);
        debug!("Issued {} ({} live)", id, self.live.len());
        id
    }

    /// Retire an identity. Returns false if it was not live.
    pub fn retire(&mut self, id: OwnerId) -> bool {
        let removed = self.live.shift_remove(&id);
        if !removed {
            warn!("Retire of unknown {}", id);
        }
        removed
    }

    pub fn is_live(&self, id: OwnerId) -> bool {
        self.live.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live owners in issue order.
    pub fn iter(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.live.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_is_unique() {
        let mut reg = OwnerRegistry::new();
        let a = reg.issue();
        let b = reg.issue();
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.iter().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_retire() {
        let mut reg = OwnerRegistry::new();
        let a = reg.issue();
        assert!(reg.retire(a));
        assert!(!reg.is_live(a));
        assert!(!reg.retire(a));
        assert!(reg.is_empty());
    }
}
