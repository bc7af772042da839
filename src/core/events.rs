//! Notifications emitted by the engine.

use crate::entities::{ClockId, OwnerId};

/// What triggered a cache notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    Insert,
    Forget(OwnerId),
    ForgetAll,
    Budget,
    Policy,
    Purge,
}

/// Emitted after every mutating cache call, whether or not anything was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheChanged {
    pub change: CacheChange,
    pub used: usize,
    pub budget: usize,
    pub evicted: usize,
}

/// Emitted by a playback clock when its current frame moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChanged {
    pub clock: ClockId,
    pub frame: i64,
}
