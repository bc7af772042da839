//! SEQPLAY - frame cache and playback clock library
//!
//! Re-exports all modules for use by binary targets.

// Core engine (cache, clock, ticker, events)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;

// Re-export commonly used types from core
pub use core::engine::{Engine, Session};
pub use core::event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter};
pub use core::frame_cache::{CachePolicy, FrameCache, FrameGuard};
pub use core::player::PlaybackClock;
pub use core::timer_hub::TimerHub;

// Re-export entities
pub use entities::{Frame, FramePayload, OwnerId};
