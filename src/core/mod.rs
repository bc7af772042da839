//! Core engine modules - cache, clock, ticker, events
//!
//! These modules form the playback engine, independent of any UI.

pub mod budget;
pub mod engine;
pub mod event_bus;
pub mod events;
pub mod frame_cache;
pub mod player;
pub mod timer_hub;

// Re-exports for convenience
pub use engine::{Engine, Session};
pub use event_bus::{EventBus, EventEmitter};
pub use events::{CacheChange, CacheChanged, FrameChanged};
pub use frame_cache::{CachePolicy, CacheStats, FrameCache, FrameGuard, FrameHandle};
pub use player::{Direction, FrameDelta, LoopMode, PlaybackClock, SharedClock};
pub use timer_hub::{TickStrategy, TimerHub};
