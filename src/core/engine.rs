//! Engine context: the one place that owns the cache, the timer hub, the
//! event bus and the owner registry.
//!
//! Built once at startup and passed by reference to whoever needs it. A
//! [`Session`] is one playback window: an owner identity plus a registered
//! clock. Frames requested through a session are cached under its owner.

use log::{debug, info};
use std::sync::MutexGuard;

use crate::config::Settings;
use crate::core::event_bus::EventBus;
use crate::core::frame_cache::{FrameCache, FrameGuard};
use crate::core::player::{PlaybackClock, SharedClock};
use crate::core::timer_hub::TimerHub;
use crate::entities::{ClockId, Frame, FramePayload, OwnerId, OwnerRegistry};

/// One playback session (window).
#[derive(Debug)]
pub struct Session {
    owner: OwnerId,
    clock: SharedClock,
    clock_id: ClockId,
}

impl Session {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn clock_id(&self) -> ClockId {
        self.clock_id
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Lock the clock for reading or driving transport.
    pub fn lock_clock(&self) -> MutexGuard<'_, PlaybackClock> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_frame(&self) -> i64 {
        self.lock_clock().frame()
    }

    /// Get `frame` from the cache, decoding and inserting it on a miss.
    ///
    /// The returned guard keeps the frame resident until dropped.
    pub fn request_frame<P, F>(&self, cache: &FrameCache<P>, frame: i64, decode: F) -> FrameGuard<P>
    where
        P: FramePayload,
        F: FnOnce(i64) -> P,
    {
        if let Some(guard) = cache.lookup(self.owner, frame) {
            return guard;
        }
        cache.insert(self.owner, frame, decode(frame))
    }
}

/// Application context for the playback core.
pub struct Engine<P: FramePayload = Frame> {
    settings: Settings,
    bus: EventBus,
    cache: FrameCache<P>,
    hub: TimerHub,
    owners: OwnerRegistry,
}

impl<P: FramePayload> Engine<P> {
    pub fn new(settings: Settings) -> Self {
        let bus = EventBus::new();
        let cache = FrameCache::new(settings.cache_budget_bytes(), settings.cache_policy, bus.emitter());
        let hub = TimerHub::new(settings.tick_strategy, settings.tick_resolution());
        info!(
            "Engine initialized: budget={} MB, policy={:?}, ticker={:?}@{:?}",
            cache.budget() / 1024 / 1024,
            settings.cache_policy,
            settings.tick_strategy,
            settings.tick_resolution()
        );
        Self { settings, bus, cache, hub, owners: OwnerRegistry::new() }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &FrameCache<P> {
        &self.cache
    }

    pub fn hub(&self) -> &TimerHub {
        &self.hub
    }

    pub fn hub_mut(&mut self) -> &mut TimerHub {
        &mut self.hub
    }

    pub fn owners(&self) -> &OwnerRegistry {
        &self.owners
    }

    /// Push new settings into the live cache, hub and every open clock.
    pub fn apply_settings(&mut self, settings: Settings, sessions: &[Session]) {
        self.cache.set_policy(settings.cache_policy);
        self.cache.set_budget(settings.cache_budget_bytes());
        self.hub.set_strategy(settings.tick_strategy);
        self.hub.set_resolution(settings.tick_resolution());
        for session in sessions {
            let mut clock = session.lock_clock();
            clock.set_loop_mode(settings.loop_mode);
            clock.set_lockstep(settings.lockstep);
        }
        debug!("Settings applied to {} sessions", sessions.len());
        self.settings = settings;
    }

    /// Open a session over a sequence of `total_frames` frames.
    ///
    /// The clock starts stopped at frame 0 with the configured loop mode,
    /// lockstep flag and base speed, and is registered with the hub.
    pub fn open_session(&mut self, total_frames: i64) -> Session {
        let owner = self.owners.issue();
        let mut clock = PlaybackClock::new(total_frames, self.settings.fps_base, self.bus.emitter());
        clock.set_loop_mode(self.settings.loop_mode);
        clock.set_lockstep(self.settings.lockstep);
        let clock = clock.shared();
        let clock_id = self.hub.register(std::sync::Arc::clone(&clock));
        info!("Session opened: {} / {}", owner, clock_id);
        Session { owner, clock, clock_id }
    }

    /// Close a session: stop its ticks, then drop its cached frames.
    ///
    /// Frames still held by guards stay resident as orphans until released.
    pub fn close_session(&mut self, session: Session) {
        self.hub.unregister(session.clock_id);
        self.cache.forget(session.owner);
        self.owners.retire(session.owner);
        info!("Session closed: {}", session.owner);
    }
}

impl<P: FramePayload> std::fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cache", &self.cache)
            .field("hub", &self.hub)
            .field("sessions", &self.owners.len())
            .finish()
    }
}
