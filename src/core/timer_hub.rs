//! Timer hub: one real-time tick source shared by every playback clock.
//!
//! The source starts when the first clock registers and stops when the last
//! one leaves. Ticks arrive on a channel; the host thread drains them with
//! [`TimerHub::pump`] and every registered clock is stepped there, in
//! registration order. Clock state is never touched by the ticker thread.
//!
//! # Strategies
//!
//! - `BusyWait`: dedicated thread sleeping in small slices until the next
//!   deadline, re-anchoring each deadline on the previous one so overshoot
//!   on one cycle is absorbed by the next.
//! - `FixedRate`: `crossbeam_channel::tick`, a self re-arming timeout.
//!
//! Ticks are coalesced: if the host has not consumed the previous tick, the
//! new one is dropped. Clocks are drift-corrected, so a missed tick only
//! makes the next step larger.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use indexmap::IndexMap;
use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::player::{FrameDelta, SharedClock};
use crate::entities::ClockId;

/// Finest resolution the hub accepts
pub const MIN_RESOLUTION: Duration = Duration::from_millis(1);

/// How the hub produces ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TickStrategy {
    /// Sleep in slices, correcting for overshoot every cycle
    #[default]
    BusyWait,
    /// Recurring timer that re-arms itself
    FixedRate,
}

/// The running tick source.
enum TickSource {
    FixedRate {
        rx: Receiver<Instant>,
    },
    BusyWait {
        rx: Receiver<Instant>,
        shutdown: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    },
}

impl TickSource {
    fn start(strategy: TickStrategy, resolution: Duration) -> Self {
        match strategy {
            TickStrategy::FixedRate => Self::fixed_rate(resolution),
            TickStrategy::BusyWait => Self::busy_wait(resolution),
        }
    }

    fn fixed_rate(resolution: Duration) -> Self {
        TickSource::FixedRate { rx: crossbeam_channel::tick(resolution) }
    }

    fn busy_wait(resolution: Duration) -> Self {
        let (tx, rx) = bounded::<Instant>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let slice = (resolution / 8).max(Duration::from_micros(100));

        let spawned = thread::Builder::new().name("seqplay-ticker".into()).spawn(move || {
            trace!("Ticker started: resolution={:?}, slice={:?}", resolution, slice);
            let mut deadline = Instant::now() + resolution;
            while !flag.load(Ordering::Relaxed) {
                let now = Instant::now();
                if now < deadline {
                    thread::sleep(slice.min(deadline - now));
                    continue;
                }
                match tx.try_send(now) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => break,
                }
                deadline += resolution;
                // More than a whole period late: resync instead of bursting
                if deadline <= now {
                    deadline = now + resolution;
                }
            }
            trace!("Ticker stopped");
        });

        match spawned {
            Ok(handle) => TickSource::BusyWait { rx, shutdown, handle: Some(handle) },
            Err(e) => {
                error!("Failed to spawn ticker thread ({}), falling back to fixed-rate timer", e);
                Self::fixed_rate(resolution)
            }
        }
    }

    fn receiver(&self) -> &Receiver<Instant> {
        match self {
            TickSource::FixedRate { rx } | TickSource::BusyWait { rx, .. } => rx,
        }
    }
}

impl Drop for TickSource {
    fn drop(&mut self) {
        if let TickSource::BusyWait { shutdown, handle, .. } = self {
            shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Multiplexes one tick source across all registered clocks.
pub struct TimerHub {
    clocks: IndexMap<ClockId, SharedClock>,
    strategy: TickStrategy,
    resolution: Duration,
    source: Option<TickSource>,
    /// Wall-clock reference for the current source run
    started_at: Option<Instant>,
    sources_started: u64,
    ticks: u64,
}

impl TimerHub {
    pub fn new(strategy: TickStrategy, resolution: Duration) -> Self {
        let resolution = resolution.max(MIN_RESOLUTION);
        debug!("TimerHub created: strategy={:?}, resolution={:?}", strategy, resolution);
        Self {
            clocks: IndexMap::new(),
            strategy,
            resolution,
            source: None,
            started_at: None,
            sources_started: 0,
            ticks: 0,
        }
    }

    /// Add a clock. Starts the tick source when it is the first one.
    ///
    /// Registering an already registered clock changes nothing.
    pub fn register(&mut self, clock: SharedClock) -> ClockId {
        let id = clock.lock().unwrap_or_else(|e| e.into_inner()).id();
        if self.clocks.contains_key(&id) {
            return id;
        }
        self.clocks.insert(id, clock);
        debug!("Registered {} ({} clocks)", id, self.clocks.len());
        if self.clocks.len() == 1 {
            self.start_source();
        }
        id
    }

    /// Remove a clock. Stops the tick source when none remain.
    ///
    /// The clock receives no further ticks once this returns.
    pub fn unregister(&mut self, id: ClockId) -> bool {
        if self.clocks.shift_remove(&id).is_none() {
            return false;
        }
        debug!("Unregistered {} ({} clocks)", id, self.clocks.len());
        if self.clocks.is_empty() {
            self.stop_source();
        }
        true
    }

    fn start_source(&mut self) {
        if self.source.is_some() {
            return;
        }
        self.source = Some(TickSource::start(self.strategy, self.resolution));
        self.started_at = Some(Instant::now());
        self.sources_started += 1;
        info!("Tick source started: {:?} @ {:?}", self.strategy, self.resolution);
    }

    fn stop_source(&mut self) {
        if self.source.take().is_some() {
            info!("Tick source stopped after {} ticks", self.ticks);
            self.started_at = None;
        }
    }

    fn restart_source(&mut self) {
        if self.source.is_some() {
            self.stop_source();
            self.start_source();
        }
    }

    pub fn is_running(&self) -> bool {
        self.source.is_some()
    }

    /// How many times a tick source has been started over the hub's life.
    pub fn sources_started(&self) -> u64 {
        self.sources_started
    }

    /// Ticks dispatched so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Time since the current tick source started.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn contains(&self, id: ClockId) -> bool {
        self.clocks.contains_key(&id)
    }

    pub fn strategy(&self) -> TickStrategy {
        self.strategy
    }

    /// Switch strategy; a running source is restarted with it.
    pub fn set_strategy(&mut self, strategy: TickStrategy) {
        if self.strategy != strategy {
            self.strategy = strategy;
            self.restart_source();
        }
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    pub fn set_resolution(&mut self, resolution: Duration) {
        let resolution = resolution.max(MIN_RESOLUTION);
        if self.resolution != resolution {
            self.resolution = resolution;
            self.restart_source();
        }
    }

    /// Step every registered clock with `now`, in registration order.
    ///
    /// Returns the clocks that produced a step.
    pub fn dispatch(&mut self, now: Instant) -> Vec<(ClockId, FrameDelta)> {
        self.ticks += 1;
        self.clocks
            .iter()
            .filter_map(|(&id, clock)| {
                let delta = clock.lock().unwrap_or_else(|e| e.into_inner()).tick(now);
                (!delta.is_zero()).then_some((id, delta))
            })
            .collect()
    }

    /// Wait up to `timeout` for the next tick and dispatch it.
    ///
    /// `None` when no tick arrived or no source is running.
    pub fn pump(&mut self, timeout: Duration) -> Option<Vec<(ClockId, FrameDelta)>> {
        let now = {
            let rx = self.source.as_ref()?.receiver();
            match rx.recv_timeout(timeout) {
                Ok(now) => now,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Tick source disconnected");
                    return None;
                }
            }
        };
        Some(self.dispatch(now))
    }
}

impl Drop for TimerHub {
    fn drop(&mut self) {
        self.stop_source();
    }
}

impl std::fmt::Debug for TimerHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHub")
            .field("clocks", &self.clocks.len())
            .field("strategy", &self.strategy)
            .field("resolution", &self.resolution)
            .field("running", &self.is_running())
            .field("ticks", &self.ticks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::{downcast_event, EventBus, EventEmitter};
    use crate::core::events::FrameChanged;
    use crate::core::player::{Direction, PlaybackClock};

    fn clock(emitter: EventEmitter) -> SharedClock {
        PlaybackClock::new(1000, 8.0, emitter).shared()
    }

    fn play(clock: &SharedClock) {
        clock.lock().unwrap().play(Direction::Forward);
    }

    #[test]
    fn test_single_source_lifecycle() {
        let mut hub = TimerHub::new(TickStrategy::FixedRate, Duration::from_millis(5));
        let a = clock(EventEmitter::dummy());
        let b = clock(EventEmitter::dummy());

        let id_a = hub.register(Arc::clone(&a));
        assert!(hub.is_running());
        assert_eq!(hub.sources_started(), 1);

        let id_b = hub.register(Arc::clone(&b));
        assert_eq!(hub.sources_started(), 1);

        assert!(hub.unregister(id_a));
        assert!(hub.is_running());

        assert!(hub.unregister(id_b));
        assert!(!hub.is_running());
        assert_eq!(hub.sources_started(), 1);
    }

    #[test]
    fn test_busy_wait_lifecycle() {
        let mut hub = TimerHub::new(TickStrategy::BusyWait, Duration::from_millis(2));
        let a = clock(EventEmitter::dummy());
        let id = hub.register(a);
        assert!(hub.is_running());
        assert!(hub.pump(Duration::from_secs(1)).is_some());
        hub.unregister(id);
        assert!(!hub.is_running());
        assert!(hub.pump(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut hub = TimerHub::new(TickStrategy::FixedRate, Duration::from_millis(5));
        let a = clock(EventEmitter::dummy());
        let first = hub.register(Arc::clone(&a));
        let second = hub.register(Arc::clone(&a));
        assert_eq!(first, second);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.sources_started(), 1);
        assert!(!hub.unregister(ClockId::new()));
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let mut hub = TimerHub::new(TickStrategy::FixedRate, Duration::from_millis(5));
        let a = clock(bus.emitter());
        let b = clock(bus.emitter());
        let id_a = hub.register(Arc::clone(&a));
        let id_b = hub.register(Arc::clone(&b));
        play(&a);
        play(&b);

        let t0 = Instant::now();
        assert!(hub.dispatch(t0).is_empty());
        let stepped = hub.dispatch(t0 + Duration::from_millis(250));
        assert_eq!(stepped.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![id_a, id_b]);
        assert_eq!(stepped[0].1.frame, 2);

        let order: Vec<_> = bus
            .poll()
            .iter()
            .filter_map(|e| downcast_event::<FrameChanged>(e).map(|f| f.clock))
            .collect();
        assert_eq!(order, vec![id_a, id_b]);
        assert_eq!(hub.ticks(), 2);
    }

    #[test]
    fn test_unregistered_clock_not_ticked() {
        let mut hub = TimerHub::new(TickStrategy::FixedRate, Duration::from_millis(5));
        let a = clock(EventEmitter::dummy());
        let b = clock(EventEmitter::dummy());
        let id_a = hub.register(Arc::clone(&a));
        hub.register(Arc::clone(&b));
        play(&a);
        play(&b);

        let t0 = Instant::now();
        hub.dispatch(t0);
        hub.unregister(id_a);
        hub.dispatch(t0 + Duration::from_secs(1));

        assert_eq!(a.lock().unwrap().frame(), 0);
        assert_eq!(b.lock().unwrap().frame(), 8);
    }

    #[test]
    fn test_settings_restart_running_source() {
        let mut hub = TimerHub::new(TickStrategy::FixedRate, Duration::from_millis(5));
        hub.set_strategy(TickStrategy::BusyWait);
        assert_eq!(hub.sources_started(), 0);

        hub.register(clock(EventEmitter::dummy()));
        hub.set_resolution(Duration::from_millis(3));
        assert!(hub.is_running());
        assert_eq!(hub.sources_started(), 2);

        hub.set_resolution(Duration::ZERO);
        assert_eq!(hub.resolution(), MIN_RESOLUTION);
    }

    #[test]
    fn test_pump_fixed_rate() {
        let mut hub = TimerHub::new(TickStrategy::FixedRate, Duration::from_millis(1));
        let a = clock(EventEmitter::dummy());
        hub.register(a);
        assert!(hub.pump(Duration::from_secs(1)).is_some());
        assert_eq!(hub.ticks(), 1);
    }
}
