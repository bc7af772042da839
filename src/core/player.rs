//! Playback clock: drift-corrected, real-time frame stepping.
//!
//! One clock per playback session. The timer hub calls [`PlaybackClock::tick`]
//! with the tick timestamp; the clock derives how many frames should have
//! elapsed since playback (re)started and applies only the difference, so
//! late or coalesced ticks never accumulate drift.
//!
//! # Timing Model
//!
//! `absolute = floor(offset + elapsed * speed)`, `delta = absolute - last`.
//! A speed change mid-playback folds the progress made so far into `offset`
//! and restarts `elapsed` from the tick that observed the change, so the
//! playhead continues without a jump.
//!
//! # Loop Modes
//!
//! - **Once**: reaching either bound stops playback
//! - **Repeat**: wrap cyclically inside the active range
//! - **PingPong**: bounce direction at the bounds
//!
//! # Shuttle
//!
//! While shuttling, the drag-derived velocity replaces the nominal speed and
//! its sign gives the direction. Entering shuttle stops normal playback.

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::event_bus::EventEmitter;
use crate::core::events::FrameChanged;
use crate::entities::ClockId;

/// FPS presets for speed up/down
pub const FPS_PRESETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 12.0, 24.0, 25.0, 30.0, 48.0, 50.0, 60.0, 120.0, 240.0];

/// Length of the real-speed measurement window in seconds
const SPEED_WINDOW_SECS: f64 = 1.0;

/// Clock shared between its session and the timer hub
pub type SharedClock = Arc<Mutex<PlaybackClock>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    Stop,
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LoopMode {
    Once,
    #[default]
    Repeat,
    PingPong,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDelta {
    /// Signed step the tick asked for (after lockstep clamping)
    pub delta: i64,
    /// Frame after loop policy was applied
    pub frame: i64,
}

impl FrameDelta {
    fn none(frame: i64) -> Self {
        Self { delta: 0, frame }
    }

    pub fn is_zero(&self) -> bool {
        self.delta == 0
    }
}

/// Shuttle velocity for a drag distance: `sign(d) * |d|^1.5`.
pub fn shuttle_velocity(drag: f64) -> f64 {
    let magnitude = drag.abs();
    if magnitude == 0.0 { 0.0 } else { drag.signum() * magnitude * magnitude.sqrt() }
}

#[derive(Debug, Clone, Copy, Default)]
struct Shuttle {
    active: bool,
    velocity: f64,
}

/// Per-run stepping bookkeeping, reset on every (re)start.
#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    t0: Option<Instant>,
    /// Frames of progress carried over from earlier speed segments
    offset: f64,
    /// Effective speed since t0
    speed: f64,
    last_absolute: i64,
    window_start: Option<Instant>,
    window_frames: u64,
    pending_dropped: bool,
}

impl Timing {
    fn start(&mut self, now: Instant, speed: f64) {
        *self = Timing { t0: Some(now), speed, window_start: Some(now), ..Timing::default() };
    }
}

/// Playback state for one session.
#[derive(Debug)]
pub struct PlaybackClock {
    id: ClockId,
    direction: Direction,
    loop_mode: LoopMode,
    total_frames: i64,
    in_point: i64,
    out_point: i64,
    range_enabled: bool,
    frame: i64,
    speed: f64,
    real_speed: f64,
    dropped_frames: bool,
    lockstep: bool,
    shuttle: Shuttle,
    timing: Timing,
    emitter: EventEmitter,
}

impl PlaybackClock {
    /// Clock over `total_frames` frames at `fps`, stopped at frame 0.
    pub fn new(total_frames: i64, fps: f64, emitter: EventEmitter) -> Self {
        let total_frames = total_frames.max(0);
        let speed = if fps.is_finite() && fps > 0.0 { fps } else { 24.0 };
        let clock = Self {
            id: ClockId::new(),
            direction: Direction::Stop,
            loop_mode: LoopMode::default(),
            total_frames,
            in_point: 0,
            out_point: (total_frames - 1).max(0),
            range_enabled: false,
            frame: 0,
            speed,
            real_speed: 0.0,
            dropped_frames: false,
            lockstep: false,
            shuttle: Shuttle::default(),
            timing: Timing::default(),
            emitter,
        };
        debug!("{} created: {} frames @ {} fps", clock.id, total_frames, speed);
        clock
    }

    /// Wrap in the shared form the timer hub expects.
    pub fn shared(self) -> SharedClock {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> ClockId {
        self.id
    }

    // === Range ===

    pub fn total_frames(&self) -> i64 {
        self.total_frames
    }

    /// Change sequence length, pulling the playhead back inside if needed.
    pub fn set_total_frames(&mut self, total: i64) {
        self.total_frames = total.max(0);
        if let Some((min, max)) = self.bounds(self.range_enabled)
            && !(min..=max).contains(&self.frame)
        {
            self.assign(self.frame.clamp(min, max));
        }
    }

    /// `(min, max)` playable frames, `None` for an empty sequence.
    ///
    /// The sub-range only applies when `respect_range` is set and the range
    /// is enabled. A sub-range lying entirely outside the sequence collapses
    /// to its nearest valid frame.
    fn bounds(&self, respect_range: bool) -> Option<(i64, i64)> {
        if self.total_frames <= 0 {
            return None;
        }
        let last = self.total_frames - 1;
        if respect_range && self.range_enabled {
            let max = self.out_point.min(last).max(0);
            let min = self.in_point.max(0).min(max);
            Some((min, max))
        } else {
            Some((0, last))
        }
    }

    /// Active playable range; `(0, 0)` for an empty sequence.
    pub fn frame_range(&self) -> (i64, i64) {
        self.bounds(true).unwrap_or((0, 0))
    }

    pub fn frame_min(&self) -> i64 {
        self.frame_range().0
    }

    pub fn frame_max(&self) -> i64 {
        self.frame_range().1
    }

    pub fn in_out(&self) -> (i64, i64) {
        (self.in_point, self.out_point)
    }

    /// Set in/out points (swapped if reversed). Takes effect when the range is enabled.
    pub fn set_range(&mut self, in_point: i64, out_point: i64) {
        let (a, b) = if out_point < in_point { (out_point, in_point) } else { (in_point, out_point) };
        self.in_point = a;
        self.out_point = b;
        self.keep_inside_range();
    }

    pub fn range_enabled(&self) -> bool {
        self.range_enabled
    }

    pub fn set_range_enabled(&mut self, enabled: bool) {
        self.range_enabled = enabled;
        self.keep_inside_range();
    }

    fn keep_inside_range(&mut self) {
        if let Some((min, max)) = self.bounds(true)
            && !(min..=max).contains(&self.frame)
        {
            self.assign(min);
        }
    }

    /// Playhead position inside the active range as 0.0..=1.0.
    pub fn progress(&self) -> f64 {
        let (min, max) = self.frame_range();
        if max == min {
            return 0.0;
        }
        (self.frame - min) as f64 / (max - min) as f64
    }

    // === Frame ===

    pub fn frame(&self) -> i64 {
        self.frame
    }

    /// Move to `target` after applying the loop policy.
    ///
    /// Returns true and emits [`FrameChanged`] only if the frame moved.
    pub fn set_frame(&mut self, target: i64, respect_range: bool) -> bool {
        let Some((min, max)) = self.bounds(respect_range) else {
            return false;
        };

        let target = match self.loop_mode {
            LoopMode::Once => {
                if target <= min || target >= max {
                    self.direction = Direction::Stop;
                }
                target.clamp(min, max)
            }
            LoopMode::Repeat => min + (target - min).rem_euclid(max - min + 1),
            LoopMode::PingPong => {
                if self.direction != Direction::Stop {
                    if target <= min {
                        self.direction = Direction::Forward;
                    } else if target >= max {
                        self.direction = Direction::Reverse;
                    }
                }
                target.clamp(min, max)
            }
        };

        self.assign(target)
    }

    fn assign(&mut self, frame: i64) -> bool {
        if frame == self.frame {
            return false;
        }
        self.frame = frame;
        self.emitter.emit(FrameChanged { clock: self.id, frame });
        true
    }

    /// Jump by `count` frames, obeying the loop mode and the active range.
    pub fn step(&mut self, count: i64) -> bool {
        if count == 0 {
            return false;
        }
        let target = self.frame.saturating_add(count);
        let moved = self.set_frame(target, self.range_enabled);
        self.timing = Timing::default();
        moved
    }

    // === Transport ===

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_playing(&self) -> bool {
        self.direction != Direction::Stop
    }

    /// Request a direction. Requesting the active direction again stops.
    pub fn play(&mut self, direction: Direction) -> Direction {
        self.direction = if direction == self.direction { Direction::Stop } else { direction };
        self.timing = Timing::default();
        info!("{} direction -> {:?}", self.id, self.direction);
        self.direction
    }

    pub fn stop(&mut self) {
        self.direction = Direction::Stop;
        self.timing = Timing::default();
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn lockstep(&self) -> bool {
        self.lockstep
    }

    /// Every-frame mode: at most one frame per productive tick, never skip.
    pub fn set_lockstep(&mut self, enabled: bool) {
        self.lockstep = enabled;
        if enabled {
            self.timing.pending_dropped = false;
            self.dropped_frames = false;
        }
    }

    // === Speed ===

    /// Nominal speed in frames per second.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Ignored unless finite and positive.
    pub fn set_speed(&mut self, fps: f64) {
        if !fps.is_finite() || fps <= 0.0 {
            warn!("{} ignoring invalid speed {}", self.id, fps);
            return;
        }
        self.speed = fps;
    }

    /// Next FPS preset above the nominal speed.
    pub fn increase_speed(&mut self) {
        if let Some(&fps) = FPS_PRESETS.iter().find(|&&f| f > self.speed) {
            self.set_speed(fps);
            trace!("{} speed increased to {}", self.id, fps);
        }
    }

    /// Previous FPS preset below the nominal speed.
    pub fn decrease_speed(&mut self) {
        if let Some(&fps) = FPS_PRESETS.iter().rev().find(|&&f| f < self.speed) {
            self.set_speed(fps);
            trace!("{} speed decreased to {}", self.id, fps);
        }
    }

    /// Measured frames per second over the last full window.
    pub fn real_speed(&self) -> f64 {
        self.real_speed
    }

    /// Whether the last full measurement window skipped frames.
    pub fn dropped_frames(&self) -> bool {
        self.dropped_frames
    }

    /// Speed to show in the UI: shuttle velocity while shuttling, else nominal.
    pub fn display_speed(&self) -> f64 {
        if self.shuttle.active { self.shuttle.velocity } else { self.speed }
    }

    // === Shuttle ===

    pub fn is_shuttling(&self) -> bool {
        self.shuttle.active
    }

    pub fn shuttle_velocity(&self) -> f64 {
        self.shuttle.velocity
    }

    /// Enter shuttle mode. Stops normal playback.
    pub fn begin_shuttle(&mut self) {
        self.direction = Direction::Stop;
        self.shuttle = Shuttle { active: true, velocity: 0.0 };
        self.timing = Timing::default();
        debug!("{} shuttle on", self.id);
    }

    /// Update the shuttle from the current drag distance.
    pub fn set_shuttle_drag(&mut self, drag: f64) {
        if !self.shuttle.active {
            return;
        }
        self.shuttle.velocity = shuttle_velocity(drag);
    }

    /// Leave shuttle mode. Playback stays stopped.
    pub fn end_shuttle(&mut self) {
        self.shuttle = Shuttle::default();
        self.timing = Timing::default();
        debug!("{} shuttle off", self.id);
    }

    fn effective_speed(&self) -> f64 {
        if self.shuttle.active { self.shuttle.velocity } else { self.speed }
    }

    // === Stepping ===

    /// Advance by however many frames wall time says have elapsed.
    ///
    /// No-op while stopped and not shuttling. The first tick after a
    /// (re)start only anchors the timeline.
    pub fn tick(&mut self, now: Instant) -> FrameDelta {
        if !self.is_playing() && !self.shuttle.active {
            return FrameDelta::none(self.frame);
        }

        let speed = self.effective_speed();
        let Some(t0) = self.timing.t0 else {
            self.timing.start(now, speed);
            self.dropped_frames = false;
            return FrameDelta::none(self.frame);
        };

        let mut elapsed = now.saturating_duration_since(t0).as_secs_f64();
        if speed != self.timing.speed {
            self.timing.offset += elapsed * self.timing.speed;
            self.timing.t0 = Some(now);
            self.timing.speed = speed;
            elapsed = 0.0;
        }

        let absolute = (self.timing.offset + elapsed * speed).floor() as i64;
        let mut delta = absolute - self.timing.last_absolute;
        if delta == 0 {
            return FrameDelta::none(self.frame);
        }
        self.timing.last_absolute = absolute;

        if self.direction == Direction::Reverse {
            delta = -delta;
        }

        if self.lockstep && !self.shuttle.active {
            delta = delta.signum();
        } else if delta.abs() > 1 {
            self.timing.pending_dropped = true;
        }

        self.timing.window_frames += delta.unsigned_abs();
        if let Some(window_start) = self.timing.window_start {
            let window = now.saturating_duration_since(window_start).as_secs_f64();
            if window >= SPEED_WINDOW_SECS {
                self.real_speed = self.timing.window_frames as f64 / window;
                self.dropped_frames = self.timing.pending_dropped;
                self.timing.window_frames = 0;
                self.timing.window_start = Some(now);
                self.timing.pending_dropped = false;
                trace!("{} real speed {:.2} fps, dropped={}", self.id, self.real_speed, self.dropped_frames);
            }
        }

        let target = self.frame.saturating_add(delta);
        self.set_frame(target, self.range_enabled);
        FrameDelta { delta, frame: self.frame }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::{downcast_event, EventBus};
    use std::time::Duration;

    fn clock(frames: i64, fps: f64) -> PlaybackClock {
        PlaybackClock::new(frames, fps, EventEmitter::dummy())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_repeat_wraps() {
        let mut c = clock(10, 24.0);
        c.set_loop_mode(LoopMode::Repeat);
        c.set_frame(10, true);
        assert_eq!(c.frame(), 0);
        c.set_frame(-1, true);
        assert_eq!(c.frame(), 9);
        c.set_frame(25, true);
        assert_eq!(c.frame(), 5);
    }

    #[test]
    fn test_once_stops_at_end() {
        let mut c = clock(10, 24.0);
        c.set_loop_mode(LoopMode::Once);
        c.play(Direction::Forward);
        c.set_frame(9, true);
        assert_eq!(c.frame(), 9);
        assert_eq!(c.direction(), Direction::Stop);
        assert!(!c.set_frame(10, true));
        assert_eq!(c.frame(), 9);
    }

    #[test]
    fn test_pingpong_bounces() {
        let mut c = clock(10, 24.0);
        c.set_loop_mode(LoopMode::PingPong);
        c.set_frame(5, true);
        c.play(Direction::Reverse);
        c.set_frame(-2, true);
        assert_eq!(c.direction(), Direction::Forward);
        assert_eq!(c.frame(), 0);

        c.set_frame(12, true);
        assert_eq!(c.direction(), Direction::Reverse);
        assert_eq!(c.frame(), 9);
    }

    #[test]
    fn test_pingpong_stopped_only_clamps() {
        let mut c = clock(10, 24.0);
        c.set_loop_mode(LoopMode::PingPong);
        c.set_frame(-5, true);
        assert_eq!(c.direction(), Direction::Stop);
        assert_eq!(c.frame(), 0);
    }

    #[test]
    fn test_play_toggles() {
        let mut c = clock(10, 24.0);
        assert_eq!(c.play(Direction::Forward), Direction::Forward);
        assert_eq!(c.play(Direction::Reverse), Direction::Reverse);
        assert_eq!(c.play(Direction::Reverse), Direction::Stop);
        assert!(!c.is_playing());
    }

    #[test]
    fn test_sub_range_bounds() {
        let mut c = clock(100, 24.0);
        c.set_range(80, 20);
        assert_eq!(c.in_out(), (20, 80));
        assert_eq!(c.frame_range(), (0, 99));

        c.set_range_enabled(true);
        assert_eq!(c.frame_range(), (20, 80));
        assert_eq!(c.frame(), 20);

        c.set_range(-5, 500);
        assert_eq!(c.frame_range(), (0, 99));

        // Ignoring the range uses the full sequence
        c.set_range(10, 20);
        c.set_frame(50, false);
        assert_eq!(c.frame(), 50);
    }

    #[test]
    fn test_single_frame_range() {
        let mut c = clock(10, 24.0);
        c.set_range(4, 4);
        c.set_range_enabled(true);
        assert_eq!(c.frame(), 4);
        assert_eq!(c.progress(), 0.0);
        c.set_frame(7, true);
        assert_eq!(c.frame(), 4);
    }

    #[test]
    fn test_empty_sequence_is_inert() {
        let mut c = clock(0, 24.0);
        assert!(!c.set_frame(3, true));
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        assert!(c.tick(t0 + ms(500)).frame == 0);
        assert_eq!(c.frame_range(), (0, 0));
    }

    #[test]
    fn test_frame_changed_only_on_move() {
        let bus = EventBus::new();
        let mut c = PlaybackClock::new(10, 24.0, bus.emitter());
        c.set_frame(3, true);
        c.set_frame(3, true);
        let events = bus.poll();
        assert_eq!(events.len(), 1);
        let ev = downcast_event::<FrameChanged>(&events[0]).copied();
        assert_eq!(ev, Some(FrameChanged { clock: c.id(), frame: 3 }));
    }

    #[test]
    fn test_tick_noop_when_stopped() {
        let mut c = clock(100, 24.0);
        let t0 = Instant::now();
        c.tick(t0);
        assert!(c.tick(t0 + ms(1000)).is_zero());
        assert_eq!(c.frame(), 0);
    }

    #[test]
    fn test_first_tick_anchors() {
        let mut c = clock(100, 8.0);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        assert!(c.tick(t0).is_zero());
        assert!(c.tick(t0 + ms(100)).is_zero());
        assert_eq!(c.tick(t0 + ms(125)).delta, 1);
        assert_eq!(c.frame(), 1);
    }

    #[test]
    fn test_tick_is_drift_corrected() {
        let mut c = clock(100, 8.0);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        // Irregular tick spacing still lands on elapsed * speed
        for offset in [130, 260, 500, 510, 875] {
            c.tick(t0 + ms(offset));
        }
        assert_eq!(c.frame(), 7);
    }

    #[test]
    fn test_reverse_steps_backwards() {
        let mut c = clock(100, 8.0);
        c.set_frame(50, true);
        c.play(Direction::Reverse);
        let t0 = Instant::now();
        c.tick(t0);
        let d = c.tick(t0 + ms(250));
        assert_eq!(d.delta, -2);
        assert_eq!(c.frame(), 48);
    }

    #[test]
    fn test_dropped_frames_latched_per_window() {
        let mut c = clock(1000, 8.0);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        c.tick(t0 + ms(500)); // 4 frames at once
        assert!(!c.dropped_frames(), "latched only at window end");
        c.tick(t0 + ms(1000));
        assert!(c.dropped_frames());
        assert_eq!(c.real_speed(), 8.0);

        // Next window has only single steps
        for i in 1..=8 {
            c.tick(t0 + ms(1000 + i * 125));
        }
        assert!(!c.dropped_frames());
    }

    #[test]
    fn test_lockstep_never_skips() {
        let mut c = clock(1000, 8.0);
        c.set_lockstep(true);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        for i in 1..=10 {
            let d = c.tick(t0 + ms(i * 400));
            assert!(d.delta.abs() <= 1);
        }
        assert_eq!(c.frame(), 10);
        assert!(!c.dropped_frames());
    }

    #[test]
    fn test_real_speed_measured() {
        let mut c = clock(1000, 8.0);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        for i in 1..=8 {
            c.tick(t0 + ms(i * 125));
        }
        assert_eq!(c.real_speed(), 8.0);
        assert!(!c.dropped_frames());
    }

    #[test]
    fn test_speed_change_keeps_position() {
        let mut c = clock(1000, 8.0);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        c.tick(t0 + ms(500));
        assert_eq!(c.frame(), 4);

        c.set_speed(16.0);
        // Change is folded in on the next tick without a jump
        assert!(c.tick(t0 + ms(500)).is_zero());
        c.tick(t0 + ms(750));
        assert_eq!(c.frame(), 8);
    }

    #[test]
    fn test_once_playback_stops_at_out_point() {
        let mut c = clock(100, 8.0);
        c.set_loop_mode(LoopMode::Once);
        c.set_range(0, 3);
        c.set_range_enabled(true);
        c.play(Direction::Forward);
        let t0 = Instant::now();
        c.tick(t0);
        c.tick(t0 + ms(1000));
        assert_eq!(c.frame(), 3);
        assert!(!c.is_playing());
        assert!(c.tick(t0 + ms(2000)).is_zero());
    }

    #[test]
    fn test_shuttle_drives_stepping() {
        let mut c = clock(1000, 24.0);
        c.set_frame(500, true);
        c.play(Direction::Forward);
        c.begin_shuttle();
        assert_eq!(c.direction(), Direction::Stop);

        c.set_shuttle_drag(-4.0);
        assert_eq!(c.shuttle_velocity(), -8.0);
        assert_eq!(c.display_speed(), -8.0);

        let t0 = Instant::now();
        c.tick(t0);
        c.tick(t0 + ms(500));
        assert_eq!(c.frame(), 496);

        c.end_shuttle();
        assert!(!c.is_playing());
        assert_eq!(c.display_speed(), 24.0);
        assert!(c.tick(t0 + ms(1000)).is_zero());
    }

    #[test]
    fn test_shuttle_ignores_lockstep() {
        let mut c = clock(1000, 24.0);
        c.set_lockstep(true);
        c.begin_shuttle();
        c.set_shuttle_drag(4.0);
        let t0 = Instant::now();
        c.tick(t0);
        assert_eq!(c.tick(t0 + ms(500)).delta, 4);
    }

    #[test]
    fn test_shuttle_velocity_curve() {
        assert_eq!(shuttle_velocity(0.0), 0.0);
        assert_eq!(shuttle_velocity(4.0), 8.0);
        assert_eq!(shuttle_velocity(-9.0), -27.0);
    }

    #[test]
    fn test_speed_presets() {
        let mut c = clock(10, 24.0);
        c.increase_speed();
        assert_eq!(c.speed(), 25.0);
        c.decrease_speed();
        c.decrease_speed();
        assert_eq!(c.speed(), 12.0);
        c.set_speed(-1.0);
        assert_eq!(c.speed(), 12.0);
    }

    #[test]
    fn test_step_obeys_loop_mode() {
        let mut c = clock(10, 24.0);
        c.step(-1);
        assert_eq!(c.frame(), 9);
        c.set_loop_mode(LoopMode::Once);
        c.step(5);
        assert_eq!(c.frame(), 9);
    }

    #[test]
    fn test_progress() {
        let mut c = clock(11, 24.0);
        c.set_frame(5, true);
        assert_eq!(c.progress(), 0.5);
    }
}
