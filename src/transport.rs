//! Canonical playback position and loop configuration.

use crate::invariant_ppt::{assert_invariant, TRANSPORT_POSITION_SYNCED};
use crate::listener::{ListenerRegistry, Subscription};
use crate::time::{Meter, SampleCount, Tempo, TempoMap, Tick, TimePoint, TimeRange};
use parking_lot::Mutex;
use std::sync::Arc;

/// Immutable transport snapshot handed to nodes for one sub-block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportInfo {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Ticks per quarter note.
    pub tpqn: u32,
    /// Range covered by the current sub-block (empty when stopped).
    pub play: TimeRange,
    /// Loop range.
    pub loop_range: TimeRange,
    /// Transport is rolling.
    pub playing: bool,
    /// Loop switch.
    pub loop_enabled: bool,
    /// Tempo at the start of `play`.
    pub tempo: Tempo,
    /// Meter at the start of `play`.
    pub meter: Meter,
}

impl TransportInfo {
    /// `true` when playback currently wraps at the loop end.
    pub fn is_looping(&self) -> bool {
        self.playing && self.loop_enabled && self.loop_range.is_valid()
    }
}

/// Receives every transport change, synchronously, after the transport lock
/// has been released.
pub trait TransportListener: Send + Sync {
    /// Called with the state before and after the change.
    fn on_transport_changed(&self, old: &TransportInfo, new: &TransportInfo);
}

#[derive(Debug)]
struct State {
    map: TempoMap,
    position: TimePoint,
    last_moved: TimePoint,
    loop_range: TimeRange,
    playing: bool,
    loop_enabled: bool,
}

impl State {
    fn info(&self) -> TransportInfo {
        TransportInfo {
            sample_rate: self.map.sample_rate(),
            tpqn: self.map.tpqn(),
            play: TimeRange::empty_at(self.position),
            loop_range: self.loop_range,
            playing: self.playing,
            loop_enabled: self.loop_enabled,
            tempo: self.map.tempo_at_tick(self.position.tick),
            meter: self.map.meter_at_tick(self.position.tick),
        }
    }

    fn resync(&mut self) {
        self.position = self.map.point_at_sample(self.position.sample);
        self.last_moved = self.map.point_at_sample(self.last_moved.sample);
        self.loop_range = TimeRange::new(
            self.map.point_at_sample(self.loop_range.begin.sample),
            self.map.point_at_sample(self.loop_range.end.sample),
        );
    }

    fn move_to(&mut self, sample: SampleCount) {
        self.position = self.map.point_at_sample(sample.max(0));
        self.last_moved = self.position;
    }
}

/// Owner of the playback position, loop range and tempo map.
///
/// All mutators lock a short internal mutex, apply the change, release the
/// lock and then notify listeners with the old/new pair. Position commits made
/// by the [`Traverser`](crate::traverser::Traverser) on the audio thread do not
/// notify.
#[derive(Debug)]
pub struct Transporter {
    state: Mutex<State>,
    listeners: ListenerRegistry<dyn TransportListener>,
}

impl Transporter {
    /// Stopped at sample 0, loop disabled and empty.
    pub fn new(map: TempoMap) -> Self {
        let origin = map.point_at_sample(0);
        Self {
            state: Mutex::new(State {
                map,
                position: origin,
                last_moved: origin,
                loop_range: TimeRange::empty_at(origin),
                playing: false,
                loop_enabled: false,
            }),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Register a listener for state changes.
    pub fn subscribe(&self, listener: &Arc<dyn TransportListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Snapshot of the current state.
    pub fn current_state(&self) -> TransportInfo {
        self.state.lock().info()
    }

    /// Current position.
    pub fn position(&self) -> TimePoint {
        self.state.lock().position
    }

    /// Position `set_stop` returns to.
    pub fn last_moved_position(&self) -> TimePoint {
        self.state.lock().last_moved
    }

    /// Transport is rolling.
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Loop switch.
    pub fn is_loop_enabled(&self) -> bool {
        self.state.lock().loop_enabled
    }

    /// Loop range.
    pub fn loop_range(&self) -> TimeRange {
        self.state.lock().loop_range
    }

    /// A copy of the tempo map in effect.
    pub fn tempo_map(&self) -> TempoMap {
        self.state.lock().map.clone()
    }

    /// Jump to `sample` (clamped at 0). This becomes the stop position.
    pub fn move_to(&self, sample: SampleCount) {
        self.mutate(|s| s.move_to(sample));
    }

    /// Jump to the start of the current measure, or of the previous one when
    /// the position is no more than `tolerance` ticks past the measure start.
    pub fn rewind(&self, tolerance: Tick) {
        self.mutate(|s| {
            let tick = s.position.tick;
            let start = s.map.measure_start(tick);
            let near_start = s.position.sample <= s.map.tick_to_sample(start + tolerance.max(0));
            let target = if near_start {
                s.map.previous_measure_start(tick)
            } else {
                start
            };
            let sample = s.map.tick_to_sample(target);
            s.move_to(sample);
        });
    }

    /// Jump to the start of the next measure.
    pub fn fast_forward(&self) {
        self.mutate(|s| {
            let target = s.map.next_measure_start(s.position.tick);
            let sample = s.map.tick_to_sample(target);
            s.move_to(sample);
        });
    }

    /// Start or pause playback.
    pub fn set_playing(&self, playing: bool) {
        self.mutate(|s| s.playing = playing);
    }

    /// Stop and snap back to the last explicitly moved-to position.
    pub fn set_stop(&self) {
        self.mutate(|s| {
            s.playing = false;
            s.position = s.last_moved;
        });
    }

    /// Set the loop range in samples. A range with `begin >= end` never loops.
    pub fn set_loop_range(&self, begin: SampleCount, end: SampleCount) {
        self.mutate(|s| {
            s.loop_range = TimeRange::new(
                s.map.point_at_sample(begin.max(0)),
                s.map.point_at_sample(end.max(0)),
            );
        });
    }

    /// Loop switch.
    pub fn set_loop_enabled(&self, enabled: bool) {
        self.mutate(|s| s.loop_enabled = enabled);
    }

    /// Replace the tempo map. Sample positions are kept; ticks and seconds
    /// are re-derived.
    pub fn set_tempo_map(&self, map: TempoMap) {
        self.mutate(|s| {
            s.map = map;
            s.resync();
        });
    }

    /// Change the sample rate of the tempo map.
    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.mutate(|s| {
            s.map.set_sample_rate(sample_rate);
            s.resync();
        });
    }

    fn mutate(&self, f: impl FnOnce(&mut State)) {
        let (old, new) = {
            let mut state = self.state.lock();
            let old = state.info();
            f(&mut state);
            (old, state.info())
        };
        assert_invariant(
            TRANSPORT_POSITION_SYNCED,
            new.play.begin.tick >= 0 && new.play.begin.sample >= 0,
            "transport position is non-negative",
            Some("Transporter::mutate"),
        );
        if old != new {
            tracing::debug!(
                sample = new.play.begin.sample,
                tick = new.play.begin.tick,
                playing = new.playing,
                looping = new.loop_enabled,
                "transport changed"
            );
            self.listeners
                .notify(|l| l.on_transport_changed(&old, &new));
        }
    }

    /// Run `f` against a consistent view of the state and tempo map.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&TransportInfo, &TempoMap) -> R) -> R {
        let state = self.state.lock();
        f(&state.info(), &state.map)
    }

    /// Commit `next` as the new position if the live position still equals
    /// `expected_begin`. Returns whether the commit happened.
    pub(crate) fn commit_position(&self, expected_begin: SampleCount, next: SampleCount) -> bool {
        let mut state = self.state.lock();
        if state.position.sample != expected_begin {
            return false;
        }
        state.position = state.map.point_at_sample(next);
        true
    }
}
