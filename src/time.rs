//! Musical time: samples, ticks and seconds kept in lock-step.
//!
//! Every [`TimePoint`] is derived through a [`TempoMap`], so the three
//! representations always agree under the tempo and meter in effect.

use serde::{Deserialize, Serialize};

/// Sample position or length.
pub type SampleCount = i64;
/// Tick position or length (resolution given by the map's TPQN).
pub type Tick = i64;

/// One musical instant in three synchronized representations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimePoint {
    /// Position in samples.
    pub sample: SampleCount,
    /// Position in ticks.
    pub tick: Tick,
    /// Position in seconds.
    pub second: f64,
}

/// Length in three synchronized representations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Duration {
    /// Length in samples.
    pub sample: SampleCount,
    /// Length in ticks.
    pub tick: Tick,
    /// Length in seconds.
    pub second: f64,
}

/// Half-open interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeRange {
    /// Inclusive start.
    pub begin: TimePoint,
    /// Exclusive end.
    pub end: TimePoint,
}

impl TimeRange {
    /// Create a range from two points.
    pub fn new(begin: TimePoint, end: TimePoint) -> Self {
        Self { begin, end }
    }

    /// An empty range anchored at `at`.
    pub fn empty_at(at: TimePoint) -> Self {
        Self { begin: at, end: at }
    }

    /// Length of the range.
    pub fn duration(&self) -> Duration {
        Duration {
            sample: self.end.sample - self.begin.sample,
            tick: self.end.tick - self.begin.tick,
            second: self.end.second - self.begin.second,
        }
    }

    /// `true` when `begin < end` in samples.
    pub fn is_valid(&self) -> bool {
        self.begin.sample < self.end.sample
    }

    /// `true` when `sample` lies in `[begin, end)`.
    pub fn contains_sample(&self, sample: SampleCount) -> bool {
        self.begin.sample <= sample && sample < self.end.sample
    }
}

/// Tempo in quarter notes per minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tempo {
    /// Beats (quarter notes) per minute.
    pub bpm: f64,
}

impl Default for Tempo {
    fn default() -> Self {
        Self { bpm: 120.0 }
    }
}

/// Time signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    /// Beats per measure.
    pub numerator: u32,
    /// Beat unit (4 = quarter note).
    pub denominator: u32,
}

impl Meter {
    /// Create a meter.
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Length of one measure in ticks at the given resolution, at least one.
    ///
    /// Exact only when [`Meter::fits`] holds for `tpqn`.
    pub fn ticks_per_measure(&self, tpqn: u32) -> Tick {
        let whole = tpqn as Tick * 4;
        (whole * self.numerator.max(1) as Tick / self.denominator.max(1) as Tick).max(1)
    }

    /// `true` for a non-zero numerator and a power-of-two denominator.
    pub fn is_valid(&self) -> bool {
        self.numerator > 0 && self.denominator.is_power_of_two()
    }

    /// `true` if the meter is valid and a measure is a whole number of ticks
    /// at `tpqn` ticks per quarter note.
    pub fn fits(&self, tpqn: u32) -> bool {
        self.is_valid() && (4 * tpqn as u64 * self.numerator as u64) % self.denominator as u64 == 0
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TempoSegment {
    tick: Tick,
    sample: f64,
    tempo: Tempo,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MeterSegment {
    tick: Tick,
    meter: Meter,
}

/// Piecewise-constant tempo and meter map.
///
/// Tempo changes take effect at arbitrary ticks; meter changes are snapped to
/// the next measure boundary of the meter already in effect. Tick values are
/// truncated toward the earlier tick when derived from samples, samples are
/// rounded to the nearest sample when derived from ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    sample_rate: f64,
    tpqn: u32,
    tempos: Vec<TempoSegment>,
    meters: Vec<MeterSegment>,
}

impl TempoMap {
    /// A map with a single tempo and meter starting at tick 0.
    pub fn new(sample_rate: f64, tpqn: u32, tempo: Tempo, meter: Meter) -> Self {
        Self {
            sample_rate,
            tpqn: tpqn.max(1),
            tempos: vec![TempoSegment {
                tick: 0,
                sample: 0.0,
                tempo,
            }],
            meters: vec![MeterSegment { tick: 0, meter }],
        }
    }

    /// Sample rate the map converts against.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Ticks per quarter note.
    pub fn tpqn(&self) -> u32 {
        self.tpqn
    }

    /// Rebuild the sample anchors for a new sample rate.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.reanchor();
    }

    /// Insert (or replace) a tempo change at `tick`.
    pub fn insert_tempo(&mut self, tick: Tick, tempo: Tempo) {
        let tick = tick.max(0);
        match self.tempos.binary_search_by_key(&tick, |s| s.tick) {
            Ok(i) => self.tempos[i].tempo = tempo,
            Err(i) => self.tempos.insert(
                i,
                TempoSegment {
                    tick,
                    sample: 0.0,
                    tempo,
                },
            ),
        }
        self.reanchor();
    }

    /// Insert (or replace) a meter change at the measure boundary at or after `tick`.
    ///
    /// Returns the tick the change was placed at, or `None` (map unchanged)
    /// if a measure of `meter` is not a whole number of ticks.
    pub fn insert_meter(&mut self, tick: Tick, meter: Meter) -> Option<Tick> {
        if !meter.fits(self.tpqn) {
            return None;
        }
        let tick = tick.max(0);
        let start = self.measure_start(tick);
        let tick = if start == tick {
            tick
        } else {
            self.next_measure_start(tick)
        };
        match self.meters.binary_search_by_key(&tick, |s| s.tick) {
            Ok(i) => self.meters[i].meter = meter,
            Err(i) => self.meters.insert(i, MeterSegment { tick, meter }),
        }
        Some(tick)
    }

    fn reanchor(&mut self) {
        let mut sample = 0.0;
        for i in 0..self.tempos.len() {
            if i > 0 {
                let prev = self.tempos[i - 1];
                let ticks = (self.tempos[i].tick - prev.tick) as f64;
                sample += ticks * self.samples_per_tick(prev.tempo);
            }
            self.tempos[i].sample = sample;
        }
    }

    fn samples_per_tick(&self, tempo: Tempo) -> f64 {
        self.sample_rate * 60.0 / (tempo.bpm * self.tpqn as f64)
    }

    fn tempo_segment_at_tick(&self, tick: Tick) -> &TempoSegment {
        let i = self.tempos.partition_point(|s| s.tick <= tick);
        &self.tempos[i.saturating_sub(1)]
    }

    fn tempo_segment_at_sample(&self, sample: f64) -> &TempoSegment {
        let i = self.tempos.partition_point(|s| s.sample <= sample);
        &self.tempos[i.saturating_sub(1)]
    }

    fn meter_segment_index(&self, tick: Tick) -> usize {
        self.meters
            .partition_point(|s| s.tick <= tick)
            .saturating_sub(1)
    }

    /// Tempo in effect at `tick`.
    pub fn tempo_at_tick(&self, tick: Tick) -> Tempo {
        self.tempo_segment_at_tick(tick).tempo
    }

    /// Meter in effect at `tick`.
    pub fn meter_at_tick(&self, tick: Tick) -> Meter {
        self.meters[self.meter_segment_index(tick)].meter
    }

    /// Convert a sample position to ticks.
    pub fn sample_to_tick(&self, sample: SampleCount) -> Tick {
        let sample = sample as f64;
        let seg = self.tempo_segment_at_sample(sample);
        let ticks = (sample - seg.sample) / self.samples_per_tick(seg.tempo);
        seg.tick + (ticks + 1e-9).floor() as Tick
    }

    /// Convert a tick position to samples.
    pub fn tick_to_sample(&self, tick: Tick) -> SampleCount {
        let seg = self.tempo_segment_at_tick(tick);
        let sample = seg.sample + (tick - seg.tick) as f64 * self.samples_per_tick(seg.tempo);
        sample.round() as SampleCount
    }

    /// Convert a sample position to seconds.
    pub fn sample_to_second(&self, sample: SampleCount) -> f64 {
        sample as f64 / self.sample_rate
    }

    /// Build a fully synchronized point from a sample position.
    pub fn point_at_sample(&self, sample: SampleCount) -> TimePoint {
        TimePoint {
            sample,
            tick: self.sample_to_tick(sample),
            second: self.sample_to_second(sample),
        }
    }

    /// Build a fully synchronized point from a tick position.
    pub fn point_at_tick(&self, tick: Tick) -> TimePoint {
        let sample = self.tick_to_sample(tick);
        TimePoint {
            sample,
            tick,
            second: self.sample_to_second(sample),
        }
    }

    /// Start tick of the measure containing `tick`.
    pub fn measure_start(&self, tick: Tick) -> Tick {
        let tick = tick.max(0);
        let seg = self.meters[self.meter_segment_index(tick)];
        let len = seg.meter.ticks_per_measure(self.tpqn);
        seg.tick + (tick - seg.tick) / len * len
    }

    /// Start tick of the measure following the one containing `tick`.
    pub fn next_measure_start(&self, tick: Tick) -> Tick {
        let tick = tick.max(0);
        let idx = self.meter_segment_index(tick);
        let seg = self.meters[idx];
        let next = self.measure_start(tick) + seg.meter.ticks_per_measure(self.tpqn);
        match self.meters.get(idx + 1) {
            Some(change) if change.tick < next => change.tick,
            _ => next,
        }
    }

    /// Start tick of the measure preceding the one containing `tick` (0 at most).
    pub fn previous_measure_start(&self, tick: Tick) -> Tick {
        let start = self.measure_start(tick);
        if start == 0 {
            0
        } else {
            self.measure_start(start - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> TempoMap {
        TempoMap::new(44_100.0, 480, Tempo { bpm: 120.0 }, Meter::new(4, 4))
    }

    #[test]
    fn one_quarter_at_120_bpm_is_half_a_second() {
        let map = map();
        assert_eq!(map.tick_to_sample(480), 22_050);
        assert_eq!(map.sample_to_tick(22_050), 480);
        assert_eq!(map.point_at_tick(480).second, 0.5);
    }

    #[test]
    fn sample_to_tick_truncates() {
        let map = map();
        // 45.9375 samples per tick
        assert_eq!(map.sample_to_tick(1000), 21);
    }

    #[test]
    fn tempo_change_reanchors_samples() {
        let mut map = map();
        map.insert_tempo(1920, Tempo { bpm: 60.0 });
        // four quarters at 120 bpm = 2 s, then one quarter at 60 bpm = 1 s
        assert_eq!(map.tick_to_sample(1920), 88_200);
        assert_eq!(map.tick_to_sample(2400), 132_300);
        assert_eq!(map.sample_to_tick(132_300), 2400);
        assert_eq!(map.tempo_at_tick(2400).bpm, 60.0);
    }

    #[test]
    fn measures_follow_meter_changes() {
        let mut map = map();
        assert_eq!(map.measure_start(2000), 1920);
        assert_eq!(map.next_measure_start(2000), 3840);
        assert_eq!(map.previous_measure_start(2000), 0);

        // 3/4 from the second measure on; requested mid-measure, snapped forward
        let at = map.insert_meter(2000, Meter::new(3, 4));
        assert_eq!(at, Some(3840));
        assert_eq!(map.measure_start(3840 + 1440 + 10), 3840 + 1440);
        assert_eq!(map.previous_measure_start(3840 + 10), 1920);
        assert_eq!(map.meter_at_tick(4000), Meter::new(3, 4));
    }

    #[test]
    fn fractional_measures_are_refused() {
        assert!(Meter::new(3, 8).fits(480));
        assert!(!Meter::new(3, 8).fits(3));
        assert!(!Meter::new(1, 8).fits(1));
        assert!(Meter::new(6, 8).fits(3));

        let mut map = TempoMap::new(48_000.0, 3, Tempo::default(), Meter::default());
        assert_eq!(map.insert_meter(0, Meter::new(3, 8)), None);
        assert_eq!(map.meter_at_tick(0), Meter::default());
        assert_eq!(map.insert_meter(0, Meter::new(6, 8)), Some(0));
        assert_eq!(map.next_measure_start(0), 9);
    }

    #[test]
    fn degenerate_measures_never_divide_by_zero() {
        let map = TempoMap::new(48_000.0, 1, Tempo::default(), Meter::new(1, 8));
        assert_eq!(Meter::new(1, 8).ticks_per_measure(1), 1);
        assert_eq!(map.measure_start(7), 7);
        assert_eq!(map.previous_measure_start(7), 6);
    }

    #[test]
    fn range_duration_and_containment() {
        let map = map();
        let range = TimeRange::new(map.point_at_sample(0), map.point_at_sample(22_050));
        assert!(range.is_valid());
        assert_eq!(range.duration().tick, 480);
        assert!(range.contains_sample(0));
        assert!(!range.contains_sample(22_050));
    }
}
