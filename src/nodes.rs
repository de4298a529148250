//! Built-in processors: device endpoints, a test instrument and a sequencer.

use crate::buffer::AudioBuffer;
use crate::error::ProcessError;
use crate::midi::{MidiMessage, MidiPayload};
use crate::processor::{BusDirection, ProcessInfo, Processor};
use crate::time::Tick;
use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Copies device input into the graph.
#[derive(Debug, Clone)]
pub struct AudioInputNode {
    channels: usize,
}

impl AudioInputNode {
    /// Endpoint exposing `channels` device input channels.
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl Processor for AudioInputNode {
    fn name(&self) -> &str {
        "Audio Input"
    }

    fn audio_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => 0,
            BusDirection::Output => self.channels,
        }
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        let start = info.offset;
        let channels = self.channels.min(info.device.input.channel_count());
        for ch in 0..channels {
            let src = info.device.input.channel(ch);
            let end = (start + info.frames).min(src.len());
            if start >= end {
                break;
            }
            info.audio_out.channel_mut(ch)[..end - start].copy_from_slice(&src[start..end]);
        }
        Ok(())
    }
}

/// Sums graph audio into the device output.
#[derive(Debug, Clone)]
pub struct AudioOutputNode {
    channels: usize,
}

impl AudioOutputNode {
    /// Endpoint feeding `channels` device output channels.
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl Processor for AudioOutputNode {
    fn name(&self) -> &str {
        "Audio Output"
    }

    fn audio_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => self.channels,
            BusDirection::Output => 0,
        }
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        let start = info.offset;
        let channels = self.channels.min(info.device.output.channel_count());
        for ch in 0..channels {
            let src = info.audio_in.channel(ch);
            let dst = info.device.output.channel_mut(ch);
            let end = (start + src.len()).min(dst.len());
            if start >= end {
                break;
            }
            for (o, &x) in dst[start..end].iter_mut().zip(src) {
                *o += x;
            }
        }
        Ok(())
    }
}

/// Delivers MIDI from a device thread into the graph.
///
/// The device side pushes into the [`Producer`] returned by [`MidiInputNode::new`];
/// messages are emitted on the next sub-block with their offset clamped into it.
pub struct MidiInputNode {
    rx: Consumer<MidiMessage>,
}

impl MidiInputNode {
    /// Endpoint and the device-side producer.
    pub fn new(capacity: usize) -> (Self, Producer<MidiMessage>) {
        let (tx, rx) = RingBuffer::new(capacity);
        (Self { rx }, tx)
    }
}

impl Processor for MidiInputNode {
    fn name(&self) -> &str {
        "MIDI Input"
    }

    fn audio_channel_count(&self, _direction: BusDirection) -> usize {
        0
    }

    fn midi_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => 0,
            BusDirection::Output => 1,
        }
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        let last = info.frames.saturating_sub(1) as u32;
        let tick = info.transport.play.begin.tick;
        let out = &mut info.midi_out[0];
        // Whatever does not fit stays queued for the next sub-block.
        while !out.is_full() {
            let Ok(mut msg) = self.rx.pop() else {
                break;
            };
            msg.offset = msg.offset.min(last);
            msg.tick = tick;
            out.push(msg);
        }
        Ok(())
    }
}

/// Hands graph MIDI to a device thread.
///
/// Offsets are rewritten relative to the start of the device block. Messages
/// that find the queue full are dropped and counted.
pub struct MidiOutputNode {
    tx: Producer<MidiMessage>,
    dropped: u64,
}

impl MidiOutputNode {
    /// Endpoint and the device-side consumer.
    pub fn new(capacity: usize) -> (Self, Consumer<MidiMessage>) {
        let (tx, rx) = RingBuffer::new(capacity);
        (Self { tx, dropped: 0 }, rx)
    }

    /// Messages dropped because the device had not drained the queue.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Processor for MidiOutputNode {
    fn name(&self) -> &str {
        "MIDI Output"
    }

    fn audio_channel_count(&self, _direction: BusDirection) -> usize {
        0
    }

    fn midi_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => 1,
            BusDirection::Output => 0,
        }
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        for msg in info.midi_in[0].events() {
            let mut msg = *msg;
            msg.offset += info.offset as u32;
            if self.tx.push(msg).is_err() {
                self.dropped += 1;
            }
        }
        Ok(())
    }
}

const VOICES: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    active: bool,
    channel: u8,
    pitch: u8,
    amplitude: f32,
    phase: f32,
    step: f32,
    age: u64,
}

/// Polyphonic sine instrument: one MIDI input, stereo output.
///
/// Voices start and stop sample-accurately at each message's offset. When all
/// voices are busy the oldest one is stolen.
#[derive(Debug, Clone)]
pub struct SineSynth {
    voices: [Voice; VOICES],
    sample_rate: f32,
    level: f32,
    clock: u64,
}

impl SineSynth {
    /// Synth at unity level.
    pub fn new() -> Self {
        Self::with_level(1.0)
    }

    /// Synth scaled by `level`.
    pub fn with_level(level: f32) -> Self {
        Self {
            voices: [Voice::default(); VOICES],
            sample_rate: 0.0,
            level,
            clock: 0,
        }
    }

    /// Voices currently sounding.
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn handle(&mut self, msg: &MidiMessage) {
        if let Some(pitch) = msg.as_note_off() {
            for v in self.voices.iter_mut() {
                if v.active && v.channel == msg.channel && v.pitch == pitch {
                    v.active = false;
                }
            }
            return;
        }
        match msg.payload {
            MidiPayload::NoteOn { pitch, velocity } => {
                self.clock += 1;
                let freq = 440.0 * 2f32.powf((pitch as f32 - 69.0) / 12.0);
                let slot = self
                    .voices
                    .iter()
                    .position(|v| !v.active)
                    .unwrap_or_else(|| oldest(&self.voices));
                self.voices[slot] = Voice {
                    active: true,
                    channel: msg.channel,
                    pitch,
                    amplitude: velocity as f32 / 127.0,
                    phase: 0.0,
                    step: TAU * freq / self.sample_rate,
                    age: self.clock,
                };
            }
            // all sound off / all notes off
            MidiPayload::ControlChange {
                control: 120 | 123, ..
            } => {
                for v in self.voices.iter_mut().filter(|v| v.channel == msg.channel) {
                    v.active = false;
                }
            }
            _ => {}
        }
    }

    fn render(&mut self, out: &mut AudioBuffer, from: usize, to: usize) {
        if out.channel_count() == 0 {
            return;
        }
        let left = out.channel_mut(0);
        for sample in &mut left[from..to] {
            let mut acc = 0.0;
            for v in self.voices.iter_mut().filter(|v| v.active) {
                acc += v.phase.sin() * v.amplitude;
                v.phase += v.step;
                if v.phase >= TAU {
                    v.phase -= TAU;
                }
            }
            *sample = acc * self.level;
        }
    }
}

fn oldest(voices: &[Voice]) -> usize {
    voices
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| v.age)
        .map_or(0, |(i, _)| i)
}

impl Default for SineSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for SineSynth {
    fn name(&self) -> &str {
        "Sine Synth"
    }

    fn audio_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => 0,
            BusDirection::Output => 2,
        }
    }

    fn midi_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => 1,
            BusDirection::Output => 0,
        }
    }

    fn on_start_processing(&mut self, sample_rate: f64, _block_size: usize) {
        self.sample_rate = sample_rate as f32;
    }

    fn on_stop_processing(&mut self) {
        for v in self.voices.iter_mut() {
            v.active = false;
        }
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        if self.sample_rate <= 0.0 {
            return Err(ProcessError::NotPrepared);
        }
        let frames = info.frames;
        let midi_in = info.midi_in;
        let mut cursor = 0;
        for msg in midi_in[0].events() {
            let at = (msg.offset as usize).min(frames);
            self.render(info.audio_out, cursor, at);
            cursor = at;
            self.handle(msg);
        }
        self.render(info.audio_out, cursor, frames);

        for ch in 1..info.audio_out.channel_count() {
            for i in 0..frames {
                let s = info.audio_out.channel(0)[i];
                info.audio_out.channel_mut(ch)[i] = s;
            }
        }
        Ok(())
    }
}

/// A note of a [`NoteSequencer`] pattern, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedNote {
    /// Start position.
    pub start: Tick,
    /// Length; the note-off falls on `start + length`.
    pub length: Tick,
    /// MIDI channel 0..=15.
    pub channel: u8,
    /// Key number.
    pub pitch: u8,
    /// Note-on velocity.
    pub velocity: u8,
}

/// Plays a note pattern against the transport.
///
/// Every sub-block emits the note-ons and note-offs whose tick falls inside
/// the sub-block's play range. When the transport stops or jumps (loop wrap,
/// relocation) every note still held gets a note-off at offset 0 of the
/// next sub-block.
#[derive(Debug, Clone, Default)]
pub struct NoteSequencer {
    notes: Vec<SequencedNote>,
    expected_next: Option<i64>,
}

impl NoteSequencer {
    /// Sequencer playing `notes`.
    pub fn new(mut notes: Vec<SequencedNote>) -> Self {
        notes.sort_by_key(|n| n.start);
        Self {
            notes,
            expected_next: None,
        }
    }

    /// The pattern, sorted by start tick.
    pub fn notes(&self) -> &[SequencedNote] {
        &self.notes
    }

    /// Replace the pattern. Call under the graph's bypass lock.
    pub fn set_notes(&mut self, notes: Vec<SequencedNote>) {
        *self = Self {
            expected_next: self.expected_next,
            ..Self::new(notes)
        };
    }
}

impl Processor for NoteSequencer {
    fn name(&self) -> &str {
        "Note Sequencer"
    }

    fn audio_channel_count(&self, _direction: BusDirection) -> usize {
        0
    }

    fn midi_channel_count(&self, direction: BusDirection) -> usize {
        match direction {
            BusDirection::Input => 0,
            BusDirection::Output => 1,
        }
    }

    fn on_stop_processing(&mut self) {
        self.expected_next = None;
    }

    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        let transport = info.transport;
        let out = &mut info.midi_out[0];

        let continuous = transport.playing && self.expected_next == Some(transport.play.begin.sample);
        if !continuous && out.notes().total() > 0 {
            out.pop_note_stack();
        }
        out.apply_cached_note_offs();
        if !transport.playing {
            self.expected_next = None;
            return Ok(());
        }
        self.expected_next = Some(transport.play.end.sample);

        let (begin, end) = (transport.play.begin.tick, transport.play.end.tick);
        if end <= begin {
            return Ok(());
        }
        let frames = info.frames as i64;
        let offset_of = |tick: Tick| (((tick - begin) * frames) / (end - begin)).min(frames - 1).max(0) as u32;

        for note in &self.notes {
            if note.start >= end {
                break;
            }
            if (begin..end).contains(&note.start) {
                out.push(MidiMessage::new(
                    offset_of(note.start),
                    note.channel,
                    note.start,
                    MidiPayload::NoteOn {
                        pitch: note.pitch,
                        velocity: note.velocity,
                    },
                ));
            }
            let off_tick = note.start + note.length;
            if (begin..end).contains(&off_tick) && out.notes().outstanding(note.channel, note.pitch) > 0 {
                out.push(MidiMessage::new(
                    offset_of(off_tick),
                    note.channel,
                    off_tick,
                    MidiPayload::NoteOff {
                        pitch: note.pitch,
                        off_velocity: 0,
                    },
                ));
            }
        }
        Ok(())
    }
}
