//! Block-scoped audio and event buffers.
//!
//! All buffers are sized once (when processing starts) and then reused every
//! sub-block without allocating. The only state that survives a block is the
//! pending note-off counts of an [`EventBuffer`].

use crate::midi::{MidiMessage, MidiPayload};
use std::sync::atomic::{AtomicU16, Ordering};

/// Non-interleaved multi-channel audio with a fixed frame capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    frames: usize,
}

impl AudioBuffer {
    /// Allocate `channels` channels of `capacity` frames, all silent.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: vec![vec![0.0; capacity]; channels],
            frames: capacity,
        }
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames valid in the current sub-block.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Frames allocated per channel.
    pub fn capacity(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Set the valid frame count, clamped to the capacity. Never allocates.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity());
    }

    /// Zero the valid frames of every channel.
    pub fn clear(&mut self) {
        let frames = self.frames;
        for ch in &mut self.channels {
            ch[..frames].fill(0.0);
        }
    }

    /// Valid frames of one channel.
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index][..self.frames]
    }

    /// Valid frames of one channel, mutable.
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let frames = self.frames;
        &mut self.channels[index][..frames]
    }

    /// Iterate over the valid frames of every channel.
    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        let frames = self.frames;
        self.channels.iter().map(move |c| &c[..frames])
    }

    /// Iterate mutably over the valid frames of every channel.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let frames = self.frames;
        self.channels.iter_mut().map(move |c| &mut c[..frames])
    }

    /// Sum `count` channels of `src` starting at `src_start` into this buffer
    /// starting at `dst_start`. Out-of-range channels are skipped.
    pub fn add_from(&mut self, src: &AudioBuffer, src_start: usize, dst_start: usize, count: usize) {
        let frames = self.frames.min(src.frames);
        for i in 0..count {
            let (Some(s), Some(d)) = (
                src.channels.get(src_start + i),
                self.channels.get_mut(dst_start + i),
            ) else {
                break;
            };
            for (o, &x) in d[..frames].iter_mut().zip(&s[..frames]) {
                *o += x;
            }
        }
    }

    /// Multiply every valid sample by `gain`.
    pub fn apply_gain(&mut self, gain: f32) {
        if gain == 1.0 {
            return;
        }
        for ch in self.channels_mut() {
            for s in ch {
                *s *= gain;
            }
        }
    }

    /// Peak absolute value over the valid frames.
    pub fn peak(&self) -> f32 {
        self.channels()
            .flat_map(|c| c.iter())
            .fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

/// Fixed-capacity list of MIDI messages.
#[derive(Debug, Clone, PartialEq)]
pub struct MidiBuffer {
    events: Vec<MidiMessage>,
    capacity: usize,
}

impl MidiBuffer {
    /// Allocate room for `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message. Returns `false` (and drops it) when full.
    pub fn push(&mut self, msg: MidiMessage) -> bool {
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push(msg);
        true
    }

    /// Remove every message.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// `true` when empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages in order.
    pub fn as_slice(&self) -> &[MidiMessage] {
        &self.events
    }

    /// Stable sort by frame offset. Insertion sort: in place, no allocation,
    /// and near-linear for the almost-sorted lists a block produces.
    pub fn sort_by_offset(&mut self) {
        for i in 1..self.events.len() {
            let mut j = i;
            while j > 0 && self.events[j - 1].offset > self.events[j].offset {
                self.events.swap(j - 1, j);
                j -= 1;
            }
        }
    }
}

const CHANNELS: usize = 16;
const PITCHES: usize = 128;

/// Outstanding note-on count per (channel, pitch).
///
/// Counters are atomics so that producers on different threads may feed the
/// same stack; decrements floor at zero.
#[derive(Debug)]
pub struct NoteStack {
    counts: Box<[AtomicU16]>,
}

impl NoteStack {
    /// All counters at zero.
    pub fn new() -> Self {
        Self {
            counts: (0..CHANNELS * PITCHES).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    fn slot(&self, channel: u8, pitch: u8) -> &AtomicU16 {
        &self.counts[(channel as usize & 0x0F) * PITCHES + (pitch as usize & 0x7F)]
    }

    /// Record a note-on.
    pub fn note_on(&self, channel: u8, pitch: u8) {
        let slot = self.slot(channel, pitch);
        let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1));
    }

    /// Record a note-off. Unmatched note-offs leave the counter at zero.
    pub fn note_off(&self, channel: u8, pitch: u8) {
        let slot = self.slot(channel, pitch);
        let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Outstanding note-ons for one key.
    pub fn outstanding(&self, channel: u8, pitch: u8) -> u16 {
        self.slot(channel, pitch).load(Ordering::Acquire)
    }

    /// Total outstanding note-ons.
    pub fn total(&self) -> usize {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Acquire) as usize)
            .sum()
    }

    /// Track a message: note-ons increment, note-offs decrement.
    pub fn track(&self, msg: &MidiMessage) {
        if let Some(pitch) = msg.as_note_on() {
            self.note_on(msg.channel, pitch);
        } else if let Some(pitch) = msg.as_note_off() {
            self.note_off(msg.channel, pitch);
        }
    }
}

impl Default for NoteStack {
    fn default() -> Self {
        Self::new()
    }
}

/// One MIDI port's events for the current sub-block, plus note tracking.
///
/// Synthesized note-offs are kept as per-key counts, so none are lost however
/// many notes were held. They are emitted at the front of later sub-blocks,
/// as many per sub-block as the live list has room for.
#[derive(Debug)]
pub struct EventBuffer {
    events: MidiBuffer,
    notes: NoteStack,
    pending_note_offs: Box<[u32]>,
    pending_total: usize,
}

impl EventBuffer {
    /// Allocate room for `capacity` live messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: MidiBuffer::with_capacity(capacity),
            notes: NoteStack::new(),
            pending_note_offs: vec![0; CHANNELS * PITCHES].into_boxed_slice(),
            pending_total: 0,
        }
    }

    /// Append a message and update the note stack.
    pub fn push(&mut self, msg: MidiMessage) -> bool {
        if !self.events.push(msg) {
            return false;
        }
        self.notes.track(&msg);
        true
    }

    /// Clear the live messages. Pending note-offs and note state survive.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Live messages.
    pub fn events(&self) -> &[MidiMessage] {
        self.events.as_slice()
    }

    /// `true` when another live message would be dropped.
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.events.capacity()
    }

    /// Sort live messages by frame offset.
    pub fn sort_by_offset(&mut self) {
        self.events.sort_by_offset();
    }

    /// Note state of everything pushed through this buffer.
    pub fn notes(&self) -> &NoteStack {
        &self.notes
    }

    /// Number of synthesized note-offs not yet emitted.
    pub fn cached_len(&self) -> usize {
        self.pending_total
    }

    /// Turn every outstanding note-on into a pending note-off and reset the
    /// note stack.
    pub fn pop_note_stack(&mut self) {
        for (slot, pending) in self.notes.counts.iter().zip(self.pending_note_offs.iter_mut()) {
            let n = slot.swap(0, Ordering::AcqRel) as u32;
            *pending = pending.saturating_add(n);
            self.pending_total += n as usize;
        }
    }

    /// Emit pending note-offs at the front of the live list, up to its free
    /// room. Whatever does not fit stays pending for the next call.
    pub fn apply_cached_note_offs(&mut self) {
        if self.pending_total == 0 {
            return;
        }
        let room = self.events.capacity.saturating_sub(self.events.len());
        let mut emitted = 0;
        for (index, pending) in self.pending_note_offs.iter_mut().enumerate() {
            if emitted == room {
                break;
            }
            let take = (*pending as usize).min(room - emitted);
            if take == 0 {
                continue;
            }
            let off = MidiMessage::new(
                0,
                (index / PITCHES) as u8,
                0,
                MidiPayload::NoteOff {
                    pitch: (index % PITCHES) as u8,
                    off_velocity: 0,
                },
            );
            for _ in 0..take {
                self.events.events.push(off);
            }
            *pending -= take as u32;
            emitted += take;
        }
        self.events.events.rotate_right(emitted);
        self.pending_total -= emitted;
    }

    /// Take over another buffer's pending note-offs.
    pub fn take_cached_from(&mut self, other: &mut EventBuffer) {
        for (mine, theirs) in self.pending_note_offs.iter_mut().zip(other.pending_note_offs.iter_mut()) {
            *mine = mine.saturating_add(std::mem::take(theirs));
        }
        self.pending_total += std::mem::take(&mut other.pending_total);
    }

    /// Forget all note state and pending note-offs.
    pub fn reset(&mut self) {
        self.events.clear();
        self.pending_note_offs.fill(0);
        self.pending_total = 0;
        for c in self.notes.counts.iter() {
            c.store(0, Ordering::Release);
        }
    }
}
