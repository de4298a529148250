//! MIDI messages exchanged between nodes within one block.

use crate::time::Tick;

/// Channel voice payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiPayload {
    /// Key pressed. A velocity of zero is treated as a note-off.
    NoteOn {
        /// Key number 0..=127.
        pitch: u8,
        /// Velocity 0..=127.
        velocity: u8,
    },
    /// Key released.
    NoteOff {
        /// Key number 0..=127.
        pitch: u8,
        /// Release velocity 0..=127.
        off_velocity: u8,
    },
    /// Per-key aftertouch.
    PolyphonicPressure {
        /// Key number 0..=127.
        pitch: u8,
        /// Pressure 0..=127.
        value: u8,
    },
    /// Controller change.
    ControlChange {
        /// Controller number 0..=127.
        control: u8,
        /// Value 0..=127.
        value: u8,
    },
    /// Program change.
    ProgramChange {
        /// Program number 0..=127.
        program: u8,
    },
    /// Channel aftertouch.
    ChannelPressure {
        /// Pressure 0..=127.
        value: u8,
    },
    /// Pitch bend, 14 bit, centre at 8192.
    PitchBend {
        /// Bend value 0..=16383.
        value: u16,
    },
}

/// A MIDI message positioned inside the current sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMessage {
    /// Frame offset relative to the start of the sub-block.
    pub offset: u32,
    /// MIDI channel 0..=15.
    pub channel: u8,
    /// Project-time position in ticks.
    pub tick: Tick,
    /// Message content.
    pub payload: MidiPayload,
}

impl MidiMessage {
    /// Create a message.
    pub fn new(offset: u32, channel: u8, tick: Tick, payload: MidiPayload) -> Self {
        Self {
            offset,
            channel: channel & 0x0F,
            tick,
            payload,
        }
    }

    /// Note-on helper.
    pub fn note_on(offset: u32, channel: u8, pitch: u8, velocity: u8) -> Self {
        Self::new(offset, channel, 0, MidiPayload::NoteOn { pitch, velocity })
    }

    /// Note-off helper.
    pub fn note_off(offset: u32, channel: u8, pitch: u8) -> Self {
        Self::new(
            offset,
            channel,
            0,
            MidiPayload::NoteOff {
                pitch,
                off_velocity: 0,
            },
        )
    }

    /// Returns the key of a note-on message with non-zero velocity.
    pub fn as_note_on(&self) -> Option<u8> {
        match self.payload {
            MidiPayload::NoteOn { pitch, velocity } if velocity > 0 => Some(pitch),
            _ => None,
        }
    }

    /// Returns the key of a note-off message, including zero-velocity note-ons.
    pub fn as_note_off(&self) -> Option<u8> {
        match self.payload {
            MidiPayload::NoteOff { pitch, .. } => Some(pitch),
            MidiPayload::NoteOn { pitch, velocity: 0 } => Some(pitch),
            _ => None,
        }
    }

    /// Decode a channel voice message from raw bytes.
    ///
    /// Returns `None` for system messages, running status and truncated input.
    pub fn from_bytes(offset: u32, tick: Tick, bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;
        if status & 0x80 == 0 || status >= 0xF0 {
            return None;
        }
        let channel = status & 0x0F;
        let data = |i: usize| bytes.get(i).map(|b| b & 0x7F);
        let payload = match status & 0xF0 {
            0x80 => MidiPayload::NoteOff {
                pitch: data(1)?,
                off_velocity: data(2)?,
            },
            0x90 => MidiPayload::NoteOn {
                pitch: data(1)?,
                velocity: data(2)?,
            },
            0xA0 => MidiPayload::PolyphonicPressure {
                pitch: data(1)?,
                value: data(2)?,
            },
            0xB0 => MidiPayload::ControlChange {
                control: data(1)?,
                value: data(2)?,
            },
            0xC0 => MidiPayload::ProgramChange { program: data(1)? },
            0xD0 => MidiPayload::ChannelPressure { value: data(1)? },
            0xE0 => MidiPayload::PitchBend {
                value: (data(2)? as u16) << 7 | data(1)? as u16,
            },
            _ => return None,
        };
        Some(Self::new(offset, channel, tick, payload))
    }

    /// Encode as raw bytes. Returns the buffer and the number of valid bytes.
    pub fn to_bytes(&self) -> ([u8; 3], usize) {
        let ch = self.channel & 0x0F;
        match self.payload {
            MidiPayload::NoteOff {
                pitch,
                off_velocity,
            } => ([0x80 | ch, pitch & 0x7F, off_velocity & 0x7F], 3),
            MidiPayload::NoteOn { pitch, velocity } => ([0x90 | ch, pitch & 0x7F, velocity & 0x7F], 3),
            MidiPayload::PolyphonicPressure { pitch, value } => {
                ([0xA0 | ch, pitch & 0x7F, value & 0x7F], 3)
            }
            MidiPayload::ControlChange { control, value } => {
                ([0xB0 | ch, control & 0x7F, value & 0x7F], 3)
            }
            MidiPayload::ProgramChange { program } => ([0xC0 | ch, program & 0x7F, 0], 2),
            MidiPayload::ChannelPressure { value } => ([0xD0 | ch, value & 0x7F, 0], 2),
            MidiPayload::PitchBend { value } => (
                [0xE0 | ch, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8],
                3,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_velocity_note_on_is_note_off() {
        let msg = MidiMessage::note_on(0, 0, 60, 0);
        assert_eq!(msg.as_note_on(), None);
        assert_eq!(msg.as_note_off(), Some(60));
    }

    #[test]
    fn decodes_pitch_bend_lsb_first() {
        let msg = MidiMessage::from_bytes(3, 0, &[0xE2, 0x00, 0x40]).unwrap();
        assert_eq!(msg.channel, 2);
        assert_eq!(msg.offset, 3);
        assert_eq!(msg.payload, MidiPayload::PitchBend { value: 8192 });
        assert_eq!(msg.to_bytes(), ([0xE2, 0x00, 0x40], 3));
    }

    #[test]
    fn rejects_system_and_truncated_messages() {
        assert!(MidiMessage::from_bytes(0, 0, &[0xF8]).is_none());
        assert!(MidiMessage::from_bytes(0, 0, &[0x90, 60]).is_none());
        assert!(MidiMessage::from_bytes(0, 0, &[0x3C, 0x40]).is_none());
        assert!(MidiMessage::from_bytes(0, 0, &[]).is_none());
    }

    #[test]
    fn program_change_is_two_bytes() {
        let msg = MidiMessage::from_bytes(0, 0, &[0xC5, 0x07]).unwrap();
        assert_eq!(msg.payload, MidiPayload::ProgramChange { program: 7 });
        assert_eq!(msg.to_bytes(), ([0xC5, 0x07, 0], 2));
    }
}
