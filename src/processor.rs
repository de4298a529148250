//! The processing contract every graph node implements.

use crate::buffer::{AudioBuffer, EventBuffer};
use crate::error::ProcessError;
use crate::transport::TransportInfo;
use std::any::Any;

/// Side of a node a channel count refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusDirection {
    /// Channels the node consumes.
    Input,
    /// Channels the node produces.
    Output,
}

/// Type-erased access to a concrete processor.
pub trait AsAny: Any {
    /// `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// `self` as `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A unit of audio/MIDI processing owned by a graph node.
///
/// Channel counts must stay constant while the processor is part of a graph:
/// they are read once when the node is added to size its buffers.
pub trait Processor: AsAny + Send {
    /// Display name.
    fn name(&self) -> &str;

    /// Audio channels for `direction`.
    fn audio_channel_count(&self, direction: BusDirection) -> usize;

    /// MIDI ports for `direction`.
    fn midi_channel_count(&self, _direction: BusDirection) -> usize {
        0
    }

    /// `true` if the processor has an editor UI.
    fn has_editor(&self) -> bool {
        false
    }

    /// Called before the first `process` and whenever the device restarts.
    fn on_start_processing(&mut self, _sample_rate: f64, _block_size: usize) {}

    /// Called after the last `process`.
    fn on_stop_processing(&mut self) {}

    /// Process one sub-block. Must not block or allocate.
    ///
    /// On `Err` the graph silences this node's outputs for the sub-block.
    fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError>;
}

/// Device-side buffers for the whole block.
///
/// Input and output nodes copy between these and the graph at the sub-block's
/// `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIo {
    /// Audio delivered by the device.
    pub input: AudioBuffer,
    /// Audio handed back to the device.
    pub output: AudioBuffer,
}

impl DeviceIo {
    /// Allocate device buffers of `block_size` frames.
    pub fn new(input_channels: usize, output_channels: usize, block_size: usize) -> Self {
        Self {
            input: AudioBuffer::new(input_channels, block_size),
            output: AudioBuffer::new(output_channels, block_size),
        }
    }

    /// Set the frame count of the current block and zero the output.
    pub fn begin_block(&mut self, frames: usize) {
        self.input.set_frames(frames);
        self.output.set_frames(frames);
        self.output.clear();
    }
}

/// Everything a processor sees for one sub-block.
pub struct ProcessInfo<'a> {
    /// Transport snapshot covering exactly this sub-block.
    pub transport: &'a TransportInfo,
    /// Offset of the sub-block inside the device block.
    pub offset: usize,
    /// Frames in the sub-block.
    pub frames: usize,
    /// Summed upstream audio.
    pub audio_in: &'a AudioBuffer,
    /// This node's audio output, zeroed before the call.
    pub audio_out: &'a mut AudioBuffer,
    /// Merged upstream events per input port, sorted by offset.
    pub midi_in: &'a [EventBuffer],
    /// This node's output ports, cleared before the call.
    pub midi_out: &'a mut [EventBuffer],
    /// Device buffers of the whole block.
    pub device: &'a mut DeviceIo,
}

impl std::fmt::Debug for ProcessInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("offset", &self.offset)
            .field("frames", &self.frames)
            .field("audio_in", &self.audio_in.channel_count())
            .field("audio_out", &self.audio_out.channel_count())
            .field("midi_in", &self.midi_in.len())
            .field("midi_out", &self.midi_out.len())
            .finish()
    }
}
