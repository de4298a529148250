//! Real-time boundary helpers and offline rendering.

// Nothing reachable from `contain_panics` may log or assert PPT invariants:
// both take locks and allocate.

use crate::engine::{silence, AudioCallback, BlockOutcome};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run `block`. If it panics, the first `frames` samples of every output
/// channel are zeroed and the block reports [`BlockOutcome::Failed`].
pub fn contain_panics(
    output: &mut [&mut [f32]],
    frames: usize,
    block: impl FnOnce(&mut [&mut [f32]]) -> BlockOutcome,
) -> BlockOutcome {
    match catch_unwind(AssertUnwindSafe(|| block(&mut *output))) {
        Ok(outcome) => outcome,
        Err(_) => {
            // Fail closed.
            silence(output, frames);
            BlockOutcome::Failed
        }
    }
}

/// Result of [`render_offline`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfflineRender {
    /// One buffer per device output channel, `frames` samples each.
    pub channels: Vec<Vec<f32>>,
    /// Outcome of every device block, in order.
    pub outcomes: Vec<BlockOutcome>,
}

impl OfflineRender {
    /// Rendered frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Blocks that did not render.
    pub fn dropped_blocks(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o, BlockOutcome::Processed { .. }))
            .count()
    }

    /// Interleave the channels frame by frame.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut samples = Vec::with_capacity(frames * self.channels.len());
        for frame in 0..frames {
            for channel in &self.channels {
                samples.push(channel[frame]);
            }
        }
        samples
    }
}

/// Drive `callback` as a device would, with silent input, for `frames`
/// frames in blocks of the configured block size.
pub fn render_offline(callback: &mut AudioCallback, frames: usize) -> OfflineRender {
    let block_size = callback.config().block_size;
    let input_channels = callback.config().input_channels;
    let output_channels = callback.config().output_channels;

    let silence_in = vec![0.0f32; block_size];
    let inputs: Vec<&[f32]> = (0..input_channels).map(|_| silence_in.as_slice()).collect();
    let mut channels = vec![vec![0.0f32; frames]; output_channels];
    let mut outcomes = Vec::with_capacity(frames.div_ceil(block_size.max(1)));

    let mut offset = 0;
    while offset < frames {
        let block = block_size.min(frames - offset);
        let mut outputs: Vec<&mut [f32]> = channels
            .iter_mut()
            .map(|c| &mut c[offset..offset + block])
            .collect();
        outcomes.push(callback.process(&inputs, &mut outputs, block));
        offset += block;
    }

    OfflineRender { channels, outcomes }
}
