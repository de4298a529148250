//! Block-by-block driver for tests: plays the device role and records what
//! happened to every block.

use crate::config::EngineConfig;
use crate::engine::{AudioCallback, BlockOutcome, Engine, EngineController, HostContext};
use crate::error::EngineError;

/// Owns both engine halves and device-shaped buffers.
pub struct RtHarness {
    callback: AudioCallback,
    controller: EngineController,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
    outcomes: Vec<BlockOutcome>,
    last_frames: usize,
}

impl RtHarness {
    /// Build an engine for `config`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let context = HostContext::new(config)?;
        let input = vec![vec![0.0; context.config.block_size]; context.config.input_channels];
        let output = vec![vec![0.0; context.config.block_size]; context.config.output_channels];
        let (callback, controller) = Engine::new(context)?;
        Ok(Self {
            callback,
            controller,
            input,
            output,
            outcomes: Vec::new(),
            last_frames: 0,
        })
    }

    /// The mutator half.
    pub fn controller(&self) -> &EngineController {
        &self.controller
    }

    /// The audio half, for driving it directly.
    pub fn callback_mut(&mut self) -> &mut AudioCallback {
        &mut self.callback
    }

    /// Fill device input `channel` with `value` for every following block.
    pub fn set_input(&mut self, channel: usize, value: f32) {
        if let Some(buffer) = self.input.get_mut(channel) {
            buffer.fill(value);
        }
    }

    /// Run one block of `frames` frames, clamped to the configured block size.
    pub fn run_block(&mut self, frames: usize) -> BlockOutcome {
        let frames = frames.min(self.controller.config().block_size);
        let input: Vec<&[f32]> = self.input.iter().map(Vec::as_slice).collect();
        let mut output: Vec<&mut [f32]> = self.output.iter_mut().map(Vec::as_mut_slice).collect();
        let outcome = self.callback.process(&input, &mut output, frames);
        self.outcomes.push(outcome);
        self.last_frames = frames;
        outcome
    }

    /// Run `count` full blocks.
    pub fn run_blocks(&mut self, count: usize) -> &[BlockOutcome] {
        let start = self.outcomes.len();
        let block_size = self.controller.config().block_size;
        for _ in 0..count {
            self.run_block(block_size);
        }
        &self.outcomes[start..]
    }

    /// Device output `channel` of the last block.
    pub fn output(&self, channel: usize) -> &[f32] {
        self.output
            .get(channel)
            .map(|c| &c[..self.last_frames])
            .unwrap_or(&[])
    }

    /// Every outcome recorded so far.
    pub fn outcomes(&self) -> &[BlockOutcome] {
        &self.outcomes
    }

    /// Number of recorded blocks matching `pred`.
    pub fn count(&self, pred: impl Fn(&BlockOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    /// Drain the audio thread's invariant signals.
    pub fn signals(&self) -> Vec<u8> {
        self.controller.drain_invariant_signals()
    }
}

impl std::fmt::Debug for RtHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtHarness")
            .field("blocks", &self.outcomes.len())
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}
