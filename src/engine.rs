//! The running host: an audio-thread half and a mutator half.
//!
//! [`Engine::new`] splits into an [`AudioCallback`], owned by the device
//! thread, and an [`EngineController`] that any number of threads may clone.
//! The graph and the device buffers live inside a [`Bypassed`] cell: the
//! callback enters it without blocking and drops the block when an edit is
//! pending; the controller waits on its own side.

use crate::bypass::Bypassed;
use crate::config::EngineConfig;
use crate::control::{new_control_queue, ControlMsg};
use crate::error::{ConfigError, EngineError};
use crate::graph::GraphProcessor;
use crate::invariant_ppt::{assert_invariant, BYPASS_EXCLUSIVE_EDIT};
use crate::invariant_rt::{
    drain_invariant_signals, new_invariant_queue, signal_invariant, signal_invariant_n,
    INV_BLOCK_PROCESSED, INV_BLOCK_SKIPPED, INV_COMMIT_DISCARDED, INV_CONTROL_MSG_APPLIED,
    INV_LOOP_WRAPPED, INV_NODE_FAILED, INV_RT_CALLBACK_CLEAN,
};
use crate::processor::DeviceIo;
use crate::rt::contain_panics;
use crate::transport::Transporter;
use crate::traverser::{SubBlock, Traverser};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Explicit application context handed to [`Engine::new`].
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Validated engine configuration.
    pub config: EngineConfig,
    /// Shared transport.
    pub transporter: Arc<Transporter>,
}

impl HostContext {
    /// Validate `config` and build a transporter from its tempo map.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transporter = Arc::new(Transporter::new(config.tempo_map()));
        Ok(Self {
            config,
            transporter,
        })
    }
}

/// What happened to one device block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The graph ran over `frames` frames.
    Processed {
        /// Frames rendered.
        frames: usize,
    },
    /// A graph edit was pending; the block is silent and the transport did not move.
    Skipped,
    /// The block panicked; the output is silent.
    Failed,
}

/// Block counters, updated by the audio thread with relaxed atomics.
#[derive(Debug, Default)]
pub struct EngineStats {
    processed_blocks: AtomicU64,
    skipped_blocks: AtomicU64,
    failed_blocks: AtomicU64,
    processed_frames: AtomicU64,
}

impl EngineStats {
    /// Blocks the graph ran for.
    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    /// Blocks dropped because an edit was pending.
    pub fn skipped_blocks(&self) -> u64 {
        self.skipped_blocks.load(Ordering::Relaxed)
    }

    /// Blocks that panicked.
    pub fn failed_blocks(&self) -> u64 {
        self.failed_blocks.load(Ordering::Relaxed)
    }

    /// Frames rendered across processed blocks.
    pub fn processed_frames(&self) -> u64 {
        self.processed_frames.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: BlockOutcome) {
        match outcome {
            BlockOutcome::Processed { frames } => {
                self.processed_blocks.fetch_add(1, Ordering::Relaxed);
                self.processed_frames.fetch_add(frames as u64, Ordering::Relaxed);
            }
            BlockOutcome::Skipped => {
                self.skipped_blocks.fetch_add(1, Ordering::Relaxed);
            }
            BlockOutcome::Failed => {
                self.failed_blocks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

struct EngineCore {
    graph: GraphProcessor,
    device: DeviceIo,
}

struct Shared {
    config: EngineConfig,
    transporter: Arc<Transporter>,
    core: Bypassed<EngineCore>,
    stats: EngineStats,
    control: Mutex<Producer<ControlMsg>>,
    signals: Mutex<Consumer<u8>>,
}

/// Builds the two halves of a host.
#[derive(Debug, Clone, Copy)]
pub struct Engine;

impl Engine {
    /// Allocate everything the audio thread will need and split.
    pub fn new(context: HostContext) -> Result<(AudioCallback, EngineController), EngineError> {
        let HostContext {
            config,
            transporter,
        } = context;
        config.validate()?;

        let graph = GraphProcessor::with_midi_capacity(config.midi_event_capacity);
        let device = DeviceIo::new(config.input_channels, config.output_channels, config.block_size);
        let core = Bypassed::new(
            EngineCore { graph, device },
            config.bypass.guard_attempts,
            config.bypass.wait_strategy(),
        );
        let (control_tx, control_rx) = new_control_queue(config.control_queue_capacity);
        let (signal_tx, signal_rx) = new_invariant_queue();

        tracing::info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            inputs = config.input_channels,
            outputs = config.output_channels,
            "engine created"
        );

        let shared = Arc::new(Shared {
            config,
            transporter,
            core,
            stats: EngineStats::default(),
            control: Mutex::new(control_tx),
            signals: Mutex::new(signal_rx),
        });
        let callback = AudioCallback {
            shared: Arc::clone(&shared),
            control: control_rx,
            signals: signal_tx,
            traverser: Traverser::new(),
        };
        Ok((callback, EngineController { shared }))
    }
}

/// The device-thread half. Call [`process`](Self::process) once per callback.
pub struct AudioCallback {
    shared: Arc<Shared>,
    control: Consumer<ControlMsg>,
    signals: Producer<u8>,
    traverser: Traverser,
}

impl AudioCallback {
    /// Render one device block.
    ///
    /// `input` and `output` are per-channel slices of at least `frames`
    /// samples. Missing device channels read as silence; output channels the
    /// engine does not drive are zeroed. Blocks longer than the configured
    /// block size are rendered in block-size chunks. Never blocks, never
    /// allocates, never unwinds into the caller.
    pub fn process(&mut self, input: &[&[f32]], output: &mut [&mut [f32]], frames: usize) -> BlockOutcome {
        let Self {
            shared,
            control,
            signals,
            traverser,
        } = self;
        let outcome = contain_panics(output, frames, |output| {
            run_block(shared, control, signals, traverser, input, output, frames)
        });
        if outcome != BlockOutcome::Failed {
            signal_invariant(signals, INV_RT_CALLBACK_CLEAN);
        }
        shared.stats.record(outcome);
        outcome
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Block counters.
    pub fn stats(&self) -> &EngineStats {
        &self.shared.stats
    }
}

impl std::fmt::Debug for AudioCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCallback")
            .field("bypass", &self.shared.core)
            .field("pending_controls", &self.control.slots())
            .finish_non_exhaustive()
    }
}

fn run_block(
    shared: &Shared,
    control: &mut Consumer<ControlMsg>,
    signals: &mut Producer<u8>,
    traverser: &Traverser,
    input: &[&[f32]],
    output: &mut [&mut [f32]],
    frames: usize,
) -> BlockOutcome {
    let Some(mut entry) = shared.core.try_enter() else {
        silence(output, frames);
        signal_invariant(signals, INV_BLOCK_SKIPPED);
        return BlockOutcome::Skipped;
    };
    let EngineCore { graph, device } = &mut *entry;

    let mut applied = 0;
    while let Ok(msg) = control.pop() {
        if msg.apply(graph) {
            applied += 1;
        }
    }
    signal_invariant_n(signals, INV_CONTROL_MSG_APPLIED, applied);

    let chunk_size = shared.config.block_size;
    let mut failed = 0;
    let mut start = 0;
    while start < frames {
        let chunk = chunk_size.min(frames - start);
        device.begin_block(chunk);
        device.input.clear();
        for (channel, source) in input.iter().enumerate().take(device.input.channel_count()) {
            let source = source.get(start..).unwrap_or(&[]);
            let count = chunk.min(source.len());
            device.input.channel_mut(channel)[..count].copy_from_slice(&source[..count]);
        }

        let report = traverser.traverse(&shared.transporter, chunk, &mut |block: &SubBlock| {
            failed += graph.process(block, device);
        });
        signal_invariant_n(signals, INV_LOOP_WRAPPED, report.loop_wraps);
        signal_invariant_n(signals, INV_COMMIT_DISCARDED, report.discarded_commits);

        for (channel, target) in output.iter_mut().enumerate() {
            let end = (start + chunk).min(target.len());
            if start >= end {
                continue;
            }
            let target = &mut target[start..end];
            if channel < device.output.channel_count() {
                target.copy_from_slice(&device.output.channel(channel)[..end - start]);
            } else {
                target.fill(0.0);
            }
        }
        start += chunk;
    }

    signal_invariant_n(signals, INV_NODE_FAILED, failed);
    signal_invariant(signals, INV_BLOCK_PROCESSED);
    BlockOutcome::Processed { frames }
}

/// Zero the first `frames` samples of every channel.
pub(crate) fn silence(output: &mut [&mut [f32]], frames: usize) {
    for channel in output.iter_mut() {
        let end = frames.min(channel.len());
        channel[..end].fill(0.0);
    }
}

/// The mutator half. Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct EngineController {
    shared: Arc<Shared>,
}

impl EngineController {
    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The shared transport.
    pub fn transporter(&self) -> &Arc<Transporter> {
        &self.shared.transporter
    }

    /// Block counters.
    pub fn stats(&self) -> &EngineStats {
        &self.shared.stats
    }

    /// Edit the graph under the bypass protocol. Waits for the block in
    /// flight to finish; the audio thread skips blocks until `edit` returns.
    pub fn edit_graph<R>(&self, edit: impl FnOnce(&mut GraphProcessor) -> R) -> R {
        let mut core = self.shared.core.lock();
        let state = self.shared.core.flag().state();
        assert_invariant(
            BYPASS_EXCLUSIVE_EDIT,
            !state.guard_active && state.pending_requests > 0,
            "graph edited while an audio block held the guard",
            Some("edit_graph"),
        );
        edit(&mut core.graph)
    }

    /// Read the graph. Goes through the same protocol as an edit.
    pub fn inspect_graph<R>(&self, read: impl FnOnce(&GraphProcessor) -> R) -> R {
        let core = self.shared.core.lock();
        read(&core.graph)
    }

    /// Prepare every node for the configured rate and block size.
    pub fn start_processing(&self) {
        let config = &self.shared.config;
        self.edit_graph(|graph| graph.start_processing(config.sample_rate, config.block_size));
        tracing::info!("engine processing started");
    }

    /// Release every node's processing resources.
    pub fn stop_processing(&self) {
        self.edit_graph(GraphProcessor::stop_processing);
        tracing::info!("engine processing stopped");
    }

    /// Whether the graph is prepared.
    pub fn is_processing(&self) -> bool {
        self.inspect_graph(GraphProcessor::is_processing)
    }

    /// Queue a parameter change for the start of the next guarded block.
    pub fn send(&self, msg: ControlMsg) -> Result<(), EngineError> {
        self.shared.control.lock().push(msg).map_err(|_| {
            tracing::warn!(msg = msg.description(), "control queue full");
            EngineError::ControlQueueFull
        })
    }

    /// Everything the audio thread signaled since the last drain.
    pub fn drain_invariant_signals(&self) -> Vec<u8> {
        drain_invariant_signals(&mut self.shared.signals.lock())
    }
}

impl std::fmt::Debug for EngineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineController")
            .field("bypass", &self.shared.core)
            .field("stats", &self.shared.stats)
            .finish_non_exhaustive()
    }
}
