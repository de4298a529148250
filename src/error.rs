//! Error types for the host core.
//!
//! Nothing in here is ever returned across the real-time boundary: the audio
//! callback degrades to silence instead. These errors surface on the mutator
//! side (graph edits, configuration, offline rendering).

use crate::graph::NodeId;
use thiserror::Error;

/// Errors raised when editing the processing graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A node handle does not refer to a live node of this graph.
    #[error("node {0:?} is not owned by this graph")]
    InvalidNode(NodeId),
    /// A channel or port index lies outside the endpoint's declared range.
    #[error("channel range {start}..{end} exceeds the {available} channels of node {node:?}")]
    ChannelOutOfRange {
        /// The node whose channel count was exceeded.
        node: NodeId,
        /// First requested channel.
        start: usize,
        /// One past the last requested channel.
        end: usize,
        /// Channels the node declares for that direction.
        available: usize,
    },
    /// Audio connections must carry at least one channel.
    #[error("audio connections must carry at least one channel")]
    ZeroChannelCount,
    /// An identical connection already exists.
    #[error("an identical connection already exists")]
    DuplicateConnection,
    /// The connection would close a cycle (self-connections included).
    #[error("connection would create a cycle")]
    CycleDetected,
}

/// Errors raised while validating or loading an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sample rate must be a positive finite number.
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(f64),
    /// Block size must be non-zero.
    #[error("block size must be greater than zero")]
    ZeroBlockSize,
    /// Ticks per quarter note must be non-zero.
    #[error("ticks per quarter note must be greater than zero")]
    ZeroTpqn,
    /// Tempo must be a positive finite number of beats per minute.
    #[error("invalid tempo: {0} bpm")]
    InvalidTempo(f64),
    /// Meter numerator must be non-zero and the denominator a power of two.
    #[error("invalid meter {numerator}/{denominator}")]
    InvalidMeter {
        /// Beats per measure.
        numerator: u32,
        /// Beat unit.
        denominator: u32,
    },
    /// A measure of the meter is not a whole number of ticks.
    #[error("meter {numerator}/{denominator} does not divide {tpqn} ticks per quarter note")]
    MeterResolution {
        /// Beats per measure.
        numerator: u32,
        /// Beat unit.
        denominator: u32,
        /// Ticks per quarter note.
        tpqn: u32,
    },
    /// A queue or buffer capacity was zero.
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
    /// The TOML source could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration could not be serialized.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a [`Processor`](crate::processor::Processor) for one sub-block.
///
/// The graph contains it: the failing node's outputs are silenced for that
/// sub-block and every other node keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The processor was asked to run before `on_start_processing`.
    #[error("processor is not prepared")]
    NotPrepared,
    /// Processor specific failure.
    #[error("processing failed: {0}")]
    Failed(&'static str),
}

/// Errors raised by the engine's mutator-side API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The control queue to the audio thread is full.
    #[error("control queue is full")]
    ControlQueueFull,
}

/// Errors raised while bouncing an offline render to disk.
#[derive(Debug, Error)]
pub enum RenderError {
    /// WAV encoding or I/O failed.
    #[error("wav export failed: {0}")]
    Wav(#[from] hound::Error),
    /// The engine has no output channels to render.
    #[error("engine has no output channels")]
    NoOutputChannels,
    /// WAV files hold at most 65535 channels.
    #[error("too many channels for a wav file")]
    TooManyChannels,
}
