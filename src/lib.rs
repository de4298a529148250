//! strata: a real-time audio/MIDI graph host core.
//!
//! A [`GraphProcessor`] holds processors and their audio and MIDI
//! connections. A [`Transporter`] owns the playback position, and the
//! [`Traverser`] cuts every device block into loop-respecting sub-blocks. The
//! [`Engine`] shares the graph between the audio thread and editors through
//! the non-blocking bypass protocol in [`bypass`].

pub mod buffer;
pub mod bypass;
pub mod config;
pub mod control;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod graph;
#[doc(hidden)]
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod listener;
pub mod midi;
pub mod nodes;
pub mod plan;
pub mod processor;
pub mod render;
pub mod rt;
pub mod time;
pub mod transport;
pub mod traverser;

pub use buffer::{AudioBuffer, EventBuffer, MidiBuffer, NoteStack};
pub use bypass::{Bypassed, BypassFlag, ScopedBypassGuard, ScopedBypassRequest, WaitStrategy};
pub use config::{BypassConfig, EngineConfig};
pub use control::ControlMsg;
pub use engine::{AudioCallback, BlockOutcome, Engine, EngineController, EngineStats, HostContext};
pub use error::{ConfigError, EngineError, GraphError, ProcessError, RenderError};
pub use graph::{Connection, ConnectionId, GraphListener, GraphProcessor, NodeId};
pub use midi::MidiMessage;
pub use processor::{BusDirection, DeviceIo, ProcessInfo, Processor};
pub use time::{Meter, SampleCount, Tempo, TempoMap, Tick, TimePoint, TimeRange};
pub use transport::{TransportInfo, TransportListener, Transporter};
pub use traverser::{SubBlock, TraversalReport, Traverser};
