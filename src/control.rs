//! Control messages for mutator → RT communication.
//!
//! Parameter changes that do not alter topology travel through a lock-free
//! SPSC queue instead of the bypass protocol, so they never cause a skipped
//! block. The audio callback drains the queue at the start of every guarded
//! block.
//!
//! All messages are `Copy` and carry no heap data.

use crate::graph::{GraphProcessor, NodeId};
use rtrb::{Consumer, Producer, RingBuffer};

/// Default capacity of the control queue.
pub const CONTROL_QUEUE_CAPACITY: usize = 256;

/// Creates a control queue pair: (mutator producer, RT consumer).
pub fn new_control_queue(capacity: usize) -> (Producer<ControlMsg>, Consumer<ControlMsg>) {
    RingBuffer::new(capacity)
}

/// Control messages sent from mutator threads to the audio callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMsg {
    /// Set a node's linear output gain.
    SetGain {
        /// Target node.
        node: NodeId,
        /// Gain value (0.0 = silent, 1.0 = unity)
        gain: f32,
    },
    /// Silence a node's audio output.
    Mute {
        /// Target node.
        node: NodeId,
    },
    /// Remove mute from a node.
    Unmute {
        /// Target node.
        node: NodeId,
    },
    /// Note-off for every note sounding on any MIDI connection.
    AllNotesOff,
    /// Drop all buffered audio, events and note state.
    Reset,
}

impl ControlMsg {
    /// Returns the target node ID, if this message targets a specific node.
    pub fn target_node(&self) -> Option<NodeId> {
        match self {
            ControlMsg::SetGain { node, .. } | ControlMsg::Mute { node } | ControlMsg::Unmute { node } => {
                Some(*node)
            }
            ControlMsg::AllNotesOff | ControlMsg::Reset => None,
        }
    }

    /// Returns a human-readable description (for debugging).
    pub fn description(&self) -> &'static str {
        match self {
            ControlMsg::SetGain { .. } => "SetGain",
            ControlMsg::Mute { .. } => "Mute",
            ControlMsg::Unmute { .. } => "Unmute",
            ControlMsg::AllNotesOff => "AllNotesOff",
            ControlMsg::Reset => "Reset",
        }
    }

    /// Apply to `graph`. Returns `false` if the target node no longer exists.
    /// RT-safe.
    pub fn apply(self, graph: &mut GraphProcessor) -> bool {
        match self {
            ControlMsg::SetGain { node, gain } => graph.set_gain(node, gain),
            ControlMsg::Mute { node } => graph.set_muted(node, true),
            ControlMsg::Unmute { node } => graph.set_muted(node, false),
            ControlMsg::AllNotesOff => {
                graph.all_notes_off();
                true
            }
            ControlMsg::Reset => {
                graph.reset();
                true
            }
        }
    }
}
