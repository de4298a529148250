//! Builder API for wiring a graph with named nodes.
//!
//! ```ignore
//! controller.edit_graph(|graph| {
//!     let mut b = GraphBuilder::new(graph);
//!     b.node("synth", SineSynth::new())?;
//!     b.node("out", AudioOutputNode::new(2))?;
//!     b.audio("synth", "out")?;
//!     Ok::<_, DslError>(b.finish())
//! })?;
//! ```

use crate::error::GraphError;
use crate::graph::{ConnectionId, GraphProcessor, NodeId};
use crate::processor::{BusDirection, Processor};
use std::collections::HashMap;
use thiserror::Error;

/// Name to node lookup produced by [`GraphBuilder::finish`].
pub type NodeNames = HashMap<String, NodeId>;

/// Adds named nodes and connections to a borrowed graph.
#[derive(Debug)]
pub struct GraphBuilder<'g> {
    graph: &'g mut GraphProcessor,
    names: NodeNames,
}

impl<'g> GraphBuilder<'g> {
    /// Build into `graph`. Existing nodes are left alone.
    pub fn new(graph: &'g mut GraphProcessor) -> Self {
        Self {
            graph,
            names: HashMap::new(),
        }
    }

    /// Add `processor` under `name`.
    pub fn node<P: Processor>(&mut self, name: &str, processor: P) -> Result<NodeId, DslError> {
        if self.names.contains_key(name) {
            return Err(DslError::DuplicateName(name.to_owned()));
        }
        let id = self.graph.add_node(processor);
        self.names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Look up a node added by this builder.
    pub fn id(&self, name: &str) -> Result<NodeId, DslError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| DslError::MissingNode(name.to_owned()))
    }

    /// Connect as many audio channels as both ends have, starting at channel 0.
    pub fn audio(&mut self, from: &str, to: &str) -> Result<ConnectionId, DslError> {
        let (up, down) = (self.id(from)?, self.id(to)?);
        let outputs = self.channel_count(up, BusDirection::Output);
        let inputs = self.channel_count(down, BusDirection::Input);
        let count = outputs.min(inputs);
        if count == 0 {
            return Err(DslError::NoCommonChannels {
                from: from.to_owned(),
                to: to.to_owned(),
            });
        }
        Ok(self.graph.connect_audio(up, down, 0, 0, count)?)
    }

    /// Connect an explicit audio channel range.
    pub fn audio_channels(
        &mut self,
        from: &str,
        to: &str,
        from_channel: usize,
        to_channel: usize,
        count: usize,
    ) -> Result<ConnectionId, DslError> {
        let (up, down) = (self.id(from)?, self.id(to)?);
        Ok(self.graph.connect_audio(up, down, from_channel, to_channel, count)?)
    }

    /// Connect MIDI port 0 to MIDI port 0.
    pub fn midi(&mut self, from: &str, to: &str) -> Result<ConnectionId, DslError> {
        self.midi_ports(from, to, 0, 0)
    }

    /// Connect explicit MIDI ports.
    pub fn midi_ports(
        &mut self,
        from: &str,
        to: &str,
        from_port: usize,
        to_port: usize,
    ) -> Result<ConnectionId, DslError> {
        let (up, down) = (self.id(from)?, self.id(to)?);
        Ok(self.graph.connect_midi(up, down, from_port, to_port)?)
    }

    /// The names of every node added.
    pub fn finish(self) -> NodeNames {
        self.names
    }

    fn channel_count(&self, node: NodeId, direction: BusDirection) -> usize {
        self.graph
            .processor(node)
            .map_or(0, |p| p.audio_channel_count(direction))
    }
}

/// Builder errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    /// The graph rejected the connection.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// No node with this name was added.
    #[error("no node named `{0}`")]
    MissingNode(String),
    /// A node with this name already exists.
    #[error("a node named `{0}` already exists")]
    DuplicateName(String),
    /// The two nodes share no audio channels.
    #[error("`{from}` has no audio output that `{to}` can take")]
    NoCommonChannels {
        /// Upstream name.
        from: String,
        /// Downstream name.
        to: String,
    },
}
