//! Graph module: node/connection arena and per-sub-block execution.
//!
//! Nodes and connections live in generational arenas. Handles stay valid
//! until the entry is removed; a retired handle never aliases a later entry.
//! Every topology change recompiles the [`ExecutionPlan`], so `process` only
//! walks precomputed tables and never allocates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::buffer::{AudioBuffer, EventBuffer};
use crate::error::GraphError;
use crate::invariant_ppt::{
    assert_invariant, GRAPH_LEGALITY, GRAPH_REJECTS_CYCLE, GRAPH_REJECTS_DUPLICATE,
    NODE_REMOVAL_CLEAN, NOTE_OFF_FLUSHED, PLAN_SOUNDNESS,
};
use crate::listener::{ListenerRegistry, Subscription};
use crate::plan::{AudioRoute, ExecutionPlan, MidiRoute, PlanEdge};
use crate::processor::{BusDirection, DeviceIo, ProcessInfo, Processor};
use crate::traverser::SubBlock;
use std::sync::Arc;

/// Events each MIDI port can hold per sub-block unless configured otherwise.
pub const DEFAULT_MIDI_CAPACITY: usize = 512;

/// Handle to a node of one [`GraphProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Arena slot.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Handle to a connection of one [`GraphProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Arena slot.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Audio edge: `channel_count` channels starting at the given indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioConnection {
    /// The source node.
    pub upstream: NodeId,
    /// The destination node.
    pub downstream: NodeId,
    /// First source output channel.
    pub upstream_channel: usize,
    /// First destination input channel.
    pub downstream_channel: usize,
    /// Number of channels carried.
    pub channel_count: usize,
}

/// MIDI edge between one output port and one input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiConnection {
    /// The source node.
    pub upstream: NodeId,
    /// The destination node.
    pub downstream: NodeId,
    /// Source output port.
    pub upstream_port: usize,
    /// Destination input port.
    pub downstream_port: usize,
}

/// A typed directed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connection {
    /// Audio channels.
    Audio(AudioConnection),
    /// MIDI events.
    Midi(MidiConnection),
}

impl Connection {
    /// The source node.
    pub fn upstream(&self) -> NodeId {
        match self {
            Connection::Audio(c) => c.upstream,
            Connection::Midi(c) => c.upstream,
        }
    }

    /// The destination node.
    pub fn downstream(&self) -> NodeId {
        match self {
            Connection::Audio(c) => c.downstream,
            Connection::Midi(c) => c.downstream,
        }
    }

    /// `true` if either endpoint is `node`.
    pub fn touches(&self, node: NodeId) -> bool {
        self.upstream() == node || self.downstream() == node
    }
}

/// Observer of node lifecycle events. Called synchronously on the mutating thread.
pub trait GraphListener: Send + Sync {
    /// A node was added.
    fn on_node_added(&self, _node: NodeId, _name: &str) {}
    /// A node is about to be removed; its connections still exist.
    fn on_node_removing(&self, _node: NodeId, _name: &str) {}
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert(&mut self, value: T) -> (u32, u32) {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return (index, slot.generation);
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ((self.slots.len() - 1) as u32, 0)
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_mut())
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(value)
    }

    fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_ref().map(|v| (i as u32, s.generation, v)))
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }
}

struct NodeBuffers {
    audio_in: AudioBuffer,
    audio_out: AudioBuffer,
    midi_in: Vec<EventBuffer>,
    midi_out: Vec<EventBuffer>,
}

impl NodeBuffers {
    fn new(processor: &dyn Processor, block_size: usize, midi_capacity: usize) -> Self {
        let ports = |direction| {
            (0..processor.midi_channel_count(direction))
                .map(|_| EventBuffer::with_capacity(midi_capacity))
                .collect()
        };
        Self {
            audio_in: AudioBuffer::new(processor.audio_channel_count(BusDirection::Input), block_size),
            audio_out: AudioBuffer::new(processor.audio_channel_count(BusDirection::Output), block_size),
            midi_in: ports(BusDirection::Input),
            midi_out: ports(BusDirection::Output),
        }
    }

    /// Reallocate audio for a new block size; MIDI state survives.
    fn resize_audio(&mut self, block_size: usize) {
        self.audio_in = AudioBuffer::new(self.audio_in.channel_count(), block_size);
        self.audio_out = AudioBuffer::new(self.audio_out.channel_count(), block_size);
    }
}

struct NodeEntry {
    processor: Box<dyn Processor>,
    gain: f32,
    muted: bool,
    buffers: NodeBuffers,
}

impl NodeEntry {
    /// Clear inputs and apply note-offs left by torn-down connections.
    fn begin_sub_block(&mut self, frames: usize) {
        let inputs = &mut self.buffers;
        inputs.audio_in.set_frames(frames);
        inputs.audio_in.clear();
        for port in &mut inputs.midi_in {
            port.clear();
            port.apply_cached_note_offs();
        }
    }

    /// Run the processor; returns `false` if it failed and was silenced.
    fn run(&mut self, block: &SubBlock, device: &mut DeviceIo) -> bool {
        let NodeBuffers {
            audio_in,
            audio_out,
            midi_in,
            midi_out,
        } = &mut self.buffers;
        for port in midi_in.iter_mut() {
            port.sort_by_offset();
        }
        audio_out.set_frames(block.frames);
        audio_out.clear();
        for port in midi_out.iter_mut() {
            port.clear();
        }

        let mut info = ProcessInfo {
            transport: &block.transport,
            offset: block.offset,
            frames: block.frames,
            audio_in: &*audio_in,
            audio_out: &mut *audio_out,
            midi_in: midi_in.as_slice(),
            midi_out: midi_out.as_mut_slice(),
            device,
        };
        let ok = self.processor.process(&mut info).is_ok();

        if !ok {
            audio_out.clear();
            for port in midi_out.iter_mut() {
                port.clear();
            }
        }
        if self.muted {
            audio_out.clear();
        } else {
            audio_out.apply_gain(self.gain);
        }
        ok
    }
}

struct ConnectionEntry {
    connection: Connection,
    /// Routing buffer of a MIDI connection; tracks the notes it carried.
    route: Option<EventBuffer>,
}

impl ConnectionEntry {
    fn plan_edge(&self, index: usize) -> PlanEdge {
        match self.connection {
            Connection::Audio(c) => PlanEdge::Audio {
                downstream: c.downstream.index(),
                route: AudioRoute {
                    upstream: c.upstream.index(),
                    upstream_channel: c.upstream_channel,
                    downstream_channel: c.downstream_channel,
                    count: c.channel_count,
                },
            },
            Connection::Midi(c) => PlanEdge::Midi {
                downstream: c.downstream.index(),
                route: MidiRoute {
                    connection: index,
                    upstream: c.upstream.index(),
                    upstream_port: c.upstream_port,
                    downstream_port: c.downstream_port,
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Prepared {
    sample_rate: f64,
    block_size: usize,
}

/// Owns nodes and connections and executes sub-blocks over them.
///
/// Not internally synchronized: the engine wraps it in a
/// [`Bypassed`](crate::bypass::Bypassed) so edits never overlap `process`.
pub struct GraphProcessor {
    nodes: Arena<NodeEntry>,
    connections: Arena<ConnectionEntry>,
    plan: ExecutionPlan,
    prepared: Option<Prepared>,
    midi_capacity: usize,
    failures: u64,
    listeners: ListenerRegistry<dyn GraphListener>,
}

impl GraphProcessor {
    /// Empty graph with [`DEFAULT_MIDI_CAPACITY`] events per MIDI port.
    pub fn new() -> Self {
        Self::with_midi_capacity(DEFAULT_MIDI_CAPACITY)
    }

    /// Empty graph with `midi_capacity` events per MIDI port.
    pub fn with_midi_capacity(midi_capacity: usize) -> Self {
        Self {
            nodes: Arena::new(),
            connections: Arena::new(),
            plan: ExecutionPlan::default(),
            prepared: None,
            midi_capacity,
            failures: 0,
            listeners: ListenerRegistry::new(),
        }
    }

    /// Register a node lifecycle listener.
    pub fn subscribe(&self, listener: &Arc<dyn GraphListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Add a node. Never fails.
    pub fn add_node<P: Processor>(&mut self, processor: P) -> NodeId {
        self.add_boxed_node(Box::new(processor))
    }

    /// Add a boxed processor as a node. If processing has started the
    /// processor is prepared immediately.
    pub fn add_boxed_node(&mut self, mut processor: Box<dyn Processor>) -> NodeId {
        let block_size = self.prepared.map_or(0, |p| p.block_size);
        if let Some(p) = self.prepared {
            processor.on_start_processing(p.sample_rate, p.block_size);
        }
        let buffers = NodeBuffers::new(processor.as_ref(), block_size, self.midi_capacity);
        let name = processor.name().to_owned();
        let (index, generation) = self.nodes.insert(NodeEntry {
            processor,
            gain: 1.0,
            muted: false,
            buffers,
        });
        let id = NodeId { index, generation };
        self.rebuild_plan();
        tracing::debug!(node = ?id, name = %name, "node added");
        self.listeners.notify(|l| l.on_node_added(id, &name));
        id
    }

    /// Remove a node, tearing down every connection that touches it first.
    /// Returns the processor, or `None` for an unknown handle.
    pub fn remove_node(&mut self, node: NodeId) -> Option<Box<dyn Processor>> {
        let name = self.node(node)?.processor.name().to_owned();
        self.listeners.notify(|l| l.on_node_removing(node, &name));
        self.disconnect_node(node);

        let mut entry = self.nodes.remove(node.index, node.generation)?;
        if self.prepared.is_some() {
            entry.processor.on_stop_processing();
        }
        self.rebuild_plan();
        assert_invariant(
            NODE_REMOVAL_CLEAN,
            !self.connections.iter().any(|(_, _, c)| c.connection.touches(node)),
            "removed node left a connection behind",
            Some("remove_node"),
        );
        tracing::debug!(node = ?node, name = %name, "node removed");
        Some(entry.processor)
    }

    /// Connect `channel_count` audio channels.
    pub fn connect_audio(
        &mut self,
        upstream: NodeId,
        downstream: NodeId,
        upstream_channel: usize,
        downstream_channel: usize,
        channel_count: usize,
    ) -> Result<ConnectionId, GraphError> {
        let result = self
            .validate_audio(upstream, downstream, upstream_channel, downstream_channel, channel_count)
            .and_then(|connection| self.insert_connection(Connection::Audio(connection)));
        if let Err(err) = &result {
            tracing::warn!(?upstream, ?downstream, %err, "audio connection rejected");
        }
        result
    }

    /// Connect one MIDI output port to one MIDI input port.
    pub fn connect_midi(
        &mut self,
        upstream: NodeId,
        downstream: NodeId,
        upstream_port: usize,
        downstream_port: usize,
    ) -> Result<ConnectionId, GraphError> {
        let result = self
            .validate_midi(upstream, downstream, upstream_port, downstream_port)
            .and_then(|connection| self.insert_connection(Connection::Midi(connection)));
        if let Err(err) = &result {
            tracing::warn!(?upstream, ?downstream, %err, "midi connection rejected");
        }
        result
    }

    /// Remove every connection touching `node`. Returns whether anything was removed.
    pub fn disconnect_node(&mut self, node: NodeId) -> bool {
        let touching: Vec<(u32, u32)> = self
            .connections
            .iter()
            .filter(|(_, _, c)| c.connection.touches(node))
            .map(|(i, g, _)| (i, g))
            .collect();
        for &(index, generation) in &touching {
            if let Some(entry) = self.connections.remove(index, generation) {
                self.retire_connection(entry);
            }
        }
        if touching.is_empty() {
            return false;
        }
        self.rebuild_plan();
        tracing::debug!(node = ?node, removed = touching.len(), "node disconnected");
        true
    }

    /// Remove exactly one connection. Returns whether it existed.
    pub fn disconnect(&mut self, connection: ConnectionId) -> bool {
        let Some(entry) = self.connections.remove(connection.index, connection.generation) else {
            return false;
        };
        self.retire_connection(entry);
        self.rebuild_plan();
        tracing::debug!(connection = ?connection, "connection removed");
        true
    }

    /// Prepare every processor and size every buffer for `block_size` frames.
    pub fn start_processing(&mut self, sample_rate: f64, block_size: usize) {
        self.prepared = Some(Prepared {
            sample_rate,
            block_size,
        });
        for entry in self.nodes.values_mut() {
            entry.processor.on_start_processing(sample_rate, block_size);
            entry.buffers.resize_audio(block_size);
        }
        tracing::info!(sample_rate, block_size, nodes = self.nodes.len, "graph processing started");
    }

    /// Forward `on_stop_processing` to every processor.
    pub fn stop_processing(&mut self) {
        if self.prepared.take().is_none() {
            return;
        }
        for entry in self.nodes.values_mut() {
            entry.processor.on_stop_processing();
        }
        tracing::info!("graph processing stopped");
    }

    /// `true` between `start_processing` and `stop_processing`.
    pub fn is_processing(&self) -> bool {
        self.prepared.is_some()
    }

    /// Execute one sub-block over every node in dependency order.
    ///
    /// Returns the number of nodes whose processor failed and were silenced.
    /// A no-op before `start_processing`. Never allocates.
    pub fn process(&mut self, block: &SubBlock, device: &mut DeviceIo) -> usize {
        if self.prepared.is_none() {
            return 0;
        }
        let Self {
            nodes,
            connections,
            plan,
            failures,
            ..
        } = self;
        let mut failed = 0;

        for &index in &plan.order {
            let Some(entry) = nodes.slots[index].value.as_mut() else {
                continue;
            };
            entry.begin_sub_block(block.frames);

            for route in &plan.audio_routes[index] {
                let (src, dst) = pair_mut(&mut nodes.slots, route.upstream, index);
                let (Some(src), Some(dst)) = (src.value.as_ref(), dst.value.as_mut()) else {
                    continue;
                };
                dst.buffers.audio_in.add_from(
                    &src.buffers.audio_out,
                    route.upstream_channel,
                    route.downstream_channel,
                    route.count,
                );
            }

            for route in &plan.midi_routes[index] {
                let Some(buffer) = connections.slots[route.connection]
                    .value
                    .as_mut()
                    .and_then(|c| c.route.as_mut())
                else {
                    continue;
                };
                let (src, dst) = pair_mut(&mut nodes.slots, route.upstream, index);
                let (Some(src), Some(dst)) = (src.value.as_ref(), dst.value.as_mut()) else {
                    continue;
                };
                let (Some(output), Some(input)) = (
                    src.buffers.midi_out.get(route.upstream_port),
                    dst.buffers.midi_in.get_mut(route.downstream_port),
                ) else {
                    continue;
                };
                buffer.clear();
                for msg in output.events() {
                    buffer.push(*msg);
                    input.push(*msg);
                }
            }

            if let Some(entry) = nodes.slots[index].value.as_mut() {
                if !entry.run(block, device) {
                    failed += 1;
                }
            }
        }

        *failures += failed as u64;
        failed
    }

    /// Flush every MIDI connection: each sounding note gets a note-off at the
    /// start of the next sub-block. RT-safe.
    pub fn all_notes_off(&mut self) {
        let Self {
            nodes, connections, ..
        } = self;
        for slot in &mut connections.slots {
            let Some(ConnectionEntry {
                connection: Connection::Midi(midi),
                route: Some(route),
            }) = slot.value.as_mut()
            else {
                continue;
            };
            route.pop_note_stack();
            if let Some(port) = nodes
                .get_mut(midi.downstream.index, midi.downstream.generation)
                .and_then(|n| n.buffers.midi_in.get_mut(midi.downstream_port))
            {
                port.take_cached_from(route);
            }
        }
    }

    /// Drop all buffered audio, events, note state and cached note-offs. RT-safe.
    pub fn reset(&mut self) {
        for entry in self.nodes.values_mut() {
            let buffers = &mut entry.buffers;
            buffers.audio_in.clear();
            buffers.audio_out.clear();
            for port in buffers.midi_in.iter_mut().chain(buffers.midi_out.iter_mut()) {
                port.reset();
            }
        }
        for entry in self.connections.values_mut() {
            if let Some(route) = entry.route.as_mut() {
                route.reset();
            }
        }
    }

    /// Linear output gain of a node. Returns `false` for an unknown handle.
    pub fn set_gain(&mut self, node: NodeId, gain: f32) -> bool {
        self.node_mut(node).map(|n| n.gain = gain).is_some()
    }

    /// Output gain of a node.
    pub fn gain(&self, node: NodeId) -> Option<f32> {
        self.node(node).map(|n| n.gain)
    }

    /// Mute a node's audio output. Returns `false` for an unknown handle.
    pub fn set_muted(&mut self, node: NodeId, muted: bool) -> bool {
        self.node_mut(node).map(|n| n.muted = muted).is_some()
    }

    /// Whether a node's audio output is muted.
    pub fn is_muted(&self, node: NodeId) -> Option<bool> {
        self.node(node).map(|n| n.muted)
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len
    }

    /// `true` if `node` is a live handle of this graph.
    pub fn contains_node(&self, node: NodeId) -> bool {
        self.node(node).is_some()
    }

    /// Handles of all live nodes, in arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .map(|(index, generation, _)| NodeId { index, generation })
    }

    /// All live connections.
    pub fn connections(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.connections.iter().map(|(index, generation, e)| {
            (ConnectionId { index, generation }, &e.connection)
        })
    }

    /// Look up one connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections
            .get(id.index, id.generation)
            .map(|e| &e.connection)
    }

    /// Audio connections with `node` at either end.
    pub fn audio_connections_of(
        &self,
        node: NodeId,
    ) -> impl Iterator<Item = (ConnectionId, &AudioConnection)> {
        self.connections().filter_map(move |(id, c)| match c {
            Connection::Audio(a) if c.touches(node) => Some((id, a)),
            _ => None,
        })
    }

    /// Live nodes in execution order.
    pub fn execution_order(&self) -> Vec<NodeId> {
        self.plan
            .order
            .iter()
            .map(|&i| NodeId {
                index: i as u32,
                generation: self.nodes.slots[i].generation,
            })
            .collect()
    }

    /// The processor behind `node`.
    pub fn processor(&self, node: NodeId) -> Option<&dyn Processor> {
        self.node(node).map(|n| n.processor.as_ref())
    }

    /// The processor behind `node`, mutable.
    pub fn processor_mut(&mut self, node: NodeId) -> Option<&mut dyn Processor> {
        let entry = self.node_mut(node)?;
        Some(entry.processor.as_mut())
    }

    /// The processor behind `node` as its concrete type.
    pub fn processor_as<T: Processor>(&self, node: NodeId) -> Option<&T> {
        self.node(node)?.processor.as_ref().as_any().downcast_ref()
    }

    /// The processor behind `node` as its concrete type, mutable.
    pub fn processor_as_mut<T: Processor>(&mut self, node: NodeId) -> Option<&mut T> {
        self.node_mut(node)?.processor.as_mut().as_any_mut().downcast_mut()
    }

    /// Audio output of `node` from the last processed sub-block.
    pub fn audio_output(&self, node: NodeId) -> Option<&AudioBuffer> {
        self.node(node).map(|n| &n.buffers.audio_out)
    }

    /// One MIDI input port of `node` as seen by its last process call.
    pub fn midi_input(&self, node: NodeId, port: usize) -> Option<&EventBuffer> {
        self.node(node)?.buffers.midi_in.get(port)
    }

    /// One MIDI output port of `node` from the last processed sub-block.
    pub fn midi_output(&self, node: NodeId, port: usize) -> Option<&EventBuffer> {
        self.node(node)?.buffers.midi_out.get(port)
    }

    /// Total processor failures since creation.
    pub fn failure_count(&self) -> u64 {
        self.failures
    }

    fn node(&self, node: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(node.index, node.generation)
    }

    fn node_mut(&mut self, node: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(node.index, node.generation)
    }

    fn check_range(
        &self,
        node: NodeId,
        direction: BusDirection,
        midi: bool,
        start: usize,
        count: usize,
    ) -> Result<(), GraphError> {
        let entry = self.node(node).ok_or(GraphError::InvalidNode(node))?;
        let available = if midi {
            entry.processor.midi_channel_count(direction)
        } else {
            entry.processor.audio_channel_count(direction)
        };
        let end = start.saturating_add(count);
        if end > available {
            return Err(GraphError::ChannelOutOfRange {
                node,
                start,
                end,
                available,
            });
        }
        Ok(())
    }

    fn check_live(&self, node: NodeId) -> Result<(), GraphError> {
        self.node(node).map(|_| ()).ok_or(GraphError::InvalidNode(node))
    }

    fn validate_audio(
        &self,
        upstream: NodeId,
        downstream: NodeId,
        upstream_channel: usize,
        downstream_channel: usize,
        channel_count: usize,
    ) -> Result<AudioConnection, GraphError> {
        self.check_live(upstream)?;
        self.check_live(downstream)?;
        if channel_count == 0 {
            return Err(GraphError::ZeroChannelCount);
        }
        self.check_range(upstream, BusDirection::Output, false, upstream_channel, channel_count)?;
        self.check_range(downstream, BusDirection::Input, false, downstream_channel, channel_count)?;
        Ok(AudioConnection {
            upstream,
            downstream,
            upstream_channel,
            downstream_channel,
            channel_count,
        })
    }

    fn validate_midi(
        &self,
        upstream: NodeId,
        downstream: NodeId,
        upstream_port: usize,
        downstream_port: usize,
    ) -> Result<MidiConnection, GraphError> {
        self.check_live(upstream)?;
        self.check_live(downstream)?;
        self.check_range(upstream, BusDirection::Output, true, upstream_port, 1)?;
        self.check_range(downstream, BusDirection::Input, true, downstream_port, 1)?;
        Ok(MidiConnection {
            upstream,
            downstream,
            upstream_port,
            downstream_port,
        })
    }

    fn insert_connection(&mut self, connection: Connection) -> Result<ConnectionId, GraphError> {
        if self.connections.iter().any(|(_, _, e)| e.connection == connection) {
            assert_invariant(
                GRAPH_REJECTS_DUPLICATE,
                true,
                "duplicate connection rejected",
                Some("insert_connection"),
            );
            return Err(GraphError::DuplicateConnection);
        }
        let (upstream, downstream) = (connection.upstream(), connection.downstream());
        if upstream == downstream || self.reaches(downstream, upstream) {
            assert_invariant(
                GRAPH_REJECTS_CYCLE,
                true,
                "cycle rejected",
                Some("insert_connection"),
            );
            return Err(GraphError::CycleDetected);
        }

        let route = matches!(connection, Connection::Midi(_))
            .then(|| EventBuffer::with_capacity(self.midi_capacity));
        let (index, generation) = self.connections.insert(ConnectionEntry { connection, route });
        self.rebuild_plan();
        assert_invariant(
            GRAPH_LEGALITY,
            self.contains_node(upstream) && self.contains_node(downstream),
            "connection endpoints are live",
            Some("insert_connection"),
        );
        let id = ConnectionId { index, generation };
        tracing::debug!(connection = ?id, ?upstream, ?downstream, "connection added");
        Ok(id)
    }

    /// Flush the notes a MIDI connection carried into its downstream port.
    fn retire_connection(&mut self, entry: ConnectionEntry) {
        let ConnectionEntry { connection, route } = entry;
        let (Connection::Midi(midi), Some(mut route)) = (connection, route) else {
            return;
        };
        route.pop_note_stack();
        assert_invariant(
            NOTE_OFF_FLUSHED,
            route.notes().total() == 0,
            "note stack emptied on disconnect",
            Some("retire_connection"),
        );
        let flushed = route.cached_len();
        if let Some(port) = self
            .node_mut(midi.downstream)
            .and_then(|n| n.buffers.midi_in.get_mut(midi.downstream_port))
        {
            port.take_cached_from(&mut route);
        }
        if flushed > 0 {
            tracing::debug!(downstream = ?midi.downstream, flushed, "note-offs forwarded");
        }
    }

    /// `true` if a path of connections leads from `from` to `to`.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.slots.len()];
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if std::mem::replace(&mut visited[current.index()], true) {
                continue;
            }
            stack.extend(
                self.connections
                    .iter()
                    .map(|(_, _, e)| e.connection)
                    .filter(|c| c.upstream() == current)
                    .map(|c| c.downstream()),
            );
        }
        false
    }

    fn rebuild_plan(&mut self) {
        let live: Vec<bool> = self.nodes.slots.iter().map(|s| s.value.is_some()).collect();
        let edges: Vec<PlanEdge> = self
            .connections
            .iter()
            .map(|(index, _, e)| e.plan_edge(index as usize))
            .collect();
        match ExecutionPlan::compile(&live, &edges) {
            Ok(plan) => {
                assert_invariant(
                    PLAN_SOUNDNESS,
                    order_respects_edges(&plan.order, &edges, live.len()),
                    "execution order respects every edge",
                    Some("rebuild_plan"),
                );
                self.plan = plan;
            }
            Err(err) => {
                tracing::error!(?err, "execution plan rejected, keeping the previous one");
            }
        }
    }
}

impl Default for GraphProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphProcessor")
            .field("nodes", &self.nodes.len)
            .field("connections", &self.connections.len)
            .field("order", &self.plan.order)
            .field("prepared", &self.prepared)
            .finish()
    }
}

fn order_respects_edges(order: &[usize], edges: &[PlanEdge], slots: usize) -> bool {
    let mut position = vec![usize::MAX; slots];
    for (pos, &index) in order.iter().enumerate() {
        position[index] = pos;
    }
    edges.iter().all(|edge| {
        let (from, to) = match edge {
            PlanEdge::Audio { downstream, route } => (route.upstream, *downstream),
            PlanEdge::Midi { downstream, route } => (route.upstream, *downstream),
        };
        position[from] < position[to]
    })
}

/// Borrow `read` immutably and `write` mutably from the same slice.
fn pair_mut<T>(items: &mut [T], read: usize, write: usize) -> (&T, &mut T) {
    debug_assert_ne!(read, write);
    if read < write {
        let (head, tail) = items.split_at_mut(write);
        (&head[read], &mut tail[0])
    } else {
        let (head, tail) = items.split_at_mut(read);
        (&tail[0], &mut head[write])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::midi::MidiMessage;
    use crate::time::{Meter, Tempo, TempoMap};
    use crate::transport::Transporter;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Writes `value` to every output channel.
    struct Constant {
        value: f32,
        channels: usize,
    }

    impl Processor for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn audio_channel_count(&self, direction: BusDirection) -> usize {
            match direction {
                BusDirection::Input => 0,
                BusDirection::Output => self.channels,
            }
        }

        fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
            for ch in info.audio_out.channels_mut() {
                ch.fill(self.value);
            }
            Ok(())
        }
    }

    /// Copies inputs to outputs; optionally fails.
    struct Through {
        channels: usize,
        fail: bool,
    }

    impl Processor for Through {
        fn name(&self) -> &str {
            "through"
        }

        fn audio_channel_count(&self, _direction: BusDirection) -> usize {
            self.channels
        }

        fn midi_channel_count(&self, _direction: BusDirection) -> usize {
            1
        }

        fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
            info.audio_out.add_from(info.audio_in, 0, 0, self.channels);
            for msg in info.midi_in[0].events() {
                info.midi_out[0].push(*msg);
            }
            if self.fail {
                return Err(ProcessError::Failed("test failure"));
            }
            Ok(())
        }
    }

    fn through(channels: usize) -> Through {
        Through {
            channels,
            fail: false,
        }
    }

    fn sub_block(frames: usize) -> SubBlock {
        let tp = Transporter::new(TempoMap::new(48_000.0, 480, Tempo::default(), Meter::default()));
        SubBlock {
            transport: tp.current_state(),
            offset: 0,
            frames,
        }
    }

    fn run(graph: &mut GraphProcessor, frames: usize) -> usize {
        let mut io = DeviceIo::new(0, 0, frames);
        graph.process(&sub_block(frames), &mut io)
    }

    #[test]
    fn graph_cycle_detection() {
        let mut graph = GraphProcessor::new();
        let a = graph.add_node(through(1));
        let b = graph.add_node(through(1));
        let c = graph.add_node(through(1));
        graph.connect_audio(a, b, 0, 0, 1).unwrap();
        graph.connect_audio(b, c, 0, 0, 1).unwrap();
        assert_eq!(graph.connect_audio(c, a, 0, 0, 1), Err(GraphError::CycleDetected));
        assert_eq!(graph.connect_midi(c, a, 0, 0), Err(GraphError::CycleDetected));
        assert_eq!(graph.connect_audio(a, a, 0, 0, 1), Err(GraphError::CycleDetected));
        assert_eq!(graph.connection_count(), 2);
    }

    #[test]
    fn duplicate_connection_is_rejected_without_change() {
        let mut graph = GraphProcessor::new();
        let a = graph.add_node(Constant { value: 1.0, channels: 2 });
        let b = graph.add_node(through(2));
        graph.connect_audio(a, b, 0, 0, 2).unwrap();
        assert_eq!(
            graph.connect_audio(a, b, 0, 0, 2),
            Err(GraphError::DuplicateConnection)
        );
        assert_eq!(graph.connection_count(), 1);
        // different indices are a different connection
        assert!(graph.connect_audio(a, b, 1, 0, 1).is_ok());
    }

    #[test]
    fn channel_ranges_are_checked() {
        let mut graph = GraphProcessor::new();
        let a = graph.add_node(Constant { value: 1.0, channels: 2 });
        let b = graph.add_node(through(1));
        assert_eq!(
            graph.connect_audio(a, b, 1, 0, 2),
            Err(GraphError::ChannelOutOfRange {
                node: a,
                start: 1,
                end: 3,
                available: 2
            })
        );
        assert_eq!(graph.connect_audio(a, b, 0, 0, 0), Err(GraphError::ZeroChannelCount));
        assert!(matches!(
            graph.connect_midi(a, b, 0, 0),
            Err(GraphError::ChannelOutOfRange { node, .. }) if node == a
        ));
    }

    #[test]
    fn retired_handles_are_rejected() {
        let mut graph = GraphProcessor::new();
        let a = graph.add_node(through(1));
        let b = graph.add_node(through(1));
        assert!(graph.remove_node(a).is_some());
        assert!(graph.remove_node(a).is_none());
        let c = graph.add_node(through(1));
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(graph.connect_audio(a, b, 0, 0, 1), Err(GraphError::InvalidNode(a)));
        assert!(graph.connect_audio(c, b, 0, 0, 1).is_ok());
    }

    #[test]
    fn remove_node_tears_down_connections() {
        let mut graph = GraphProcessor::new();
        let a = graph.add_node(through(1));
        let b = graph.add_node(through(1));
        let c = graph.add_node(through(1));
        graph.connect_audio(a, b, 0, 0, 1).unwrap();
        graph.connect_midi(b, c, 0, 0).unwrap();
        graph.connect_audio(a, c, 0, 0, 1).unwrap();
        graph.remove_node(b).unwrap();
        assert_eq!(graph.connection_count(), 1);
        assert!(graph.connections().all(|(_, c)| !c.touches(b)));
        assert!(!graph.disconnect_node(b));
    }

    #[test]
    fn only_connected_channels_are_summed() {
        let mut graph = GraphProcessor::new();
        let src = graph.add_node(Constant { value: 0.5, channels: 2 });
        let src2 = graph.add_node(Constant { value: 0.25, channels: 1 });
        let dst = graph.add_node(through(2));
        graph.connect_audio(src, dst, 1, 0, 1).unwrap();
        graph.connect_audio(src2, dst, 0, 0, 1).unwrap();
        graph.start_processing(48_000.0, 64);
        run(&mut graph, 64);

        let out = graph.audio_output(dst).unwrap();
        assert!(out.channel(0).iter().all(|&s| s == 0.75));
        assert!(out.channel(1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn failing_processor_is_silenced_and_graph_continues() {
        let mut graph = GraphProcessor::new();
        let src = graph.add_node(Constant { value: 1.0, channels: 1 });
        let bad = graph.add_node(Through {
            channels: 1,
            fail: true,
        });
        let after = graph.add_node(through(1));
        graph.connect_audio(src, bad, 0, 0, 1).unwrap();
        graph.connect_audio(src, after, 0, 0, 1).unwrap();
        graph.start_processing(48_000.0, 32);

        assert_eq!(run(&mut graph, 32), 1);
        assert_eq!(graph.audio_output(bad).unwrap().peak(), 0.0);
        assert_eq!(graph.audio_output(after).unwrap().peak(), 1.0);
        assert_eq!(graph.failure_count(), 1);
    }

    #[test]
    fn gain_and_mute_apply_after_processing() {
        let mut graph = GraphProcessor::new();
        let src = graph.add_node(Constant { value: 1.0, channels: 1 });
        graph.start_processing(48_000.0, 16);
        assert!(graph.set_gain(src, 0.5));
        run(&mut graph, 16);
        assert_eq!(graph.audio_output(src).unwrap().peak(), 0.5);
        graph.set_muted(src, true);
        run(&mut graph, 16);
        assert_eq!(graph.audio_output(src).unwrap().peak(), 0.0);
        assert_eq!(graph.is_muted(src), Some(true));
    }

    #[test]
    fn process_before_start_is_a_no_op() {
        let mut graph = GraphProcessor::new();
        graph.add_node(Constant { value: 1.0, channels: 1 });
        assert_eq!(run(&mut graph, 16), 0);
    }

    /// Emits its queued messages in order, as many per sub-block as fit.
    struct NoteSource {
        queued: Vec<MidiMessage>,
    }

    impl Processor for NoteSource {
        fn name(&self) -> &str {
            "notes"
        }

        fn audio_channel_count(&self, _direction: BusDirection) -> usize {
            0
        }

        fn midi_channel_count(&self, direction: BusDirection) -> usize {
            match direction {
                BusDirection::Input => 0,
                BusDirection::Output => 1,
            }
        }

        fn process(&mut self, info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
            let mut sent = 0;
            for msg in &self.queued {
                if !info.midi_out[0].push(*msg) {
                    break;
                }
                sent += 1;
            }
            self.queued.drain(..sent);
            Ok(())
        }
    }

    #[test]
    fn disconnecting_midi_flushes_held_notes_downstream() {
        let mut graph = GraphProcessor::new();
        let src = graph.add_node(NoteSource {
            queued: vec![
                MidiMessage::note_on(0, 0, 60, 100),
                MidiMessage::note_on(3, 0, 64, 100),
                MidiMessage::note_on(5, 0, 67, 100),
                MidiMessage::note_off(9, 0, 67),
            ],
        });
        let dst = graph.add_node(through(0));
        let conn = graph.connect_midi(src, dst, 0, 0).unwrap();
        graph.start_processing(48_000.0, 16);

        run(&mut graph, 16);
        assert_eq!(graph.midi_input(dst, 0).unwrap().events().len(), 4);

        assert!(graph.disconnect(conn));
        run(&mut graph, 16);
        let offs: Vec<u8> = graph
            .midi_input(dst, 0)
            .unwrap()
            .events()
            .iter()
            .filter_map(|m| m.as_note_off())
            .collect();
        assert_eq!(offs, vec![60, 64]);

        // flushed once only
        run(&mut graph, 16);
        assert!(graph.midi_input(dst, 0).unwrap().events().is_empty());
    }

    #[test]
    fn disconnect_flushes_more_held_notes_than_a_port_holds() {
        let mut graph = GraphProcessor::with_midi_capacity(4);
        let src = graph.add_node(NoteSource {
            queued: (60..66).map(|p| MidiMessage::note_on(0, 0, p, 100)).collect(),
        });
        let dst = graph.add_node(through(0));
        let conn = graph.connect_midi(src, dst, 0, 0).unwrap();
        graph.start_processing(48_000.0, 16);

        run(&mut graph, 16);
        run(&mut graph, 16);
        assert_eq!(graph.midi_input(dst, 0).unwrap().events().len(), 2);

        assert!(graph.disconnect(conn));
        let mut offs = Vec::new();
        for expected in [4, 2, 0] {
            run(&mut graph, 16);
            let events = graph.midi_input(dst, 0).unwrap().events();
            assert_eq!(events.len(), expected);
            offs.extend(events.iter().filter_map(|m| m.as_note_off()));
        }
        assert_eq!(offs, (60..66).collect::<Vec<u8>>());
    }

    #[test]
    fn all_notes_off_flushes_without_disconnecting() {
        let mut graph = GraphProcessor::new();
        let src = graph.add_node(NoteSource {
            queued: vec![MidiMessage::note_on(0, 2, 48, 90)],
        });
        let dst = graph.add_node(through(0));
        graph.connect_midi(src, dst, 0, 0).unwrap();
        graph.start_processing(48_000.0, 16);
        run(&mut graph, 16);

        graph.all_notes_off();
        run(&mut graph, 16);
        let events = graph.midi_input(dst, 0).unwrap().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, 2);
        assert_eq!(events[0].as_note_off(), Some(48));
        assert_eq!(graph.connection_count(), 1);
    }

    #[derive(Default)]
    struct Lifecycle {
        events: Mutex<Vec<String>>,
    }

    impl GraphListener for Lifecycle {
        fn on_node_added(&self, _node: NodeId, name: &str) {
            self.events.lock().push(format!("added {name}"));
        }

        fn on_node_removing(&self, _node: NodeId, name: &str) {
            self.events.lock().push(format!("removing {name}"));
        }
    }

    #[test]
    fn listeners_observe_node_lifecycle() {
        let mut graph = GraphProcessor::new();
        let listener = Arc::new(Lifecycle::default());
        let as_dyn: Arc<dyn GraphListener> = listener.clone();
        let _sub = graph.subscribe(&as_dyn);
        let a = graph.add_node(through(1));
        graph.remove_node(a);
        assert_eq!(
            *listener.events.lock(),
            vec!["added through".to_string(), "removing through".to_string()]
        );
    }

    #[test]
    fn typed_processor_access() {
        let mut graph = GraphProcessor::new();
        let a = graph.add_node(Constant { value: 0.1, channels: 1 });
        graph.processor_as_mut::<Constant>(a).unwrap().value = 0.3;
        assert_eq!(graph.processor_as::<Constant>(a).unwrap().value, 0.3);
        assert!(graph.processor_as::<Through>(a).is_none());
        assert_eq!(graph.processor(a).unwrap().name(), "constant");
    }

    proptest! {
        #[test]
        fn execution_order_respects_random_dags(
            nodes in 2usize..10,
            edges in prop::collection::vec((0usize..10, 0usize..10), 0..30),
        ) {
            let mut graph = GraphProcessor::new();
            let ids: Vec<NodeId> = (0..nodes).map(|_| graph.add_node(through(1))).collect();
            for (a, b) in edges {
                let (a, b) = (a % nodes, b % nodes);
                // insert in reverse index order too, so arena order is not a topo order
                let _ = graph.connect_audio(ids[b.max(a)], ids[b.min(a)], 0, 0, 1);
            }
            let order = graph.execution_order();
            prop_assert_eq!(order.len(), nodes);
            for (_, c) in graph.connections() {
                let up = order.iter().position(|n| *n == c.upstream()).unwrap();
                let down = order.iter().position(|n| *n == c.downstream()).unwrap();
                prop_assert!(up < down);
            }
        }
    }
}
