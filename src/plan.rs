//! Plan module: compile graph topology into an execution plan.
//!
//! The plan is rebuilt on the mutator side after every topology change, so the
//! audio thread only ever walks precomputed, allocation-free tables.

use std::collections::VecDeque;

/// Audio input of a node: sum `count` channels of `upstream` into this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRoute {
    /// Arena index of the upstream node.
    pub upstream: usize,
    /// First upstream output channel.
    pub upstream_channel: usize,
    /// First downstream input channel.
    pub downstream_channel: usize,
    /// Channels carried.
    pub count: usize,
}

/// MIDI input of a node, carried by the connection at arena index `connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiRoute {
    /// Arena index of the connection (owns the routing buffer).
    pub connection: usize,
    /// Arena index of the upstream node.
    pub upstream: usize,
    /// Upstream output port.
    pub upstream_port: usize,
    /// Downstream input port.
    pub downstream_port: usize,
}

/// One edge as seen by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEdge {
    /// Audio edge into `downstream`.
    Audio {
        /// Arena index of the downstream node.
        downstream: usize,
        /// Route data.
        route: AudioRoute,
    },
    /// MIDI edge into `downstream`.
    Midi {
        /// Arena index of the downstream node.
        downstream: usize,
        /// Route data.
        route: MidiRoute,
    },
}

impl PlanEdge {
    fn endpoints(&self) -> (usize, usize) {
        match self {
            PlanEdge::Audio { downstream, route } => (route.upstream, *downstream),
            PlanEdge::Midi { downstream, route } => (route.upstream, *downstream),
        }
    }
}

/// The compiled plan: execution order and per-node input routes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    /// Live node indices, every upstream before its downstreams.
    pub order: Vec<usize>,
    /// Audio inputs per node index.
    pub audio_routes: Vec<Vec<AudioRoute>>,
    /// MIDI inputs per node index.
    pub midi_routes: Vec<Vec<MidiRoute>>,
}

/// Errors during plan compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The edges do not form a DAG.
    CycleDetected,
}

impl ExecutionPlan {
    /// Compile a plan over an arena of `slots` node slots where `live[i]`
    /// marks occupied slots.
    pub fn compile(live: &[bool], edges: &[PlanEdge]) -> Result<Self, PlanError> {
        let slots = live.len();
        let mut audio_routes = vec![Vec::new(); slots];
        let mut midi_routes = vec![Vec::new(); slots];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); slots];
        let mut in_degree = vec![0usize; slots];

        for edge in edges {
            let (from, to) = edge.endpoints();
            adj[from].push(to);
            in_degree[to] += 1;
            match *edge {
                PlanEdge::Audio { downstream, route } => audio_routes[downstream].push(route),
                PlanEdge::Midi { downstream, route } => midi_routes[downstream].push(route),
            }
        }

        let order = topo_sort(live, &adj, in_degree)?;
        Ok(Self {
            order,
            audio_routes,
            midi_routes,
        })
    }
}

/// Kahn's algorithm; ready nodes are taken in arena order for determinism.
fn topo_sort(live: &[bool], adj: &[Vec<usize>], mut in_degree: Vec<usize>) -> Result<Vec<usize>, PlanError> {
    let mut queue = VecDeque::new();
    for (i, &deg) in in_degree.iter().enumerate() {
        if live[i] && deg == 0 {
            queue.push_back(i);
        }
    }

    let mut order = Vec::new();
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    let live_count = live.iter().filter(|l| **l).count();
    if order.len() == live_count {
        Ok(order)
    } else {
        Err(PlanError::CycleDetected)
    }
}
