use proptest::prelude::*;
use strata::error::{GraphError, ProcessError};
use strata::processor::{BusDirection, ProcessInfo, Processor};
use strata::{GraphProcessor, NodeId};

struct Node;

impl Processor for Node {
    fn name(&self) -> &str {
        "node"
    }

    fn audio_channel_count(&self, _direction: BusDirection) -> usize {
        2
    }

    fn midi_channel_count(&self, _direction: BusDirection) -> usize {
        1
    }

    fn process(&mut self, _info: &mut ProcessInfo<'_>) -> Result<(), ProcessError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Audio { from: usize, to: usize, channel: usize },
    Midi { from: usize, to: usize },
    Remove(usize),
    DisconnectNode(usize),
}

fn op(nodes: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..nodes, 0..nodes, 0..2usize).prop_map(|(from, to, channel)| Op::Audio { from, to, channel }),
        3 => (0..nodes, 0..nodes).prop_map(|(from, to)| Op::Midi { from, to }),
        1 => (0..nodes).prop_map(Op::Remove),
        1 => (0..nodes).prop_map(Op::DisconnectNode),
    ]
}

fn position(order: &[NodeId], node: NodeId) -> Option<usize> {
    order.iter().position(|&n| n == node)
}

proptest! {
    #[test]
    fn execution_order_respects_every_connection(ops in prop::collection::vec(op(8), 1..60)) {
        let mut graph = GraphProcessor::new();
        let nodes: Vec<NodeId> = (0..8).map(|_| graph.add_node(Node)).collect();

        for op in ops {
            let before = graph.connection_count();
            let result = match op {
                Op::Audio { from, to, channel } => {
                    graph.connect_audio(nodes[from], nodes[to], channel, channel, 1).map(|_| ())
                }
                Op::Midi { from, to } => graph.connect_midi(nodes[from], nodes[to], 0, 0).map(|_| ()),
                Op::Remove(n) => {
                    graph.remove_node(nodes[n]);
                    Ok(())
                }
                Op::DisconnectNode(n) => {
                    graph.disconnect_node(nodes[n]);
                    Ok(())
                }
            };
            match result {
                Ok(()) => {}
                Err(GraphError::CycleDetected | GraphError::DuplicateConnection | GraphError::InvalidNode(_)) => {
                    prop_assert_eq!(graph.connection_count(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }

            let order = graph.execution_order();
            prop_assert_eq!(order.len(), graph.node_count());
            for (_, connection) in graph.connections() {
                let up = position(&order, connection.upstream());
                let down = position(&order, connection.downstream());
                prop_assert!(up.is_some() && down.is_some());
                prop_assert!(up < down);
            }
        }
    }

    #[test]
    fn compiling_twice_gives_the_same_order(edges in prop::collection::vec((0..6usize, 0..6usize), 0..20)) {
        let build = || {
            let mut graph = GraphProcessor::new();
            let nodes: Vec<NodeId> = (0..6).map(|_| graph.add_node(Node)).collect();
            for &(from, to) in &edges {
                let _ = graph.connect_audio(nodes[from], nodes[to], 0, 0, 2);
            }
            graph.execution_order()
        };
        prop_assert_eq!(build(), build());
    }
}
