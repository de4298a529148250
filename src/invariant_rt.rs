//! RT-safe invariant signaling for the audio callback.
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! The audio side pushes `u8` ids into a lock-free SPSC queue; the controller
//! drains them and contract tests check which facts were observed. Signals are
//! dropped when the queue is full.
//!
//! ```ignore
//! signal_invariant(&mut tx, INV_BLOCK_PROCESSED);
//! let signals = drain_invariant_signals(&mut rx);
//! assert!(signals.contains(&INV_BLOCK_PROCESSED));
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

/// A block was traversed and the graph ran.
pub const INV_BLOCK_PROCESSED: u8 = 1;
/// A block was emitted as silence because the graph was being edited.
pub const INV_BLOCK_SKIPPED: u8 = 2;
/// The transport wrapped from loop end to loop begin.
pub const INV_LOOP_WRAPPED: u8 = 3;
/// A position commit lost against a concurrent transport move.
pub const INV_COMMIT_DISCARDED: u8 = 4;
/// A control message was applied at the start of a block.
pub const INV_CONTROL_MSG_APPLIED: u8 = 5;
/// A node's process call failed and its outputs were silenced.
pub const INV_NODE_FAILED: u8 = 6;
/// The callback returned without panicking.
pub const INV_RT_CALLBACK_CLEAN: u8 = 7;

/// Capacity of the signal queue; several blocks' worth between drains.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Creates a new invariant signal queue pair: (RT producer, controller consumer).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals an invariant from the RT path. Never blocks or allocates.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

/// Signals an invariant `count` times, capped at 16 per call.
#[inline]
pub fn signal_invariant_n(tx: &mut Producer<u8>, id: u8, count: usize) {
    for _ in 0..count.min(16) {
        let _ = tx.push(id);
    }
}

/// Drains all pending invariant signals.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Asserts that every `required` invariant was signaled at least once.
///
/// # Panics
/// Panics listing the missing and present invariant names.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|id| counts[**id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_BLOCK_PROCESSED => "BLOCK_PROCESSED",
        INV_BLOCK_SKIPPED => "BLOCK_SKIPPED",
        INV_LOOP_WRAPPED => "LOOP_WRAPPED",
        INV_COMMIT_DISCARDED => "COMMIT_DISCARDED",
        INV_CONTROL_MSG_APPLIED => "CONTROL_MSG_APPLIED",
        INV_NODE_FAILED => "NODE_FAILED",
        INV_RT_CALLBACK_CLEAN => "RT_CALLBACK_CLEAN",
        _ => "UNKNOWN",
    }
}
