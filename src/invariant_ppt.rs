//! PPT invariant system: mutator-side invariant enforcement with contract tracking.
//!
//! Only called off the audio thread; the audio side uses [`crate::invariant_rt`].

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

/// Every connection references live nodes and valid channel/port ranges.
pub const GRAPH_LEGALITY: u32 = 1;
/// A connection closing a cycle was refused.
pub const GRAPH_REJECTS_CYCLE: u32 = 2;
/// A connection identical to an existing one was refused.
pub const GRAPH_REJECTS_DUPLICATE: u32 = 3;
/// The execution order lists every upstream before its downstreams.
pub const PLAN_SOUNDNESS: u32 = 4;
/// A removed node left no connection behind.
pub const NODE_REMOVAL_CLEAN: u32 = 5;
/// A disconnected MIDI route flushed note-offs for every sounding note.
pub const NOTE_OFF_FLUSHED: u32 = 6;
/// Transport sample and tick positions agree and are non-negative.
pub const TRANSPORT_POSITION_SYNCED: u32 = 7;
/// A topology edit ran with the audio side locked out.
pub const BYPASS_EXCLUSIVE_EDIT: u32 = 8;
/// Engine configuration passed validation before use.
pub const CONFIG_VALIDATED: u32 = 9;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = match context {
            Some(ctx) => format!("Invariant {} failed: {} (context: {})", id, message, ctx),
            None => format!("Invariant {} failed: {}", id, message),
        };
        tracing::error!(invariant = id, "{}", full_message);
        panic!("{}", full_message);
    }
    INVARIANT_LOG.lock().insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {}", message);
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let missing: Vec<u32> = {
        let log = INVARIANT_LOG.lock();
        required_invariants
            .iter()
            .copied()
            .filter(|inv| !log.contains(inv))
            .collect()
    };
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG.lock().clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
