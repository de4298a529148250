//! The bypass protocol: guard/request exclusion.

use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata::bypass::{BypassFlag, Bypassed, ScopedBypassGuard, ScopedBypassRequest, WaitStrategy};

#[derive(Debug, Clone, Copy)]
enum Step {
    Request,
    Release,
    Guard,
    EndGuard,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Request),
        Just(Step::Release),
        Just(Step::Guard),
        Just(Step::EndGuard),
    ]
}

proptest! {
    #[test]
    fn guard_is_granted_iff_no_request_is_pending(steps in prop::collection::vec(step(), 1..200)) {
        let flag = BypassFlag::new();
        let mut requests = 0u32;
        let mut guarded = false;

        for step in steps {
            match step {
                Step::Request => {
                    flag.request();
                    requests += 1;
                }
                Step::Release if requests > 0 => {
                    flag.release_request();
                    requests -= 1;
                }
                Step::Release => {}
                Step::Guard if !guarded => {
                    let granted = flag.begin_guard(4);
                    prop_assert_eq!(granted, requests == 0);
                    guarded = granted;
                }
                Step::Guard => {}
                Step::EndGuard if guarded => {
                    flag.end_guard();
                    guarded = false;
                }
                Step::EndGuard => {}
            }
            let state = flag.state();
            prop_assert_eq!(state.pending_requests, requests);
            prop_assert_eq!(state.guard_active, guarded);
        }
    }
}

#[test]
fn scoped_types_restore_the_flag() {
    let flag = BypassFlag::new();
    {
        let _guard = ScopedBypassGuard::try_new(&flag, 1).unwrap();
        assert!(flag.state().guard_active);
        assert!(ScopedBypassGuard::try_new(&flag, 1).is_none());
    }
    {
        let _a = ScopedBypassRequest::new(&flag, None);
        let _b = ScopedBypassRequest::new(&flag, Some(&WaitStrategy::default()));
        assert_eq!(flag.state().pending_requests, 2);
        assert!(ScopedBypassGuard::try_new(&flag, 8).is_none());
    }
    assert_eq!(flag.state(), Default::default());
    assert!(ScopedBypassGuard::try_new(&flag, 1).is_some());
}

#[test]
fn mutator_waits_for_the_block_in_flight() {
    let flag = Arc::new(BypassFlag::new());
    assert!(flag.begin_guard(1));

    let entered = Arc::new(AtomicBool::new(false));
    let mutator = {
        let flag = Arc::clone(&flag);
        let entered = Arc::clone(&entered);
        thread::spawn(move || {
            let _request = ScopedBypassRequest::new(&flag, Some(&WaitStrategy::default()));
            entered.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!entered.load(Ordering::SeqCst));
    flag.end_guard();
    mutator.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
    assert_eq!(flag.state().pending_requests, 0);
}

#[test]
fn audio_and_mutators_never_overlap() {
    let shared = Arc::new(Bypassed::new(0u64, 4, WaitStrategy::default()));
    let inside = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let audio = {
        let shared = Arc::clone(&shared);
        let inside = Arc::clone(&inside);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut processed = 0u64;
            while !done.load(Ordering::Acquire) {
                if let Some(mut value) = shared.try_enter() {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    *value += 1;
                    processed += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
                thread::yield_now();
            }
            processed
        })
    };

    let mutators: Vec<_> = (0..3)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..200 {
                    let mut value = shared.lock();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    *value += 1_000_000;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for m in mutators {
        m.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let processed = audio.join().unwrap();

    let shared = Arc::try_unwrap(shared).unwrap();
    assert_eq!(shared.into_inner(), 600 * 1_000_000 + processed);
}
