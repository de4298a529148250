//! Non-blocking exclusion between the audio callback and mutator threads.
//!
//! The audio thread *guards* each block; mutators *request* a bypass. A guard
//! can only be raised while no request is pending, and a mutator only touches
//! shared state once it has observed the guard down while its own request was
//! pending. The audio side never waits: when a request is pending it drops the
//! block. Only mutators spin, yield and sleep.
//!
//! State has two independent dimensions, kept in one atomic word so that both
//! change in a single compare-and-swap:
//!
//! | dimension          | meaning                                      |
//! |--------------------|----------------------------------------------|
//! | `guard_active`     | an audio block is executing under the guard  |
//! | `pending_requests` | mutators that announced intent to mutate     |

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Decoded view of a [`BypassFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BypassState {
    /// An audio block currently holds the guard.
    pub guard_active: bool,
    /// Outstanding mutation requests.
    pub pending_requests: u32,
}

impl BypassState {
    const GUARD: u64 = 1 << 32;

    fn encode(self) -> u64 {
        let guard = if self.guard_active { Self::GUARD } else { 0 };
        guard | self.pending_requests as u64
    }

    fn decode(bits: u64) -> Self {
        Self {
            guard_active: bits & Self::GUARD != 0,
            pending_requests: (bits & u32::MAX as u64) as u32,
        }
    }
}

/// How a mutator waits: `spins` busy iterations, then `yields` thread yields,
/// then sleeps of `sleep` until the condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStrategy {
    /// Busy-spin iterations before yielding.
    pub spins: u32,
    /// `thread::yield_now` iterations before sleeping.
    pub yields: u32,
    /// Sleep interval once spinning and yielding were exhausted.
    pub sleep: Duration,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self {
            spins: 100,
            yields: 10,
            sleep: Duration::from_micros(500),
        }
    }
}

impl WaitStrategy {
    /// Block the calling (non-real-time) thread until `done` returns true.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut round: u64 = 0;
        while !done() {
            if round < self.spins as u64 {
                std::hint::spin_loop();
            } else if round < self.spins as u64 + self.yields as u64 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.sleep);
            }
            round = round.saturating_add(1);
        }
    }
}

/// Shared status word of the bypass protocol.
#[derive(Debug, Default)]
pub struct BypassFlag {
    bits: AtomicU64,
}

impl BypassFlag {
    /// Guard down, no requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current decoded state.
    pub fn state(&self) -> BypassState {
        BypassState::decode(self.bits.load(Ordering::Acquire))
    }

    /// Audio side: try to raise the guard.
    ///
    /// Fails immediately when a request is pending. Otherwise retries the
    /// compare-and-swap at most `max_attempts` times (a concurrent request can
    /// change the word between load and swap). Never blocks.
    pub fn begin_guard(&self, max_attempts: u32) -> bool {
        let mut current = self.bits.load(Ordering::Acquire);
        for _ in 0..max_attempts.max(1) {
            let state = BypassState::decode(current);
            if state.pending_requests > 0 || state.guard_active {
                return false;
            }
            let next = BypassState {
                guard_active: true,
                ..state
            };
            match self.bits.compare_exchange_weak(
                current,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Audio side: lower the guard.
    pub fn end_guard(&self) {
        self.update(|s| BypassState {
            guard_active: false,
            ..s
        });
    }

    /// Mutator side: announce a pending mutation.
    pub fn request(&self) {
        self.update(|s| BypassState {
            pending_requests: s.pending_requests.saturating_add(1),
            ..s
        });
    }

    /// Mutator side: withdraw one pending mutation.
    pub fn release_request(&self) {
        let prev = self.update(|s| BypassState {
            pending_requests: s.pending_requests.saturating_sub(1),
            ..s
        });
        if cfg!(debug_assertions) && prev.pending_requests == 0 {
            tracing::warn!("bypass request released without a matching request");
        }
    }

    /// Mutator side: wait until the audio thread is outside its guard.
    pub fn wait_for_guard_clear(&self, strategy: &WaitStrategy) {
        strategy.wait_until(|| !self.state().guard_active);
    }

    /// Wait until every outstanding request has been released.
    pub fn wait_for_all_requests_released(&self, strategy: &WaitStrategy) {
        strategy.wait_until(|| self.state().pending_requests == 0);
    }

    fn update(&self, f: impl Fn(BypassState) -> BypassState) -> BypassState {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let state = BypassState::decode(current);
            let next = f(state).encode();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return state,
                Err(actual) => current = actual,
            }
        }
    }
}

/// RAII guard held by the audio thread for one block.
#[derive(Debug)]
pub struct ScopedBypassGuard<'a> {
    flag: &'a BypassFlag,
}

impl<'a> ScopedBypassGuard<'a> {
    /// Raise the guard, or return `None` if a mutation is pending.
    pub fn try_new(flag: &'a BypassFlag, max_attempts: u32) -> Option<Self> {
        flag.begin_guard(max_attempts).then(|| Self { flag })
    }
}

impl Drop for ScopedBypassGuard<'_> {
    fn drop(&mut self) {
        self.flag.end_guard();
    }
}

/// RAII request held by a mutator thread.
#[derive(Debug)]
pub struct ScopedBypassRequest<'a> {
    flag: &'a BypassFlag,
}

impl<'a> ScopedBypassRequest<'a> {
    /// Raise a request. With `wait`, also wait until the guard is down, after
    /// which the shared state may be mutated until this request is dropped.
    pub fn new(flag: &'a BypassFlag, wait: Option<&WaitStrategy>) -> Self {
        flag.request();
        if let Some(strategy) = wait {
            flag.wait_for_guard_clear(strategy);
        }
        Self { flag }
    }
}

impl Drop for ScopedBypassRequest<'_> {
    fn drop(&mut self) {
        self.flag.release_request();
    }
}

/// A value shared between the audio thread and mutators under the bypass
/// protocol.
///
/// The audio thread reaches the value with [`try_enter`](Self::try_enter),
/// which never blocks. Mutators reach it with [`lock`](Self::lock); they are
/// serialized among themselves by a mutex the audio thread never touches.
pub struct Bypassed<T> {
    flag: BypassFlag,
    mutators: Mutex<()>,
    value: UnsafeCell<T>,
    guard_attempts: u32,
    wait: WaitStrategy,
}

// SAFETY: access to `value` is exclusive: the audio side holds the guard only
// while no request is pending, and a mutator proceeds only after observing the
// guard down with its request raised; mutators exclude each other via
// `mutators`. `T: Send` is required because the value is used from both threads.
unsafe impl<T: Send> Sync for Bypassed<T> {}

impl<T> Bypassed<T> {
    /// Wrap `value`.
    pub fn new(value: T, guard_attempts: u32, wait: WaitStrategy) -> Self {
        Self {
            flag: BypassFlag::new(),
            mutators: Mutex::new(()),
            value: UnsafeCell::new(value),
            guard_attempts,
            wait,
        }
    }

    /// The underlying status word.
    pub fn flag(&self) -> &BypassFlag {
        &self.flag
    }

    /// Audio side: exclusive access for one block, or `None` when a mutation
    /// is pending.
    pub fn try_enter(&self) -> Option<BypassEntry<'_, T>> {
        let guard = ScopedBypassGuard::try_new(&self.flag, self.guard_attempts)?;
        Some(BypassEntry {
            _guard: guard,
            value: &self.value,
        })
    }

    /// Mutator side: exclusive access, waiting for the current block to end.
    pub fn lock(&self) -> BypassLock<'_, T> {
        let serial = self.mutators.lock();
        let request = ScopedBypassRequest::new(&self.flag, Some(&self.wait));
        BypassLock {
            _request: request,
            _serial: serial,
            value: &self.value,
        }
    }

    /// Exclusive access through a unique borrow; no protocol needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> std::fmt::Debug for Bypassed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bypassed")
            .field("state", &self.flag.state())
            .finish_non_exhaustive()
    }
}

/// Audio-side access for one block.
pub struct BypassEntry<'a, T> {
    _guard: ScopedBypassGuard<'a>,
    value: &'a UnsafeCell<T>,
}

impl<T> Deref for BypassEntry<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard is up and no request is pending (see `Bypassed`).
        unsafe { &*self.value.get() }
    }
}

impl<T> DerefMut for BypassEntry<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` prevents aliasing through this entry.
        unsafe { &mut *self.value.get() }
    }
}

/// Mutator-side access. Dropping it releases the request.
pub struct BypassLock<'a, T> {
    // Field order matters: the request must be released before the next
    // mutator is let in, so it drops first.
    _request: ScopedBypassRequest<'a>,
    _serial: parking_lot::MutexGuard<'a, ()>,
    value: &'a UnsafeCell<T>,
}

impl<T> Deref for BypassLock<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: request raised and guard observed down; other mutators are
        // excluded by the serial lock.
        unsafe { &*self.value.get() }
    }
}

impl<T> DerefMut for BypassLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    #[test]
    fn state_dimensions_are_independent() {
        let s = BypassState {
            guard_active: true,
            pending_requests: 7,
        };
        assert_eq!(BypassState::decode(s.encode()), s);
        assert_eq!(BypassState::decode(0), BypassState::default());
    }

    #[test]
    fn guard_fails_while_request_pending() {
        let flag = BypassFlag::new();
        flag.request();
        assert!(!flag.begin_guard(4));
        flag.release_request();
        assert!(flag.begin_guard(4));
        assert!(flag.state().guard_active);
        flag.end_guard();
        assert_eq!(flag.state(), BypassState::default());
    }

    #[test]
    fn scoped_guard_releases_on_drop() {
        let flag = BypassFlag::new();
        {
            let _g = ScopedBypassGuard::try_new(&flag, 1).expect("guard");
            assert!(ScopedBypassGuard::try_new(&flag, 1).is_none());
        }
        assert!(!flag.state().guard_active);
    }

    #[test]
    fn scoped_guard_releases_on_unwind() {
        let flag = BypassFlag::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = ScopedBypassGuard::try_new(&flag, 1).expect("guard");
            panic!("block exploded");
        }));
        assert!(result.is_err());
        assert!(!flag.state().guard_active);
    }

    #[test]
    fn requests_nest() {
        let flag = BypassFlag::new();
        let a = ScopedBypassRequest::new(&flag, None);
        let b = ScopedBypassRequest::new(&flag, None);
        assert_eq!(flag.state().pending_requests, 2);
        drop(a);
        assert!(!flag.begin_guard(1));
        drop(b);
        assert!(flag.begin_guard(1));
    }

    #[test]
    fn wait_for_all_requests_released_returns_once_drained() {
        let flag = Arc::new(BypassFlag::new());
        flag.request();
        let releaser = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                flag.release_request();
            })
        };
        flag.wait_for_all_requests_released(&WaitStrategy::default());
        assert_eq!(flag.state().pending_requests, 0);
        releaser.join().unwrap();
    }

    #[test]
    fn mutator_and_audio_never_overlap() {
        let shared = Arc::new(Bypassed::new(0u64, 4, WaitStrategy::default()));
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let audio = {
            let (shared, inside, overlaps, stop) =
                (shared.clone(), inside.clone(), overlaps.clone(), stop.clone());
            std::thread::spawn(move || {
                let mut processed = 0u64;
                while !stop.load(Ordering::Acquire) {
                    if let Some(mut v) = shared.try_enter() {
                        if inside.swap(true, Ordering::AcqRel) {
                            overlaps.fetch_add(1, Ordering::Relaxed);
                        }
                        *v += 1;
                        processed += 1;
                        inside.store(false, Ordering::Release);
                    }
                }
                processed
            })
        };

        for _ in 0..200 {
            let mut v = shared.lock();
            if inside.swap(true, Ordering::AcqRel) {
                overlaps.fetch_add(1, Ordering::Relaxed);
            }
            *v += 1_000_000;
            inside.store(false, Ordering::Release);
        }
        stop.store(true, Ordering::Release);
        let processed = audio.join().unwrap();

        assert_eq!(overlaps.load(Ordering::Relaxed), 0);
        let total = *shared.lock();
        assert_eq!(total, 200 * 1_000_000 + processed);
    }
}
