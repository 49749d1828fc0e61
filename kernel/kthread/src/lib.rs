//! Guest kernel thread objects.
//!
//! A [`Thread`] carries the state a synchronization primitive needs to park
//! and wake it: an atomic run state, the result slot a waker fills in, and
//! the binding to the wait structure it is currently enrolled in (if any).
//! All of it is mutated under the global scheduler lock; the atomics and
//! small spinlocks here exist so the object stays data-race free regardless.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use log::warn;
use spin::Mutex;
use svc_results::SvcResult;
use wait_tree::WaitKey;

pub const HIGHEST_PRIORITY: u8 = 0;
pub const LOWEST_PRIORITY: u8 = 63;

/// Run state of a guest thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable = 0,
    Waiting = 1,
    Terminated = 2,
}

impl ThreadState {
    fn from_u8(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Runnable,
            1 => ThreadState::Waiting,
            _ => ThreadState::Terminated,
        }
    }
}

/// Why a waiting thread is parked; for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Arbitration,
    Sleep,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// A guest kernel thread.
pub struct Thread {
    id: u64,
    priority: u8,
    core: usize,
    state: AtomicU8,
    termination_requested: AtomicBool,
    wait_result: Mutex<SvcResult>,
    arbiter_key: Mutex<Option<WaitKey>>,
    wait_reason: Mutex<Option<WaitReason>>,
}

impl Thread {
    /// Creates a new runnable thread.
    ///
    /// `priority` ranges from [`HIGHEST_PRIORITY`] (0) to
    /// [`LOWEST_PRIORITY`] (63); lower numbers run and wake first. `core` is
    /// the emulated core the thread executes on, which selects its
    /// exclusive-monitor slot.
    pub fn new(priority: u8, core: usize) -> ThreadRef {
        debug_assert!(priority <= LOWEST_PRIORITY);
        ThreadRef(Arc::new(Thread {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            priority,
            core,
            state: AtomicU8::new(ThreadState::Runnable as u8),
            termination_requested: AtomicBool::new(false),
            wait_result: Mutex::new(Ok(())),
            arbiter_key: Mutex::new(None),
            wait_reason: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Transitions `Waiting` to `Runnable`.
    ///
    /// Returns whether the transition happened; a thread that was already
    /// runnable (e.g. a stale timer event racing a wake) is left alone.
    pub fn wakeup(&self) -> bool {
        match self.state.compare_exchange(
            ThreadState::Waiting as u8,
            ThreadState::Runnable as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(previous) => {
                if previous == ThreadState::Terminated as u8 {
                    warn!("wakeup of terminated thread {}", self.id);
                }
                false
            }
        }
    }

    pub fn request_termination(&self) {
        self.termination_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::SeqCst)
    }

    /// Presets the result a waker (or nobody) will leave behind.
    pub fn set_wait_result(&self, result: SvcResult) {
        *self.wait_result.lock() = result;
    }

    pub fn wait_result(&self) -> SvcResult {
        *self.wait_result.lock()
    }

    /// Records the wait-tree position this thread is enrolled at.
    pub fn bind_arbiter(&self, key: WaitKey) {
        *self.arbiter_key.lock() = Some(key);
        *self.wait_reason.lock() = Some(WaitReason::Arbitration);
    }

    /// Drops the arbiter binding, returning the enrolled position if the
    /// thread still held one.
    pub fn clear_arbiter(&self) -> Option<WaitKey> {
        *self.wait_reason.lock() = None;
        self.arbiter_key.lock().take()
    }

    pub fn is_waiting_for_arbiter(&self) -> bool {
        self.arbiter_key.lock().is_some()
    }

    pub fn wait_reason(&self) -> Option<WaitReason> {
        *self.wait_reason.lock()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("core", &self.core)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared handle to a [`Thread`].
///
/// Compares and hashes by thread id, so it can key queues and maps.
#[derive(Clone)]
pub struct ThreadRef(Arc<Thread>);

impl Deref for ThreadRef {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        &self.0
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ThreadRef {}

impl Hash for ThreadRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svc_results::SvcError;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = Thread::new(20, 0);
        let b = Thread::new(20, 0);
        assert!(a.id() < b.id());
        assert_ne!(a, b);
    }

    #[test]
    fn wakeup_only_moves_waiting_threads() {
        let t = Thread::new(20, 0);
        assert_eq!(t.state(), ThreadState::Runnable);
        assert!(!t.wakeup());

        t.set_state(ThreadState::Waiting);
        assert!(t.wakeup());
        assert_eq!(t.state(), ThreadState::Runnable);

        t.set_state(ThreadState::Terminated);
        assert!(!t.wakeup());
        assert_eq!(t.state(), ThreadState::Terminated);
    }

    #[test]
    fn wait_result_is_overwritable() {
        let t = Thread::new(20, 0);
        assert_eq!(t.wait_result(), Ok(()));
        t.set_wait_result(Err(SvcError::TimedOut));
        assert_eq!(t.wait_result(), Err(SvcError::TimedOut));
        t.set_wait_result(Ok(()));
        assert_eq!(t.wait_result(), Ok(()));
    }

    #[test]
    fn arbiter_binding_roundtrip() {
        let t = Thread::new(20, 0);
        assert!(!t.is_waiting_for_arbiter());
        assert_eq!(t.wait_reason(), None);

        let key = WaitKey {
            addr: 0x1000,
            priority: 20,
            seq: 0,
        };
        t.bind_arbiter(key);
        assert!(t.is_waiting_for_arbiter());
        assert_eq!(t.wait_reason(), Some(WaitReason::Arbitration));

        assert_eq!(t.clear_arbiter(), Some(key));
        assert!(!t.is_waiting_for_arbiter());
        assert_eq!(t.clear_arbiter(), None);
    }

    #[test]
    fn termination_is_sticky() {
        let t = Thread::new(20, 0);
        assert!(!t.is_termination_requested());
        t.request_termination();
        assert!(t.is_termination_requested());
    }
}
