//! The global scheduler lock and the blocking machinery built on it.
//!
//! Every wait-structure mutation, thread state transition, and wake decision
//! in the kernel happens under one global lock, taken through [`lock`]. A
//! blocking syscall instead constructs a [`SchedulerLockAndSleep`]: dropping
//! it arms the wakeup timer, releases the lock, and parks the calling host
//! thread until the guest thread leaves the `Waiting` state. From a waker's
//! point of view the release and the park are indivisible, because waking
//! requires the same lock the sleeper held while marking itself `Waiting`.
//!
//! Guest threads are backed by host threads; [`adopt`] records which guest
//! thread the calling host thread is executing.

use std::cell::RefCell;

use kthread::{Thread, ThreadRef, ThreadState};
use log::warn;
use spin::{Mutex, MutexGuard};

static SCHEDULER_LOCK: Mutex<()> = Mutex::new(());

/// Holds the global scheduler lock for its lifetime.
pub struct SchedulerLockGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Acquires the global scheduler lock.
pub fn lock() -> SchedulerLockGuard {
    SchedulerLockGuard {
        _guard: SCHEDULER_LOCK.lock(),
    }
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<ThreadRef>> = RefCell::new(None);
}

/// Registers `thread` as the guest thread the calling host thread executes.
pub fn adopt(thread: ThreadRef) {
    CURRENT_THREAD.with(|current| {
        if let Some(previous) = current.replace(Some(thread)) {
            warn!("host thread re-adopted over guest thread {}", previous.id());
        }
    });
}

/// The guest thread the calling host thread executes, if any.
pub fn current_thread() -> Option<ThreadRef> {
    CURRENT_THREAD.with(|current| current.borrow().clone())
}

/// Creates a guest thread and a host thread executing `f` as it.
///
/// The guest thread is marked `Terminated` once `f` returns.
pub fn spawn_guest_thread<F, R>(
    priority: u8,
    core: usize,
    f: F,
) -> (ThreadRef, std::thread::JoinHandle<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let thread = Thread::new(priority, core);
    let executing = thread.clone();
    let handle = std::thread::spawn(move || {
        adopt(executing.clone());
        let result = f();
        executing.set_state(ThreadState::Terminated);
        result
    });
    (thread, handle)
}

/// Scheduler lock acquisition fused with a pending sleep.
///
/// The caller does its checks and enrollment under the lock, marks the
/// thread `Waiting`, and lets the session drop; the drop arms the timer
/// (if a finite timeout was given), releases the lock, and parks until the
/// thread is woken. Calling [`cancel_sleep`] instead turns the drop into a
/// plain unlock, for paths that bail out before blocking.
///
/// A zero timeout never blocks: callers resolve it before enrolling. A
/// negative timeout sleeps with no deadline.
///
/// [`cancel_sleep`]: SchedulerLockAndSleep::cancel_sleep
pub struct SchedulerLockAndSleep {
    guard: Option<MutexGuard<'static, ()>>,
    thread: ThreadRef,
    timeout_ns: i64,
    cancelled: bool,
}

impl SchedulerLockAndSleep {
    pub fn new(thread: ThreadRef, timeout_ns: i64) -> Self {
        Self {
            guard: Some(SCHEDULER_LOCK.lock()),
            thread,
            timeout_ns,
            cancelled: false,
        }
    }

    pub fn cancel_sleep(&mut self) {
        self.cancelled = true;
    }
}

impl Drop for SchedulerLockAndSleep {
    fn drop(&mut self) {
        if !self.cancelled && self.timeout_ns > 0 {
            let deadline = time_manager::now_ns().saturating_add(self.timeout_ns as u64);
            time_manager::schedule_wakeup(self.thread.clone(), deadline);
        }

        self.guard.take();

        if self.cancelled {
            return;
        }

        while self.thread.state() == ThreadState::Waiting {
            time_manager::fire_due_wakeups();
            std::thread::yield_now();
        }
    }
}
