//! Wakeup-deadline bookkeeping for sleeping guest threads.
//!
//! Threads that block with a timeout are registered here with an absolute
//! deadline. Whoever notices time passing calls [`fire_due_wakeups`], which
//! wakes every thread whose deadline has been reached; in this hosted kernel
//! that caller is the sleep loop of the parked threads themselves.
//!
//! The queue is a priority queue keyed by deadline, with the earliest
//! deadline cached in an atomic so the common "nothing is due" poll skips
//! the lock entirely.
//!
//! Firing a wakeup deliberately does not touch the thread's stored wait
//! result: a timed-out waiter keeps the default result it set before going
//! to sleep, which is how expiry is distinguished from a real wake.

use core::cmp::Reverse;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hashbrown::hash_map::DefaultHashBuilder;
use kthread::ThreadRef;
use lazy_static::lazy_static;
use priority_queue::PriorityQueue;
use spin::Mutex;

lazy_static! {
    /// All threads with a pending wakeup, keyed by absolute deadline.
    static ref WAKEUP_QUEUE: Mutex<PriorityQueue<ThreadRef, Reverse<u64>, DefaultHashBuilder>> =
        Mutex::new(PriorityQueue::with_default_hasher());

    static ref EPOCH: Instant = Instant::now();
}

/// Earliest pending deadline, `u64::MAX` when the queue is empty.
static NEXT_WAKEUP_NS: AtomicU64 = AtomicU64::new(u64::MAX);

/// Nanoseconds of monotonic time since the kernel started.
pub fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Registers a wakeup for `thread` at the absolute time `deadline_ns`.
///
/// A thread has at most one pending wakeup; scheduling again replaces it.
pub fn schedule_wakeup(thread: ThreadRef, deadline_ns: u64) {
    let mut queue = WAKEUP_QUEUE.lock();
    queue.push(thread, Reverse(deadline_ns));
    if deadline_ns < NEXT_WAKEUP_NS.load(Ordering::SeqCst) {
        NEXT_WAKEUP_NS.store(deadline_ns, Ordering::SeqCst);
    }
}

/// Drops the pending wakeup for `thread`; no-op if it already fired.
pub fn unschedule_wakeup(thread: &ThreadRef) {
    let mut queue = WAKEUP_QUEUE.lock();
    queue.remove(thread);
    refresh_next_deadline(&queue);
}

/// Whether `thread` still has a wakeup pending.
pub fn is_scheduled(thread: &ThreadRef) -> bool {
    WAKEUP_QUEUE.lock().get(thread).is_some()
}

/// Wakes every thread whose deadline has been reached.
pub fn fire_due_wakeups() {
    let now = now_ns();
    if now < NEXT_WAKEUP_NS.load(Ordering::SeqCst) {
        return;
    }

    let mut queue = WAKEUP_QUEUE.lock();
    loop {
        let due = matches!(queue.peek(), Some((_, Reverse(deadline))) if *deadline <= now);
        if !due {
            break;
        }
        if let Some((thread, _)) = queue.pop() {
            thread.wakeup();
        }
    }
    refresh_next_deadline(&queue);
}

fn refresh_next_deadline(
    queue: &PriorityQueue<ThreadRef, Reverse<u64>, DefaultHashBuilder>,
) {
    let next = queue
        .peek()
        .map(|(_, Reverse(deadline))| *deadline)
        .unwrap_or(u64::MAX);
    NEXT_WAKEUP_NS.store(next, Ordering::SeqCst);
}
