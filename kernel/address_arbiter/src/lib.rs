//! Futex-style wait/signal on 32-bit guest memory cells.
//!
//! An [`AddressArbiter`] lets guest threads block on the value published at
//! a guest virtual address and be woken when another thread signals that
//! address. It is the kernel half of the guest's user-space mutexes,
//! condition variables, and semaphores: the user-space fast path operates on
//! the cell directly, and falls into the arbiter only on contention.
//!
//! Every decision the arbiter makes (enrollment, wake selection, a waiter's
//! final result) happens under the global scheduler lock, so signals and
//! enrollments form a single total order. Reads and conditional updates of
//! the guest cell go through the per-core exclusive monitor, so the value a
//! signal decision is based on is the same value guest code observes.
//!
//! Waiters on one address wake in priority order, first-in-first-out among
//! equal priorities. A wait ends in exactly one way: woken by a signal
//! (`Ok`), expired (`TimedOut`), rejected up front (`InvalidState`,
//! `InvalidCurrentMemory`), or refused because the caller is shutting down
//! (`TerminationRequested`).

mod user_atomic;

pub mod svc;


use std::sync::Arc;

use guest_memory::{ExclusiveMonitor, GuestMemory, VAddr};
use kthread::{ThreadRef, ThreadState};
use log::{error, trace};
use scheduler::SchedulerLockAndSleep;
use spin::Mutex;
use svc_results::{SvcError, SvcResult};
use wait_tree::WaitTree;

/// Futex-style synchronization object, one per guest process.
///
/// The inner wait tree is guarded by its own mutex only to satisfy aliasing
/// rules; every access is serialized by the scheduler lock.
pub struct AddressArbiter {
    memory: Arc<GuestMemory>,
    monitor: Arc<ExclusiveMonitor>,
    waiters: Mutex<WaitTree<ThreadRef>>,
}

impl AddressArbiter {
    pub fn new(memory: Arc<GuestMemory>, monitor: Arc<ExclusiveMonitor>) -> Self {
        Self {
            memory,
            monitor,
            waiters: Mutex::new(WaitTree::new()),
        }
    }

    /// Wakes up to `count` waiters on `addr`; `count <= 0` wakes all.
    pub fn signal(&self, addr: VAddr, count: i32) -> SvcResult {
        let _sl = scheduler::lock();
        self.wake_batch(addr, count);
        Ok(())
    }

    /// Atomically increments the cell at `addr` from `value`, then wakes up
    /// to `count` waiters.
    ///
    /// Fails with `InvalidState` (cell untouched) if the cell does not hold
    /// `value`.
    pub fn signal_and_increment_if_equal(
        &self,
        addr: VAddr,
        value: i32,
        count: i32,
    ) -> SvcResult {
        let _sl = scheduler::lock();

        let user_value = user_atomic::update_if_equal(
            &self.memory,
            &self.monitor,
            current_core(),
            addr,
            value,
            value.wrapping_add(1),
        )
        .ok_or(SvcError::InvalidCurrentMemory)?;

        if user_value != value {
            return Err(SvcError::InvalidState);
        }

        self.wake_batch(addr, count);
        Ok(())
    }

    /// Adjusts the cell at `addr` based on how many waiters queue on it
    /// relative to `count`, then wakes up to `count` waiters.
    ///
    /// The stored value advertises the queue state to the user-space fast
    /// path: `value + 1` when nothing is queued, `value - 1` when this
    /// signal drains the queue, `value - 2` when a wake-all drains it, and
    /// `value` unchanged when waiters will remain.
    pub fn signal_and_modify_by_waiting_count_if_equal(
        &self,
        addr: VAddr,
        value: i32,
        count: i32,
    ) -> SvcResult {
        let _sl = scheduler::lock();

        let new_value = {
            let waiters = self.waiters.lock();
            let has_waiter = waiters.first_key_for(addr).is_some();
            if count <= 0 {
                if has_waiter {
                    value.wrapping_sub(2)
                } else {
                    value.wrapping_add(1)
                }
            } else if !has_waiter {
                value.wrapping_add(1)
            } else {
                // Count waiters beyond the first, stopping once `count` of
                // them have been seen.
                let extras = waiters.waiters_on(addr, count as usize + 1) - 1;
                if extras < count as usize {
                    value.wrapping_sub(1)
                } else {
                    value
                }
            }
        };

        let user_value = if new_value != value {
            user_atomic::update_if_equal(
                &self.memory,
                &self.monitor,
                current_core(),
                addr,
                value,
                new_value,
            )
        } else {
            user_atomic::read_from_user(&self.memory, addr)
        }
        .ok_or(SvcError::InvalidCurrentMemory)?;

        if user_value != value {
            return Err(SvcError::InvalidState);
        }

        self.wake_batch(addr, count);
        Ok(())
    }

    /// Blocks until `addr` is signaled, provided the cell holds a value
    /// less than `value`.
    ///
    /// With `decrement`, the cell is atomically decremented iff the
    /// comparison holds. A zero `timeout_ns` polls: the cell is still
    /// checked (and decremented), but the call reports `TimedOut` instead
    /// of blocking. A negative `timeout_ns` waits indefinitely.
    pub fn wait_if_less_than(
        &self,
        addr: VAddr,
        value: i32,
        decrement: bool,
        timeout_ns: i64,
    ) -> SvcResult {
        let cur_thread = scheduler::current_thread()
            .expect("address arbiter wait from a host thread with no guest thread");

        {
            let mut slp = SchedulerLockAndSleep::new(cur_thread.clone(), timeout_ns);

            if cur_thread.is_termination_requested() {
                slp.cancel_sleep();
                return Err(SvcError::TerminationRequested);
            }

            // Unless a signal overwrites it, the wait ends as a timeout.
            cur_thread.set_wait_result(Err(SvcError::TimedOut));

            let user_value = if decrement {
                user_atomic::decrement_if_less_than(
                    &self.memory,
                    &self.monitor,
                    cur_thread.core(),
                    addr,
                    value,
                )
            } else {
                user_atomic::read_from_user(&self.memory, addr)
            };
            let user_value = match user_value {
                Some(v) => v,
                None => {
                    slp.cancel_sleep();
                    return Err(SvcError::InvalidCurrentMemory);
                }
            };

            if user_value >= value {
                slp.cancel_sleep();
                return Err(SvcError::InvalidState);
            }

            if timeout_ns == 0 {
                slp.cancel_sleep();
                return Err(SvcError::TimedOut);
            }

            self.enroll(&cur_thread, addr);
        }

        self.finish_wait(&cur_thread)
    }

    /// Blocks until `addr` is signaled, provided the cell holds exactly
    /// `value`.
    ///
    /// Timeout semantics match [`wait_if_less_than`].
    ///
    /// [`wait_if_less_than`]: Self::wait_if_less_than
    pub fn wait_if_equal(&self, addr: VAddr, value: i32, timeout_ns: i64) -> SvcResult {
        let cur_thread = scheduler::current_thread()
            .expect("address arbiter wait from a host thread with no guest thread");

        {
            let mut slp = SchedulerLockAndSleep::new(cur_thread.clone(), timeout_ns);

            if cur_thread.is_termination_requested() {
                slp.cancel_sleep();
                return Err(SvcError::TerminationRequested);
            }

            cur_thread.set_wait_result(Err(SvcError::TimedOut));

            let user_value = match user_atomic::read_from_user(&self.memory, addr) {
                Some(v) => v,
                None => {
                    slp.cancel_sleep();
                    return Err(SvcError::InvalidCurrentMemory);
                }
            };

            if user_value != value {
                slp.cancel_sleep();
                return Err(SvcError::InvalidState);
            }

            if timeout_ns == 0 {
                slp.cancel_sleep();
                return Err(SvcError::TimedOut);
            }

            self.enroll(&cur_thread, addr);
        }

        self.finish_wait(&cur_thread)
    }

    /// Queues `thread` on `addr` and marks it waiting. Scheduler lock held.
    fn enroll(&self, thread: &ThreadRef, addr: VAddr) {
        debug_assert!(!thread.is_waiting_for_arbiter());
        let key = self
            .waiters
            .lock()
            .insert(addr, thread.priority(), thread.clone());
        thread.bind_arbiter(key);
        thread.set_state(ThreadState::Waiting);
    }

    /// Post-sleep half of a wait: retire the timer, self-erase if no signal
    /// dequeued us, and report the stored outcome.
    fn finish_wait(&self, thread: &ThreadRef) -> SvcResult {
        time_manager::unschedule_wakeup(thread);

        {
            let _sl = scheduler::lock();
            if let Some(key) = thread.clear_arbiter() {
                self.waiters.lock().remove(&key);
            }
        }

        thread.wait_result()
    }

    /// Dequeues and wakes up to `count` waiters on `addr` in tree order;
    /// `count <= 0` wakes all. Scheduler lock held.
    fn wake_batch(&self, addr: VAddr, count: i32) -> usize {
        let mut waiters = self.waiters.lock();
        let mut num_woken = 0;
        while count <= 0 || (num_woken as i32) < count {
            let (_, thread) = match waiters.take_first_for(addr) {
                Some(front) => front,
                None => break,
            };

            if !thread.is_waiting_for_arbiter() {
                error!("dequeued thread {} holds no arbiter binding", thread.id());
                debug_assert!(false);
            }
            thread.set_wait_result(Ok(()));
            thread.clear_arbiter();
            // An expired timer may already have made the thread runnable;
            // the result set above still decides the outcome.
            thread.wakeup();
            num_woken += 1;
        }
        trace!("woke {} waiter(s) on {:#x}", num_woken, addr);
        num_woken
    }

    /// Number of threads currently queued on `addr`.
    pub fn waiter_count(&self, addr: VAddr) -> usize {
        self.waiters.lock().waiters_on(addr, usize::MAX)
    }
}

impl Drop for AddressArbiter {
    fn drop(&mut self) {
        // An arbiter is torn down with its process, after every waiter left.
        debug_assert!(self.waiters.lock().is_empty());
    }
}

/// Exclusive-monitor slot of the emulated core the caller runs on.
fn current_core() -> usize {
    scheduler::current_thread()
        .map(|thread| thread.core())
        .unwrap_or(0)
}
