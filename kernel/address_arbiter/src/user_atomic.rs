//! Conditional read-modify-write on guest cells, through the exclusive
//! monitor.
//!
//! Each operation returns the cell value observed *before* any
//! modification, or `None` when the cell is unreadable. A comparison is
//! only ever made against the same 32 bits a successful store would
//! replace: the value comes from an exclusive read, and a store that loses
//! its reservation restarts the whole read rather than reusing a stale
//! value.

use guest_memory::{ExclusiveMonitor, GuestMemory, VAddr};

/// Lost-reservation count after which a retry gives up its timeslice.
const STORE_RETRIES_BEFORE_YIELD: u32 = 64;

pub(crate) fn read_from_user(memory: &GuestMemory, addr: VAddr) -> Option<i32> {
    memory.read_u32(addr).map(|value| value as i32)
}

/// If the cell holds a value less than `value`, decrements it.
pub(crate) fn decrement_if_less_than(
    memory: &GuestMemory,
    monitor: &ExclusiveMonitor,
    core: usize,
    addr: VAddr,
    value: i32,
) -> Option<i32> {
    let mut lost_stores = 0;
    loop {
        let current = monitor.exclusive_read32(memory, core, addr)? as i32;
        if current < value {
            if monitor.exclusive_write32(memory, core, addr, current.wrapping_sub(1) as u32)? {
                return Some(current);
            }
        } else {
            monitor.clear_exclusive(core);
            return Some(current);
        }
        backoff(&mut lost_stores);
    }
}

/// If the cell holds exactly `value`, replaces it with `new_value`.
pub(crate) fn update_if_equal(
    memory: &GuestMemory,
    monitor: &ExclusiveMonitor,
    core: usize,
    addr: VAddr,
    value: i32,
    new_value: i32,
) -> Option<i32> {
    let mut lost_stores = 0;
    loop {
        let current = monitor.exclusive_read32(memory, core, addr)? as i32;
        if current == value {
            if monitor.exclusive_write32(memory, core, addr, new_value as u32)? {
                return Some(current);
            }
        } else {
            monitor.clear_exclusive(core);
            return Some(current);
        }
        backoff(&mut lost_stores);
    }
}

fn backoff(lost_stores: &mut u32) {
    *lost_stores += 1;
    if *lost_stores >= STORE_RETRIES_BEFORE_YIELD {
        std::thread::yield_now();
    } else {
        core::hint::spin_loop();
    }
}
