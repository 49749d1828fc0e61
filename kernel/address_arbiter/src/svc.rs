//! Syscall-facing entry points for address arbitration.
//!
//! Guest code reaches the arbiter through two syscalls, each carrying a raw
//! operation selector. This module validates the cell address and the
//! selector before anything touches the arbiter: the arbiter itself assumes
//! a 4-byte-aligned user-space address.

use guest_memory::VAddr;
use svc_results::{SvcError, SvcResult};

use crate::AddressArbiter;

/// Start of the guest kernel's reserved address region; user cells must lie
/// below it.
pub const KERNEL_REGION_BASE: VAddr = 0xFFFF_FF80_0000_0000;

/// Wait-side operation selector carried by the wait syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationType {
    WaitIfLessThan = 0,
    DecrementAndWaitIfLessThan = 1,
    WaitIfEqual = 2,
}

impl TryFrom<u32> for ArbitrationType {
    type Error = SvcError;

    fn try_from(raw: u32) -> Result<Self, SvcError> {
        match raw {
            0 => Ok(ArbitrationType::WaitIfLessThan),
            1 => Ok(ArbitrationType::DecrementAndWaitIfLessThan),
            2 => Ok(ArbitrationType::WaitIfEqual),
            _ => Err(SvcError::InvalidEnumValue),
        }
    }
}

/// Signal-side operation selector carried by the signal syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Signal = 0,
    SignalAndIncrementIfEqual = 1,
    SignalAndModifyByWaitingCountIfEqual = 2,
}

impl TryFrom<u32> for SignalType {
    type Error = SvcError;

    fn try_from(raw: u32) -> Result<Self, SvcError> {
        match raw {
            0 => Ok(SignalType::Signal),
            1 => Ok(SignalType::SignalAndIncrementIfEqual),
            2 => Ok(SignalType::SignalAndModifyByWaitingCountIfEqual),
            _ => Err(SvcError::InvalidEnumValue),
        }
    }
}

fn validate_address(addr: VAddr) -> SvcResult {
    if addr >= KERNEL_REGION_BASE {
        return Err(SvcError::InvalidCurrentMemory);
    }
    if addr % 4 != 0 {
        return Err(SvcError::InvalidAddress);
    }
    Ok(())
}

/// Entry point of the wait syscall.
pub fn wait_for_address(
    arbiter: &AddressArbiter,
    addr: VAddr,
    arb_type: u32,
    value: i32,
    timeout_ns: i64,
) -> SvcResult {
    validate_address(addr)?;
    match ArbitrationType::try_from(arb_type)? {
        ArbitrationType::WaitIfLessThan => {
            arbiter.wait_if_less_than(addr, value, false, timeout_ns)
        }
        ArbitrationType::DecrementAndWaitIfLessThan => {
            arbiter.wait_if_less_than(addr, value, true, timeout_ns)
        }
        ArbitrationType::WaitIfEqual => arbiter.wait_if_equal(addr, value, timeout_ns),
    }
}

/// Entry point of the signal syscall.
pub fn signal_to_address(
    arbiter: &AddressArbiter,
    addr: VAddr,
    signal_type: u32,
    value: i32,
    count: i32,
) -> SvcResult {
    validate_address(addr)?;
    match SignalType::try_from(signal_type)? {
        SignalType::Signal => arbiter.signal(addr, count),
        SignalType::SignalAndIncrementIfEqual => {
            arbiter.signal_and_increment_if_equal(addr, value, count)
        }
        SignalType::SignalAndModifyByWaitingCountIfEqual => {
            arbiter.signal_and_modify_by_waiting_count_if_equal(addr, value, count)
        }
    }
}
