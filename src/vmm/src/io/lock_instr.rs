// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Split-lock instruction emulation.
//!
//! A locked instruction (`lock xadd`, `lock cmpxchg`, ...) whose operand
//! straddles a cache-line boundary traps out to the hypervisor on real
//! hardware (an alignment-check/`#AC` style exit) because the atomicity
//! guarantee can't be honored across two cache lines. Grounded on the
//! decode-and-inject flow of `vmx_io.c`'s EPT-violation handler: a decode
//! failure injects `#PF`, an unrecognized opcode is left as `#UD` for the
//! caller to raise, and a confirmed split-lock is either emulated in place
//! (single-step, non-atomically, with a warning) or re-injected as `#AC`
//! depending on policy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockInstrAction {
    /// Emulate the access without atomicity (acceptable for a device
    /// register access that the guest won't actually race against).
    EmulateNonAtomic,
    /// Re-inject `#AC` (Alignment Check) so the guest's own handler, if it
    /// has one, can deal with it.
    InjectAlignmentCheck,
    /// The decoder could not identify a locked instruction at the faulting
    /// address at all; inject `#PF` as the original does for failed fetch.
    InjectPageFault,
    /// Opcode decoded but isn't a recognized locked form; leave `#UD`
    /// injection to the caller.
    Undecoded,
}

#[derive(Debug, Clone, Copy)]
pub struct LockAccess {
    pub addr: u64,
    pub size: u8,
}

const CACHE_LINE: u64 = 64;

/// Returns true when `[addr, addr+size)` straddles a 64-byte line.
pub fn is_split_lock(access: LockAccess) -> bool {
    let start_line = access.addr / CACHE_LINE;
    let end_line = (access.addr + access.size as u64 - 1) / CACHE_LINE;
    start_line != end_line
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitLockPolicy {
    /// Hardware-accurate: refuse to emulate, raise `#AC` so the guest
    /// backs off (matches modern Linux's split-lock detection mode).
    Strict,
    /// Best-effort: emulate under the VMM's own lock, trading strict
    /// cross-cache-line atomicity for guest forward progress.
    Lenient,
}

pub fn decide(decoded: Option<LockAccess>, policy: SplitLockPolicy) -> LockInstrAction {
    let access = match decoded {
        None => return LockInstrAction::InjectPageFault,
        Some(a) => a,
    };
    if !is_split_lock(access) {
        return LockInstrAction::Undecoded;
    }
    match policy {
        SplitLockPolicy::Strict => LockInstrAction::InjectAlignmentCheck,
        SplitLockPolicy::Lenient => LockInstrAction::EmulateNonAtomic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_access_is_not_split() {
        assert!(!is_split_lock(LockAccess { addr: 0x1000, size: 4 }));
    }

    #[test]
    fn access_crossing_line_boundary_is_split() {
        assert!(is_split_lock(LockAccess { addr: 0x103e, size: 4 }));
    }

    #[test]
    fn strict_policy_injects_ac_on_split_lock() {
        let action = decide(Some(LockAccess { addr: 0x103e, size: 4 }), SplitLockPolicy::Strict);
        assert_eq!(action, LockInstrAction::InjectAlignmentCheck);
    }

    #[test]
    fn decode_failure_injects_page_fault() {
        assert_eq!(decide(None, SplitLockPolicy::Lenient), LockInstrAction::InjectPageFault);
    }
}
