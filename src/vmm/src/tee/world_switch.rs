// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! TEE/REE world switch, grounded on
//! `hypervisor/arch/x86/guest/optee.c`. A companion pair of VMs (one
//! TEE, one REE) is pinned to the same pcpu and shares it cooperatively:
//! `switch_ee` (world switch) is invoked from a hypercall (see
//! `hypercall::gate::HypercallId::SwitchEe`) and copies the register
//! subset the original copies, checks whether the TEE has a pending
//! interrupt it should handle before yielding back to the REE, and parks
//! the caller's vCPU thread while waking the companion's.

use crate::sched::{ScheduleControl, ThreadId};

/// Fixed non-secure interrupt vector OP-TEE is configured to use for
/// notifying the REE; mirrors `TEE_FIXED_NONSECURE_VECTOR`.
pub const TEE_FIXED_NONSECURE_VECTOR: u8 = 0xef;

#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum World {
    Tee,
    Ree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldSwitchError {
    /// The two companion VMs aren't pinned to the same singleton pcpu set,
    /// checked at VM-configuration time (spec.md §4.9's invariant).
    AffinityMismatch,
    NoPendingInterrupt,
}

impl std::fmt::Display for WorldSwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorldSwitchError::AffinityMismatch => {
                write!(f, "TEE/REE companion VMs must be pinned to the same single pcpu")
            }
            WorldSwitchError::NoPendingInterrupt => write!(f, "no pending interrupt for REE to re-inject"),
        }
    }
}

impl std::error::Error for WorldSwitchError {}

/// Sentinel RDI value OP-TEE recognizes as "entered to handle a secure
/// interrupt", not a guest-initiated SMC. Used both when the hypervisor
/// forces a REE->TEE switch for a pending secure interrupt and when the
/// TEE's matching `switch_ee` call back to the REE is itself just the tail
/// of that FIQ handling (in which case the normal register copy is
/// skipped, since there's no real SMC argument set to propagate).
const OPTEE_FIQ_ENTRY: u64 = 0xb200_00ff;

pub struct WorldSwitcher {
    pub tee_thread: ThreadId,
    pub ree_thread: ThreadId,
}

impl WorldSwitcher {
    /// Validates the "pinned to the same pcpu" invariant from two
    /// single-bit affinity masks (one bit set, and it's the same bit).
    pub fn validate_affinity(tee_affinity: u64, ree_affinity: u64) -> Result<(), WorldSwitchError> {
        if tee_affinity.count_ones() != 1 || tee_affinity != ree_affinity {
            return Err(WorldSwitchError::AffinityMismatch);
        }
        Ok(())
    }

    /// TEE -> REE: copy RDI/RSI/RDX/RBX unless RDI signals an FIQ return,
    /// compare the TEE's pending interrupt priority against the fixed
    /// non-secure vector, wake the REE thread, and sleep the TEE thread.
    /// Mirrors the `tee->ree` branch of `switch_world`.
    pub fn switch_to_ree(
        &self,
        sched: &ScheduleControl,
        tee_regs: GuestRegs,
        pending_intr_vector: Option<u8>,
    ) -> GuestRegs {
        let mut ree_regs = GuestRegs::default();
        let is_fiq_return = tee_regs.rdi == OPTEE_FIQ_ENTRY;
        if !is_fiq_return {
            ree_regs.rdi = tee_regs.rdi;
            ree_regs.rsi = tee_regs.rsi;
            ree_regs.rdx = tee_regs.rdx;
            ree_regs.rbx = tee_regs.rbx;
        }
        // A TEE interrupt carrying the fixed non-secure vector is destined
        // for the REE, not the TEE itself; it is consumed here rather than
        // left pending, since control is handed to the REE immediately
        // after. Re-injecting it as a concrete REE interrupt would need a
        // vLAPIC model this hypervisor doesn't implement (see DESIGN.md).
        let _ = pending_intr_vector.filter(|&v| v == TEE_FIXED_NONSECURE_VECTOR);
        sched.wake_thread(self.ree_thread);
        sched.sleep_thread(self.tee_thread);
        ree_regs
    }

    /// Forces a REE -> TEE switch to deliver a secure interrupt, matching
    /// `switch_world`'s FIQ-injection path: RDI is set to `OPTEE_FIQ_ENTRY`
    /// instead of copying the REE's registers, since the TEE is being
    /// entered to service the interrupt rather than responding to an SMC
    /// the REE issued. Fails with `NoPendingInterrupt` if called when the
    /// TEE has nothing to handle.
    pub fn switch_to_tee_for_secure_interrupt(
        &self,
        sched: &ScheduleControl,
        pending_intr_vector: Option<u8>,
    ) -> Result<GuestRegs, WorldSwitchError> {
        if pending_intr_vector.is_none() {
            return Err(WorldSwitchError::NoPendingInterrupt);
        }
        let tee_regs = GuestRegs {
            rdi: OPTEE_FIQ_ENTRY,
            ..Default::default()
        };
        sched.wake_thread(self.tee_thread);
        sched.sleep_thread(self.ree_thread);
        Ok(tee_regs)
    }

    /// REE -> TEE: copy RAX/RCX plus the same base register set, wake the
    /// TEE thread, sleep the REE thread.
    pub fn switch_to_tee(&self, sched: &ScheduleControl, ree_regs: GuestRegs) -> GuestRegs {
        let tee_regs = GuestRegs {
            rax: ree_regs.rax,
            rcx: ree_regs.rcx,
            rdi: ree_regs.rdi,
            rsi: ree_regs.rsi,
            rdx: ree_regs.rdx,
            rbx: ree_regs.rbx,
        };
        sched.wake_thread(self.tee_thread);
        sched.sleep_thread(self.ree_thread);
        tee_regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::iorr::IorrPolicy;
    use crate::sched::SchedParams;

    #[test]
    fn mismatched_affinity_is_rejected() {
        assert_eq!(
            WorldSwitcher::validate_affinity(0b0001, 0b0010),
            Err(WorldSwitchError::AffinityMismatch)
        );
        assert_eq!(
            WorldSwitcher::validate_affinity(0b0011, 0b0011),
            Err(WorldSwitchError::AffinityMismatch)
        );
    }

    #[test]
    fn matching_singleton_affinity_is_accepted() {
        assert_eq!(WorldSwitcher::validate_affinity(0b0100, 0b0100), Ok(()));
    }

    #[test]
    fn fiq_return_does_not_copy_registers() {
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let tee = sched.alloc_thread_id();
        let ree = sched.alloc_thread_id();
        sched.init_thread_data(tee, SchedParams::default());
        sched.init_thread_data(ree, SchedParams::default());
        let switcher = WorldSwitcher { tee_thread: tee, ree_thread: ree };
        let regs = GuestRegs {
            rdi: OPTEE_FIQ_ENTRY,
            rsi: 0x55,
            ..Default::default()
        };
        let ree_regs = switcher.switch_to_ree(&sched, regs, None);
        assert_eq!(ree_regs.rsi, 0);
    }

    #[test]
    fn secure_interrupt_forces_tee_entry_with_fiq_marker() {
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let tee = sched.alloc_thread_id();
        let ree = sched.alloc_thread_id();
        sched.init_thread_data(tee, SchedParams::default());
        sched.init_thread_data(ree, SchedParams::default());
        let switcher = WorldSwitcher { tee_thread: tee, ree_thread: ree };
        let tee_regs = switcher
            .switch_to_tee_for_secure_interrupt(&sched, Some(TEE_FIXED_NONSECURE_VECTOR))
            .unwrap();
        assert_eq!(tee_regs.rdi, OPTEE_FIQ_ENTRY);
    }

    #[test]
    fn secure_interrupt_switch_without_pending_vector_fails() {
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let tee = sched.alloc_thread_id();
        let ree = sched.alloc_thread_id();
        sched.init_thread_data(tee, SchedParams::default());
        sched.init_thread_data(ree, SchedParams::default());
        let switcher = WorldSwitcher { tee_thread: tee, ree_thread: ree };
        assert_eq!(
            switcher.switch_to_tee_for_secure_interrupt(&sched, None),
            Err(WorldSwitchError::NoPendingInterrupt)
        );
    }

    #[test]
    fn normal_switch_copies_register_subset() {
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let tee = sched.alloc_thread_id();
        let ree = sched.alloc_thread_id();
        sched.init_thread_data(tee, SchedParams::default());
        sched.init_thread_data(ree, SchedParams::default());
        let switcher = WorldSwitcher { tee_thread: tee, ree_thread: ree };
        let regs = GuestRegs { rdi: 1, rsi: 2, rdx: 3, rbx: 4, ..Default::default() };
        let ree_regs = switcher.switch_to_ree(&sched, regs, None);
        assert_eq!((ree_regs.rdi, ree_regs.rsi, ree_regs.rdx, ree_regs.rbx), (1, 2, 3, 4));
    }
}
