// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Hypercall dispatch gate, grounded on
//! `hypervisor/arch/x86/guest/vmcall.c`. The original's `vmcall_vmexit_handler`
//! checks, in order: the caller VM is allowed to make hypercalls at all
//! (Service VM or a VM with the hypercall guest-flag set), the caller is
//! running at CPL0, the hypercall id names a registered handler, and
//! finally the handler's permission flags against the caller and, for
//! privileged calls, resolves which VM the call actually targets.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestException {
    /// Caller isn't permitted to hypercall at all.
    UndefinedOpcode,
    /// Caller isn't at ring 0.
    GeneralProtection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallError {
    Exception(GuestException),
    /// Hypercall id not recognized or wired to a handler in this build.
    NotSupported,
    /// Caller lacks the permission flags the handler requires.
    PermissionDenied,
    /// `parse_target_vm` couldn't resolve a valid, non-prelaunched target.
    InvalidTargetVm,
}

/// Matches spec.md §6's frozen hypercall ABI numbering; only a subset has a
/// live handler in this software-only KVM-backed VMM (see module docs in
/// SPEC_FULL.md §7 and DESIGN.md for the stubbed remainder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum HypercallId {
    GetApiVersion = 0x0,
    CreateVm = 0x10,
    DestroyVm = 0x11,
    StartVm = 0x12,
    PauseVm = 0x14,
    SetIoreqBuffer = 0x20,
    NotifyIoreq = 0x21,
    InjectMsi = 0x30,
    SetIrqLine = 0x31,
    Gpa2Hpa = 0x40,
    SwitchEe = 0x50,
    InitializeTrusty = 0x51,
    SaveRestoreSworldCtx = 0x52,
}

impl std::convert::TryFrom<u64> for HypercallId {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => HypercallId::GetApiVersion,
            0x10 => HypercallId::CreateVm,
            0x11 => HypercallId::DestroyVm,
            0x12 => HypercallId::StartVm,
            0x14 => HypercallId::PauseVm,
            0x20 => HypercallId::SetIoreqBuffer,
            0x21 => HypercallId::NotifyIoreq,
            0x30 => HypercallId::InjectMsi,
            0x31 => HypercallId::SetIrqLine,
            0x40 => HypercallId::Gpa2Hpa,
            0x50 => HypercallId::SwitchEe,
            0x51 => HypercallId::InitializeTrusty,
            0x52 => HypercallId::SaveRestoreSworldCtx,
            _ => return Err(()),
        })
    }
}

pub const GUEST_FLAG_HYPERCALL: u32 = 1 << 0;
pub const GUEST_FLAG_SERVICE_VM: u32 = 1 << 1;
pub const GUEST_FLAG_TEE: u32 = 1 << 2;
pub const GUEST_FLAG_REE: u32 = 1 << 3;
pub const GUEST_FLAG_PRELAUNCHED: u32 = 1 << 4;
/// Set on *either* side of a TEE/REE companion pair (in addition to that
/// side's own `GUEST_FLAG_TEE`/`GUEST_FLAG_REE` identity bit). §4.7's
/// permission check is a superset (AND) test against the caller's own
/// flags, so a mask built out of `GUEST_FLAG_TEE | GUEST_FLAG_REE` could
/// never be satisfied by either companion alone -- a single vCPU is never
/// both worlds at once. `switch_ee` is callable by a TEE-only or REE-only
/// caller, so it gates on this shared capability bit instead.
pub const GUEST_FLAG_TEE_WORLD: u32 = 1 << 5;

/// Caller context the gate needs to make its permission decisions; callers
/// build this from the vCPU's owning `VMMConfig` entry and current CPL.
#[derive(Debug, Clone, Copy)]
pub struct CallerContext {
    pub vm_id: u16,
    pub guest_flags: u32,
    pub cpl: u8,
}

struct HypercallEntry {
    /// 0 means "Service-VM-only, target resolved by id-specific logic";
    /// nonzero means "caller's guest_flags must be a superset of this mask".
    permission_flags: u32,
}

pub struct HypercallGate {
    table: HashMap<HypercallId, HypercallEntry>,
}

impl HypercallGate {
    /// Populates the IDs that are actually meaningful to a software-only
    /// KVM-backed VMM; everything else named in `HypercallId` but omitted
    /// here falls through to `NotSupported` (`-ENOTTY`) in `dispatch`,
    /// which is an explicit decision, not a silent gap (see DESIGN.md).
    pub fn new() -> Self {
        let mut table = HashMap::new();
        table.insert(HypercallId::GetApiVersion, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::CreateVm, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::DestroyVm, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::StartVm, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::PauseVm, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::SetIoreqBuffer, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::NotifyIoreq, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::InjectMsi, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::SetIrqLine, HypercallEntry { permission_flags: 0 });
        table.insert(HypercallId::Gpa2Hpa, HypercallEntry { permission_flags: 0 });
        table.insert(
            HypercallId::SwitchEe,
            HypercallEntry {
                permission_flags: GUEST_FLAG_TEE_WORLD,
            },
        );
        table.insert(
            HypercallId::InitializeTrusty,
            HypercallEntry {
                permission_flags: GUEST_FLAG_REE,
            },
        );
        table.insert(
            HypercallId::SaveRestoreSworldCtx,
            HypercallEntry {
                permission_flags: GUEST_FLAG_TEE_WORLD,
            },
        );
        HypercallGate { table }
    }

    /// Resolves which VM a Service-VM-only (`permission_flags == 0`) call
    /// actually targets, rejecting prelaunched VMs as the original does
    /// (a prelaunched VM has no Service-VM-mediated lifecycle).
    pub fn parse_target_vm(
        &self,
        id: HypercallId,
        requested_vm_id: u16,
        target_guest_flags: u32,
    ) -> Result<u16, HypercallError> {
        match id {
            HypercallId::CreateVm => Ok(requested_vm_id),
            _ => {
                if target_guest_flags & GUEST_FLAG_PRELAUNCHED != 0 {
                    Err(HypercallError::InvalidTargetVm)
                } else {
                    Ok(requested_vm_id)
                }
            }
        }
    }

    /// Implements the gate order from spec.md §4.7: non-hypercall-capable
    /// caller -> `#UD`; non-ring-0 -> `#GP(0)`; unknown/unsupported id ->
    /// `NotSupported`; `permission_flags == 0` -> Service-VM-only;
    /// nonzero `permission_flags` -> caller's flags must be a superset.
    pub fn dispatch(
        &self,
        id: HypercallId,
        caller: CallerContext,
    ) -> Result<&'static str, HypercallError> {
        if caller.guest_flags & GUEST_FLAG_HYPERCALL == 0 && caller.guest_flags & GUEST_FLAG_SERVICE_VM == 0 {
            return Err(HypercallError::Exception(GuestException::UndefinedOpcode));
        }
        if caller.cpl != 0 {
            return Err(HypercallError::Exception(GuestException::GeneralProtection));
        }
        let entry = self.table.get(&id).ok_or(HypercallError::NotSupported)?;
        if entry.permission_flags == 0 {
            if caller.guest_flags & GUEST_FLAG_SERVICE_VM == 0 {
                return Err(HypercallError::PermissionDenied);
            }
        } else if caller.guest_flags & entry.permission_flags != entry.permission_flags {
            return Err(HypercallError::PermissionDenied);
        }
        Ok(handler_name(id))
    }
}

impl Default for HypercallGate {
    fn default() -> Self {
        Self::new()
    }
}

fn handler_name(id: HypercallId) -> &'static str {
    match id {
        HypercallId::GetApiVersion => "hcall_get_api_version",
        HypercallId::CreateVm => "hcall_create_vm",
        HypercallId::DestroyVm => "hcall_destroy_vm",
        HypercallId::StartVm => "hcall_start_vm",
        HypercallId::PauseVm => "hcall_pause_vm",
        HypercallId::SetIoreqBuffer => "hcall_set_ioreq_buffer",
        HypercallId::NotifyIoreq => "hcall_notify_ioreq_finish",
        HypercallId::InjectMsi => "hcall_inject_msi",
        HypercallId::SetIrqLine => "hcall_set_irqline",
        HypercallId::Gpa2Hpa => "hcall_gpa_to_hpa",
        HypercallId::SwitchEe => "hcall_world_switch",
        HypercallId::InitializeTrusty => "hcall_initialize_trusty",
        HypercallId::SaveRestoreSworldCtx => "hcall_save_restore_sworld_ctx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_hypercall_capable_vm_gets_undefined_opcode() {
        let gate = HypercallGate::new();
        let caller = CallerContext { vm_id: 3, guest_flags: 0, cpl: 0 };
        let res = gate.dispatch(HypercallId::CreateVm, caller);
        assert_eq!(res, Err(HypercallError::Exception(GuestException::UndefinedOpcode)));
    }

    #[test]
    fn ring3_caller_gets_general_protection() {
        let gate = HypercallGate::new();
        let caller = CallerContext {
            vm_id: 0,
            guest_flags: GUEST_FLAG_SERVICE_VM,
            cpl: 3,
        };
        let res = gate.dispatch(HypercallId::CreateVm, caller);
        assert_eq!(res, Err(HypercallError::Exception(GuestException::GeneralProtection)));
    }

    #[test]
    fn non_service_vm_cannot_call_service_only_hypercall() {
        let gate = HypercallGate::new();
        let caller = CallerContext {
            vm_id: 2,
            guest_flags: GUEST_FLAG_HYPERCALL,
            cpl: 0,
        };
        let res = gate.dispatch(HypercallId::CreateVm, caller);
        assert_eq!(res, Err(HypercallError::PermissionDenied));
    }

    #[test]
    fn tee_vm_may_call_switch_ee() {
        let gate = HypercallGate::new();
        let caller = CallerContext {
            vm_id: 4,
            guest_flags: GUEST_FLAG_HYPERCALL | GUEST_FLAG_TEE | GUEST_FLAG_TEE_WORLD,
            cpl: 0,
        };
        assert!(gate.dispatch(HypercallId::SwitchEe, caller).is_ok());
    }

    #[test]
    fn ree_vm_alone_may_also_call_switch_ee() {
        let gate = HypercallGate::new();
        let caller = CallerContext {
            vm_id: 5,
            guest_flags: GUEST_FLAG_HYPERCALL | GUEST_FLAG_REE | GUEST_FLAG_TEE_WORLD,
            cpl: 0,
        };
        assert!(gate.dispatch(HypercallId::SwitchEe, caller).is_ok());
    }

    #[test]
    fn vm_without_tee_world_capability_cannot_call_switch_ee() {
        let gate = HypercallGate::new();
        let caller = CallerContext {
            vm_id: 6,
            guest_flags: GUEST_FLAG_HYPERCALL | GUEST_FLAG_TEE,
            cpl: 0,
        };
        assert_eq!(
            gate.dispatch(HypercallId::SwitchEe, caller),
            Err(HypercallError::PermissionDenied)
        );
    }

    #[test]
    fn prelaunched_vm_rejected_as_target() {
        let gate = HypercallGate::new();
        let res = gate.parse_target_vm(HypercallId::PauseVm, 7, GUEST_FLAG_PRELAUNCHED);
        assert_eq!(res, Err(HypercallError::InvalidTargetVm));
    }

    #[test]
    fn raw_id_roundtrips_through_try_from() {
        use std::convert::TryFrom;
        assert!(HypercallId::try_from(0x12345).is_err());
        assert_eq!(HypercallId::try_from(0x30), Ok(HypercallId::InjectMsi));
    }
}
