// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Boot-time MSR entry list, the set a freshly created vCPU needs before
//! its first `VCPU_RUN` so the guest doesn't see undefined syscall/sysenter
//! MSR state.

use kvm_bindings::{kvm_msr_entry, Msrs};

use super::msr_index::*;

#[derive(Debug)]
pub enum Error {
    /// Failed to allocate the `Msrs` FAM wrapper.
    CreateMsrs,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::CreateMsrs => write!(f, "failed to allocate boot MSR entry list"),
        }
    }
}

impl std::error::Error for Error {}

fn msr_entry(index: u32, data: u64) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data,
        ..Default::default()
    }
}

/// The minimal MSR set Linux expects configured at boot: syscall/sysenter
/// entry points zeroed, EFER left for `configure_sregs` to set LME/LMA,
/// and fast-string microcode left enabled as `MISC_ENABLE` already defaults
/// to on real silicon.
pub fn create_boot_msr_entries() -> Result<Msrs, Error> {
    let entries = vec![
        msr_entry(MSR_IA32_SYSENTER_CS, 0),
        msr_entry(MSR_IA32_SYSENTER_ESP, 0),
        msr_entry(MSR_IA32_SYSENTER_EIP, 0),
        msr_entry(MSR_STAR, 0),
        msr_entry(MSR_CSTAR, 0),
        msr_entry(MSR_KERNEL_GS_BASE, 0),
        msr_entry(MSR_SYSCALL_MASK, 0),
        msr_entry(MSR_LSTAR, 0),
        msr_entry(MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING),
    ];

    Msrs::from_entries(&entries).map_err(|_| Error::CreateMsrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_msr_entries_builds_without_error() {
        let msrs = create_boot_msr_entries().unwrap();
        assert_eq!(msrs.as_fam_struct_ref().nmsrs, 9);
    }
}
