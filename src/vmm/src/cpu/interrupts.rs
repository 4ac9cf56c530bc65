// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! LAPIC register helpers for the boot-time LVT0/LVT1 configuration
//! (`configure_lapic`), following the same byte layout `KVM_GET_LAPIC`
//! returns (a 4 KiB register page indexed by register offset).

use kvm_bindings::kvm_lapic_state;

pub const APIC_LVT0: usize = 0x350;
pub const APIC_LVT1: usize = 0x360;

pub const APIC_MODE_EXTINT: u32 = 0x7;
pub const APIC_MODE_NMI: u32 = 0x4;

/// `kvm_lapic_state::regs` is a `[i8; 1024]` byte page (the historic `char
/// regs[]` from the kernel UAPI); reinterpret the 4-byte window as `u8` to
/// decode/encode a little-endian register value.
pub fn get_klapic_reg(klapic: &kvm_lapic_state, reg_offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = klapic.regs[reg_offset + i] as u8;
    }
    u32::from_le_bytes(bytes)
}

pub fn set_klapic_reg(klapic: &mut kvm_lapic_state, reg_offset: usize, value: u32) {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        klapic.regs[reg_offset + i] = *b as i8;
    }
}

/// Rewrites the delivery-mode bits (2:0) of an LVT entry, leaving mask/
/// vector/trigger-mode bits untouched.
pub fn set_apic_delivery_mode(reg: u32, mode: u32) -> u32 {
    (reg & !0x700) | ((mode & 0x7) << 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_klapic_register_page() {
        let mut klapic = kvm_lapic_state::default();
        set_klapic_reg(&mut klapic, APIC_LVT0, 0xdead_beef);
        assert_eq!(get_klapic_reg(&klapic, APIC_LVT0), 0xdead_beef);
    }

    #[test]
    fn delivery_mode_only_touches_bits_10_8() {
        let reg = 0x0001_0000;
        let updated = set_apic_delivery_mode(reg, APIC_MODE_EXTINT);
        assert_eq!(updated & 0x700, APIC_MODE_EXTINT << 8);
        assert_eq!(updated & 0x0001_0000, 0x0001_0000);
    }
}
