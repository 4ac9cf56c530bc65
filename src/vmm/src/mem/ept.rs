// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest-physical memory region registry, `gpa2hpa`, and vMTRR-driven
//! memory-type propagation.
//!
//! KVM owns the actual extended page tables; `VmFd::set_user_memory_region`
//! is the only lever this VMM has over them. `EptManager` therefore tracks
//! the registered regions and their requested cache attribute in its own
//! registry (mirroring `hypervisor/arch/x86/ept.c`'s bookkeeping) and
//! recomputes that attribute whenever the guest reprograms its virtual
//! MTRRs, the same trigger `vmtrr.c`'s `update_mtrr` uses to call
//! `ept_modify_mr`.

use std::fmt;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{Address, GuestAddress, GuestMemory, GuestMemoryMmap};

#[derive(Debug)]
pub enum EptError {
    Overlap { base: u64, size: u64 },
    NotFound { base: u64 },
    Kvm(kvm_ioctls::Error),
    Translate(u64),
}

impl fmt::Display for EptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EptError::Overlap { base, size } => {
                write!(f, "memory region [{:#x}, {:#x}) overlaps an existing one", base, base + size)
            }
            EptError::NotFound { base } => write!(f, "no memory region registered at base {:#x}", base),
            EptError::Kvm(e) => write!(f, "kvm ioctl failed: {e}"),
            EptError::Translate(gpa) => write!(f, "guest physical address {:#x} has no host mapping", gpa),
        }
    }
}

impl std::error::Error for EptError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttr {
    Uncached,
    WriteCombining,
    WriteThrough,
    WriteProtected,
    WriteBack,
}

impl CacheAttr {
    /// Mirrors the `IA32_MTRR` memory type encoding used by `vmtrr.c`.
    pub fn from_mtrr_type(v: u8) -> Self {
        match v {
            0 => CacheAttr::Uncached,
            1 => CacheAttr::WriteCombining,
            4 => CacheAttr::WriteThrough,
            5 => CacheAttr::WriteProtected,
            6 => CacheAttr::WriteBack,
            _ => CacheAttr::Uncached,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemRegion {
    pub base: u64,
    pub size: u64,
    pub slot: u32,
    pub readonly: bool,
    pub cache_attr: CacheAttr,
}

impl MemRegion {
    fn end(&self) -> u64 {
        self.base + self.size
    }

    fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.end() && base + size > self.base
    }
}

pub struct EptManager {
    regions: Vec<MemRegion>,
    next_slot: u32,
    /// Per-subrange cache attribute for the first 1 MiB (`FIRST_MIB`),
    /// decomposed at the granularity the guest's fixed-range MTRRs actually
    /// address. A top-level `MemRegion` only carries one `cache_attr` for
    /// its whole span, which is too coarse to represent eleven
    /// independently-typed fixed ranges inside a single registered region
    /// (typically the guest's base RAM region starting at GPA 0); this
    /// list is the finer-grained analogue `ept_modify_mr` would need if EPT
    /// PTEs were programmed directly. Sorted, non-overlapping, contiguous
    /// over `[0, FIRST_MIB)`.
    low_mem_ranges: Vec<(u64, u64, CacheAttr)>,
}

impl EptManager {
    pub fn new() -> Self {
        EptManager {
            regions: Vec::new(),
            next_slot: 0,
            low_mem_ranges: vec![(0, FIRST_MIB, CacheAttr::Uncached)],
        }
    }

    /// Mirrors `ept_add_mr`: registers a new guest-physical region backed by
    /// `host_addr`, rejecting overlap with any region already registered.
    pub fn ept_add_mr(
        &mut self,
        vm_fd: &VmFd,
        base: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
    ) -> Result<u32, EptError> {
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(base, size)) {
            return Err(EptError::Overlap {
                base: existing.base,
                size: existing.size,
            });
        }
        let slot = self.next_slot;
        self.next_slot += 1;

        let kvm_region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: base,
            memory_size: size,
            userspace_addr: host_addr,
            flags: if readonly { kvm_bindings::KVM_MEM_READONLY } else { 0 },
        };
        // Safety: the memory backing `host_addr` outlives the VM (it comes
        // from the mmap'd `GuestMemoryMmap` region) and the region does not
        // overlap any other slot, checked above.
        unsafe {
            vm_fd
                .set_user_memory_region(kvm_region)
                .map_err(EptError::Kvm)?;
        }

        self.regions.push(MemRegion {
            base,
            size,
            slot,
            readonly,
            cache_attr: CacheAttr::WriteBack,
        });
        Ok(slot)
    }

    /// Mirrors `ept_modify_mr`: updates the tracked cache attribute for a
    /// region without touching the actual KVM mapping (KVM doesn't expose a
    /// memory-type knob independent of the guest's own page tables; the
    /// attribute here is the value handed back to vMTRR-aware callers, e.g.
    /// for guest-visible `IA32_MTRR_CAP`/range queries).
    pub fn ept_modify_mr(&mut self, base: u64, cache_attr: CacheAttr) -> Result<(), EptError> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.base == base)
            .ok_or(EptError::NotFound { base })?;
        region.cache_attr = cache_attr;
        Ok(())
    }

    /// Mirrors `ept_del_mr`.
    pub fn ept_del_mr(&mut self, vm_fd: &VmFd, base: u64) -> Result<(), EptError> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(EptError::NotFound { base })?;
        let region = self.regions.remove(idx);
        let kvm_region = kvm_userspace_memory_region {
            slot: region.slot,
            guest_phys_addr: region.base,
            memory_size: 0,
            userspace_addr: 0,
            flags: 0,
        };
        unsafe {
            vm_fd
                .set_user_memory_region(kvm_region)
                .map_err(EptError::Kvm)?;
        }
        Ok(())
    }

    pub fn region_at(&self, gpa: u64) -> Option<&MemRegion> {
        self.regions.iter().find(|r| gpa >= r.base && gpa < r.end())
    }

    /// Replaces the first-1 MiB subrange table wholesale; used by
    /// `MemoryTypeTable::apply` after it recomputes the coalesced fixed
    /// ranges from vMTRR state.
    fn set_low_mem_ranges(&mut self, ranges: Vec<(u64, u64, CacheAttr)>) {
        self.low_mem_ranges = ranges;
    }

    /// Looks up the cache attribute that applies at `gpa`, consulting the
    /// fine-grained first-1 MiB table below `FIRST_MIB` and the coarser
    /// per-region attribute above it.
    pub fn cache_attr_at(&self, gpa: u64) -> Option<CacheAttr> {
        if gpa < FIRST_MIB {
            self.low_mem_ranges
                .iter()
                .find(|&&(start, end, _)| gpa >= start && gpa < end)
                .map(|&(_, _, attr)| attr)
        } else {
            self.region_at(gpa).map(|r| r.cache_attr)
        }
    }

    /// Mirrors `gpa2hpa`, delegated to `vm-memory`'s own translation since
    /// KVM's EPT and `GuestMemoryMmap`'s mappings are kept in lock-step.
    pub fn gpa2hpa(&self, mem: &GuestMemoryMmap, gpa: u64) -> Result<u64, EptError> {
        mem.get_host_address(GuestAddress(gpa))
            .map(|ptr| ptr as u64)
            .map_err(|_| EptError::Translate(gpa))
    }
}

impl Default for EptManager {
    fn default() -> Self {
        Self::new()
    }
}

const FIXED_RANGE_COUNT: usize = 11;

/// End of the fixed-range MTRR-covered region; real hardware always covers
/// `[0, FIRST_MIB)` with fixed ranges and leaves everything above it to
/// variable-range MTRRs (not emulated here, per spec.md §4.4).
const FIRST_MIB: u64 = 0x0010_0000;

/// `(MSR address, base GPA, subrange size)` for each of the 11 real
/// fixed-range MTRR MSRs, in ascending GPA order. The MSR addresses are not
/// contiguous (`0x250`, then `0x258`-`0x259`, then `0x268`-`0x26F`), so this
/// table -- not an arithmetic offset from a single base -- is what maps an
/// MSR write to the GPA range and subrange granularity it covers. Each MSR
/// packs eight one-byte memory types, one per subrange, into its 64-bit
/// value.
const FIXED_RANGE_LAYOUT: [(u32, u64, u64); FIXED_RANGE_COUNT] = [
    (0x250, 0x0000_0000, 0x0001_0000), // MTRRfix64K_00000: 8 x 64 KiB
    (0x258, 0x0008_0000, 0x0000_4000), // MTRRfix16K_80000: 8 x 16 KiB
    (0x259, 0x000a_0000, 0x0000_4000), // MTRRfix16K_A0000: 8 x 16 KiB
    (0x268, 0x000c_0000, 0x0000_1000), // MTRRfix4K_C0000: 8 x 4 KiB
    (0x269, 0x000c_8000, 0x0000_1000), // MTRRfix4K_C8000
    (0x26a, 0x000d_0000, 0x0000_1000), // MTRRfix4K_D0000
    (0x26b, 0x000d_8000, 0x0000_1000), // MTRRfix4K_D8000
    (0x26c, 0x000e_0000, 0x0000_1000), // MTRRfix4K_E0000
    (0x26d, 0x000e_8000, 0x0000_1000), // MTRRfix4K_E8000
    (0x26e, 0x000f_0000, 0x0000_1000), // MTRRfix4K_F0000
    (0x26f, 0x000f_8000, 0x0000_1000), // MTRRfix4K_F8000
];

/// Virtual MTRR state for one vCPU, grounded on `vmtrr.c`'s `mtrr_state`.
#[derive(Debug, Clone)]
pub struct VirtualMtrr {
    pub fixed_ranges: [u64; FIXED_RANGE_COUNT],
    pub def_type: u64,
    pub enabled: bool,
}

impl VirtualMtrr {
    pub fn new() -> Self {
        VirtualMtrr {
            fixed_ranges: [0; FIXED_RANGE_COUNT],
            def_type: 0,
            enabled: false,
        }
    }

    /// Mirrors `write_mtrr`: applies an MSR write and reports whether the
    /// default type/enable bit changed, so the caller can decide whether a
    /// reprogram of the first-1MiB region is needed.
    pub fn on_mtrr_write(&mut self, msr: u32, value: u64) -> bool {
        const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
        if msr == IA32_MTRR_DEF_TYPE {
            let new_def_type = value & 0xff;
            let new_enabled = value & (1 << 11) != 0;
            let changed = self.def_type != new_def_type || self.enabled != new_enabled;
            self.def_type = new_def_type;
            self.enabled = new_enabled;
            changed
        } else if let Some(idx) = FIXED_RANGE_LAYOUT.iter().position(|&(m, _, _)| m == msr) {
            let changed = self.fixed_ranges[idx] != value;
            self.fixed_ranges[idx] = value;
            changed
        } else {
            false
        }
    }

    pub fn default_cache_attr(&self) -> CacheAttr {
        if !self.enabled {
            CacheAttr::Uncached
        } else {
            CacheAttr::from_mtrr_type(self.def_type as u8)
        }
    }

    /// Decodes every fixed-range MSR into its eight one-byte-per-subrange
    /// memory types, producing the elementary (uncoalesced) `[start, end,
    /// type)` triples covering `[0, FIRST_MIB)` in ascending order.
    fn elementary_ranges(&self) -> Vec<(u64, u64, u8)> {
        let mut out = Vec::with_capacity(FIXED_RANGE_COUNT * 8);
        for (reg_idx, &(_, base, subrange_size)) in FIXED_RANGE_LAYOUT.iter().enumerate() {
            let reg_value = self.fixed_ranges[reg_idx];
            for sub in 0..8u64 {
                let ty = ((reg_value >> (sub * 8)) & 0xff) as u8;
                let start = base + sub * subrange_size;
                out.push((start, start + subrange_size, ty));
            }
        }
        out
    }
}

impl Default for VirtualMtrr {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges adjacent elementary subranges that carry the same memory type,
/// mirroring `vmtrr.c`'s coalescing before it calls `ept_modify_mr` -- an
/// all-`WB` fixed-range table collapses to one `[0, FIRST_MIB)` entry
/// rather than 88 individually-typed ones.
fn coalesce_ranges(ranges: &[(u64, u64, u8)]) -> Vec<(u64, u64, u8)> {
    let mut out: Vec<(u64, u64, u8)> = Vec::new();
    for &(start, end, ty) in ranges {
        match out.last_mut() {
            Some(last) if last.1 == start && last.2 == ty => last.1 = end,
            _ => out.push((start, end, ty)),
        }
    }
    out
}

/// Recomputes cache-attribute updates from vMTRR state and applies them to
/// the EPT region registry, the nearest analogue of `ept_modify_mr`'s
/// memory-type bits addressable without raw EPT PTE access.
pub struct MemoryTypeTable;

impl MemoryTypeTable {
    /// Mirrors `vmtrr.c`'s recompute-on-write path: when MTRRs are disabled
    /// the first MiB is forced to the vMTRR default type (matching real
    /// hardware, which always covers the first MiB with fixed ranges);
    /// otherwise the 11 fixed-range MSRs are decoded, coalesced, and each
    /// resulting run is given its own cache attribute. Any tracked region
    /// above the first MiB takes on the current default type directly
    /// (variable-range MTRRs are not emulated, per spec.md §4.4).
    pub fn apply(ept: &mut EptManager, mtrr: &VirtualMtrr) -> Result<(), EptError> {
        let default_attr = mtrr.default_cache_attr();

        if mtrr.enabled {
            let coalesced = coalesce_ranges(&mtrr.elementary_ranges());
            let low_mem_ranges = coalesced
                .into_iter()
                .map(|(start, end, ty)| (start, end, CacheAttr::from_mtrr_type(ty)))
                .collect();
            ept.set_low_mem_ranges(low_mem_ranges);
        } else {
            ept.set_low_mem_ranges(vec![(0, FIRST_MIB, default_attr)]);
        }

        let bases: Vec<u64> = ept
            .regions
            .iter()
            .filter(|r| r.base >= FIRST_MIB)
            .map(|r| r.base)
            .collect();
        for base in bases {
            ept.ept_modify_mr(base, default_attr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_region_is_rejected_without_touching_kvm() {
        let mut ept = EptManager::new();
        ept.regions.push(MemRegion {
            base: 0,
            size: 0x1000,
            slot: 0,
            readonly: false,
            cache_attr: CacheAttr::WriteBack,
        });
        assert!(ept.regions[0].overlaps(0x800, 0x1000));
        assert!(!ept.regions[0].overlaps(0x1000, 0x1000));
    }

    #[test]
    fn mtrr_disabled_reports_uncached_default() {
        let mtrr = VirtualMtrr::new();
        assert_eq!(mtrr.default_cache_attr(), CacheAttr::Uncached);
    }

    #[test]
    fn enabling_def_type_changes_cache_attr() {
        let mut mtrr = VirtualMtrr::new();
        let changed = mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x06);
        assert!(changed);
        assert_eq!(mtrr.default_cache_attr(), CacheAttr::WriteBack);
    }

    #[test]
    fn type_only_change_with_enable_bit_held_is_detected() {
        let mut mtrr = VirtualMtrr::new();
        assert!(mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x06));
        // Same enable bit, different type: must still report changed.
        let changed = mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x00);
        assert!(changed);
        assert_eq!(mtrr.default_cache_attr(), CacheAttr::Uncached);
    }

    #[test]
    fn rewriting_identical_def_type_reports_unchanged() {
        let mut mtrr = VirtualMtrr::new();
        assert!(mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x06));
        let changed = mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x06);
        assert!(!changed);
    }

    #[test]
    fn fixed_range_msrs_cover_non_contiguous_layout() {
        let mut mtrr = VirtualMtrr::new();
        // MTRRfix64K_00000: every subrange WB (0x06).
        assert!(mtrr.on_mtrr_write(0x250, 0x0606_0606_0606_0606));
        // MTRRfix4K_F8000: every subrange UC (0x00), already the default --
        // still counts as an MSR write even though the value doesn't change.
        assert!(!mtrr.on_mtrr_write(0x26f, 0));
        let elementary = mtrr.elementary_ranges();
        assert_eq!(elementary.len(), 88);
        assert_eq!(elementary[0], (0, 0x1_0000, 0x06));
        assert_eq!(elementary.last().copied().unwrap(), (0xf_f000, FIRST_MIB, 0x00));
    }

    #[test]
    fn coalescing_merges_uniform_fixed_ranges_into_one_span() {
        let mut mtrr = VirtualMtrr::new();
        mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x06);
        for &(msr, ..) in FIXED_RANGE_LAYOUT.iter() {
            mtrr.on_mtrr_write(msr, 0x0606_0606_0606_0606);
        }
        let coalesced = coalesce_ranges(&mtrr.elementary_ranges());
        assert_eq!(coalesced, vec![(0, FIRST_MIB, 0x06)]);
    }

    #[test]
    fn apply_propagates_fixed_range_types_into_low_mem_ranges() {
        let mut ept = EptManager::new();
        let mut mtrr = VirtualMtrr::new();
        mtrr.on_mtrr_write(0x2ff, (1 << 11) | 0x06);
        // First fixed MSR (covers [0, 0x10000)) marked UC; rest left at WB.
        mtrr.on_mtrr_write(0x250, 0);
        for &(msr, ..) in FIXED_RANGE_LAYOUT.iter().skip(1) {
            mtrr.on_mtrr_write(msr, 0x0606_0606_0606_0606);
        }
        MemoryTypeTable::apply(&mut ept, &mtrr).unwrap();
        assert_eq!(ept.cache_attr_at(0), Some(CacheAttr::Uncached));
        assert_eq!(ept.cache_attr_at(0x1_0000), Some(CacheAttr::WriteBack));
    }

    #[test]
    fn apply_with_mtrrs_disabled_forces_first_mib_uncached() {
        let mut ept = EptManager::new();
        let mtrr = VirtualMtrr::new();
        MemoryTypeTable::apply(&mut ept, &mtrr).unwrap();
        assert_eq!(ept.cache_attr_at(0), Some(CacheAttr::Uncached));
        assert_eq!(ept.cache_attr_at(FIRST_MIB - 1), Some(CacheAttr::Uncached));
    }
}
