// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Passthrough interrupt remapping, grounded on
//! `hypervisor/common/ptdev.c`. The original keeps a fixed-capacity array
//! of `ptirq_remapping_info` plus open-chained hash tables
//! (`phys_sid_htable`/`virt_sid_htable`) for O(1) lookup by physical or
//! virtual source id. A `HashMap` already gives the same asymptotic lookup
//! cost idiomatically, so the two indices here just map straight to
//! `std::collections::HashMap` rather than reimplementing the hand-rolled
//! chaining (see DESIGN.md).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const MAX_PT_IRQ_ENTRIES: usize = 256;
pub const IRQ_INVALID: u32 = u32::MAX;
pub const INVALID_PTDEV_ENTRY_ID: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrType {
    Intx,
    Msi,
}

/// A source id is either a physical (irq/gsi) or virtual (virt-irq/vbdf)
/// identifier; kept as a plain newtype matching `union source_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

pub type VmId = u16;

#[derive(Debug, Clone)]
pub struct PtirqEntry {
    pub id: usize,
    pub intr_type: IntrType,
    pub vm_id: VmId,
    pub is_service_vm: bool,
    pub phys_sid: SourceId,
    pub virt_sid: SourceId,
    pub allocated_pirq: u32,
    pub intr_count: u64,
    pub active: bool,
    pub release_pending: bool,
    delay_until: Option<Instant>,
}

impl PtirqEntry {
    fn fresh(id: usize, vm_id: VmId, is_service_vm: bool, intr_type: IntrType) -> Self {
        PtirqEntry {
            id,
            intr_type,
            vm_id,
            is_service_vm,
            phys_sid: SourceId(0),
            virt_sid: SourceId(0),
            allocated_pirq: IRQ_INVALID,
            intr_count: 0,
            active: false,
            release_pending: false,
            delay_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllocError;

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ptirq entry pool exhausted")
    }
}

impl std::error::Error for AllocError {}

/// Per-pcpu owner of the fixed entry pool, the allocation bitmap-equivalent
/// (a `Vec<bool>`), the two lookup indices, and the softirq dispatch queue.
pub struct PtirqManager {
    entries: Vec<Option<PtirqEntry>>,
    phys_index: HashMap<(IntrType, SourceId), usize>,
    virt_index: HashMap<(IntrType, SourceId, VmId), usize>,
    softirq_queue: VecDeque<usize>,
    delayed: Vec<usize>,
    /// Per-VM anti-storm delay, 0 disables delay (matches
    /// `intr_inject_delay_delta == 0`).
    pub intr_inject_delay: Duration,
}

impl PtirqManager {
    pub fn new() -> Self {
        PtirqManager {
            entries: (0..MAX_PT_IRQ_ENTRIES).map(|_| None).collect(),
            phys_index: HashMap::new(),
            virt_index: HashMap::new(),
            softirq_queue: VecDeque::new(),
            delayed: Vec::new(),
            intr_inject_delay: Duration::ZERO,
        }
    }

    /// Mirrors `ptirq_alloc_entry`: finds the first free slot and resets it.
    pub fn ptirq_alloc_entry(
        &mut self,
        vm_id: VmId,
        is_service_vm: bool,
        intr_type: IntrType,
    ) -> Result<usize, AllocError> {
        let slot = self.entries.iter().position(|e| e.is_none()).ok_or(AllocError)?;
        self.entries[slot] = Some(PtirqEntry::fresh(slot, vm_id, is_service_vm, intr_type));
        Ok(slot)
    }

    /// Mirrors `ptirq_release_entry`: clears the timer/softirq linkage and
    /// frees the slot.
    pub fn ptirq_release_entry(&mut self, id: usize) {
        self.softirq_queue.retain(|&x| x != id);
        self.delayed.retain(|&x| x != id);
        self.entries[id] = None;
    }

    /// Mirrors `ptirq_activate_entry`: records the allocated physical irq,
    /// marks active, and inserts both hash-table entries.
    pub fn ptirq_activate_entry(
        &mut self,
        id: usize,
        phys_sid: SourceId,
        virt_sid: SourceId,
        phys_irq: u32,
    ) {
        let (intr_type, vm_id) = {
            let entry = self.entries[id].as_mut().expect("activate on live entry");
            entry.phys_sid = phys_sid;
            entry.virt_sid = virt_sid;
            entry.allocated_pirq = phys_irq;
            entry.active = true;
            (entry.intr_type, entry.vm_id)
        };
        self.phys_index.insert((intr_type, phys_sid), id);
        self.virt_index.insert((intr_type, virt_sid, vm_id), id);
    }

    /// Mirrors `ptirq_deactivate_entry`.
    pub fn ptirq_deactivate_entry(&mut self, id: usize) {
        if let Some(entry) = self.entries[id].as_mut() {
            entry.active = false;
            let phys_key = (entry.intr_type, entry.phys_sid);
            let virt_key = (entry.intr_type, entry.virt_sid, entry.vm_id);
            self.phys_index.remove(&phys_key);
            self.virt_index.remove(&virt_key);
        }
    }

    /// Mirrors `find_ptirq_entry` with `vm == NULL` (physical lookup).
    pub fn find_by_phys(&self, intr_type: IntrType, sid: SourceId) -> Option<&PtirqEntry> {
        self.phys_index
            .get(&(intr_type, sid))
            .and_then(|&id| self.entries[id].as_ref())
            .filter(|e| e.active)
    }

    /// Mirrors `find_ptirq_entry` with a concrete `vm` (virtual lookup).
    pub fn find_by_virt(&self, intr_type: IntrType, sid: SourceId, vm_id: VmId) -> Option<&PtirqEntry> {
        self.virt_index
            .get(&(intr_type, sid, vm_id))
            .and_then(|&id| self.entries[id].as_ref())
            .filter(|e| e.active)
    }

    /// Mirrors `ptirq_interrupt_handler`'s storm detection: Service VM
    /// entries always enqueue immediately; User VM entries with a nonzero
    /// delay delta start (or skip, if already pending) a delay timer
    /// instead.
    pub fn on_physical_interrupt(&mut self, id: usize, now: Instant) {
        let (is_service_vm, already_delayed) = {
            let entry = match self.entries[id].as_mut() {
                Some(e) => e,
                None => return,
            };
            entry.intr_count += 1;
            (entry.is_service_vm, entry.delay_until.is_some())
        };

        if is_service_vm || self.intr_inject_delay.is_zero() {
            self.enqueue_softirq(id);
            return;
        }

        if already_delayed {
            return;
        }
        if let Some(entry) = self.entries[id].as_mut() {
            entry.delay_until = Some(now + self.intr_inject_delay);
        }
        self.delayed.push(id);
    }

    fn enqueue_softirq(&mut self, id: usize) {
        if !self.softirq_queue.contains(&id) {
            self.softirq_queue.push_back(id);
        }
    }

    /// Mirrors `ptirq_dequeue_softirq`: pops the next ready entry, promoting
    /// any delayed entries whose timer has expired.
    pub fn ptirq_dequeue_softirq(&mut self, now: Instant) -> Option<usize> {
        let mut still_delayed = Vec::new();
        for id in self.delayed.drain(..) {
            let expired = self.entries[id]
                .as_ref()
                .and_then(|e| e.delay_until)
                .map(|t| now >= t)
                .unwrap_or(true);
            if expired {
                if let Some(e) = self.entries[id].as_mut() {
                    e.delay_until = None;
                }
                self.softirq_queue.push_back(id);
            } else {
                still_delayed.push(id);
            }
        }
        self.delayed = still_delayed;
        self.softirq_queue.pop_front()
    }

    /// Mirrors `ptdev_release_all_entries`.
    pub fn ptdev_release_all_entries(&mut self, vm_id: VmId) {
        let ids: Vec<usize> = self
            .entries
            .iter()
            .filter_map(|e| e.as_ref())
            .filter(|e| e.vm_id == vm_id && e.active)
            .map(|e| e.id)
            .collect();
        for id in ids {
            self.ptirq_deactivate_entry(id);
            self.ptirq_release_entry(id);
        }
    }

    pub fn entry(&self, id: usize) -> Option<&PtirqEntry> {
        self.entries[id].as_ref()
    }
}

impl Default for PtirqManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_then_lookup_by_phys_and_virt_sid() {
        let mut mgr = PtirqManager::new();
        let id = mgr.ptirq_alloc_entry(1, false, IntrType::Msi).unwrap();
        mgr.ptirq_activate_entry(id, SourceId(0x10), SourceId(0x20), 33);
        assert!(mgr.find_by_phys(IntrType::Msi, SourceId(0x10)).is_some());
        assert!(mgr.find_by_virt(IntrType::Msi, SourceId(0x20), 1).is_some());
        assert!(mgr.find_by_virt(IntrType::Msi, SourceId(0x20), 2).is_none());
    }

    #[test]
    fn service_vm_interrupt_enqueues_immediately() {
        let mut mgr = PtirqManager::new();
        mgr.intr_inject_delay = Duration::from_millis(5);
        let id = mgr.ptirq_alloc_entry(0, true, IntrType::Intx).unwrap();
        mgr.on_physical_interrupt(id, Instant::now());
        assert_eq!(mgr.ptirq_dequeue_softirq(Instant::now()), Some(id));
    }

    #[test]
    fn user_vm_interrupt_is_delayed_then_dequeued_after_expiry() {
        let mut mgr = PtirqManager::new();
        mgr.intr_inject_delay = Duration::from_millis(1);
        let id = mgr.ptirq_alloc_entry(2, false, IntrType::Intx).unwrap();
        let now = Instant::now();
        mgr.on_physical_interrupt(id, now);
        assert_eq!(mgr.ptirq_dequeue_softirq(now), None);
        let later = now + Duration::from_millis(2);
        assert_eq!(mgr.ptirq_dequeue_softirq(later), Some(id));
    }

    #[test]
    fn release_all_entries_for_vm_clears_indices() {
        let mut mgr = PtirqManager::new();
        let id = mgr.ptirq_alloc_entry(5, false, IntrType::Msi).unwrap();
        mgr.ptirq_activate_entry(id, SourceId(1), SourceId(2), 7);
        mgr.ptdev_release_all_entries(5);
        assert!(mgr.find_by_phys(IntrType::Msi, SourceId(1)).is_none());
        assert!(mgr.entry(id).is_none());
    }
}
