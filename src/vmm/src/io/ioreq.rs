// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! I/O request representation, the shared request ring, and `emulate_io`.
//!
//! Grounded on `hypervisor/include/dm/io_req.h` and
//! `hypervisor/arch/x86/guest/vmx_io.c`. The original's `union
//! vhm_io_request` page shared with the Service VM via a hypervisor-visible
//! GPA is stood in for by a fixed-size, `#[repr(C)]` in-process ring (one
//! slot per vCPU index) that a device-model thread drains instead of a
//! second VM.

use std::sync::{Arc, Mutex};

use super::bus::{MmioBus, PioBus, RangeLookup};
use crate::sched::{ScheduleControl, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Mirrors spec.md §3's `IoRequest` tagged union.
#[derive(Debug, Clone, Copy)]
pub enum IoRequest {
    Pio {
        port: u16,
        size: u8,
        direction: IoDirection,
        value: u32,
    },
    Mmio {
        addr: u64,
        size: u8,
        direction: IoDirection,
        value: u64,
    },
    PciCfgRead {
        bus: u8,
        device: u8,
        function: u8,
        offset: u16,
        size: u8,
    },
    PciCfgWrite {
        bus: u8,
        device: u8,
        function: u8,
        offset: u16,
        size: u8,
        value: u32,
    },
    /// A write into a range explicitly registered as read-only; the DM (not
    /// the handler) decides whether to accept or drop it.
    WriteProtected {
        addr: u64,
        size: u8,
        value: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    Ready = 1,
    Processing = 2,
    Success = 3,
    Failed = 4,
}

/// Wire-stable layout: standing in for the VHM/DM shared request page, kept
/// `#[repr(C)]` in case this ring is ever mapped across a process boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoSlot {
    pub valid: bool,
    pub state: SlotState,
    pub vcpu: u16,
    pub request: IoRequestRaw,
}

/// `IoRequest` flattened into a POD shape suitable for `#[repr(C)]`
/// embedding; `IoRequestRing` converts to/from the ergonomic `IoRequest`
/// enum at its API boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoRequestRaw {
    pub kind: u8,
    pub addr: u64,
    pub size: u8,
    pub is_write: bool,
    pub value: u64,
    pub pci_bdf: u32,
}

impl From<IoRequest> for IoRequestRaw {
    fn from(req: IoRequest) -> Self {
        match req {
            IoRequest::Pio { port, size, direction, value } => IoRequestRaw {
                kind: 0,
                addr: port as u64,
                size,
                is_write: direction == IoDirection::Write,
                value: value as u64,
                pci_bdf: 0,
            },
            IoRequest::Mmio { addr, size, direction, value } => IoRequestRaw {
                kind: 1,
                addr,
                size,
                is_write: direction == IoDirection::Write,
                value,
                pci_bdf: 0,
            },
            IoRequest::PciCfgRead { bus, device, function, offset, size } => IoRequestRaw {
                kind: 2,
                addr: offset as u64,
                size,
                is_write: false,
                value: 0,
                pci_bdf: bdf(bus, device, function),
            },
            IoRequest::PciCfgWrite { bus, device, function, offset, size, value } => IoRequestRaw {
                kind: 3,
                addr: offset as u64,
                size,
                is_write: true,
                value: value as u64,
                pci_bdf: bdf(bus, device, function),
            },
            IoRequest::WriteProtected { addr, size, value } => IoRequestRaw {
                kind: 4,
                addr,
                size,
                is_write: true,
                value,
                pci_bdf: 0,
            },
        }
    }
}

fn bdf(bus: u8, device: u8, function: u8) -> u32 {
    ((bus as u32) << 8) | ((device as u32) << 3) | function as u32
}

const MAX_VCPUS: usize = 16;

/// Fixed-size ring indexed by vCPU id, draining to a device-model thread.
pub struct IoRequestRing {
    slots: Mutex<[IoSlot; MAX_VCPUS]>,
}

impl IoRequestRing {
    pub fn new() -> Arc<Self> {
        let empty = IoSlot {
            valid: false,
            state: SlotState::Free,
            vcpu: 0,
            request: IoRequestRaw {
                kind: 0,
                addr: 0,
                size: 0,
                is_write: false,
                value: 0,
                pci_bdf: 0,
            },
        };
        Arc::new(IoRequestRing {
            slots: Mutex::new([empty; MAX_VCPUS]),
        })
    }

    pub fn post(&self, vcpu: u16, request: IoRequest) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[vcpu as usize % MAX_VCPUS];
        slot.valid = true;
        slot.state = SlotState::Ready;
        slot.vcpu = vcpu;
        slot.request = request.into();
    }

    pub fn state(&self, vcpu: u16) -> SlotState {
        self.slots.lock().unwrap()[vcpu as usize % MAX_VCPUS].state
    }

    pub fn take_ready(&self, vcpu: u16) -> Option<IoRequestRaw> {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[vcpu as usize % MAX_VCPUS];
        if slot.valid && slot.state == SlotState::Ready {
            slot.state = SlotState::Processing;
            Some(slot.request)
        } else {
            None
        }
    }

    /// Completes a slot with the DM-produced result, writing the read-back
    /// value (ignored for writes) and clearing `valid`.
    pub fn complete(&self, vcpu: u16, success: bool, read_value: u64) -> Option<u64> {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[vcpu as usize % MAX_VCPUS];
        if !slot.valid {
            return None;
        }
        slot.state = if success { SlotState::Success } else { SlotState::Failed };
        if !slot.request.is_write {
            slot.request.value = read_value;
        }
        slot.valid = false;
        Some(slot.request.value)
    }

    /// Read-side counterpart to `complete`: called by the vCPU thread after
    /// it is woken from `sleep_thread` to learn the terminal state and (for
    /// reads) the value to place into the guest's destination register
    /// (spec.md §4.5's wake routine). Does not mutate the slot; the next
    /// `post` overwrites it.
    pub fn outcome(&self, vcpu: u16) -> (SlotState, u64) {
        let slots = self.slots.lock().unwrap();
        let slot = &slots[vcpu as usize % MAX_VCPUS];
        (slot.state, slot.request.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulateResult {
    /// Write emulated synchronously by a registered handler.
    Handled,
    /// Read emulated synchronously by a registered handler; carries the
    /// value the caller must place into the decoded destination register
    /// (spec.md §8's read-value testable property).
    HandledRead(u64),
    /// Delivered to the device-model ring; the vCPU thread should sleep.
    Pending,
    /// The access spans more than one handler's range (spec.md §4.5, `-EIO`).
    SplitAccess,
    /// No handler and no fallback; treated as `-EINVAL` upstream.
    NoHandler,
}

/// Implements spec.md §4.5's 4-branch `emulate_io` algorithm: single handler
/// -> call it; split access -> `-EIO`; no handler -> ring dispatch plus
/// `sleep_thread` on the requesting vCPU's thread.
pub fn emulate_io(
    pio_bus: &PioBus,
    ring: &IoRequestRing,
    sched: &ScheduleControl,
    vcpu_thread: ThreadId,
    vcpu_idx: u16,
    port: u16,
    size: u8,
    direction: IoDirection,
    value: u32,
) -> EmulateResult {
    match pio_bus.lookup(port, size) {
        RangeLookup::Whole(idx) => {
            let handler = pio_bus.handler(idx).expect("index from lookup is valid");
            match direction {
                IoDirection::Read => {
                    if let Some(read) = &handler.read {
                        return EmulateResult::HandledRead(read(port, size) as u64);
                    }
                    EmulateResult::Handled
                }
                IoDirection::Write => {
                    if let Some(write) = &handler.write {
                        write(port, size, value);
                    }
                    EmulateResult::Handled
                }
            }
        }
        RangeLookup::Split => EmulateResult::SplitAccess,
        RangeLookup::NoHandler => {
            ring.post(
                vcpu_idx,
                IoRequest::Pio { port, size, direction, value },
            );
            sched.sleep_thread(vcpu_thread);
            EmulateResult::Pending
        }
    }
}

pub fn emulate_mmio(
    mmio_bus: &MmioBus,
    ring: &IoRequestRing,
    sched: &ScheduleControl,
    vcpu_thread: ThreadId,
    vcpu_idx: u16,
    addr: u64,
    size: u8,
    direction: IoDirection,
    value: u64,
) -> EmulateResult {
    match mmio_bus.lookup(addr, size) {
        RangeLookup::Whole(idx) => {
            let handler = mmio_bus.handler(idx).expect("index from lookup is valid");
            match direction {
                IoDirection::Read => {
                    if let Some(read) = &handler.read {
                        return EmulateResult::HandledRead(read(addr, size));
                    }
                    EmulateResult::Handled
                }
                IoDirection::Write => {
                    if let Some(write) = &handler.write {
                        write(addr, size, value);
                    }
                    EmulateResult::Handled
                }
            }
        }
        RangeLookup::Split => EmulateResult::SplitAccess,
        RangeLookup::NoHandler => {
            ring.post(vcpu_idx, IoRequest::Mmio { addr, size, direction, value });
            sched.sleep_thread(vcpu_thread);
            EmulateResult::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bus::PioHandler;
    use crate::sched::iorr::IorrPolicy;
    use crate::sched::SchedParams;

    #[test]
    fn whole_access_calls_handler_directly() {
        let mut bus = PioBus::new();
        bus.register(PioHandler {
            range: 0x3f8..0x400,
            read: None,
            write: Some(Box::new(|_, _, _| {})),
        });
        let ring = IoRequestRing::new();
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let id = sched.alloc_thread_id();
        sched.init_thread_data(id, SchedParams::default());
        let res = emulate_io(&bus, &ring, &sched, id, 0, 0x3f8, 1, IoDirection::Write, 0x41);
        assert_eq!(res, EmulateResult::Handled);
    }

    #[test]
    fn whole_access_read_returns_handler_value_to_caller() {
        let mut bus = PioBus::new();
        bus.register(PioHandler {
            range: 0x3f8..0x400,
            read: Some(Box::new(|_, _| 0x5a)),
            write: None,
        });
        let ring = IoRequestRing::new();
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let id = sched.alloc_thread_id();
        sched.init_thread_data(id, SchedParams::default());
        let res = emulate_io(&bus, &ring, &sched, id, 0, 0x3f8, 1, IoDirection::Read, 0);
        assert_eq!(res, EmulateResult::HandledRead(0x5a));
    }

    #[test]
    fn no_handler_posts_to_ring_and_sleeps_vcpu() {
        let bus = PioBus::new();
        let ring = IoRequestRing::new();
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let id = sched.alloc_thread_id();
        sched.init_thread_data(id, SchedParams::default());
        sched.wake_thread(id);
        sched.schedule();
        let res = emulate_io(&bus, &ring, &sched, id, 2, 0xcf8, 4, IoDirection::Read, 0);
        assert_eq!(res, EmulateResult::Pending);
        assert_eq!(ring.state(2), SlotState::Ready);
    }

    #[test]
    fn split_access_across_two_handlers_is_eio_equivalent() {
        let mut bus = PioBus::new();
        bus.register(PioHandler { range: 0x60..0x61, read: None, write: None });
        bus.register(PioHandler { range: 0x61..0x62, read: None, write: None });
        let ring = IoRequestRing::new();
        let sched = ScheduleControl::new(0, Box::new(IorrPolicy::new())).unwrap();
        let id = sched.alloc_thread_id();
        sched.init_thread_data(id, SchedParams::default());
        let res = emulate_io(&bus, &ring, &sched, id, 0, 0x60, 2, IoDirection::Read, 0);
        assert_eq!(res, EmulateResult::SplitAccess);
    }

    #[test]
    fn complete_slot_writes_back_read_value() {
        let ring = IoRequestRing::new();
        ring.post(0, IoRequest::Pio { port: 0x60, size: 1, direction: IoDirection::Read, value: 0 });
        let v = ring.complete(0, true, 0xab);
        assert_eq!(v, Some(0xab));
        assert_eq!(ring.state(0), SlotState::Success);
    }
}
