// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! I/O request routing: PIO/MMIO handler lists, the shared request ring,
//! and the `emulate_io` dispatch algorithm.

pub mod bus;
pub mod ioreq;
pub mod lock_instr;

pub use ioreq::{
    emulate_io, emulate_mmio, EmulateResult, IoDirection, IoRequest, IoRequestRing, IoSlot,
    SlotState,
};
