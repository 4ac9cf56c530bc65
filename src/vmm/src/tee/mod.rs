// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! TEE/REE companion-VM world switch.

pub mod world_switch;

pub use world_switch::{GuestRegs, WorldSwitchError, WorldSwitcher};
