// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest-physical memory region registry and memory-type propagation.

pub mod ept;

pub use ept::{CacheAttr, EptError, EptManager, MemRegion, MemoryTypeTable, VirtualMtrr};
