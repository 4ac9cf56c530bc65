// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Passthrough interrupt remapping.

pub mod ptdev;

pub use ptdev::{IntrType, PtirqEntry, PtirqManager, SourceId};
