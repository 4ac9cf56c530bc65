// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Hypercall dispatch gate.

pub mod gate;

pub use gate::{GuestException, HypercallError, HypercallGate, HypercallId};
