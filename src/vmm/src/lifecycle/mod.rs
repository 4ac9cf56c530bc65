// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest lifecycle protocol endpoint (shutdown/reboot handshake).

pub mod protocol;

pub use protocol::{LifecycleError, ShutdownState, Transport, Vocabulary};
