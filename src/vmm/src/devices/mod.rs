// SPDX-License-Identifier: Apache-2.0

pub(crate) mod serial;

/// Custom defined [`std::result::Result`]
pub type Result<T> = std::result::Result<T, Error>;

/// Error related to the emulated console device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on the console device: {0}")]
    Io(#[from] std::io::Error),
}
