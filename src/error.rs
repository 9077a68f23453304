// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors produced by the container core. The command line layer wraps these
//! in `anyhow` with file context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("payload of {size} bytes exceeds UF2 max of 476")]
    PayloadTooLarge { size: usize },

    /// A block would start before the logical end of the block preceding it.
    #[error(
        "block at address {address:#010x} is out of order: previous block \
         ends at {end:#010x}"
    )]
    OutOfOrder { address: u32, end: u64 },

    #[error("chunk size {0} must be between 1 and 476")]
    InvalidChunkSize(usize),

    #[error("{len} bytes at base address {base:#010x} would wrap the 32-bit address space")]
    AddressOverflow { base: u32, len: usize },

    #[error("container has changed since it was last scanned")]
    Unscanned,

    #[error("bad family table: {0}")]
    Family(String),
}
