// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Combining a firmware image with a second image placed after it.

use tracing::debug;

use crate::container::Container;
use crate::error::{Error, Result};
use crate::family::FamilyRegistry;
use crate::format::{Block, DATA_LEN};

/// Appends every block of `addition` to `base`, renumbers the result as one
/// image, and rescans it.
///
/// `addition` must begin at or after the end of `base`'s last block. If it
/// doesn't, `base` is left exactly as it was. No other placement checks are
/// done here: whether the addition lands inside the intended flash region is
/// up to the caller.
pub fn merge(
    base: &mut Container,
    addition: Container,
    registry: &FamilyRegistry,
) -> Result<()> {
    if let (Some(end), Some(first)) = (base.end_address(), addition.first()) {
        if u64::from(first.target_addr) < end {
            return Err(Error::OutOfOrder {
                address: first.target_addr,
                end,
            });
        }
    }

    let added = addition.len();
    base.extend(addition.blocks().iter().cloned())?;
    base.renumber();
    base.scan(registry);

    debug!("merged {} blocks, image is now {} blocks", added, base.len());
    Ok(())
}

/// Payload of the marker block.
const END_MARKER_PAYLOAD: &[u8] = b"foo";
/// Length the marker block claims, which is longer than what it carries.
const END_MARKER_LEN: u32 = 256;

/// Builds the short trailing block that is written after a merged drive to
/// mark the end of the image.
pub fn end_marker(address: u32) -> Block {
    let mut data = [0; DATA_LEN];
    data[..END_MARKER_PAYLOAD.len()].copy_from_slice(END_MARKER_PAYLOAD);
    Block {
        target_addr: address,
        payload_size: END_MARKER_LEN,
        data,
        ..Block::empty()
    }
}
