// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrapping an arbitrary byte blob, typically a filesystem image, into UF2
//! blocks.

use tracing::debug;

use crate::container::Container;
use crate::error::{Error, Result};
use crate::format::{Block, Flags, DATA_LEN};

/// Splits `buffer` into blocks of at most `chunk_size` bytes laid out
/// contiguously from `base_address`. `chunk_size` is normally `DATA_LEN`,
/// the most a block can carry.
///
/// If `family_id` is nonzero, every block is tagged with it. The blocks are
/// numbered as a standalone image: `block_no` counts from zero and
/// `num_blocks` is the total.
pub fn convert(
    buffer: &[u8],
    family_id: u32,
    base_address: u32,
    chunk_size: usize,
) -> Result<Container> {
    if chunk_size == 0 || chunk_size > DATA_LEN {
        return Err(Error::InvalidChunkSize(chunk_size));
    }
    // The last byte has to land at or below u32::MAX.
    let room = u64::from(u32::MAX - base_address) + 1;
    if buffer.len() as u64 > room {
        return Err(Error::AddressOverflow {
            base: base_address,
            len: buffer.len(),
        });
    }

    let mut image = Container::new();
    for (i, chunk) in buffer.chunks(chunk_size).enumerate() {
        let mut block = Block::new(chunk)?;
        if family_id != 0 {
            block.flags = Flags::FAMILY_ID_PRESENT;
            block.reserved = family_id;
        }
        // Bounded by the room check above.
        block.target_addr = base_address + (i * chunk_size) as u32;
        image.append(block)?;
    }
    image.renumber();

    debug!(
        "converted {} bytes into {} blocks at {:#010x}",
        buffer.len(),
        image.len(),
        base_address,
    );
    Ok(image)
}
