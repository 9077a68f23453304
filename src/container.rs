// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An ordered sequence of UF2 blocks and the address-space views derived from
//! it.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::family::FamilyRegistry;
use crate::format::{Block, BLOCK_LEN, DATA_LEN};

/// Superblock signature of a littlefs v2 filesystem. It sits near the start of
/// each of the first two filesystem blocks, which are 4 KiB aligned in flash.
pub const FS_SIGNATURE: &[u8] = b"\xF0\x0F\xFF\xF7littlefs/\xE0\x00\x10";

/// Alignment at which [`FS_SIGNATURE`] is searched for.
pub const FS_ALIGN: u32 = 4096;

/// Views derived from a container's blocks by [`Container::scan`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scan {
    /// Family name to lowest target address among its blocks.
    pub families: BTreeMap<String, u32>,
    /// `(start, end)` of each run of address-contiguous, non-blank blocks,
    /// in container order. `end` is exclusive, so it is 64 bits wide to
    /// describe a block that ends at the top of the address space.
    pub ranges: Vec<(u32, u64)>,
    /// Indices of blocks that carry a filesystem superblock signature.
    pub signatures: Vec<usize>,
}

/// A UF2 image as an ordered list of blocks.
///
/// Blocks are only added through [`append`](Self::append) and
/// [`extend`](Self::extend), which keep target addresses monotonic. Any
/// mutation throws away the derived views; call [`scan`](Self::scan) before
/// reading them or serializing.
#[derive(Clone, Debug, Default)]
pub struct Container {
    blocks: Vec<Block>,
    scan: Option<Scan>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every valid record in `image`, in file order. Records with bad
    /// magic are skipped, as is a partial record at the end of the image.
    ///
    /// Blocks are taken as they appear, without the ordering check that
    /// `append` does; an existing file is whatever it is. The result is not
    /// yet scanned.
    pub fn decode(image: &[u8]) -> Self {
        let mut blocks = Vec::with_capacity(image.len() / BLOCK_LEN);
        let records = image.chunks_exact(BLOCK_LEN);
        let trailing = records.remainder().len();

        for (i, raw) in records.enumerate() {
            let Some(block) = Block::decode(raw) else {
                info!(
                    "skipping record at offset {:#x}: bad magic",
                    i * BLOCK_LEN,
                );
                continue;
            };
            if block.payload_size as usize > DATA_LEN {
                warn!(
                    "record at offset {:#x} claims impossible length {}",
                    i * BLOCK_LEN,
                    block.payload_size,
                );
            }
            blocks.push(block);
        }

        if trailing != 0 {
            info!("ignoring {} trailing bytes after last full record", trailing);
        }
        debug!("decoded {} blocks", blocks.len());

        Self { blocks, scan: None }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn first(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// First address past the last block, or `None` if empty.
    pub fn end_address(&self) -> Option<u64> {
        self.last().map(Block::end_address)
    }

    /// Adds `block` at the end. It must not start before the end of the
    /// current last block. Its `block_no` is set to its index.
    pub fn append(&mut self, mut block: Block) -> Result<()> {
        if let Some(end) = self.end_address() {
            if u64::from(block.target_addr) < end {
                return Err(Error::OutOfOrder {
                    address: block.target_addr,
                    end,
                });
            }
        }
        block.block_no = self.blocks.len() as u32;
        self.blocks.push(block);
        self.scan = None;
        Ok(())
    }

    /// Appends each block in turn. Stops at the first failure, leaving the
    /// blocks before it in place; a container that failed to extend should be
    /// discarded.
    pub fn extend(&mut self, blocks: impl IntoIterator<Item = Block>) -> Result<()> {
        for block in blocks {
            self.append(block)?;
        }
        Ok(())
    }

    /// Rewrites `block_no` and `num_blocks` of every block to describe this
    /// container as a whole.
    pub fn renumber(&mut self) {
        let total = self.blocks.len() as u32;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.block_no = i as u32;
            block.num_blocks = total;
        }
        self.scan = None;
    }

    /// Recomputes the family, range and signature views.
    pub fn scan(&mut self, registry: &FamilyRegistry) {
        let families = scan_families(&self.blocks, registry);
        let ranges = scan_ranges(&self.blocks);
        let signatures = scan_signatures(&self.blocks);
        self.scan = Some(Scan { families, ranges, signatures });
    }

    /// The views from the last `scan`, if nothing has changed since.
    pub fn scanned(&self) -> Option<&Scan> {
        self.scan.as_ref()
    }

    /// Serializes every block. Refuses to run on a container that has
    /// changed since its last scan.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.scan.is_none() {
            return Err(Error::Unscanned);
        }
        let mut out = Vec::with_capacity(self.blocks.len() * BLOCK_LEN);
        for block in &self.blocks {
            out.extend_from_slice(&block.encode());
        }
        Ok(out)
    }
}

fn scan_families(
    blocks: &[Block],
    registry: &FamilyRegistry,
) -> BTreeMap<String, u32> {
    let mut families = BTreeMap::new();
    for block in blocks {
        if let Some(id) = block.family_id() {
            families.entry(registry.name_of(id).to_string())
                .and_modify(|addr: &mut u32| *addr = (*addr).min(block.target_addr))
                .or_insert(block.target_addr);
        }
    }
    families
}

/// Splits the blocks into runs. A run ends at an address gap, and also at any
/// block whose payload is entirely zero; such a block starts the next run.
///
/// NOTE: a blank block is treated as a placeholder even if it is genuine
/// zero-filled data inside a firmware image. Existing images are reported this
/// way, so we keep it.
fn scan_ranges(blocks: &[Block]) -> Vec<(u32, u64)> {
    let mut ranges = vec![];
    let mut start: Option<u32> = None;
    let mut last_address = 0u64;

    for block in blocks {
        match start {
            None => start = Some(block.target_addr),
            Some(s) if u64::from(block.target_addr) != last_address || block.is_blank() => {
                ranges.push((s, last_address));
                start = Some(block.target_addr);
            }
            Some(_) => (),
        }
        last_address = block.end_address();
    }
    if let Some(s) = start {
        ranges.push((s, last_address));
    }
    ranges
}

fn scan_signatures(blocks: &[Block]) -> Vec<usize> {
    blocks.iter()
        .enumerate()
        .filter(|(_, block)| block.target_addr % FS_ALIGN == 0)
        .filter(|(_, block)| {
            block.data.windows(FS_SIGNATURE.len()).any(|w| w == FS_SIGNATURE)
        })
        .map(|(i, block)| {
            info!(
                "found littlefs superblock in block {} at {:#010x}",
                i,
                block.target_addr,
            );
            i
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Flags;

    fn block_at(addr: u32, payload: &[u8]) -> Block {
        let mut block = Block::new(payload).unwrap();
        block.target_addr = addr;
        block
    }

    fn family_block(addr: u32, family: u32) -> Block {
        let mut block = block_at(addr, &[1; 16]);
        block.flags = Flags::FAMILY_ID_PRESENT;
        block.reserved = family;
        block
    }

    fn scanned(blocks: Vec<Block>) -> Container {
        let mut c = Container::new();
        c.extend(blocks).unwrap();
        c.scan(&FamilyRegistry::builtin());
        c
    }

    #[test]
    fn append_assigns_block_numbers() {
        let c = scanned(vec![
            block_at(0x100, &[1; 16]),
            block_at(0x110, &[1; 16]),
        ]);
        let numbers: Vec<_> = c.blocks().iter().map(|b| b.block_no).collect();
        assert_eq!(numbers, [0, 1]);
    }

    #[test]
    fn append_rejects_overlap() {
        let mut c = Container::new();
        c.append(block_at(0x100, &[1; 16])).unwrap();
        assert_eq!(
            c.append(block_at(0x10F, &[1; 16])),
            Err(Error::OutOfOrder { address: 0x10F, end: 0x110 }),
        );
        assert_eq!(
            c.append(block_at(0x0, &[1; 16])),
            Err(Error::OutOfOrder { address: 0x0, end: 0x110 }),
        );
        assert_eq!(c.len(), 1);
        // Touching is fine, and so is a gap.
        c.append(block_at(0x110, &[1; 16])).unwrap();
        c.append(block_at(0x400, &[1; 16])).unwrap();
    }

    #[test]
    fn successful_appends_are_monotonic() {
        let mut c = Container::new();
        let mut addr = 0x1000_0000u32;
        for i in 0..50u32 {
            let len = (i * 37 % 476) as usize + 1;
            let _ = c.append(block_at(addr, &vec![0xEE; len]));
            // Every few blocks try something that must fail.
            if i % 7 == 0 {
                let _ = c.append(block_at(addr, &[1]));
            }
            addr += (i * 13 % 300) + 1;
        }
        for pair in c.blocks().windows(2) {
            assert!(pair[0].end_address() <= u64::from(pair[1].target_addr));
        }
    }

    #[test]
    fn extend_stops_at_first_failure() {
        let mut c = Container::new();
        let result = c.extend(vec![
            block_at(0x0, &[1; 16]),
            block_at(0x10, &[1; 16]),
            block_at(0x8, &[1; 16]),
            block_at(0x100, &[1; 16]),
        ]);
        assert_eq!(result, Err(Error::OutOfOrder { address: 0x8, end: 0x20 }));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn ranges_split_at_gaps() {
        let c = scanned(vec![
            block_at(0x0, &[1; 16]),
            block_at(0x10, &[1; 16]),
            block_at(0x30, &[1; 16]),
        ]);
        assert_eq!(c.scanned().unwrap().ranges, [(0x0, 0x20), (0x30, 0x40)]);
    }

    #[test]
    fn blank_block_splits_range() {
        let c = scanned(vec![
            block_at(0x0, &[1; 16]),
            block_at(0x10, &[0; 16]),
            block_at(0x20, &[1; 16]),
        ]);
        assert_eq!(c.scanned().unwrap().ranges, [(0x0, 0x10), (0x10, 0x30)]);
    }

    #[test]
    fn run_of_blank_blocks_gives_one_range_each() {
        let c = scanned(vec![
            block_at(0x0, &[0; 16]),
            block_at(0x10, &[0; 16]),
            block_at(0x20, &[0; 16]),
        ]);
        assert_eq!(
            c.scanned().unwrap().ranges,
            [(0x0, 0x10), (0x10, 0x20), (0x20, 0x30)],
        );
    }

    #[test]
    fn range_ending_at_top_of_address_space() {
        let c = scanned(vec![block_at(u32::MAX - 15, &[1; 16])]);
        assert_eq!(c.scanned().unwrap().ranges, [(0xFFFF_FFF0, 0x1_0000_0000)]);
    }

    #[test]
    fn empty_container_has_no_views() {
        let c = scanned(vec![]);
        assert_eq!(c.scanned(), Some(&Scan::default()));
    }

    #[test]
    fn family_scan_keeps_lowest_address() {
        // Decoded images aren't necessarily sorted, so go through decode.
        let mut image = vec![];
        image.extend_from_slice(&family_block(0x2000, 0xe48bff56).encode());
        image.extend_from_slice(&family_block(0x1000, 0xe48bff56).encode());
        image.extend_from_slice(&family_block(0x3000, 0x1234_5678).encode());
        image.extend_from_slice(&block_at(0x0, &[1; 16]).encode());
        let mut c = Container::decode(&image);
        c.scan(&FamilyRegistry::builtin());

        let families = &c.scanned().unwrap().families;
        assert_eq!(families.len(), 2);
        assert_eq!(families["RP2040"], 0x1000);
        assert_eq!(families["unknown"], 0x3000);
    }

    #[test]
    fn signature_only_counts_on_aligned_blocks() {
        let mut payload = vec![0xFF; 100];
        payload.extend_from_slice(FS_SIGNATURE);
        let c = scanned(vec![
            block_at(0x1000, &payload),
            block_at(0x1100, &payload),
            block_at(0x2000, &[1; 16]),
            block_at(0x3000, &payload),
        ]);
        assert_eq!(c.scanned().unwrap().signatures, [0, 3]);
    }

    #[test]
    fn signature_found_past_payload_size() {
        // The whole data buffer is searched, not just the declared payload.
        let mut block = block_at(0x4000, &[]);
        block.data[400..400 + FS_SIGNATURE.len()].copy_from_slice(FS_SIGNATURE);
        let c = scanned(vec![block]);
        assert_eq!(c.scanned().unwrap().signatures, [0]);
    }

    #[test]
    fn decode_drops_corrupt_records() {
        let mut image = vec![];
        for i in 0..5u32 {
            let mut raw = block_at(i * 0x100, &[1; 16]).encode();
            if i % 2 == 1 {
                raw[509] = 0;
            }
            image.extend_from_slice(&raw);
        }
        // Trailing partial record is ignored too.
        image.extend_from_slice(&[0x55; 100]);

        let c = Container::decode(&image);
        assert_eq!(c.len(), 3);
        let addrs: Vec<_> = c.blocks().iter().map(|b| b.target_addr).collect();
        assert_eq!(addrs, [0x0, 0x200, 0x400]);
    }

    #[test]
    fn mutation_invalidates_scan() {
        let mut c = scanned(vec![block_at(0x0, &[1; 16])]);
        assert!(c.to_bytes().is_ok());

        c.append(block_at(0x10, &[1; 16])).unwrap();
        assert!(c.scanned().is_none());
        assert_eq!(c.to_bytes(), Err(Error::Unscanned));

        c.scan(&FamilyRegistry::builtin());
        assert_eq!(c.to_bytes().unwrap().len(), 2 * BLOCK_LEN);
    }

    #[test]
    fn serialized_image_decodes_to_same_blocks() {
        let mut c = scanned(vec![
            family_block(0x1000_0000, 0xe48bff56),
            family_block(0x1000_0010, 0xe48bff56),
        ]);
        c.renumber();
        c.scan(&FamilyRegistry::builtin());
        let again = Container::decode(&c.to_bytes().unwrap());
        assert_eq!(again.blocks(), c.blocks());
        assert!(again.blocks().iter().all(|b| b.num_blocks == 2));
    }
}
