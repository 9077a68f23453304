// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UF2 file format definitions, magic constants, and the block codec.

use std::fmt;
use std::ops::BitOr;

use zerocopy::{AsBytes, FromBytes, LayoutVerified, U32};
use byteorder::LittleEndian;

use crate::error::{Error, Result};

/// Size of one UF2 record on disk.
pub const BLOCK_LEN: usize = 512;
/// Size of the payload buffer inside a record.
pub const DATA_LEN: usize = 476;

/// On-disk layout of a UF2 record. Only used at the encode/decode boundary;
/// the rest of the program works with [`Block`].
#[derive(Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct Uf2Record {
    pub magic: [U32<LittleEndian>; 2],
    pub flags: U32<LittleEndian>,
    pub address: U32<LittleEndian>,
    pub length: U32<LittleEndian>,
    pub block_no: U32<LittleEndian>,
    pub total_blocks: U32<LittleEndian>,
    pub family_id: U32<LittleEndian>,

    pub data: [u8; DATA_LEN],

    pub final_magic: U32<LittleEndian>,
}

impl Uf2Record {
    pub const MAGIC: [u32; 2] = [0x0A324655, 0x9E5D5157];
    pub const FINAL_MAGIC: u32 = 0x0AB16F30;

    fn has_valid_magic(&self) -> bool {
        self.magic[0].get() == Self::MAGIC[0]
            && self.magic[1].get() == Self::MAGIC[1]
            && self.final_magic.get() == Self::FINAL_MAGIC
    }
}

/// The `flags` word of a UF2 block.
///
/// Bits we don't recognize are preserved through decode and encode but
/// otherwise ignored; the format reserves room for future extensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    /// Comment block, not to be written to main flash.
    pub const NO_FLASH: Flags = Flags(0x0000_0001);
    pub const FILE_CONTAINER: Flags = Flags(0x0000_1000);
    /// `reserved` holds a family ID rather than a file size.
    pub const FAMILY_ID_PRESENT: Flags = Flags(0x0000_2000);
    pub const MD5_PRESENT: Flags = Flags(0x0000_4000);
    pub const EXTENSION_TAGS_PRESENT: Flags = Flags(0x0000_8000);

    /// Every bit this program knows about, with a human description.
    pub const KNOWN: [(Flags, &'static str); 5] = [
        (Flags::NO_FLASH, "do not flash to device"),
        (Flags::FILE_CONTAINER, "file container"),
        (Flags::FAMILY_ID_PRESENT, "family ID present"),
        (Flags::MD5_PRESENT, "MD5 hash present"),
        (Flags::EXTENSION_TAGS_PRESENT, "extension tags present"),
    ];

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Descriptions of the recognized bits that are set, in bit order.
    pub fn descriptions(self) -> impl Iterator<Item = &'static str> {
        Self::KNOWN.into_iter()
            .filter(move |(f, _)| self.contains(*f))
            .map(|(_, desc)| desc)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)?;
        let mut first = true;
        for desc in self.descriptions() {
            f.write_str(if first { " (" } else { ", " })?;
            f.write_str(desc)?;
            first = false;
        }
        if !first {
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// A single valid UF2 block. Magic numbers are implied: a `Block` only exists
/// for records whose magic checked out, and the encoder writes them back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub flags: Flags,
    pub target_addr: u32,
    /// Number of meaningful bytes at the front of `data`.
    pub payload_size: u32,
    pub block_no: u32,
    pub num_blocks: u32,
    /// Family ID if `FAMILY_ID_PRESENT` is set, file size or zero otherwise.
    pub reserved: u32,
    pub data: [u8; DATA_LEN],
}

impl Block {
    /// A block with no payload and every field zeroed.
    pub const fn empty() -> Self {
        Self {
            flags: Flags::empty(),
            target_addr: 0,
            payload_size: 0,
            block_no: 0,
            num_blocks: 0,
            reserved: 0,
            data: [0; DATA_LEN],
        }
    }

    /// Creates a block holding `payload`, zero padded, with every other field
    /// zeroed for the caller to fill in.
    pub fn new(payload: &[u8]) -> Result<Self> {
        if payload.len() > DATA_LEN {
            return Err(Error::PayloadTooLarge { size: payload.len() });
        }
        let mut data = [0; DATA_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            payload_size: payload.len() as u32,
            data,
            ..Self::empty()
        })
    }

    /// Parses one 512-byte record. Returns `None` if `raw` is the wrong size
    /// or any of the three magic numbers is wrong; that is a signal to skip the
    /// record, not an error.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != BLOCK_LEN {
            return None;
        }
        // Uf2Record has alignment 1, so this only fails on size.
        let record = LayoutVerified::<_, Uf2Record>::new(raw)?.into_ref();
        if !record.has_valid_magic() {
            return None;
        }
        Some(Self {
            flags: Flags::from_bits(record.flags.get()),
            target_addr: record.address.get(),
            payload_size: record.length.get(),
            block_no: record.block_no.get(),
            num_blocks: record.total_blocks.get(),
            reserved: record.family_id.get(),
            data: record.data,
        })
    }

    /// Produces the exact on-disk representation of this block.
    pub fn encode(&self) -> [u8; BLOCK_LEN] {
        let record = Uf2Record {
            magic: [
                U32::new(Uf2Record::MAGIC[0]),
                U32::new(Uf2Record::MAGIC[1]),
            ],
            flags: U32::new(self.flags.bits()),
            address: U32::new(self.target_addr),
            length: U32::new(self.payload_size),
            block_no: U32::new(self.block_no),
            total_blocks: U32::new(self.num_blocks),
            family_id: U32::new(self.reserved),
            data: self.data,
            final_magic: U32::new(Uf2Record::FINAL_MAGIC),
        };
        let mut out = [0; BLOCK_LEN];
        out.copy_from_slice(record.as_bytes());
        out
    }

    /// The meaningful part of `data`. A decoded block may claim more than
    /// `DATA_LEN` bytes; the view is clamped rather than trusted.
    pub fn payload(&self) -> &[u8] {
        let len = usize::try_from(self.payload_size)
            .unwrap_or(DATA_LEN)
            .min(DATA_LEN);
        &self.data[..len]
    }

    /// True if every payload byte is zero, which the range scan treats as an
    /// unused placeholder.
    pub fn is_blank(&self) -> bool {
        self.payload().iter().all(|&b| b == 0)
    }

    pub fn family_id(&self) -> Option<u32> {
        if self.flags.contains(Flags::FAMILY_ID_PRESENT) {
            Some(self.reserved)
        } else {
            None
        }
    }

    /// First address past this block's payload. Computed in 64 bits so that a
    /// block at the top of the address space doesn't wrap.
    pub fn end_address(&self) -> u64 {
        u64::from(self.target_addr) + u64::from(self.payload_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        let mut block = Block::new(b"hello, flash").unwrap();
        block.flags = Flags::FAMILY_ID_PRESENT | Flags::from_bits(0x0010_0000);
        block.target_addr = 0x1000_2000;
        block.block_no = 3;
        block.num_blocks = 9;
        block.reserved = 0xe48bff56;
        block
    }

    #[test]
    fn layout_is_512_bytes() {
        assert_eq!(std::mem::size_of::<Uf2Record>(), BLOCK_LEN);
    }

    #[test]
    fn new_zero_pads_and_sets_size() {
        let block = Block::new(&[0xAA; 10]).unwrap();
        assert_eq!(block.payload_size, 10);
        assert_eq!(block.flags, Flags::empty());
        assert_eq!(block.target_addr, 0);
        assert!(block.data[..10].iter().all(|&b| b == 0xAA));
        assert!(block.data[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn new_accepts_full_payload() {
        let block = Block::new(&[1; DATA_LEN]).unwrap();
        assert_eq!(block.payload_size, DATA_LEN as u32);
    }

    #[test]
    fn new_rejects_oversize_payload() {
        assert_eq!(
            Block::new(&[0; DATA_LEN + 1]),
            Err(Error::PayloadTooLarge { size: DATA_LEN + 1 }),
        );
    }

    #[test]
    fn encode_matches_wire_layout() {
        let raw = sample().encode();
        assert_eq!(&raw[0..4], &[0x55, 0x46, 0x32, 0x0A]);
        assert_eq!(&raw[4..8], &[0x57, 0x51, 0x5D, 0x9E]);
        assert_eq!(&raw[8..12], &0x0010_2000u32.to_le_bytes());
        assert_eq!(&raw[12..16], &0x1000_2000u32.to_le_bytes());
        assert_eq!(&raw[16..20], &12u32.to_le_bytes());
        assert_eq!(&raw[20..24], &3u32.to_le_bytes());
        assert_eq!(&raw[24..28], &9u32.to_le_bytes());
        assert_eq!(&raw[28..32], &0xe48bff56u32.to_le_bytes());
        assert_eq!(&raw[32..44], b"hello, flash");
        assert!(raw[44..508].iter().all(|&b| b == 0));
        assert_eq!(&raw[508..512], &[0x30, 0x6F, 0xB1, 0x0A]);
    }

    #[test]
    fn decode_inverts_encode() {
        let block = sample();
        assert_eq!(Block::decode(&block.encode()), Some(block));

        let mut full = Block::new(&[0x5A; DATA_LEN]).unwrap();
        full.target_addr = u32::MAX - DATA_LEN as u32;
        assert_eq!(Block::decode(&full.encode()), Some(full));
    }

    #[test]
    fn decode_skips_bad_magic() {
        for offset in [0, 4, 508] {
            let mut raw = sample().encode();
            raw[offset] ^= 0xFF;
            assert_eq!(Block::decode(&raw), None, "corrupted byte {}", offset);
        }
    }

    #[test]
    fn decode_skips_wrong_size() {
        let raw = sample().encode();
        assert_eq!(Block::decode(&raw[..511]), None);
        assert_eq!(Block::decode(&[]), None);
    }

    #[test]
    fn unknown_flag_bits_survive() {
        let decoded = Block::decode(&sample().encode()).unwrap();
        assert_eq!(decoded.flags.bits(), 0x0010_2000);
        assert_eq!(decoded.family_id(), Some(0xe48bff56));
    }

    #[test]
    fn payload_view_is_clamped() {
        let mut block = Block::new(&[7; 4]).unwrap();
        block.payload_size = 1000;
        assert_eq!(block.payload().len(), DATA_LEN);
    }

    #[test]
    fn blank_detection() {
        assert!(Block::new(&[0; 16]).unwrap().is_blank());
        assert!(!Block::new(&[0, 0, 1]).unwrap().is_blank());
    }

    #[test]
    fn flags_display_lists_known_bits() {
        let flags = Flags::NO_FLASH | Flags::FAMILY_ID_PRESENT;
        assert_eq!(
            flags.to_string(),
            "0x00002001 (do not flash to device, family ID present)",
        );
        assert_eq!(Flags::empty().to_string(), "0x00000000");
    }
}
