// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human-readable descriptions of containers and blocks.

use std::fmt;

use crate::container::Container;
use crate::format::Block;
use crate::inspect::Metadata;

/// Summary of a container: blocks, families, ranges, filesystem superblocks,
/// and the binary and drive bounds when they're known.
pub struct Report<'a> {
    pub container: &'a Container,
    pub metadata: Option<&'a Metadata>,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.metadata.cloned().unwrap_or_default();

        writeln!(f, "Number of blocks: {}", self.container.len())?;
        writeln!(f, "Program name: {}", meta.program_name.as_deref().unwrap_or("-"))?;
        writeln!(f, "Board: {}", meta.board.as_deref().unwrap_or("-"))?;

        let Some(scan) = self.container.scanned() else {
            return writeln!(f, "(not scanned)");
        };

        writeln!(f, "Number of families: {}", scan.families.len())?;
        for (family, addr) in &scan.families {
            writeln!(f, " - Family {} at {}", family, Addr::from(*addr))?;
        }

        writeln!(f, "Number of ranges: {}", scan.ranges.len())?;
        for (i, &(start, end)) in scan.ranges.iter().enumerate() {
            writeln!(f, " - Range {}: {} - {}", i, Addr::from(start), Addr(end))?;
        }

        writeln!(f, "LittleFS superblocks: {}", scan.signatures.len())?;
        for (i, &index) in scan.signatures.iter().enumerate() {
            let addr = self.container.blocks()[index].target_addr;
            writeln!(f, " - LittleFS superblock {}: block {} at {}", i, index, Addr::from(addr))?;
        }

        writeln!(f, "Binary info")?;
        writeln!(f, " - Binary start: {}", OptAddr(meta.binary_start))?;
        writeln!(f, " - Binary end: {}", OptAddr(meta.binary_end))?;

        writeln!(f, "Drive info")?;
        writeln!(f, " - Drive start: {}", OptAddr(meta.drive_start))?;
        writeln!(f, " - Drive end: {}", OptAddr(meta.drive_end))
    }
}

/// One line per block, for verbose listings.
pub struct BlockLine<'a>(pub &'a Block);

impl fmt::Display for BlockLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "#{:<5} {}  {:>3} bytes  {}/{}  flags {}",
            b.block_no,
            Addr::from(b.target_addr),
            b.payload_size,
            b.block_no,
            b.num_blocks,
            b.flags,
        )?;
        if let Some(id) = b.family_id() {
            write!(f, "  family {:#010x}", id)?;
        }
        Ok(())
    }
}

/// Address in the `0x1000_0000` style used throughout the output. Wide enough
/// for an exclusive end at the top of the 32-bit space, which prints as
/// `0x10000_0000`.
struct Addr(u64);

impl From<u32> for Addr {
    fn from(a: u32) -> Self {
        Self(a.into())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}_{:04X}", self.0 >> 16, self.0 & 0xFFFF)
    }
}

struct OptAddr(Option<u32>);

impl fmt::Display for OptAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(a) => fmt::Display::fmt(&Addr::from(a), f),
            None => f.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyRegistry;
    use crate::format::Flags;

    fn container() -> Container {
        let mut c = Container::new();
        for i in 0..3u32 {
            let mut block = Block::new(&[1; 256]).unwrap();
            block.target_addr = 0x1000_0000 + i * 256;
            block.flags = Flags::FAMILY_ID_PRESENT;
            block.reserved = 0xe48bff56;
            c.append(block).unwrap();
        }
        c
    }

    #[test]
    fn summary_of_scanned_container() {
        let mut c = container();
        c.scan(&FamilyRegistry::builtin());
        let meta = Metadata {
            program_name: Some("MicroPython".into()),
            binary_start: Some(0x1000_0000),
            binary_end: Some(0x1000_0300),
            drive_start: Some(0x100a_0000),
            ..Metadata::default()
        };
        let text = Report { container: &c, metadata: Some(&meta) }.to_string();
        assert_eq!(text, "\
Number of blocks: 3
Program name: MicroPython
Board: -
Number of families: 1
 - Family RP2040 at 0x1000_0000
Number of ranges: 1
 - Range 0: 0x1000_0000 - 0x1000_0300
LittleFS superblocks: 0
Binary info
 - Binary start: 0x1000_0000
 - Binary end: 0x1000_0300
Drive info
 - Drive start: 0x100A_0000
 - Drive end: unknown
");
    }

    #[test]
    fn summary_of_unscanned_container() {
        let c = container();
        let text = Report { container: &c, metadata: None }.to_string();
        assert!(text.ends_with("(not scanned)\n"));
    }

    #[test]
    fn range_end_at_top_of_address_space() {
        let mut c = Container::new();
        let mut block = Block::new(&[1; 16]).unwrap();
        block.target_addr = 0xFFFF_FFF0;
        c.append(block).unwrap();
        c.scan(&FamilyRegistry::builtin());
        let text = Report { container: &c, metadata: None }.to_string();
        assert!(text.contains(" - Range 0: 0xFFFF_FFF0 - 0x10000_0000\n"), "{}", text);
        assert!(text.contains(" - Binary end: unknown\n"));
    }

    #[test]
    fn block_line_shows_family() {
        let c = container();
        let line = BlockLine(&c.blocks()[1]).to_string();
        assert!(line.starts_with("#1     0x1000_0100  256 bytes"), "{}", line);
        assert!(line.contains("family ID present"));
        assert!(line.ends_with("family 0xe48bff56"));
    }
}
