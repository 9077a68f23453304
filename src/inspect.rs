// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Program metadata recovered by running `picotool info -a` on an image.
//!
//! This is purely diagnostic. Any failure to run the tool or make sense of its
//! output yields `None` or empty fields, and everything else carries on.

use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub program_name: Option<String>,
    pub board: Option<String>,
    pub binary_start: Option<u32>,
    pub binary_end: Option<u32>,
    /// Start of the region the firmware reserves for its filesystem.
    pub drive_start: Option<u32>,
    pub drive_end: Option<u32>,
}

/// Runs `tool info -a path` and parses what it prints.
pub fn external_inspect(tool: &Path, path: &Path) -> Option<Metadata> {
    let output = match Command::new(tool).args(["info", "-a"]).arg(path).output() {
        Ok(output) => output,
        Err(e) => {
            warn!("can't run {}: {}; continuing without program info",
                tool.display(), e);
            return None;
        }
    };
    if !output.status.success() {
        warn!("{} failed ({}); continuing without program info",
            tool.display(), output.status);
        debug!("{} stderr: {}", tool.display(),
            String::from_utf8_lossy(&output.stderr).trim());
        return None;
    }
    Some(parse_info(&String::from_utf8_lossy(&output.stdout)))
}

/// Picks the fields we care about out of `picotool info -a` output. Lines look
/// like `key: value`, indented under section headings; the first occurrence of
/// each key wins.
pub fn parse_info(text: &str) -> Metadata {
    let mut meta = Metadata::default();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "name" if meta.program_name.is_none() => {
                meta.program_name = first_word(value);
            }
            "pico_board" if meta.board.is_none() => {
                meta.board = first_word(value);
            }
            "binary start" if meta.binary_start.is_none() => {
                meta.binary_start = first_word(value).and_then(|w| parse_hex(&w));
            }
            "binary end" if meta.binary_end.is_none() => {
                meta.binary_end = first_word(value).and_then(|w| parse_hex(&w));
            }
            // embedded drive: 0x100a0000-0x10200000 (1408K): MicroPython
            "embedded drive" if meta.drive_start.is_none() => {
                if let Some(span) = first_word(value) {
                    let mut ends = span.splitn(2, '-');
                    meta.drive_start = ends.next().and_then(parse_hex);
                    meta.drive_end = ends.next().and_then(parse_hex);
                }
            }
            _ => (),
        }
    }
    meta
}

fn first_word(s: &str) -> Option<String> {
    s.split_whitespace().next().map(String::from)
}

fn parse_hex(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u32::from_str_radix(digits, 16).ok()
}
