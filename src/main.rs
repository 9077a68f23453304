// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `uf2merge` inspects UF2 firmware images and merges filesystem images into
//! them.
//!
//! The typical use is putting a prebuilt littlefs image into the flash region
//! a MicroPython-style firmware reserves for its drive, so that the firmware
//! and its files can be loaded with a single copy to the bootloader. Building
//! the filesystem image is someone else's job; to this tool it's just bytes.

mod container;
mod convert;
mod error;
mod family;
mod format;
mod inspect;
mod merge;
mod report;

use std::path::{Path, PathBuf};
use clap::Parser;
use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::container::Container;
use crate::family::{FamilyRegistry, UNKNOWN_FAMILY};
use crate::inspect::Metadata;
use crate::report::{BlockLine, Report};

///////////////////////////////////////////////////////////////////////
// Top-level command line interface definition and dispatch.

/// uf2merge inspects UF2 firmware images and appends filesystem images to
/// them.
#[derive(Parser)]
#[clap(term_width = 80)]
struct Uf2Merge {
    #[clap(flatten)]
    global: GlobalFlags,
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
struct GlobalFlags {
    /// Enable additional output, probably more of it than you'd like.
    #[clap(long, short, global = true)]
    verbose: bool,

    /// JSON file of UF2 families to use instead of the built-in table, in the
    /// same format as the upstream `uf2families.json`.
    #[clap(long, global = true, env = "UF2_FAMILIES", value_name = "PATH")]
    families: Option<PathBuf>,
}

#[derive(Parser)]
enum Cmd {
    /// Read a UF2 file and print its families, address ranges, and any
    /// filesystem superblocks found in it.
    Info(InfoArgs),
    /// Wrap a raw binary (such as a filesystem image) into a UF2 file at a
    /// given address.
    Convert(ConvertArgs),
    /// Append a filesystem image to a firmware UF2 file, placing it at the
    /// start of the firmware's drive region.
    Merge(MergeArgs),
}

///////////////////////////////////////////////////////////////////////
// Main function / dispatch routine.

fn main() -> Result<()> {
    let args = Uf2Merge::parse();
    init_logging(args.global.verbose);

    let registry = load_registry(&args.global)?;
    match &args.command {
        Cmd::Info(subargs) => cmd_info(&args.global, &registry, subargs),
        Cmd::Convert(subargs) => cmd_convert(&registry, subargs),
        Cmd::Merge(subargs) => cmd_merge(&args.global, &registry, subargs),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_registry(global: &GlobalFlags) -> Result<FamilyRegistry> {
    let Some(path) = &global.families else {
        return Ok(FamilyRegistry::builtin());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("can't read family table {}", path.display()))?;
    let registry = FamilyRegistry::from_json(&json)
        .with_context(|| format!("can't load family table {}", path.display()))?;
    debug!("loaded {} families from {}", registry.len(), path.display());
    Ok(registry)
}

///////////////////////////////////////////////////////////////////////
// Shared file and inspector handling.

#[derive(Parser)]
struct InspectArgs {
    /// Path to `picotool`, used to read program and drive information out of
    /// RP2 firmware.
    #[clap(long, env = "PICOTOOL", default_value = "picotool")]
    picotool: PathBuf,

    /// Run the inspector even if the image has no RP2 family blocks.
    #[clap(long)]
    inspect: bool,

    /// Never run the inspector. Overrides `--inspect`.
    #[clap(long)]
    no_inspect: bool,
}

/// Runs the external inspector if it's likely to understand this image. Only
/// RP2-family firmware carries the information it reports.
fn inspect_image(
    args: &InspectArgs,
    container: &Container,
    path: &Path,
) -> Option<Metadata> {
    if args.no_inspect {
        return None;
    }
    let rp2 = container.scanned()
        .map(|s| s.families.keys().any(|name| name.starts_with("RP2")))
        .unwrap_or(false);
    if !rp2 && !args.inspect {
        debug!("no RP2 family blocks, not running {}", args.picotool.display());
        return None;
    }
    inspect::external_inspect(&args.picotool, path)
}

fn read_uf2(path: &Path, registry: &FamilyRegistry) -> Result<Container> {
    let image = std::fs::read(path)
        .with_context(|| format!("can't read input path {}", path.display()))?;

    if image.len() % format::BLOCK_LEN != 0 {
        info!(
            "file size ({} bytes) of {} isn't evenly divisible by {}",
            image.len(),
            path.display(),
            format::BLOCK_LEN,
        );
    }

    let mut container = Container::decode(&image);
    if container.is_empty() {
        warn!("{} contains no valid UF2 blocks", path.display());
    }
    container.scan(registry);
    Ok(container)
}

fn write_uf2(path: &Path, container: &Container) -> Result<()> {
    let bytes = container.to_bytes()?;
    std::fs::write(path, bytes)
        .with_context(|| format!("can't write output file {}", path.display()))?;
    info!("wrote {} blocks to {}", container.len(), path.display());
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// info

#[derive(Parser)]
struct InfoArgs {
    #[clap(flatten)]
    inspect: InspectArgs,

    /// Path to a UF2 file to analyze.
    input: PathBuf,
}

fn cmd_info(
    global: &GlobalFlags,
    registry: &FamilyRegistry,
    args: &InfoArgs,
) -> Result<()> {
    let container = read_uf2(&args.input, registry)?;
    let metadata = inspect_image(&args.inspect, &container, &args.input);

    print!("{}", Report { container: &container, metadata: metadata.as_ref() });

    if global.verbose {
        println!("Blocks:");
        for block in container.blocks() {
            println!("  {}", BlockLine(block));
        }
    }
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// convert

#[derive(Parser)]
struct ConvertArgs {
    /// Address at which the first byte of the input is placed.
    #[clap(long, short, parse(try_from_str = parse_u32))]
    address: u32,

    /// Family to tag blocks with, given as a number or a name from the family
    /// table. Pass `help` to see a list of known names. Blocks are untagged if
    /// omitted.
    #[clap(long, short)]
    family: Option<String>,

    /// Payload bytes per block, at most 476.
    #[clap(
        long,
        short,
        default_value = "476",
        parse(try_from_str = parse_usize),
    )]
    chunk_size: usize,

    /// Path to the raw binary input.
    input: PathBuf,

    /// Path for UF2 output.
    output: PathBuf,
}

fn cmd_convert(
    registry: &FamilyRegistry,
    args: &ConvertArgs,
) -> Result<()> {
    let family_id = match &args.family {
        Some(f) => resolve_family(registry, f)?,
        None => 0,
    };
    let data = std::fs::read(&args.input)
        .with_context(|| format!("can't read input path {}", args.input.display()))?;
    if data.is_empty() {
        warn!("{} is empty, output will contain no blocks", args.input.display());
    }

    let mut container = convert::convert(&data, family_id, args.address, args.chunk_size)
        .with_context(|| format!("can't convert {}", args.input.display()))?;
    container.scan(registry);
    write_uf2(&args.output, &container)
}

///////////////////////////////////////////////////////////////////////
// merge

#[derive(Parser)]
struct MergeArgs {
    #[clap(flatten)]
    inspect: InspectArgs,

    /// Address of the start of the drive region. Normally read from the
    /// firmware with picotool.
    #[clap(long, parse(try_from_str = parse_u32))]
    drive_start: Option<u32>,

    /// Address of the end of the drive region. The filesystem image must fit
    /// below it. Normally read from the firmware with picotool.
    #[clap(long, parse(try_from_str = parse_u32))]
    drive_end: Option<u32>,

    /// Family to tag filesystem blocks with, as a number or a name. Defaults
    /// to the lowest-addressed family in the firmware.
    #[clap(long, short)]
    family: Option<String>,

    /// Payload bytes per filesystem block, at most 476.
    #[clap(
        long,
        short,
        default_value = "476",
        parse(try_from_str = parse_usize),
    )]
    chunk_size: usize,

    /// Also write the filesystem image alone, as UF2, to this path.
    #[clap(long, value_name = "PATH")]
    save_image: Option<PathBuf>,

    /// Append a short marker block at this address after the filesystem.
    #[clap(long, value_name = "ADDR", parse(try_from_str = parse_u32))]
    end_marker: Option<u32>,

    /// Path to the firmware UF2 file.
    #[clap(env = "UF2_BASE")]
    base: PathBuf,

    /// Path to the raw filesystem image.
    #[clap(env = "UF2_FS_IMAGE")]
    image: PathBuf,

    /// Path for merged UF2 output.
    #[clap(env = "UF2_OUTPUT")]
    output: PathBuf,
}

fn cmd_merge(
    global: &GlobalFlags,
    registry: &FamilyRegistry,
    args: &MergeArgs,
) -> Result<()> {
    let (merged, metadata) = do_merge(registry, args)?;
    if global.verbose {
        print!("{}", Report { container: &merged, metadata: Some(&metadata) });
    }
    Ok(())
}

/// Runs the merge pipeline and writes the output. Returns the merged image
/// along with whatever was learned about the firmware.
fn do_merge(
    registry: &FamilyRegistry,
    args: &MergeArgs,
) -> Result<(Container, Metadata)> {
    let mut base = read_uf2(&args.base, registry)?;
    let metadata = inspect_image(&args.inspect, &base, &args.base)
        .unwrap_or_default();
    debug!("firmware:\n{}", Report { container: &base, metadata: Some(&metadata) });

    let drive_start = args.drive_start
        .or(metadata.drive_start)
        .ok_or_else(|| anyhow!(
            "don't know where the drive starts in {}; pass --drive-start",
            args.base.display(),
        ))?;
    let drive_end = args.drive_end.or(metadata.drive_end);

    let family_id = match &args.family {
        Some(f) => resolve_family(registry, f)?,
        None => base_family(&base, registry),
    };

    let fs_image = std::fs::read(&args.image)
        .with_context(|| format!("can't read filesystem image {}", args.image.display()))?;

    check_drive_region(drive_start, fs_image.len(), drive_end, metadata.binary_end)?;

    let drive = convert::convert(&fs_image, family_id, drive_start, args.chunk_size)
        .with_context(|| format!("can't convert {}", args.image.display()))?;
    info!(
        "filesystem image is {} blocks at {:#010x}",
        drive.len(),
        drive_start,
    );

    if let Some(path) = &args.save_image {
        let mut alone = drive.clone();
        alone.scan(registry);
        write_uf2(path, &alone)?;
    }

    merge::merge(&mut base, drive, registry)
        .with_context(|| format!(
            "can't place filesystem at {:#010x} after firmware in {}",
            drive_start,
            args.base.display(),
        ))?;

    if let Some(addr) = args.end_marker {
        base.append(merge::end_marker(addr))
            .context("can't append end marker")?;
        base.renumber();
        base.scan(registry);
    }

    write_uf2(&args.output, &base)?;
    Ok((base, metadata))
}

/// Checks that a filesystem image of `len` bytes at `drive_start` stays clear
/// of the firmware binary and inside the drive, as far as either is known. The
/// merge itself only cares about block ordering.
fn check_drive_region(
    drive_start: u32,
    len: usize,
    drive_end: Option<u32>,
    binary_end: Option<u32>,
) -> Result<()> {
    if let Some(end) = binary_end {
        if drive_start < end {
            bail!(
                "drive start {:#010x} is inside the firmware binary, which \
                 ends at {:#010x}",
                drive_start,
                end,
            );
        }
    }
    if let Some(end) = drive_end {
        let image_end = u64::from(drive_start) + len as u64;
        if image_end > u64::from(end) {
            bail!(
                "filesystem image of {} bytes at {:#010x} runs past the end \
                 of the drive at {:#010x}",
                len,
                drive_start,
                end,
            );
        }
    }
    Ok(())
}

/// ID of the firmware's lowest-addressed family, or zero if it has none we
/// can name. Families missing from the table are passed over.
fn base_family(container: &Container, registry: &FamilyRegistry) -> u32 {
    container.scanned()
        .and_then(|s| {
            s.families.iter()
                .filter(|&(name, _)| name != UNKNOWN_FAMILY)
                .min_by_key(|&(_, addr)| *addr)
        })
        .and_then(|(name, _)| registry.id_of(name))
        .unwrap_or(0)
}

///////////////////////////////////////////////////////////////////////
// Number and family parsing. Out of the box, Clap does not appear to be able
// to parse numbers with a base prefix. So, let's fix that.

fn parse_u32(s: &str) -> Result<u32> {
    parse_with_prefix(s, u32::from_str_radix)
}

fn parse_usize(s: &str) -> Result<usize> {
    parse_with_prefix(s, usize::from_str_radix)
}

fn parse_with_prefix<T>(
    s: &str,
    parse_radix: impl FnOnce(&str, u32) -> Result<T, std::num::ParseIntError>,
) -> Result<T> {
    let s = s.replace('_', "");
    if let Some(hex) = s.strip_prefix("0x") {
        parse_radix(hex, 16)
            .context("has hex prefix 0x but is not a hex number")
    } else if let Some(bin) = s.strip_prefix("0b") {
        parse_radix(bin, 2)
            .context("has binary prefix 0b but is not a binary number")
    } else {
        parse_radix(&s, 10)
            .context("expected decimal number or 0x/0b prefix")
    }
}

fn resolve_family(registry: &FamilyRegistry, s: &str) -> Result<u32> {
    // Try parsing as an integer first.
    if let Ok(f) = parse_u32(s) {
        return Ok(f);
    }
    if s == "help" {
        eprintln!("Defined UF2 families:");
        eprintln!("{:10} {:16} {}", "HEX", "NAME", "DESCRIPTION");
        for f in registry.iter() {
            eprintln!("{:#10x} {:16} {}", f.id, f.short_name, f.description);
        }
        bail!("choose a hex value or name from the list above.");
    }
    registry.id_of(s).ok_or_else(|| anyhow!(
        "can't parse {} as family name or number (use --family=help for list)",
        s,
    ))
}
