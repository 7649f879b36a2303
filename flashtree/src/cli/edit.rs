// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

use crate::{
    cli::image::{EditArgs, TargetArgs, read_image, write_image},
    format::{Context, file::File, section::SectionType},
    guid::Guid,
    util::NumBytes,
    visitors::{
        CreateFv, Insert, NVarCompact, Preposition, Remove, Repack, ReplaceSection, SetOffsets,
        TightenMe,
    },
};

/// Parse a number with an optional `0x` prefix.
pub(crate) fn parse_u64(s: &str) -> Result<u64, String> {
    let result = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };

    result.map_err(|e| format!("Invalid number {s:?}: {e}"))
}

pub fn remove_main(cli: &RemoveCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    Remove::new(cli.target.predicate()?, cli.pad)
        .run(&mut fw)
        .context("Failed to remove files")?;

    write_image(&cli.image.output, &mut fw)
}

pub fn remove_except_main(cli: &RemoveExceptCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    Remove::all_except(cli.target.predicate()?)
        .run(&mut fw)
        .context("Failed to remove files")?;

    write_image(&cli.image.output, &mut fw)
}

pub fn insert_main(cli: &InsertCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    let buf = fs::read(&cli.file).with_context(|| format!("Failed to read file: {:?}", cli.file))?;
    let file = File::parse(&buf, &mut Context::default())
        .with_context(|| format!("Failed to parse FFS file: {:?}", cli.file))?;

    let predicate = match cli.position {
        Preposition::Front | Preposition::End => cli.target.volume_predicate()?,
        _ => cli.target.predicate()?,
    };

    info!("Inserting file {} ({}) {}", file.guid, file.file_type, cli.position);

    Insert::new(file, cli.position, predicate)
        .run(&mut fw)
        .context("Failed to insert file")?;

    write_image(&cli.image.output, &mut fw)
}

pub fn replace_section_main(cli: &ReplaceSectionCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    let data = fs::read(&cli.data).with_context(|| format!("Failed to read data: {:?}", cli.data))?;

    let mut replace = ReplaceSection::new(cli.target.predicate()?, cli.section_type, data);
    replace
        .run(&mut fw)
        .with_context(|| format!("Failed to replace {} sections", cli.section_type))?;

    info!("Replaced {} sections", replace.replaced);

    write_image(&cli.image.output, &mut fw)
}

pub fn repack_main(cli: &RepackCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    Repack::new(cli.target.predicate()?)
        .run(&mut fw)
        .context("Failed to repack volume")?;

    write_image(&cli.image.output, &mut fw)
}

pub fn create_fv_main(cli: &CreateFvCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    fw.apply(&mut SetOffsets).context("Failed to compute offsets")?;
    CreateFv::new(cli.offset, cli.size, cli.fv_name)
        .run(&mut fw)
        .context("Failed to create volume")?;

    write_image(&cli.image.output, &mut fw)
}

pub fn tighten_me_main(cli: &TightenMeCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    let mut tighten = TightenMe::default();
    fw.apply(&mut tighten).context("Failed to shrink ME region")?;

    if tighten.reclaimed == 0 {
        info!("Nothing to reclaim");
    } else {
        info!("Reclaimed {:?}", NumBytes(tighten.reclaimed));
    }

    write_image(&cli.image.output, &mut fw)
}

pub fn nvram_compact_main(cli: &NvramCompactCli) -> Result<()> {
    let mut fw = read_image(&cli.image.input.input, cli.image.input.allow_polarity_mismatch)?;

    let mut compact = NVarCompact::default();
    fw.apply(&mut compact).context("Failed to compact NVRAM")?;

    info!(
        "Dropped {} stale entries from {} NVRAM stores",
        compact.removed, compact.stores,
    );

    write_image(&cli.image.output, &mut fw)
}

/// Remove files from their volumes.
#[derive(Debug, Parser)]
pub struct RemoveCli {
    #[command(flatten)]
    pub image: EditArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Leave a pad file in place of each removed file.
    #[arg(long)]
    pub pad: bool,
}

/// Remove every file that does not match.
#[derive(Debug, Parser)]
pub struct RemoveExceptCli {
    #[command(flatten)]
    pub image: EditArgs,

    #[command(flatten)]
    pub target: TargetArgs,
}

/// Insert an FFS file relative to a volume or file.
#[derive(Debug, Parser)]
pub struct InsertCli {
    #[command(flatten)]
    pub image: EditArgs,

    /// Path to the FFS file to insert.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub file: PathBuf,

    /// Where to insert relative to the target.
    ///
    /// `front` and `end` target a volume (matched by its name GUID), the
    /// others target a file.
    #[arg(short, long, value_name = "POSITION", default_value = "end")]
    pub position: Preposition,

    #[command(flatten)]
    pub target: TargetArgs,
}

/// Replace the payload of sections inside a file.
#[derive(Debug, Parser)]
pub struct ReplaceSectionCli {
    #[command(flatten)]
    pub image: EditArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Type of the sections to replace (name or hex number).
    #[arg(short, long, value_name = "TYPE")]
    pub section_type: SectionType,

    /// Path to the new section payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub data: PathBuf,
}

/// Recompress a volume image file as a single compressed volume.
#[derive(Debug, Parser)]
pub struct RepackCli {
    #[command(flatten)]
    pub image: EditArgs,

    #[command(flatten)]
    pub target: TargetArgs,
}

/// Create an empty volume inside BIOS region padding.
#[derive(Debug, Parser)]
pub struct CreateFvCli {
    #[command(flatten)]
    pub image: EditArgs,

    /// Absolute offset of the new volume.
    #[arg(long, value_name = "OFFSET", value_parser = parse_u64)]
    pub offset: u64,

    /// Size of the new volume.
    #[arg(long, value_name = "BYTES", value_parser = parse_u64)]
    pub size: u64,

    /// Name GUID of the new volume.
    #[arg(long, value_name = "GUID")]
    pub fv_name: Guid,
}

/// Shrink the ME region and grow the BIOS region by the freed space.
#[derive(Debug, Parser)]
pub struct TightenMeCli {
    #[command(flatten)]
    pub image: EditArgs,
}

/// Drop stale NVRAM variable entries.
#[derive(Debug, Parser)]
pub struct NvramCompactCli {
    #[command(flatten)]
    pub image: EditArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert!(parse_u64("0xzz").is_err());
    }
}
