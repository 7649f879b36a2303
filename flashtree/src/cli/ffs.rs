// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use tracing::info;

use crate::{
    cli::edit::parse_u64,
    format::{
        depex::DepExOp,
        file::{File, FileType},
        section::{Section, SectionType},
    },
    guid::{self, Guid},
    util::NumBytes,
};

/// DepEx section type matching the phase the file runs in.
fn depex_type(file_type: FileType) -> SectionType {
    match file_type {
        FileType::PEIM | FileType::COMBINED_PEIM_DRIVER => SectionType::PEI_DEPEX,
        FileType::MM | FileType::MM_STANDALONE | FileType::COMBINED_MM_DXE => SectionType::MM_DEPEX,
        _ => SectionType::DXE_DEPEX,
    }
}

fn build_sections(cli: &CreateFfsCli) -> Result<Vec<Section>> {
    let mut sections = vec![];

    if let Some(expr) = &cli.depex {
        let ops = DepExOp::parse_expression(expr)
            .with_context(|| format!("Invalid dependency expression: {expr:?}"))?;
        sections.push(Section::new_depex(depex_type(cli.file_type), ops)?);
    }

    for (section_type, paths) in [
        (SectionType::PE32, &cli.pe32),
        (SectionType::TE, &cli.te),
        (SectionType::RAW, &cli.raw),
    ] {
        for path in paths {
            let data = fs::read(path).with_context(|| format!("Failed to read: {path:?}"))?;
            sections.push(Section::new_leaf(section_type, &data)?);
        }
    }

    if let Some(name) = &cli.ui {
        sections.push(Section::new_ui(name)?);
    }

    if let Some(version) = &cli.version_string {
        sections.push(Section::new_version(cli.build_number, version)?);
    }

    if sections.is_empty() {
        bail!("At least one section is required");
    }

    if cli.compress {
        sections = vec![Section::new_guid_defined(guid::LZMA, sections)?];
    }

    Ok(sections)
}

pub fn create_ffs_main(cli: &CreateFfsCli) -> Result<()> {
    let sections = build_sections(cli)?;

    let mut file = File::new(cli.guid, cli.file_type, sections, cli.erase_polarity)
        .context("Failed to build file")?;

    if let Some(alignment) = cli.alignment {
        file.set_alignment(alignment)?;
        file.assemble()?;
    }

    fs::write(&cli.output, &file.buf)
        .with_context(|| format!("Failed to write file: {:?}", cli.output))?;

    info!(
        "Wrote {} file {} ({:?}) to {:?}",
        file.file_type,
        file.guid,
        NumBytes(file.buf.len() as u64),
        cli.output,
    );

    Ok(())
}

/// Build an FFS file from section payloads.
#[derive(Debug, Parser)]
pub struct CreateFfsCli {
    /// Path to output FFS file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Name GUID of the file.
    #[arg(short, long, value_name = "GUID")]
    pub guid: Guid,

    /// File type (name or hex number).
    #[arg(short = 't', long = "type", value_name = "TYPE", default_value = "DRIVER")]
    pub file_type: FileType,

    /// Dependency expression: `TRUE` or whitespace separated GUIDs.
    #[arg(long, value_name = "EXPR")]
    pub depex: Option<String>,

    /// Path to a PE32 image. Can be repeated.
    #[arg(long, value_name = "FILE", value_parser)]
    pub pe32: Vec<PathBuf>,

    /// Path to a TE image. Can be repeated.
    #[arg(long, value_name = "FILE", value_parser)]
    pub te: Vec<PathBuf>,

    /// Path to raw section data. Can be repeated.
    #[arg(long, value_name = "FILE", value_parser)]
    pub raw: Vec<PathBuf>,

    /// User interface name.
    #[arg(long, value_name = "NAME")]
    pub ui: Option<String>,

    /// Version string.
    #[arg(long = "version-string", value_name = "VERSION")]
    pub version_string: Option<String>,

    /// Build number stored with the version string.
    #[arg(long, value_name = "NUMBER", default_value_t = 0, requires = "version_string")]
    pub build_number: u16,

    /// Wrap all sections in an LZMA compressed section.
    #[arg(long)]
    pub compress: bool,

    /// Data alignment of the file.
    #[arg(long, value_name = "BYTES", value_parser = parse_u64)]
    pub alignment: Option<u64>,

    /// Value of erased flash bytes.
    #[arg(long, value_name = "BYTE", default_value_t = 0xff)]
    pub erase_polarity: u8,
}
