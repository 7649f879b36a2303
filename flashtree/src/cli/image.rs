// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser};
use tracing::{info, warn};

use crate::{
    format::{self, Context, Firmware},
    guid::Guid,
    util::NumBytes,
    visitors::{AttachBuffers, Assemble, Count, ExtractBuffers, Find, Flatten, Predicate, Validate},
};

const TREE_FILE: &str = "summary.json";

pub(crate) fn read_image(path: &Path, allow_polarity_mismatch: bool) -> Result<Firmware> {
    let buf = fs::read(path).with_context(|| format!("Failed to read image: {path:?}"))?;

    let mut ctx = Context::default();
    ctx.allow_polarity_mismatch = allow_polarity_mismatch;
    let fw = format::parse(&buf, &mut ctx)
        .with_context(|| format!("Failed to parse image: {path:?}"))?;

    info!("Parsed {:?} image as {}", NumBytes(buf.len() as u64), fw.type_name());

    Ok(fw)
}

/// Rebuild every buffer from the tree and write the result.
pub(crate) fn write_image(path: &Path, fw: &mut Firmware) -> Result<()> {
    fw.apply(&mut Assemble::new())
        .context("Failed to assemble image")?;

    fs::write(path, fw.buf()).with_context(|| format!("Failed to write image: {path:?}"))?;
    info!("Wrote {:?} to {path:?}", NumBytes(fw.buf().len() as u64));

    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("Failed to serialize JSON")?;
    writeln!(stdout)?;

    Ok(())
}

fn validate_subcommand(fw: &mut Firmware) -> Result<()> {
    let mut validate = Validate::default();
    fw.apply(&mut validate).context("Failed to validate image")?;

    for finding in &validate.findings {
        warn!("{finding}");
    }

    if !validate.is_ok() {
        bail!("Image has {} inconsistencies", validate.findings.len());
    }

    info!("Image is consistent");

    Ok(())
}

pub fn validate_main(cli: &ValidateCli) -> Result<()> {
    let mut fw = read_image(&cli.input.input, cli.input.allow_polarity_mismatch)?;

    validate_subcommand(&mut fw)
}

pub fn count_main(cli: &CountCli) -> Result<()> {
    let mut fw = read_image(&cli.input.input, cli.input.allow_polarity_mismatch)?;

    let mut count = Count::default();
    fw.apply(&mut count).context("Failed to count nodes")?;

    print_json(&count)
}

pub fn list_main(cli: &ListCli) -> Result<()> {
    let mut fw = read_image(&cli.input.input, cli.input.allow_polarity_mismatch)?;

    let mut flatten = Flatten::default();
    fw.apply(&mut flatten).context("Failed to walk image")?;

    if cli.json {
        print_json(&flatten)
    } else {
        print!("{}", flatten.render());
        Ok(())
    }
}

pub fn json_main(cli: &JsonCli) -> Result<()> {
    let mut fw = read_image(&cli.input.input, cli.input.allow_polarity_mismatch)?;

    let Some(dir) = &cli.extract else {
        return print_json(&fw);
    };

    fw.apply(&mut ExtractBuffers::new(|key: &str, data: &[u8]| {
        let path = dir.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }))
    .with_context(|| format!("Failed to extract buffers to: {dir:?}"))?;

    let path = dir.join(TREE_FILE);
    let json = serde_json::to_vec_pretty(&fw).context("Failed to serialize tree")?;
    fs::write(&path, json).with_context(|| format!("Failed to write tree: {path:?}"))?;

    info!("Extracted image to {dir:?}");

    Ok(())
}

pub fn find_main(cli: &FindCli) -> Result<()> {
    let mut fw = read_image(&cli.input.input, cli.input.allow_polarity_mismatch)?;

    let mut find = Find::new(cli.target.predicate()?);
    fw.apply(&mut find).context("Failed to search image")?;

    if find.matches.is_empty() {
        bail!("No matches");
    }

    if let Some(dir) = &cli.output_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {dir:?}"))?;
    }

    for (i, m) in find.matches.iter().enumerate() {
        match m {
            Firmware::File(f) => println!(
                "{} {} {:?} {}",
                f.guid,
                f.file_type,
                NumBytes(f.buf.len() as u64),
                f.name().unwrap_or("-"),
            ),
            other => println!("{} {:?}", other.type_name(), NumBytes(other.buf().len() as u64)),
        }

        if let Some(dir) = &cli.output_dir {
            let path = dir.join(format!("{i}_{}.bin", m.type_name()));
            fs::write(&path, m.buf()).with_context(|| format!("Failed to write match: {path:?}"))?;
        }
    }

    Ok(())
}

pub fn assemble_main(cli: &AssembleCli) -> Result<()> {
    let mut fw = if let Some(input) = &cli.input {
        read_image(input, cli.allow_polarity_mismatch)?
    } else if let Some(dir) = &cli.dir {
        let path = dir.join(TREE_FILE);
        let json = fs::read(&path).with_context(|| format!("Failed to read tree: {path:?}"))?;
        let mut fw: Firmware =
            serde_json::from_slice(&json).with_context(|| format!("Failed to parse tree: {path:?}"))?;

        fw.apply(&mut AttachBuffers::new(|key: &str| fs::read(dir.join(key))))
            .with_context(|| format!("Failed to load buffers from: {dir:?}"))?;

        fw
    } else {
        bail!("Either an input image or an extracted directory is required");
    };

    write_image(&cli.output, &mut fw)
}

/// Image to read.
#[derive(Debug, Args)]
pub struct InputArgs {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Log erase polarity mismatches between volumes instead of failing.
    #[arg(long)]
    pub allow_polarity_mismatch: bool,
}

/// Image to read and where to write the edited image.
#[derive(Debug, Args)]
pub struct EditArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,
}

/// Selects the node an operation works on.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    /// Regex fully matching a file GUID or user interface name.
    #[arg(short, long, value_name = "REGEX")]
    pub name: Option<String>,

    /// File name GUID.
    #[arg(short, long, value_name = "GUID")]
    pub guid: Option<Guid>,
}

impl TargetArgs {
    pub fn predicate(&self) -> Result<Predicate> {
        if let Some(guid) = self.guid {
            Ok(Predicate::by_guid(guid))
        } else if let Some(name) = &self.name {
            Predicate::by_name(name).with_context(|| format!("Invalid name pattern: {name:?}"))
        } else {
            bail!("No target specified");
        }
    }

    /// Like [`Self::predicate`], but volumes can match by name GUID too.
    pub fn volume_predicate(&self) -> Result<Predicate> {
        let pattern = match (&self.name, self.guid) {
            (_, Some(guid)) => regex::escape(&guid.to_string()),
            (Some(name), None) => name.clone(),
            (None, None) => bail!("No target specified"),
        };

        Predicate::by_volume_or_name(&pattern)
            .with_context(|| format!("Invalid name pattern: {pattern:?}"))
    }
}

/// Check sizes, checksums and signatures of every structure in an image.
#[derive(Debug, Parser)]
pub struct ValidateCli {
    #[command(flatten)]
    pub input: InputArgs,
}

/// Count nodes by type, file type and section type.
#[derive(Debug, Parser)]
pub struct CountCli {
    #[command(flatten)]
    pub input: InputArgs,
}

/// List every node of an image.
#[derive(Debug, Parser)]
pub struct ListCli {
    #[command(flatten)]
    pub input: InputArgs,

    /// Print the list as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Print the parsed tree as JSON.
#[derive(Debug, Parser)]
pub struct JsonCli {
    #[command(flatten)]
    pub input: InputArgs,

    /// Write node buffers and the tree to a directory instead.
    ///
    /// The directory can be turned back into an image with `assemble --dir`.
    #[arg(short, long, value_name = "DIR", value_parser)]
    pub extract: Option<PathBuf>,
}

/// Find files by GUID or user interface name.
#[derive(Debug, Parser)]
pub struct FindCli {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Write every match to this directory.
    #[arg(long, value_name = "DIR", value_parser)]
    pub output_dir: Option<PathBuf>,
}

/// Rebuild an image from a parsed image or an extracted directory.
#[derive(Debug, Parser)]
pub struct AssembleCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser, conflicts_with = "dir")]
    pub input: Option<PathBuf>,

    /// Directory written by `json --extract`.
    #[arg(short, long, value_name = "DIR", value_parser, required_unless_present = "input")]
    pub dir: Option<PathBuf>,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Log erase polarity mismatches between volumes instead of failing.
    #[arg(long)]
    pub allow_polarity_mismatch: bool,
}
