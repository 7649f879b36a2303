// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::{
    format::compression::{self, Codec},
    util::NumBytes,
};

fn lookup(name: &str) -> Result<Box<dyn Codec>> {
    compression::codec_by_name(&name.to_ascii_uppercase())
        .ok_or_else(|| anyhow!("Unknown codec: {name:?}"))
}

fn transform_subcommand(cli: &TransformCli, decode: bool) -> Result<()> {
    let codec = lookup(&cli.codec)?;
    let data = fs::read(&cli.input).with_context(|| format!("Failed to read: {:?}", cli.input))?;

    let out = if decode {
        codec.decode(&data)
    } else {
        codec.encode(&data)
    }
    .with_context(|| format!("{} failed on: {:?}", codec.name(), cli.input))?;

    fs::write(&cli.output, &out).with_context(|| format!("Failed to write: {:?}", cli.output))?;
    info!(
        "{} {:?} -> {:?}",
        codec.name(),
        NumBytes(data.len() as u64),
        NumBytes(out.len() as u64),
    );

    Ok(())
}

pub fn codec_main(cli: &CodecCli) -> Result<()> {
    match &cli.command {
        CodecCommand::Compress(c) => transform_subcommand(c, false),
        CodecCommand::Decompress(c) => transform_subcommand(c, true),
    }
}

/// Input, output and codec of a single transform.
#[derive(Debug, Parser)]
struct TransformCli {
    /// Codec name: LZMA, LZMAX86, ZLIB, LZ4 or BROTLI.
    #[arg(short, long, value_name = "NAME")]
    codec: String,

    /// Path to input data.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output data.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CodecCommand {
    Compress(TransformCli),
    Decompress(TransformCli),
}

/// Run a section codec on a standalone file.
///
/// The output carries the same headers as the payload of a compressed
/// section.
#[derive(Debug, Parser)]
pub struct CodecCli {
    #[command(subcommand)]
    command: CodecCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names() {
        assert_eq!(lookup("zlib").unwrap().name(), "ZLIB");
        assert_eq!(lookup("LzmaX86").unwrap().name(), "LZMAX86");
        assert!(lookup("gzip").is_err());
    }
}
