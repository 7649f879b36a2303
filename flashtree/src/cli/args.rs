// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use crate::cli::{codec, completion, edit, ffs, image};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

pub fn init_logging(log_level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(log_level.as_level())
        .init();
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    Validate(image::ValidateCli),
    Count(image::CountCli),
    List(image::ListCli),
    Json(image::JsonCli),
    Find(image::FindCli),
    Assemble(image::AssembleCli),
    Remove(edit::RemoveCli),
    RemoveExcept(edit::RemoveExceptCli),
    Insert(edit::InsertCli),
    ReplaceSection(edit::ReplaceSectionCli),
    Repack(edit::RepackCli),
    CreateFv(edit::CreateFvCli),
    TightenMe(edit::TightenMeCli),
    NvramCompact(edit::NvramCompactCli),
    CreateFfs(ffs::CreateFfsCli),
    Codec(codec::CodecCli),
    Completion(completion::CompletionCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log level to print.
    #[arg(long, global = true, value_name = "LEVEL", value_enum, default_value_t)]
    pub log_level: LogLevel,
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Validate(c) => image::validate_main(&c),
        Command::Count(c) => image::count_main(&c),
        Command::List(c) => image::list_main(&c),
        Command::Json(c) => image::json_main(&c),
        Command::Find(c) => image::find_main(&c),
        Command::Assemble(c) => image::assemble_main(&c),
        Command::Remove(c) => edit::remove_main(&c),
        Command::RemoveExcept(c) => edit::remove_except_main(&c),
        Command::Insert(c) => edit::insert_main(&c),
        Command::ReplaceSection(c) => edit::replace_section_main(&c),
        Command::Repack(c) => edit::repack_main(&c),
        Command::CreateFv(c) => edit::create_fv_main(&c),
        Command::TightenMe(c) => edit::tighten_me_main(&c),
        Command::NvramCompact(c) => edit::nvram_compact_main(&c),
        Command::CreateFfs(c) => ffs::create_ffs_main(&c),
        Command::Codec(c) => codec::codec_main(&c),
        Command::Completion(c) => completion::completion_main(&c),
    }
}
