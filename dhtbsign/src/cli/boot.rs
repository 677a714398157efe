/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::status,
    format::{bootimage, dhtb},
    stream::{FromReader, ReadFixedSizeExt},
};

fn trim_subcommand(cli: &TrimCli) -> Result<()> {
    let size = bootimage::trim_in_place(&cli.input)
        .with_context(|| format!("Failed to trim boot image: {:?}", cli.input))?;

    status!("Trimmed {:?} to {size} bytes", cli.input);

    Ok(())
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let file = File::open(&cli.input)
        .with_context(|| format!("Failed to open boot image for reading: {:?}", cli.input))?;
    let mut reader = BufReader::new(file);

    let magic: [u8; 4] = reader
        .read_array_exact()
        .with_context(|| format!("Failed to read file magic: {:?}", cli.input))?;
    let offset = if magic == dhtb::MAGIC {
        dhtb::WRAPPER_SIZE as u64
    } else {
        0
    };
    reader
        .seek(SeekFrom::Start(offset))
        .with_context(|| format!("Failed to seek file: {:?}", cli.input))?;

    let header = bootimage::RawHeader::from_reader(&mut reader)
        .with_context(|| format!("Failed to load boot image header: {:?}", cli.input))?;
    let total = header
        .total_size()
        .with_context(|| format!("Failed to compute boot image size: {:?}", cli.input))?;

    status!("Boot image at offset {offset}, payload size {total}");
    println!("{header}");

    Ok(())
}

/// Trim a raw boot image dump down to its meaningful payload.
///
/// The dump may carry a DHTB vendor wrapper in front of the boot image and
/// flash padding after it. Both are removed, leaving exactly the payload the
/// hash footer must cover. The image is rewritten in place.
#[derive(Debug, Parser)]
struct TrimCli {
    /// Path to boot or recovery image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Display boot image header information.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to boot or recovery image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BootCommand {
    Trim(TrimCli),
    #[command(alias = "dump")]
    Info(InfoCli),
}

/// Trim and inspect boot/recovery images.
#[derive(Debug, Parser)]
pub struct BootCli {
    #[command(subcommand)]
    command: BootCommand,
}

pub fn boot_main(cli: &BootCli) -> Result<()> {
    match &cli.command {
        BootCommand::Trim(c) => trim_subcommand(c),
        BootCommand::Info(c) => info_subcommand(c),
    }
}
