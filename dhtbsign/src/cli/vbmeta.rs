/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{sign, status, warning},
    format::{dhtb, vbmeta},
    signer::{self, AlgorithmParameters},
    util,
};

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let buf = fs::read(&cli.input)
        .with_context(|| format!("Failed to read vbmeta image: {:?}", cli.input))?;

    let base = vbmeta::header_offset(&buf);
    let header = vbmeta::RawHeader::decode_checked(&buf, base)
        .with_context(|| format!("Failed to load vbmeta header: {:?}", cli.input))?;

    if base != 0 {
        status!("Found DHTB vendor wrapper, vbmeta header at offset {base}");
    }
    println!("{header:#?}");

    let algorithm_type = util::swap_bytes_32(header.algorithm_type.get());
    match AlgorithmParameters::from_raw(algorithm_type) {
        Ok(params) => println!("Signing algorithm: {}", params.name()),
        Err(e) => println!("Signing algorithm: unknown ({e})"),
    }

    let offset = vbmeta::descriptors_offset(base, &header)
        .with_context(|| format!("Failed to locate descriptor region: {:?}", cli.input))?;
    let entries = vbmeta::walk_chain(&buf, offset)
        .with_context(|| format!("Failed to walk chain descriptors: {:?}", cli.input))?;

    println!("Chained partitions: {}", entries.len());
    for entry in entries {
        println!(
            "- {} (rollback index location {}, {} byte public key)",
            entry.partition_name,
            entry.rollback_index_location,
            entry.public_key.len(),
        );
    }

    Ok(())
}

fn script_subcommand(cli: &ScriptCli) -> Result<()> {
    let buf = fs::read(&cli.input)
        .with_context(|| format!("Failed to read vbmeta image: {:?}", cli.input))?;

    let base = vbmeta::header_offset(&buf);
    let header = vbmeta::RawHeader::decode_checked(&buf, base)
        .with_context(|| format!("Failed to load vbmeta header: {:?}", cli.input))?;

    let algorithm_type = util::swap_bytes_32(header.algorithm_type.get());
    let params = AlgorithmParameters::from_raw(algorithm_type)
        .with_context(|| format!("Cannot re-sign vbmeta image: {:?}", cli.input))?;

    let chains = sign::extract_chain_keys(&buf, base, &header, &params)?;

    let padding = dhtb::probe_padding_size(&buf);
    if padding.used_default {
        warning!(
            "DHTB marker not found, assuming padding size {:#x}",
            padding.size,
        );
    }

    let script = signer::resign_script(&cli.avbtool, &params, &chains, padding.size, &cli.output);
    fs::write(&cli.script, script)
        .with_context(|| format!("Failed to write script: {:?}", cli.script))?;

    status!("Wrote re-signing script to {:?}", cli.script);

    Ok(())
}

fn wrap_subcommand(cli: &WrapCli) -> Result<()> {
    let profile = dhtb::TrailerProfile::for_version(cli.android_version)
        .context("No container layout for this firmware version")?;

    profile
        .wrap_in_place(&cli.input)
        .with_context(|| format!("Failed to wrap image: {:?}", cli.input))?;

    status!(
        "Wrapped {:?} in {} byte version {} container",
        cli.input,
        profile.total_size,
        profile.version,
    );

    Ok(())
}

/// Display vbmeta header and chain partition information.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Generate a re-signing shell script instead of invoking the signer.
///
/// Walks the image's chain partitions, extracts their public keys to the
/// working directory, and writes the signer command line to a script for
/// manual inspection or editing.
#[derive(Debug, Parser)]
struct ScriptCli {
    /// Path to vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output shell script.
    #[arg(long, value_name = "FILE", value_parser, default_value = "sign_vbmeta.sh")]
    script: PathBuf,

    /// Path to the external signing tool.
    #[arg(long, value_name = "FILE", value_parser, default_value = "avbtool")]
    avbtool: PathBuf,

    /// Signed vbmeta path the script will produce.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_parser,
        default_value = "vbmeta-sign-custom.img"
    )]
    output: PathBuf,
}

/// Wrap a signed vbmeta image in a DHTB vendor container.
///
/// The image is rewritten in place as a fixed-size container with an
/// embedded digest trailer, laid out for the given firmware version.
#[derive(Debug, Parser)]
struct WrapCli {
    /// Path to signed vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Target firmware major version (8, 9, 10, 11, or 13).
    #[arg(short, long, value_name = "VERSION")]
    android_version: u32,
}

#[derive(Debug, Subcommand)]
enum VbmetaCommand {
    #[command(alias = "dump")]
    Info(InfoCli),
    Script(ScriptCli),
    Wrap(WrapCli),
}

/// Inspect and wrap vbmeta images.
#[derive(Debug, Parser)]
pub struct VbmetaCli {
    #[command(subcommand)]
    command: VbmetaCommand,
}

pub fn vbmeta_main(cli: &VbmetaCli) -> Result<()> {
    match &cli.command {
        VbmetaCommand::Info(c) => info_subcommand(c),
        VbmetaCommand::Script(c) => script_subcommand(c),
        VbmetaCommand::Wrap(c) => wrap_subcommand(c),
    }
}
