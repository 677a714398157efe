/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    cli::{status, warning},
    format::{bootimage, dhtb, vbmeta},
    signer::{self, AlgorithmParameters, ChainPartition},
    stream, util,
};

/// Extract every chained partition's public key to the working directory and
/// return the matching `--chain_partition` entries.
pub(crate) fn extract_chain_keys(
    buf: &[u8],
    base: usize,
    header: &vbmeta::RawHeader,
    params: &AlgorithmParameters,
) -> Result<Vec<ChainPartition>> {
    let offset = vbmeta::descriptors_offset(base, header)
        .context("Failed to locate descriptor region")?;
    let entries =
        vbmeta::walk_chain(buf, offset).context("Failed to walk chain descriptors")?;

    let mut chains = Vec::with_capacity(entries.len());

    for entry in entries {
        let key_file = params.public_key_name(&entry.partition_name);

        status!("Extracting {key_file}");
        fs::write(&key_file, &entry.public_key)
            .with_context(|| format!("Failed to write public key: {key_file}"))?;

        chains.push(ChainPartition {
            partition_name: entry.partition_name,
            rollback_index_location: entry.rollback_index_location,
            key_file,
        });
    }

    Ok(chains)
}

/// Swap the target partition's extracted key for the user-provided custom
/// key, when one is present in the working directory.
fn substitute_custom_key(params: &AlgorithmParameters, partition: &str) -> Result<()> {
    let custom = params.public_key_name("custom");
    let target = params.public_key_name(partition);

    if Path::new(&target).exists() {
        fs::remove_file(&target)
            .with_context(|| format!("Failed to remove extracted key: {target}"))?;
    }

    if Path::new(&custom).exists() {
        status!("Using custom public key for {partition}");
        fs::copy(&custom, &target)
            .with_context(|| format!("Failed to copy {custom} to {target}"))?;
    }

    Ok(())
}

fn pack_archive(archive: &Path, images: &[&Path]) -> Result<()> {
    let file = File::create(archive)
        .with_context(|| format!("Failed to create archive: {archive:?}"))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in images {
        let name = path
            .file_name()
            .with_context(|| format!("Path has no file name: {path:?}"))?
            .to_string_lossy();

        writer
            .start_file(name, options)
            .with_context(|| format!("Failed to add archive entry for: {path:?}"))?;

        let mut reader = File::open(path)
            .with_context(|| format!("Failed to open for reading: {path:?}"))?;
        io::copy(&mut reader, &mut writer)
            .with_context(|| format!("Failed to copy into archive: {path:?}"))?;
    }

    writer.finish().context("Failed to finalize archive")?;

    Ok(())
}

pub fn sign_main(cli: &SignCli, cancel_signal: &AtomicBool) -> Result<()> {
    // Fail on a bad firmware version before anything is modified.
    let profile = dhtb::TrailerProfile::for_version(cli.android_version)
        .context("No container layout for this firmware version")?;

    status!("Trimming {:?}", cli.image);
    bootimage::trim_in_place(&cli.image)
        .with_context(|| format!("Failed to trim boot image: {:?}", cli.image))?;

    stream::check_cancel(cancel_signal)?;

    let buf = fs::read(&cli.vbmeta)
        .with_context(|| format!("Failed to read vbmeta image: {:?}", cli.vbmeta))?;

    let base = vbmeta::header_offset(&buf);
    let header = vbmeta::RawHeader::decode_checked(&buf, base)
        .with_context(|| format!("Failed to load vbmeta header: {:?}", cli.vbmeta))?;

    let algorithm_type = util::swap_bytes_32(header.algorithm_type.get());
    let params = AlgorithmParameters::from_raw(algorithm_type)
        .with_context(|| format!("Cannot re-sign vbmeta image: {:?}", cli.vbmeta))?;
    status!("Original image signed with {}", params.name());

    let chains = extract_chain_keys(&buf, base, &header, &params)?;
    substitute_custom_key(&params, &cli.partition)?;

    let padding = dhtb::probe_padding_size(&buf);
    if padding.used_default {
        warning!(
            "DHTB marker not found, assuming padding size {:#x}",
            padding.size,
        );
    }

    stream::check_cancel(cancel_signal)?;

    status!("Signing new vbmeta image");
    let args = signer::resign_args(&params, &chains, padding.size, &cli.output);
    signer::run_signer(&cli.avbtool, &args).context("Failed to re-sign vbmeta image")?;

    if !cli.output.exists() {
        bail!("Signer did not produce: {:?}", cli.output);
    }

    stream::check_cancel(cancel_signal)?;

    status!("Wrapping signed image for version {} firmware", profile.version);
    profile
        .wrap_in_place(&cli.output)
        .with_context(|| format!("Failed to wrap signed image: {:?}", cli.output))?;

    stream::check_cancel(cancel_signal)?;

    status!("Signing {} image", cli.partition);
    let args = signer::footer_args(&params, &cli.image, &cli.partition, cli.size);
    signer::run_signer(&cli.avbtool, &args)
        .with_context(|| format!("Failed to sign {} image", cli.partition))?;

    stream::check_cancel(cancel_signal)?;

    pack_archive(&cli.archive, &[cli.image.as_path(), cli.output.as_path()])?;
    status!("Packed signed images into {:?}", cli.archive);

    Ok(())
}

/// Re-sign a boot/recovery image and its vbmeta image with a custom key.
///
/// The boot image is trimmed, the vbmeta image is re-signed with the same
/// chain as the original (substituting the custom public key for the target
/// partition when one exists), the result is wrapped in a DHTB vendor
/// container, a hash footer is appended to the boot image, and both outputs
/// are packed into a flashable zip.
#[derive(Debug, Parser)]
pub struct SignCli {
    /// Path to original vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser, default_value = "vbmeta.img")]
    pub vbmeta: PathBuf,

    /// Path to boot or recovery image to re-sign.
    #[arg(short, long, value_name = "FILE", value_parser, default_value = "boot.img")]
    pub image: PathBuf,

    /// Partition name the image belongs to.
    #[arg(short = 't', long = "type", value_name = "NAME", default_value = "boot")]
    pub partition: String,

    /// Target firmware major version (8, 9, 10, 11, or 13).
    #[arg(short, long, value_name = "VERSION", default_value_t = 8)]
    pub android_version: u32,

    /// Size of the partition the image will be flashed to.
    #[arg(short, long, value_name = "BYTES", default_value_t = 36_700_160)]
    pub size: u64,

    /// Path to the external signing tool.
    #[arg(long, value_name = "FILE", value_parser, default_value = "avbtool")]
    pub avbtool: PathBuf,

    /// Path to output vbmeta image.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_parser,
        default_value = "vbmeta-sign-custom.img"
    )]
    pub output: PathBuf,

    /// Path to output zip of signed images.
    #[arg(long, value_name = "FILE", value_parser, default_value = "SignedImages.zip")]
    pub archive: PathBuf,
}
