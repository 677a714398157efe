/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::{boot, sign, vbmeta};

#[derive(Debug, Subcommand)]
pub enum Command {
    Sign(sign::SignCli),
    Boot(boot::BootCli),
    Vbmeta(vbmeta::VbmetaCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Diagnostics go to stderr so the subcommands' own output stays clean. The
/// default severity is overridable via `RUST_LOG`.
fn init_logging(logging_initialized: &AtomicBool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    logging_initialized.store(true, Ordering::SeqCst);
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(logging_initialized);

    match cli.command {
        Command::Sign(c) => sign::sign_main(&c, cancel_signal),
        Command::Boot(c) => boot::boot_main(&c),
        Command::Vbmeta(c) => vbmeta::vbmeta_main(&c),
    }
}
