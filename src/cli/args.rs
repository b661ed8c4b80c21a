// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::payload;

/// Extract partition images from an Android OTA payload.
///
/// Each partition is written to `<partition name>.img` in the output
/// directory. The directory must already exist.
#[derive(Debug, Parser)]
#[command(name = "payload-dumper", version)]
pub struct Cli {
    /// Path to input payload binary.
    #[arg(value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Output directory for extracted images.
    #[arg(
        short,
        long,
        value_name = "DIR",
        value_parser,
        required_unless_present_any = ["list", "verify"]
    )]
    pub output: Option<PathBuf>,

    /// Extract only the named partitions (comma-separated).
    #[arg(short, long, value_name = "NAMES", value_delimiter = ',')]
    pub partitions: Vec<String>,

    /// Number of concurrent extraction workers.
    #[arg(short, long, value_name = "N", default_value_t = num_cpus::get())]
    pub concurrency: usize,

    /// Show payload information without extracting.
    #[arg(short, long)]
    pub list: bool,

    /// Verify operation checksums without extracting.
    #[arg(long, conflicts_with = "list")]
    pub verify: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<ExitCode> {
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    payload::payload_main(&cli, cancel_signal)
}
