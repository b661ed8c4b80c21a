// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::atomic::AtomicBool,
};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::{
    cli::{args::Cli, status, warning},
    format::payload::{self, ExtractSummary, PayloadHeader},
    progress::Progress,
    stream::{FromReader, PSeekFile, Reopen, WriteSeek},
    util,
};

fn open_payload(path: &Path) -> Result<(PSeekFile, PayloadHeader)> {
    let file = File::open(path)
        .map(PSeekFile::new)
        .with_context(|| format!("Failed to open payload for reading: {path:?}"))?;

    let reader = BufReader::new(file.reopen()?);
    let header = PayloadHeader::from_reader(reader)
        .with_context(|| format!("Failed to read payload header: {path:?}"))?;

    Ok((file, header))
}

fn print_info(header: &PayloadHeader) {
    let manifest = &header.manifest;

    println!("Payload version: {}", header.version);
    println!("Manifest size: {} bytes", header.manifest_size);
    println!(
        "Metadata signature size: {} bytes",
        header.metadata_signature_size,
    );
    println!("Metadata size: {} bytes", header.metadata_size());
    println!("Data offset: {}", header.blob_offset);
    println!("Block size: {}", manifest.block_size());
    println!("Minor version: {}", manifest.minor_version());
    println!("Partitions ({}):", manifest.partitions.len());

    for partition in &manifest.partitions {
        let size = partition
            .new_partition_info
            .as_ref()
            .and_then(|info| info.size)
            .unwrap_or(0);

        println!(
            "  {:<24} {:>12}  ({} ops)",
            partition.partition_name,
            util::human_size(size),
            partition.operations.len(),
        );
    }
}

/// Join a partition name to the output directory, rejecting names that could
/// escape it.
fn image_path(directory: &Path, name: &str) -> io::Result<PathBuf> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unsafe partition name: {name:?}"),
        ));
    }

    Ok(directory.join(format!("{name}.img")))
}

fn open_output(directory: &Path, name: &str) -> io::Result<Box<dyn WriteSeek>> {
    let path = image_path(directory, name)?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }

    let file = options.open(&path)?;

    Ok(Box::new(BufWriter::new(file)))
}

fn report_summary(summary: &ExtractSummary, action: &str) -> ExitCode {
    for (name, error) in &summary.failed {
        warning!("Failed to {action} {name}: {error:?}");
    }

    status!(
        "{} {} of {} partitions",
        if action == "verify" {
            "Verified"
        } else {
            "Extracted"
        },
        summary.succeeded.len(),
        summary.total(),
    );

    if summary.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

pub fn payload_main(cli: &Cli, cancel_signal: &AtomicBool) -> Result<ExitCode> {
    if cli.concurrency == 0 {
        bail!("Worker count must be at least 1");
    }

    let (file, header) = open_payload(&cli.input)?;

    if cli.list {
        print_info(&header);
        return Ok(ExitCode::SUCCESS);
    }

    if !header.is_full_ota() {
        warning!("Payload is a delta OTA; delta operations will fail to extract");
    }

    let partition_names = if cli.partitions.is_empty() {
        header
            .manifest
            .partitions
            .iter()
            .map(|p| p.partition_name.as_str())
            .collect::<Vec<_>>()
    } else {
        cli.partitions.iter().map(|n| n.as_str()).collect()
    };

    let progress = Progress::new();

    if cli.verify {
        debug!("Verifying {} partitions", partition_names.len());

        let summary = payload::verify_images(
            &file,
            &header,
            partition_names,
            cli.concurrency,
            &progress,
            cancel_signal,
        )
        .context("Failed to verify payload")?;

        return Ok(report_summary(&summary, "verify"));
    }

    // The CLI contract requires the output directory to already exist.
    let directory = cli.output.as_deref().expect("Output directory not set");
    if !directory.is_dir() {
        bail!("Output directory does not exist: {directory:?}");
    }

    debug!(
        "Extracting {} partitions with {} workers",
        partition_names.len(),
        cli.concurrency,
    );

    let summary = payload::extract_images(
        &file,
        |name| open_output(directory, name),
        &header,
        partition_names,
        cli.concurrency,
        &progress,
        cancel_signal,
    )
    .context("Failed to extract partitions")?;

    Ok(report_summary(&summary, "extract"))
}
