// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeSet, HashSet},
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use byteorder::{BigEndian, ReadBytesExt};
use bzip2::write::BzDecoder;
use num_traits::ToPrimitive;
use prost::Message;
use rayon::{
    iter::{IntoParallelRefIterator, ParallelIterator},
    ThreadPoolBuilder,
};
use ring::digest::Context;
use thiserror::Error;
use xz2::write::XzDecoder;

use crate::{
    progress::{Progress, ProgressBar},
    protobuf::chromeos_update_engine::{
        install_operation, DeltaArchiveManifest, InstallOperation, PartitionUpdate,
    },
    stream::{
        self, check_cancel, CountingReader, FromReader, HashingReader, ReadDiscardExt,
        ReadSeekReopen, SectionReader, WriteSeek,
    },
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const PAYLOAD_HEADER_SIZE: usize = PAYLOAD_MAGIC.len() + 8 + 8 + 4;

/// The only major payload version produced by current OTA tooling.
pub const PAYLOAD_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Partitions not found in payload: {0:?}")]
    MissingPartitions(BTreeSet<String>),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Install operation has no destination extents")]
    NoDestinationExtents,
    #[error("Unsupported install operation: {}", .0.as_str_name())]
    UnsupportedOperation(install_operation::Type),
    #[error("Unknown install operation type: {0}")]
    UnknownOperation(i32),
    #[error("Expected sha256 {expected}, but have {actual}")]
    MismatchedDigest { expected: String, actual: String },
    #[error("Expected {expected} output bytes, but wrote {actual}")]
    MismatchedOutputSize { expected: u64, actual: u64 },
    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Protobuf error")]
    Protobuf(#[from] prost::DecodeError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
    pub blob_offset: u64,
}

impl PayloadHeader {
    /// Size of the framing header plus the manifest, excluding the metadata
    /// signature block.
    pub fn metadata_size(&self) -> u64 {
        PAYLOAD_HEADER_SIZE as u64 + self.manifest_size
    }

    pub fn is_full_ota(&self) -> bool {
        self.manifest
            .partitions
            .iter()
            .all(|p| p.old_partition_info.is_none())
    }
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload file. After this function returns,
    /// the file position is set to the beginning of the blob section. Callers
    /// must not rely on the cursor; all subsequent blob access is positional.
    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader.read_u64::<BigEndian>()?;
        if version != PAYLOAD_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = reader.read_u64::<BigEndian>()?;
        let metadata_signature_size = reader.read_u32::<BigEndian>()?;

        let mut manifest_raw =
            vec![
                0u8;
                manifest_size
                    .to_usize()
                    .ok_or(Error::IntegerTooLarge("manifest_size"))?
            ];
        reader.read_exact(&mut manifest_raw)?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

        // The metadata signatures are located, but never verified.
        reader.read_discard_exact(metadata_signature_size.into())?;

        Ok(Self {
            version,
            manifest,
            manifest_size,
            metadata_signature_size,
            blob_offset: reader.stream_position()?,
        })
    }
}

/// One contiguous byte range of the output file, derived from a destination
/// extent.
struct ExtentRun {
    offset: u64,
    length: u64,
}

/// A writer that routes a sequential stream across an operation's destination
/// extents, seeking the underlying writer at each extent boundary.
struct ExtentsWriter<W: WriteSeek> {
    inner: W,
    runs: Vec<ExtentRun>,
    index: usize,
    run_pos: u64,
    written: u64,
    needs_seek: bool,
}

impl<W: WriteSeek> ExtentsWriter<W> {
    fn new(inner: W, runs: Vec<ExtentRun>) -> Self {
        Self {
            inner,
            runs,
            index: 0,
            run_pos: 0,
            written: 0,
            needs_seek: true,
        }
    }

    fn written(&self) -> u64 {
        self.written
    }
}

impl<W: WriteSeek> Write for ExtentsWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let Some(run) = self.runs.get(self.index) else {
                // Capacity exhausted. write_all() turns this into WriteZero.
                return Ok(0);
            };

            if self.run_pos == run.length {
                self.index += 1;
                self.run_pos = 0;
                self.needs_seek = true;
                continue;
            }

            if self.needs_seek {
                self.inner.seek(SeekFrom::Start(run.offset + self.run_pos))?;
                self.needs_seek = false;
            }

            let to_write = (run.length - self.run_pos).min(buf.len() as u64) as usize;
            let n = self.inner.write(&buf[..to_write])?;

            self.run_pos += n as u64;
            self.written += n as u64;

            return Ok(n);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compute the output byte ranges for an operation's destination extents and
/// the total expected output size.
fn extent_runs(op: &InstallOperation, block_size: u32) -> Result<(Vec<ExtentRun>, u64)> {
    if op.dst_extents.is_empty() {
        return Err(Error::NoDestinationExtents);
    }

    let mut runs = Vec::with_capacity(op.dst_extents.len());
    let mut expected = 0u64;

    for extent in &op.dst_extents {
        let start_block = extent
            .start_block
            .ok_or(Error::MissingField("start_block"))?;
        let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

        let offset = start_block
            .checked_mul(block_size.into())
            .ok_or(Error::IntegerTooLarge("out_offset"))?;
        let length = num_blocks
            .checked_mul(block_size.into())
            .ok_or(Error::IntegerTooLarge("out_data_length"))?;

        expected = expected
            .checked_add(length)
            .ok_or(Error::IntegerTooLarge("out_data_length"))?;

        runs.push(ExtentRun { offset, length });
    }

    Ok((runs, expected))
}

/// Apply a partition install operation from `reader` to `writer`.
///
/// The decompressed output is written across every destination extent in
/// declared order. The SHA-256 digest is computed over the compressed (on
/// disk) bytes, which is what the manifest records, and compared against
/// [`InstallOperation::data_sha256_hash`] if one is declared.
pub fn apply_operation(
    mut reader: impl Read + Seek,
    writer: impl Write + Seek,
    block_size: u32,
    blob_offset: u64,
    op: &InstallOperation,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let op_type = install_operation::Type::try_from(op.r#type)
        .map_err(|_| Error::UnknownOperation(op.r#type))?;

    let (runs, expected) = extent_runs(op, block_size)?;
    let mut out = ExtentsWriter::new(writer, runs);

    match op_type {
        // ZERO doesn't reference the payload blob, so there is no digest to
        // compare.
        install_operation::Type::Zero => {
            stream::copy_n(io::repeat(0), &mut out, expected, cancel_signal)?;
        }
        install_operation::Type::Replace
        | install_operation::Type::ReplaceBz
        | install_operation::Type::ReplaceXz
        | install_operation::Type::Zstd => {
            let data_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
            let data_length = op.data_length.ok_or(Error::MissingField("data_length"))?;
            let in_offset = blob_offset
                .checked_add(data_offset)
                .ok_or(Error::IntegerTooLarge("in_offset"))?;

            let section = SectionReader::new(&mut reader, in_offset, data_length)?;
            let mut hashing = HashingReader::new(section, Context::new(&ring::digest::SHA256));

            match op_type {
                install_operation::Type::Replace => {
                    stream::copy_n(&mut hashing, &mut out, data_length, cancel_signal)?;
                }
                install_operation::Type::ReplaceBz => {
                    let mut decoder = BzDecoder::new(&mut out);
                    stream::copy_n(&mut hashing, &mut decoder, data_length, cancel_signal)?;
                    decoder.finish()?;
                }
                install_operation::Type::ReplaceXz => {
                    let mut decoder = XzDecoder::new(&mut out);
                    stream::copy_n(&mut hashing, &mut decoder, data_length, cancel_signal)?;
                    decoder.finish()?;
                }
                install_operation::Type::Zstd => {
                    let mut decoder = zstd::stream::write::Decoder::new(&mut out)?;
                    stream::copy_n(&mut hashing, &mut decoder, data_length, cancel_signal)?;
                    decoder.flush()?;
                }
                _ => unreachable!(),
            }

            let (_, context) = hashing.finish();
            let digest = context.finish();

            if let Some(expected_digest) = &op.data_sha256_hash {
                if !expected_digest.is_empty() && expected_digest.as_slice() != digest.as_ref() {
                    return Err(Error::MismatchedDigest {
                        expected: hex::encode(expected_digest),
                        actual: hex::encode(digest.as_ref()),
                    });
                }
            }
        }
        other => return Err(Error::UnsupportedOperation(other)),
    }

    let written = out.written();
    if written != expected {
        return Err(Error::MismatchedOutputSize {
            expected,
            actual: written,
        });
    }

    Ok(())
}

/// Extract a single partition image by applying its operations in manifest
/// order. The first failing operation aborts the partition; bytes already
/// written are left in place.
pub fn extract_partition(
    mut reader: impl Read + Seek,
    mut writer: impl Write + Seek,
    block_size: u32,
    blob_offset: u64,
    partition: &PartitionUpdate,
    bar: &ProgressBar,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for op in &partition.operations {
        check_cancel(cancel_signal)?;

        apply_operation(
            &mut reader,
            &mut writer,
            block_size,
            blob_offset,
            op,
            cancel_signal,
        )?;

        bar.increment();
    }

    writer.flush()?;

    Ok(())
}

/// Check one operation's blob digest without producing any output. Operations
/// that declare no digest (including ZERO) are skipped.
fn verify_operation(
    reader: impl Read + Seek,
    blob_offset: u64,
    op: &InstallOperation,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let Some(expected) = op.data_sha256_hash.as_deref().filter(|h| !h.is_empty()) else {
        return Ok(());
    };
    let (Some(data_offset), Some(data_length)) = (op.data_offset, op.data_length) else {
        return Ok(());
    };

    let in_offset = blob_offset
        .checked_add(data_offset)
        .ok_or(Error::IntegerTooLarge("in_offset"))?;

    let section = SectionReader::new(reader, in_offset, data_length)?;
    let mut context = Context::new(&ring::digest::SHA256);

    stream::copy_n_inspect(
        section,
        io::sink(),
        data_length,
        |data| context.update(data),
        cancel_signal,
    )?;

    let digest = context.finish();
    if expected != digest.as_ref() {
        return Err(Error::MismatchedDigest {
            expected: hex::encode(expected),
            actual: hex::encode(digest.as_ref()),
        });
    }

    Ok(())
}

/// Outcome of a scheduler run. Partitions appear in manifest order.
#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl ExtractSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Select partitions by name, in manifest order. Names not present in the
/// manifest are an error, reported before any work starts.
fn select_partitions<'a, 'b>(
    manifest: &'a DeltaArchiveManifest,
    partition_names: impl IntoIterator<Item = &'b str>,
) -> Result<Vec<&'a PartitionUpdate>> {
    let mut remaining = partition_names.into_iter().collect::<HashSet<_>>();
    let selected = manifest
        .partitions
        .iter()
        .filter(|p| remaining.remove(p.partition_name.as_str()))
        .collect::<Vec<_>>();

    if !remaining.is_empty() {
        let remaining = remaining.iter().map(|&n| n.to_owned()).collect();
        return Err(Error::MissingPartitions(remaining));
    }

    Ok(selected)
}

/// Run `task` against the selected partitions on a pool of `workers` threads.
/// Every partition is attempted; individual failures are recorded in the
/// summary instead of aborting the run.
fn run_selected<'a>(
    manifest: &DeltaArchiveManifest,
    partition_names: impl IntoIterator<Item = &'a str>,
    workers: usize,
    progress: &Progress,
    task: impl Fn(&PartitionUpdate, &ProgressBar) -> Result<()> + Sync,
) -> Result<ExtractSummary> {
    let selected = select_partitions(manifest, partition_names)?;

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;

    let results = pool.install(|| {
        selected
            .par_iter()
            .map(|p| {
                let bar = progress.add_bar(&p.partition_name, p.operations.len() as u64);
                let result = task(p, &bar);
                bar.finish();

                (p.partition_name.clone(), result)
            })
            .collect::<Vec<_>>()
    });

    let mut summary = ExtractSummary::default();
    for (name, result) in results {
        match result {
            Ok(()) => summary.succeeded.push(name),
            Err(e) => summary.failed.push((name, e)),
        }
    }

    Ok(summary)
}

/// Extract the specified partition images from the payload into writers
/// produced by `open_output`. `open_output` is called from multiple threads;
/// each returned writer is owned exclusively by one worker.
pub fn extract_images<'a>(
    payload: &(dyn ReadSeekReopen + Sync),
    open_output: impl Fn(&str) -> io::Result<Box<dyn WriteSeek>> + Sync,
    header: &PayloadHeader,
    partition_names: impl IntoIterator<Item = &'a str>,
    workers: usize,
    progress: &Progress,
    cancel_signal: &AtomicBool,
) -> Result<ExtractSummary> {
    run_selected(
        &header.manifest,
        partition_names,
        workers,
        progress,
        |partition, bar| {
            let reader = payload.reopen_boxed()?;
            let writer = open_output(&partition.partition_name)?;

            extract_partition(
                reader,
                writer,
                header.manifest.block_size(),
                header.blob_offset,
                partition,
                bar,
                cancel_signal,
            )
        },
    )
}

/// Check the declared blob digests of the specified partitions without
/// writing any output files.
pub fn verify_images<'a>(
    payload: &(dyn ReadSeekReopen + Sync),
    header: &PayloadHeader,
    partition_names: impl IntoIterator<Item = &'a str>,
    workers: usize,
    progress: &Progress,
    cancel_signal: &AtomicBool,
) -> Result<ExtractSummary> {
    run_selected(
        &header.manifest,
        partition_names,
        workers,
        progress,
        |partition, bar| {
            let mut reader = payload.reopen_boxed()?;

            for op in &partition.operations {
                check_cancel(cancel_signal)?;
                verify_operation(&mut reader, header.blob_offset, op, cancel_signal)?;
                bar.increment();
            }

            Ok(())
        },
    )
}
