// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{Cursor, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use prost::Message;

use payload_dumper::{
    format::payload::{self, Error, PayloadHeader},
    progress::Progress,
    protobuf::chromeos_update_engine::{
        install_operation::Type, DeltaArchiveManifest, Extent, InstallOperation, PartitionUpdate,
    },
    stream::{FromReader, PSeekFile, WriteSeek},
};

const BLOCK_SIZE: u32 = 4096;

fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

fn extent(start_block: u64, num_blocks: u64) -> Extent {
    Extent {
        start_block: Some(start_block),
        num_blocks: Some(num_blocks),
    }
}

/// Append `blob` to the blob section and return an operation referencing it.
fn data_op(
    op_type: Type,
    blob: &[u8],
    blobs: &mut Vec<u8>,
    with_hash: bool,
    extents: &[(u64, u64)],
) -> InstallOperation {
    let mut op = InstallOperation {
        data_offset: Some(blobs.len() as u64),
        data_length: Some(blob.len() as u64),
        dst_extents: extents.iter().map(|&(s, n)| extent(s, n)).collect(),
        data_sha256_hash: with_hash.then(|| sha256(blob)),
        ..Default::default()
    };
    op.set_type(op_type);

    blobs.extend_from_slice(blob);

    op
}

fn zero_op(extents: &[(u64, u64)]) -> InstallOperation {
    let mut op = InstallOperation {
        dst_extents: extents.iter().map(|&(s, n)| extent(s, n)).collect(),
        ..Default::default()
    };
    op.set_type(Type::Zero);

    op
}

fn partition(name: &str, operations: Vec<InstallOperation>) -> PartitionUpdate {
    PartitionUpdate {
        partition_name: name.to_owned(),
        operations,
        ..Default::default()
    }
}

fn manifest(partitions: Vec<PartitionUpdate>) -> DeltaArchiveManifest {
    DeltaArchiveManifest {
        block_size: Some(BLOCK_SIZE),
        partitions,
        ..Default::default()
    }
}

fn frame_payload(version: u64, manifest_raw: &[u8], metadata_sig: &[u8], blobs: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(b"CrAU");
    data.extend_from_slice(&version.to_be_bytes());
    data.extend_from_slice(&(manifest_raw.len() as u64).to_be_bytes());
    data.extend_from_slice(&(metadata_sig.len() as u32).to_be_bytes());
    data.extend_from_slice(manifest_raw);
    data.extend_from_slice(metadata_sig);
    data.extend_from_slice(blobs);
    data
}

fn build_payload(manifest: &DeltaArchiveManifest, blobs: &[u8]) -> Vec<u8> {
    frame_payload(2, &manifest.encode_to_vec(), &[], blobs)
}

fn payload_file(data: &[u8]) -> PSeekFile {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(data).unwrap();
    PSeekFile::new(file)
}

fn xz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn bz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn zstd_compress(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 3).unwrap()
}

/// Run one operation against an in-memory blob section (blob offset 0).
fn run_op(op: &InstallOperation, blobs: &[u8]) -> Result<Vec<u8>, Error> {
    let cancel_signal = AtomicBool::new(false);
    let mut reader = Cursor::new(blobs.to_vec());
    let mut writer = Cursor::new(Vec::new());

    payload::apply_operation(&mut reader, &mut writer, BLOCK_SIZE, 0, op, &cancel_signal)
        .map(|_| writer.into_inner())
}

fn extract_to(
    directory: &Path,
    data: &[u8],
    names: &[&str],
    workers: usize,
) -> Result<(payload::ExtractSummary, Progress), Error> {
    let cancel_signal = AtomicBool::new(false);
    let file = payload_file(data);
    let header = PayloadHeader::from_reader(Cursor::new(data)).unwrap();
    let progress = Progress::new();

    let summary = payload::extract_images(
        &file,
        |name| {
            let file = fs::File::create(directory.join(format!("{name}.img")))?;
            Ok(Box::new(file) as Box<dyn WriteSeek>)
        },
        &header,
        names.iter().copied(),
        workers,
        &progress,
        &cancel_signal,
    )?;

    Ok((summary, progress))
}

#[test]
fn header_rejects_bad_magic() {
    let mut data = build_payload(&manifest(vec![]), &[]);
    data[..4].copy_from_slice(b"CrAV");

    let err = PayloadHeader::from_reader(Cursor::new(data)).unwrap_err();
    assert!(matches!(err, Error::UnknownMagic(m) if m == *b"CrAV"));
}

#[test]
fn header_rejects_unsupported_version() {
    let data = frame_payload(1, &manifest(vec![]).encode_to_vec(), &[], &[]);

    let err = PayloadHeader::from_reader(Cursor::new(data)).unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion(1)));
}

#[test]
fn header_rejects_truncated_manifest() {
    let manifest_raw = manifest(vec![partition("x", vec![zero_op(&[(0, 1)])])]).encode_to_vec();
    let mut data = frame_payload(2, &manifest_raw, &[], &[]);

    // The declared manifest size is truthful, but the file ends mid-manifest.
    data.truncate(24 + manifest_raw.len() / 2);

    let err = PayloadHeader::from_reader(Cursor::new(data)).unwrap_err();
    assert!(
        matches!(&err, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof),
        "{err:?}",
    );
}

#[test]
fn header_reports_offsets() {
    let manifest_raw = manifest(vec![]).encode_to_vec();
    let data = frame_payload(2, &manifest_raw, b"sigsigs", &[]);

    let header = PayloadHeader::from_reader(Cursor::new(data)).unwrap();
    assert_eq!(header.version, 2);
    assert_eq!(header.manifest_size, manifest_raw.len() as u64);
    assert_eq!(header.metadata_signature_size, 7);
    assert_eq!(header.metadata_size(), 24 + manifest_raw.len() as u64);
    assert_eq!(header.blob_offset, 24 + manifest_raw.len() as u64 + 7);
}

#[test]
fn replace_writes_raw_blob() {
    let mut blobs = Vec::new();
    let block = (0..BLOCK_SIZE).map(|i| i as u8).collect::<Vec<_>>();
    let op = data_op(Type::Replace, &block, &mut blobs, true, &[(0, 1)]);

    let out = run_op(&op, &blobs).unwrap();
    assert_eq!(out, block);
}

#[test]
fn replace_without_declared_hash_is_accepted() {
    let mut blobs = Vec::new();
    let block = vec![0x5au8; BLOCK_SIZE as usize];
    let op = data_op(Type::Replace, &block, &mut blobs, false, &[(0, 1)]);

    let out = run_op(&op, &blobs).unwrap();
    assert_eq!(out, block);
}

#[test]
fn replace_with_short_blob_is_a_size_mismatch() {
    // E1: 8 bytes of data for a 4096-byte extent, with a valid hash.
    let mut blobs = Vec::new();
    let op = data_op(Type::Replace, b"abcdefgh", &mut blobs, true, &[(0, 1)]);

    let err = run_op(&op, &blobs).unwrap_err();
    assert!(matches!(
        err,
        Error::MismatchedOutputSize {
            expected: 4096,
            actual: 8,
        }
    ));
}

#[test]
fn xz_operation_round_trips() {
    // E3.
    let raw = vec![0xabu8; BLOCK_SIZE as usize];
    let mut blobs = Vec::new();
    let op = data_op(Type::ReplaceXz, &xz_compress(&raw), &mut blobs, true, &[(0, 1)]);

    let out = run_op(&op, &blobs).unwrap();
    assert_eq!(out, raw);
}

#[test]
fn bz_operation_round_trips() {
    let raw = vec![0x17u8; BLOCK_SIZE as usize];
    let mut blobs = Vec::new();
    let op = data_op(Type::ReplaceBz, &bz_compress(&raw), &mut blobs, true, &[(0, 1)]);

    let out = run_op(&op, &blobs).unwrap();
    assert_eq!(out, raw);
}

#[test]
fn zstd_operation_round_trips() {
    let raw = vec![0xc4u8; BLOCK_SIZE as usize];
    let mut blobs = Vec::new();
    let op = data_op(Type::Zstd, &zstd_compress(&raw), &mut blobs, true, &[(0, 1)]);

    let out = run_op(&op, &blobs).unwrap();
    assert_eq!(out, raw);
}

#[test]
fn flipped_digest_is_a_mismatch() {
    // E4.
    let raw = vec![0xabu8; BLOCK_SIZE as usize];
    let mut blobs = Vec::new();
    let mut op = data_op(Type::ReplaceXz, &xz_compress(&raw), &mut blobs, true, &[(0, 1)]);
    op.data_sha256_hash.as_mut().unwrap()[0] ^= 0x01;

    let err = run_op(&op, &blobs).unwrap_err();
    assert!(matches!(err, Error::MismatchedDigest { .. }));
}

#[test]
fn multi_extent_replace_splits_output() {
    let mut raw = vec![0x11u8; BLOCK_SIZE as usize];
    raw.extend(vec![0x22u8; BLOCK_SIZE as usize]);

    let mut blobs = Vec::new();
    let op = data_op(Type::Replace, &raw, &mut blobs, true, &[(0, 1), (2, 1)]);

    let out = run_op(&op, &blobs).unwrap();
    assert_eq!(out.len(), 3 * BLOCK_SIZE as usize);
    assert_eq!(&out[..4096], &raw[..4096]);
    assert_eq!(&out[4096..8192], &[0u8; 4096][..]);
    assert_eq!(&out[8192..], &raw[4096..]);
}

#[test]
fn empty_dst_extents_is_invalid() {
    let mut blobs = Vec::new();
    let mut op = data_op(Type::Replace, b"data", &mut blobs, true, &[]);
    op.dst_extents.clear();

    let err = run_op(&op, &blobs).unwrap_err();
    assert!(matches!(err, Error::NoDestinationExtents));
}

#[test]
fn delta_operation_types_are_unsupported() {
    let mut op = zero_op(&[(0, 1)]);
    op.set_type(Type::SourceCopy);

    let err = run_op(&op, &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedOperation(Type::SourceCopy)
    ));
}

#[test]
fn out_of_schema_operation_type_is_unknown() {
    let mut op = zero_op(&[(0, 1)]);
    op.r#type = 99;

    let err = run_op(&op, &[]).unwrap_err();
    assert!(matches!(err, Error::UnknownOperation(99)));
}

#[test]
fn zero_partition_extracts_zeros() {
    // E2.
    let data = build_payload(&manifest(vec![partition("x", vec![zero_op(&[(0, 2)])])]), &[]);
    let dir = tempfile::tempdir().unwrap();

    let (summary, progress) = extract_to(dir.path(), &data, &["x"], 1).unwrap();
    assert_eq!(summary.succeeded, vec!["x"]);
    assert!(summary.failed.is_empty());
    assert_eq!(progress.total_units(), 1);
    assert!(progress.all_finished());

    let image = fs::read(dir.path().join("x.img")).unwrap();
    assert_eq!(image.len(), 8192);
    assert!(image.iter().all(|&b| b == 0));
}

#[test]
fn zero_blocks_zero_operation_writes_nothing() {
    let data = build_payload(&manifest(vec![partition("x", vec![zero_op(&[(0, 0)])])]), &[]);
    let dir = tempfile::tempdir().unwrap();

    let (summary, _) = extract_to(dir.path(), &data, &["x"], 1).unwrap();
    assert_eq!(summary.succeeded, vec!["x"]);

    let image = fs::read(dir.path().join("x.img")).unwrap();
    assert!(image.is_empty());
}

#[test]
fn unknown_selector_name_fails_before_extraction() {
    let data = build_payload(&manifest(vec![partition("boot", vec![zero_op(&[(0, 1)])])]), &[]);
    let dir = tempfile::tempdir().unwrap();

    let err = extract_to(dir.path(), &data, &["boot", "nope"], 1).unwrap_err();
    match err {
        Error::MissingPartitions(names) => {
            assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["nope"]);
        }
        e => panic!("Unexpected error: {e:?}"),
    }

    assert!(!dir.path().join("boot.img").exists());
    assert!(!dir.path().join("nope.img").exists());
}

#[test]
fn two_partitions_extract_concurrently() {
    // E5.
    let mut blobs = Vec::new();
    let block = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect::<Vec<_>>();

    let parts = vec![
        partition("a", vec![zero_op(&[(0, 1)])]),
        partition(
            "b",
            vec![data_op(Type::Replace, &block, &mut blobs, true, &[(0, 1)])],
        ),
    ];
    let data = build_payload(&manifest(parts), &blobs);
    let dir = tempfile::tempdir().unwrap();

    let (summary, progress) = extract_to(dir.path(), &data, &["a", "b"], 2).unwrap();
    assert_eq!(summary.succeeded, vec!["a", "b"]);
    assert!(summary.failed.is_empty());
    assert_eq!(progress.total_units(), 2);
    assert_eq!(progress.completed_units(), 2);
    assert!(progress.all_finished());

    assert_eq!(fs::read(dir.path().join("a.img")).unwrap(), vec![0u8; 4096]);
    assert_eq!(fs::read(dir.path().join("b.img")).unwrap(), block);
}

#[test]
fn one_bad_partition_does_not_stop_the_others() {
    // E6.
    let mut blobs = Vec::new();
    let block = vec![0x33u8; BLOCK_SIZE as usize];

    let mut bad_op = zero_op(&[(0, 1)]);
    bad_op.set_type(Type::SourceBsdiff);

    let parts = vec![
        partition("a", vec![zero_op(&[(0, 1)])]),
        partition("b", vec![bad_op]),
        partition(
            "c",
            vec![data_op(Type::Replace, &block, &mut blobs, true, &[(0, 1)])],
        ),
    ];
    let data = build_payload(&manifest(parts), &blobs);
    let dir = tempfile::tempdir().unwrap();

    let (summary, progress) = extract_to(dir.path(), &data, &["a", "b", "c"], 2).unwrap();
    assert_eq!(summary.succeeded, vec!["a", "c"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "b");
    assert!(matches!(
        summary.failed[0].1,
        Error::UnsupportedOperation(Type::SourceBsdiff)
    ));
    assert!(progress.all_finished());

    assert_eq!(fs::read(dir.path().join("a.img")).unwrap(), vec![0u8; 4096]);
    assert_eq!(fs::read(dir.path().join("c.img")).unwrap(), block);
}

#[test]
fn extraction_is_deterministic_across_worker_counts() {
    let mut blobs = Vec::new();
    let block_a = vec![0x44u8; BLOCK_SIZE as usize];
    let block_b = vec![0x55u8; 2 * BLOCK_SIZE as usize];

    let parts = vec![
        partition(
            "sys",
            vec![
                data_op(Type::ReplaceXz, &xz_compress(&block_a), &mut blobs, true, &[(0, 1)]),
                data_op(Type::Replace, &block_b, &mut blobs, true, &[(1, 2)]),
            ],
        ),
        partition("oem", vec![zero_op(&[(0, 3)])]),
    ];
    let data = build_payload(&manifest(parts), &blobs);

    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let dir3 = tempfile::tempdir().unwrap();

    extract_to(dir1.path(), &data, &["sys", "oem"], 1).unwrap();
    extract_to(dir2.path(), &data, &["sys", "oem"], 3).unwrap();
    extract_to(dir3.path(), &data, &["sys", "oem"], 1).unwrap();

    for name in ["sys.img", "oem.img"] {
        let first = fs::read(dir1.path().join(name)).unwrap();
        assert_eq!(first, fs::read(dir2.path().join(name)).unwrap());
        assert_eq!(first, fs::read(dir3.path().join(name)).unwrap());
    }

    let sys = fs::read(dir1.path().join("sys.img")).unwrap();
    assert_eq!(sys.len(), 3 * BLOCK_SIZE as usize);
    assert_eq!(&sys[..4096], &block_a[..]);
    assert_eq!(&sys[4096..], &block_b[..]);
}

#[test]
fn verify_checks_blob_digests() {
    let raw = vec![0x77u8; BLOCK_SIZE as usize];
    let mut blobs = Vec::new();
    let parts = vec![partition(
        "x",
        vec![data_op(Type::ReplaceXz, &xz_compress(&raw), &mut blobs, true, &[(0, 1)])],
    )];
    let data = build_payload(&manifest(parts), &blobs);

    let cancel_signal = AtomicBool::new(false);
    let header = PayloadHeader::from_reader(Cursor::new(&*data)).unwrap();

    let progress = Progress::new();
    let summary = payload::verify_images(
        &payload_file(&data),
        &header,
        ["x"],
        1,
        &progress,
        &cancel_signal,
    )
    .unwrap();
    assert_eq!(summary.succeeded, vec!["x"]);
    assert!(summary.failed.is_empty());

    // Flipping any blob byte must be caught.
    let mut corrupted = data.clone();
    let index = header.blob_offset as usize;
    corrupted[index] ^= 0x01;

    let progress = Progress::new();
    let summary = payload::verify_images(
        &payload_file(&corrupted),
        &header,
        ["x"],
        1,
        &progress,
        &cancel_signal,
    )
    .unwrap();
    assert!(summary.succeeded.is_empty());
    assert!(matches!(summary.failed[0].1, Error::MismatchedDigest { .. }));
}

#[test]
fn corrupted_blob_fails_extraction() {
    let raw = vec![0x88u8; BLOCK_SIZE as usize];
    let mut blobs = Vec::new();
    let parts = vec![partition(
        "x",
        vec![data_op(Type::ReplaceXz, &xz_compress(&raw), &mut blobs, true, &[(0, 1)])],
    )];
    let mut data = build_payload(&manifest(parts), &blobs);

    let header = PayloadHeader::from_reader(Cursor::new(&*data)).unwrap();
    let index = header.blob_offset as usize + blobs.len() / 2;
    data[index] ^= 0x01;

    let dir = tempfile::tempdir().unwrap();
    let (summary, _) = extract_to(dir.path(), &data, &["x"], 1).unwrap();

    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert!(matches!(
        summary.failed[0].1,
        Error::MismatchedDigest { .. } | Error::Io(_) | Error::MismatchedOutputSize { .. }
    ));
}
