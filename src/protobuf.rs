// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Message types for the `chromeos_update_engine` protobuf package, in the
//! form `prost-build` generates from AOSP's `update_metadata.proto`. The
//! schema is a frozen external contract, so the generated form is checked in
//! instead of being produced by a build script. Only the fields this crate
//! consumes are declared; prost skips unknown fields during decoding.

#![allow(clippy::all)]

pub mod chromeos_update_engine {
    /// Data is packed into blocks on disk. A block's size is the minimal unit
    /// written to disk.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Extent {
        #[prost(uint64, optional, tag = "1")]
        pub start_block: ::core::option::Option<u64>,
        #[prost(uint64, optional, tag = "2")]
        pub num_blocks: ::core::option::Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Signatures {
        #[prost(message, repeated, tag = "1")]
        pub signatures: ::prost::alloc::vec::Vec<signatures::Signature>,
    }

    /// Nested message and enum types in `Signatures`.
    pub mod signatures {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Signature {
            #[deprecated]
            #[prost(uint32, optional, tag = "1")]
            pub version: ::core::option::Option<u32>,
            #[prost(bytes = "vec", optional, tag = "2")]
            pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
            /// The DER encoded signature size of EC keys is nondeterministic.
            /// This field provides the exact size the signature occupies.
            #[prost(fixed32, optional, tag = "3")]
            pub unpadded_signature_size: ::core::option::Option<u32>,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PartitionInfo {
        #[prost(uint64, optional, tag = "1")]
        pub size: ::core::option::Option<u64>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InstallOperation {
        #[prost(enumeration = "install_operation::Type", required, tag = "1")]
        pub r#type: i32,
        /// Only minor version 2 or newer support 64 bits |data_offset|.
        #[prost(uint64, optional, tag = "2")]
        pub data_offset: ::core::option::Option<u64>,
        #[prost(uint64, optional, tag = "3")]
        pub data_length: ::core::option::Option<u64>,
        #[prost(message, repeated, tag = "4")]
        pub src_extents: ::prost::alloc::vec::Vec<Extent>,
        #[prost(message, repeated, tag = "6")]
        pub dst_extents: ::prost::alloc::vec::Vec<Extent>,
        /// If type == REPLACE, REPLACE_BZ, REPLACE_XZ, or ZSTD, the hash of
        /// the data blob pointed to by data_offset.
        #[prost(bytes = "vec", optional, tag = "8")]
        pub data_sha256_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    /// Nested message and enum types in `InstallOperation`.
    pub mod install_operation {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Type {
            /// Replace destination extents w/ attached data.
            Replace = 0,
            /// Move source extents to destination extents.
            Move = 1,
            /// The data is a bsdiff binary diff.
            Bsdiff = 2,
            /// Replace destination extents w/ attached bzipped data.
            ReplaceBz = 3,
            /// Regions of source partition are copied into target.
            SourceCopy = 4,
            /// Like BSDIFF, but operates on the source partition.
            SourceBsdiff = 5,
            /// Write zeros in the destination.
            Zero = 6,
            /// Discard the destination blocks.
            Discard = 7,
            /// Replace destination extents w/ attached xz data.
            ReplaceXz = 8,
            /// The data is in puffdiff format.
            Puffdiff = 9,
            /// Like SOURCE_BSDIFF, but compressed with brotli.
            BrotliBsdiff = 10,
            /// The data is in zucchini format.
            Zucchini = 11,
            /// The data is in lz4diff format.
            Lz4diffBsdiff = 12,
            Lz4diffPuffdiff = 13,
            /// Replace destination extents w/ attached zstd data.
            Zstd = 14,
        }

        impl Type {
            /// String value of the enum field names used in the ProtoBuf
            /// definition.
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    Self::Replace => "REPLACE",
                    Self::Move => "MOVE",
                    Self::Bsdiff => "BSDIFF",
                    Self::ReplaceBz => "REPLACE_BZ",
                    Self::SourceCopy => "SOURCE_COPY",
                    Self::SourceBsdiff => "SOURCE_BSDIFF",
                    Self::Zero => "ZERO",
                    Self::Discard => "DISCARD",
                    Self::ReplaceXz => "REPLACE_XZ",
                    Self::Puffdiff => "PUFFDIFF",
                    Self::BrotliBsdiff => "BROTLI_BSDIFF",
                    Self::Zucchini => "ZUCCHINI",
                    Self::Lz4diffBsdiff => "LZ4DIFF_BSDIFF",
                    Self::Lz4diffPuffdiff => "LZ4DIFF_PUFFDIFF",
                    Self::Zstd => "ZSTD",
                }
            }

            /// Creates an enum from field names used in the ProtoBuf
            /// definition.
            pub fn from_str_name(value: &str) -> ::core::option::Option<Self> {
                match value {
                    "REPLACE" => Some(Self::Replace),
                    "MOVE" => Some(Self::Move),
                    "BSDIFF" => Some(Self::Bsdiff),
                    "REPLACE_BZ" => Some(Self::ReplaceBz),
                    "SOURCE_COPY" => Some(Self::SourceCopy),
                    "SOURCE_BSDIFF" => Some(Self::SourceBsdiff),
                    "ZERO" => Some(Self::Zero),
                    "DISCARD" => Some(Self::Discard),
                    "REPLACE_XZ" => Some(Self::ReplaceXz),
                    "PUFFDIFF" => Some(Self::Puffdiff),
                    "BROTLI_BSDIFF" => Some(Self::BrotliBsdiff),
                    "ZUCCHINI" => Some(Self::Zucchini),
                    "LZ4DIFF_BSDIFF" => Some(Self::Lz4diffBsdiff),
                    "LZ4DIFF_PUFFDIFF" => Some(Self::Lz4diffPuffdiff),
                    "ZSTD" => Some(Self::Zstd),
                    _ => None,
                }
            }
        }
    }

    /// Describes the update to apply to a single partition.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PartitionUpdate {
        /// A platform-specific name to identify the partition set being
        /// updated, eg. "system".
        #[prost(string, required, tag = "1")]
        pub partition_name: ::prost::alloc::string::String,
        /// The old partition information. Only present in delta payloads.
        #[prost(message, optional, tag = "6")]
        pub old_partition_info: ::core::option::Option<PartitionInfo>,
        #[prost(message, optional, tag = "7")]
        pub new_partition_info: ::core::option::Option<PartitionInfo>,
        /// The list of operations to be performed to apply this
        /// PartitionUpdate. The associated operation blobs (in
        /// operations[i].data_offset, data_length) should be stored
        /// contiguously and in the same order.
        #[prost(message, repeated, tag = "8")]
        pub operations: ::prost::alloc::vec::Vec<InstallOperation>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeltaArchiveManifest {
        /// The size used to align partition data to blocks.
        #[prost(uint32, optional, tag = "3", default = "4096")]
        pub block_size: ::core::option::Option<u32>,
        /// If signatures are present, the offset into the blobs, generally
        /// tacked onto the end of the file, and their length.
        #[prost(uint64, optional, tag = "4")]
        pub signatures_offset: ::core::option::Option<u64>,
        #[prost(uint64, optional, tag = "5")]
        pub signatures_size: ::core::option::Option<u64>,
        /// The minor version, also referred as "delta version", of the
        /// payload. Minor version 0 is a full payload.
        #[prost(uint32, optional, tag = "12", default = "0")]
        pub minor_version: ::core::option::Option<u32>,
        /// Only present in major version >= 2. List of partitions that will
        /// be updated, in the order they will be updated.
        #[prost(message, repeated, tag = "13")]
        pub partitions: ::prost::alloc::vec::Vec<PartitionUpdate>,
        /// The maximum timestamp of the OS allowed to apply this payload.
        #[prost(int64, optional, tag = "14")]
        pub max_timestamp: ::core::option::Option<i64>,
        /// If the payload only updates a subset of partitions on the device.
        #[prost(bool, optional, tag = "16")]
        pub partial_update: ::core::option::Option<bool>,
    }

}
