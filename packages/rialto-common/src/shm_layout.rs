//! Shared-memory partition layout and versioned per-frame metadata (§3.1, §6).
//!
//! A partition is `[metadata_region | media_region]`, reserved by the server
//! for one source's next `NeedData` batch. `FrameMetadataV1` is a fixed
//! 104-byte `bytemuck::Pod` struct (grounded on the teacher's `bytemuck`
//! dependency, used here for exactly the fixed-layout wire struct it's meant
//! for); `FrameMetadataV2` is a self-describing `serde` record. Both are
//! written/read by [`crate::channel`]-adjacent crates (`rialto-client`'s
//! `FrameWriter`, `rialto-server`'s `DataReader`).

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Maximum number of frames the server will ever request in a single
/// `NeedData` batch.
pub const MAX_FRAMES_PER_NEED_DATA: usize = 24;

/// Size in bytes of one [`FrameMetadataV1`] record on the wire.
pub const V1_FRAME_STRUCT_SIZE: usize = 104;

/// Fixed IV length assumed by V1's decryption reference (CENC/CBCS IVs are
/// always 16 bytes; V2 carries the IV inline with an explicit length and has
/// no such restriction).
pub const V1_IV_LENGTH: usize = 16;

/// Maximum number of bytes of extra-data V1 can carry inline.
pub const V1_MAX_INLINE_EXTRA_DATA: usize = 32;

/// Minimum metadata-subregion size: 4 bytes of version prefix plus room for
/// the maximum per-`NeedData` frame count at the V1 struct size (§6).
pub const MIN_METADATA_REGION_BYTES: u32 =
    4 + (MAX_FRAMES_PER_NEED_DATA as u32) * (V1_FRAME_STRUCT_SIZE as u32);

/// A contiguous window inside the shared-memory region reserved for one
/// source's next `NeedData` batch (§3.1 ShmPartition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmPartition {
    pub metadata_offset: u32,
    pub max_metadata_bytes: u32,
    pub media_offset: u32,
    pub max_media_bytes: u32,
}

impl ShmPartition {
    /// Validates that the partition has at least the minimum metadata
    /// region size required to hold a full `NeedData` batch.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.max_metadata_bytes >= MIN_METADATA_REGION_BYTES && self.max_media_bytes > 0
    }
}

impl From<crate::protocol::ShmInfo> for ShmPartition {
    fn from(info: crate::protocol::ShmInfo) -> Self {
        Self {
            metadata_offset: info.metadata_offset,
            max_metadata_bytes: info.max_metadata_bytes,
            media_offset: info.media_offset,
            max_media_bytes: info.max_media_bytes,
        }
    }
}

/// Fixed 104-byte little-endian per-frame record (§3.1 FrameMetadata V1).
///
/// `#[repr(C)]` with fields ordered largest-alignment-first keeps the layout
/// free of implicit padding, so `size_of::<FrameMetadataV1>() == 104` holds
/// on every supported target without needing `#[repr(packed)]` (which would
/// make field access require unaligned reads).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameMetadataV1 {
    pub payload_offset: u64,
    pub timestamp_ns: i64,
    pub duration_ns: i64,
    pub payload_length: u32,
    pub stream_id: i32,
    pub extra_data_len: u32,
    pub key_session_id: i32,
    pub key_id_offset: u32,
    pub key_id_length: u32,
    pub iv_offset: u32,
    pub subsample_table_offset: u32,
    pub subsample_table_count: u32,
    /// 0/1: whether `init_with_last_15` applies to this frame's decryption.
    pub init_with_last_15: u32,
    /// Audio: sample rate. Video: width. Interpretation is decided by the
    /// owning source's `MediaSourceType`.
    pub extra_1: u32,
    /// Audio: channel count. Video: height.
    pub extra_2: u32,
    pub extra_data: [u8; V1_MAX_INLINE_EXTRA_DATA],
}

const _: () = assert!(std::mem::size_of::<FrameMetadataV1>() == V1_FRAME_STRUCT_SIZE);

impl FrameMetadataV1 {
    /// Returns the decryption reference fields as `(key_id range, iv range,
    /// subsample range)`, all relative to the shm region base.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.key_id_length > 0
    }
}

/// Self-describing per-frame metadata record for V2 (§3.1 FrameMetadata V2).
///
/// Encoded on the wire as `u32 meta_len` followed by a `serde_json` encoding
/// of this struct, followed by `payload_length` bytes of payload. Optional
/// fields are only serialized when set, satisfying the "present iff the
/// writer sets them" requirement without inventing a bespoke schema (the
/// spec's Open Question on V2's wire schema states any equivalent
/// self-describing schema suffices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadataV2 {
    pub timestamp_ns: i64,
    pub duration_ns: i64,
    pub payload_length: u32,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub codec_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub segment_alignment: Option<crate::protocol::SegmentAlignment>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_session_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_id: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub init_vector: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub init_with_last_15: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sub_samples: Option<Vec<crate::protocol::SubSample>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cipher_mode: Option<crate::protocol::CipherMode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crypt_byte_block: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub skip_byte_block: Option<u8>,
}

impl FrameMetadataV2 {
    /// Per §4.5: encrypted iff any of the four encryption-identifying
    /// fields is present.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.key_session_id.is_some()
            || self.key_id.is_some()
            || self.init_vector.is_some()
            || self.init_with_last_15.is_some()
    }
}

/// Wire version discriminant, read from the first 4 LE bytes of a
/// partition's metadata subregion (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmVersion {
    V1,
    V2,
}

impl ShmVersion {
    /// Parses a version tag, returning `None` for anything other than 1/2
    /// (§4.11, §8 scenario 6).
    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_struct_is_104_bytes() {
        assert_eq!(std::mem::size_of::<FrameMetadataV1>(), 104);
    }

    #[test]
    fn min_metadata_region_matches_spec_constant() {
        // §6: metadata_region_size >= 4 + 24*104 = 2500 bytes.
        assert_eq!(MIN_METADATA_REGION_BYTES, 2500);
    }

    #[test]
    fn partition_validity() {
        let p = ShmPartition {
            metadata_offset: 0,
            max_metadata_bytes: 2500,
            media_offset: 2500,
            max_media_bytes: 200_000,
        };
        assert!(p.is_valid());

        let too_small = ShmPartition {
            max_metadata_bytes: 100,
            ..p
        };
        assert!(!too_small.is_valid());
    }

    #[test]
    fn version_dispatch_rejects_unknown_tag() {
        assert_eq!(ShmVersion::from_tag(3), None);
        assert_eq!(ShmVersion::from_tag(1), Some(ShmVersion::V1));
        assert_eq!(ShmVersion::from_tag(2), Some(ShmVersion::V2));
    }

    #[test]
    fn v2_encrypted_detection() {
        let mut meta = FrameMetadataV2 {
            timestamp_ns: 0,
            duration_ns: 0,
            payload_length: 0,
            extra_data: None,
            codec_data: None,
            segment_alignment: None,
            key_session_id: None,
            key_id: None,
            init_vector: None,
            init_with_last_15: None,
            sub_samples: None,
            cipher_mode: None,
            crypt_byte_block: None,
            skip_byte_block: None,
        };
        assert!(!meta.is_encrypted());
        meta.key_id = Some(vec![1, 2, 3]);
        assert!(meta.is_encrypted());
    }

    #[test]
    fn v1_zeroed_is_not_encrypted() {
        let meta = FrameMetadataV1::zeroed();
        assert!(!meta.is_encrypted());
    }
}
