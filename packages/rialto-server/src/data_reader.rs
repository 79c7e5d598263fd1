//! `DataReaderFactory` (C5 reader half, §4.5/§4.11): decodes the frames a
//! guest wrote into a [`ShmPartition`] back into owned [`ReadFrameV1`]/
//! [`ReadFrameV2`] values.
//!
//! The buffer being parsed is guest-writable: every offset and length in it
//! is untrusted input. Every read here is preceded by an explicit bounds
//! check against the mapped region's total size before any pointer
//! arithmetic, and any single malformed frame discards the whole batch
//! (§4.11 "a parse failure of any frame discards the whole batch and
//! returns an empty result") rather than returning a partial, possibly
//! misaligned result.

use rialto_common::protocol::{MediaSourceType, SubSample};
use rialto_common::shm_layout::{
    FrameMetadataV1, FrameMetadataV2, ShmPartition, ShmVersion, V1_FRAME_STRUCT_SIZE,
};

/// One decoded V1 frame, with its decryption reference (if any) already
/// resolved out of shm into owned bytes.
#[derive(Debug, Clone)]
pub struct ReadFrameV1 {
    pub metadata: FrameMetadataV1,
    pub payload: Vec<u8>,
    pub key_id: Option<Vec<u8>>,
    pub init_vector: Option<Vec<u8>>,
    pub sub_samples: Vec<SubSample>,
}

/// One decoded V2 frame.
#[derive(Debug, Clone)]
pub struct ReadFrameV2 {
    pub metadata: FrameMetadataV2,
    pub payload: Vec<u8>,
}

/// The result of one `DataReaderFactory::read` call, tagged by the version
/// the 4-byte prefix selected.
#[derive(Debug, Clone)]
pub enum FrameBatch {
    V1(Vec<ReadFrameV1>),
    V2(Vec<ReadFrameV2>),
}

impl FrameBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::V1(frames) => frames.len(),
            Self::V2(frames) => frames.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads frames out of a mapped shm region (§4.11 DataReaderFactory).
pub struct DataReaderFactory;

impl DataReaderFactory {
    /// `base` is the server's own mapping of the shm fd (generally a
    /// different address than the client's mapping of the same fd — every
    /// offset in the wire formats is relative to the region start, never an
    /// absolute pointer). `shm_size` is the total mapped size, used to bound
    /// every read. `partition` identifies the metadata/media windows this
    /// batch was written into. `source_type` only affects how the V1
    /// `extra_1`/`extra_2` fields would be interpreted by a caller; the
    /// reader itself passes them through unchanged.
    ///
    /// Returns `None` if the 4-byte version prefix is neither 1 nor 2 (§8
    /// scenario 6), regardless of `num_frames`.
    #[must_use]
    pub fn read(
        base: usize,
        shm_size: usize,
        partition: &ShmPartition,
        source_type: MediaSourceType,
        num_frames: u32,
    ) -> Option<FrameBatch> {
        let _ = source_type;
        let tag_offset = partition.metadata_offset as usize;
        if !fits(tag_offset, 4, shm_size) {
            return None;
        }
        let tag = read_u32(base, tag_offset);

        match ShmVersion::from_tag(tag)? {
            ShmVersion::V1 => Some(FrameBatch::V1(read_v1(base, shm_size, partition, num_frames))),
            ShmVersion::V2 => Some(FrameBatch::V2(read_v2(base, shm_size, partition, num_frames))),
        }
    }
}

/// `start + len` fits within `[0, total)` without overflowing.
fn fits(start: usize, len: usize, total: usize) -> bool {
    match start.checked_add(len) {
        Some(end) => end <= total,
        None => false,
    }
}

fn read_u32(base: usize, offset: usize) -> u32 {
    // Safety: caller has already verified `fits(offset, 4, shm_size)`.
    unsafe {
        let bytes = std::slice::from_raw_parts((base + offset) as *const u8, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

fn read_bytes(base: usize, offset: usize, len: usize) -> Vec<u8> {
    // Safety: caller has already verified `fits(offset, len, shm_size)`.
    unsafe { std::slice::from_raw_parts((base + offset) as *const u8, len).to_vec() }
}

/// §4.11: "V1 reads `num_frames` fixed structs from `metadata_offset`" —
/// here `metadata_offset` already means "past the 4-byte version prefix",
/// matching `DataReaderFactory::read`'s `metadataOffset = dataOffset + 4`.
fn read_v1(
    base: usize,
    shm_size: usize,
    partition: &ShmPartition,
    num_frames: u32,
) -> Vec<ReadFrameV1> {
    let structs_start = partition.metadata_offset as usize + 4;
    let metadata_region_end =
        partition.metadata_offset as usize + partition.max_metadata_bytes as usize;
    let mut frames = Vec::with_capacity(num_frames as usize);

    for i in 0..num_frames as usize {
        let struct_offset = structs_start + i * V1_FRAME_STRUCT_SIZE;
        if struct_offset + V1_FRAME_STRUCT_SIZE > metadata_region_end
            || !fits(struct_offset, V1_FRAME_STRUCT_SIZE, shm_size)
        {
            return Vec::new();
        }

        let meta: FrameMetadataV1 = {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (base + struct_offset) as *const u8,
                    V1_FRAME_STRUCT_SIZE,
                )
            };
            *bytemuck::from_bytes(bytes)
        };

        let payload_start = meta.payload_offset as usize;
        let payload_len = meta.payload_length as usize;
        if !fits(payload_start, payload_len, shm_size) {
            return Vec::new();
        }
        let payload = read_bytes(base, payload_start, payload_len);

        let key_id = if meta.key_id_length > 0 {
            let offset = meta.key_id_offset as usize;
            let len = meta.key_id_length as usize;
            if !fits(offset, len, shm_size) {
                return Vec::new();
            }
            Some(read_bytes(base, offset, len))
        } else {
            None
        };

        let init_vector = if meta.is_encrypted() {
            let offset = meta.iv_offset as usize;
            if !fits(offset, rialto_common::shm_layout::V1_IV_LENGTH, shm_size) {
                return Vec::new();
            }
            Some(read_bytes(
                base,
                offset,
                rialto_common::shm_layout::V1_IV_LENGTH,
            ))
        } else {
            None
        };

        let sub_samples = if meta.subsample_table_count > 0 {
            const ENTRY_SIZE: usize = 8; // two u32: clear bytes, encrypted bytes
            let table_offset = meta.subsample_table_offset as usize;
            let table_len = meta.subsample_table_count as usize * ENTRY_SIZE;
            if !fits(table_offset, table_len, shm_size) {
                return Vec::new();
            }
            (0..meta.subsample_table_count as usize)
                .map(|j| SubSample {
                    num_clear_bytes: read_u32(base, table_offset + j * ENTRY_SIZE),
                    num_encrypted_bytes: read_u32(base, table_offset + j * ENTRY_SIZE + 4),
                })
                .collect()
        } else {
            Vec::new()
        };

        frames.push(ReadFrameV1 {
            metadata: meta,
            payload,
            key_id,
            init_vector,
            sub_samples,
        });
    }

    frames
}

/// §4.11: "V2 iterates frames at `data_offset = metadata_region_base +
/// max_metadata_bytes`: parse `meta_len`, advance, parse metadata, advance,
/// treat the next `length` bytes as payload, advance."
fn read_v2(
    base: usize,
    shm_size: usize,
    partition: &ShmPartition,
    num_frames: u32,
) -> Vec<ReadFrameV2> {
    let mut cursor = partition.metadata_offset as usize + partition.max_metadata_bytes as usize;
    let mut frames = Vec::with_capacity(num_frames as usize);

    for _ in 0..num_frames {
        if !fits(cursor, 4, shm_size) {
            return Vec::new();
        }
        let meta_len = read_u32(base, cursor) as usize;
        cursor += 4;

        if !fits(cursor, meta_len, shm_size) {
            return Vec::new();
        }
        let meta_bytes =
            unsafe { std::slice::from_raw_parts((base + cursor) as *const u8, meta_len) };
        let meta: FrameMetadataV2 = match serde_json::from_slice(meta_bytes) {
            Ok(meta) => meta,
            Err(_) => return Vec::new(),
        };
        cursor += meta_len;

        let payload_len = meta.payload_length as usize;
        if !fits(cursor, payload_len, shm_size) {
            return Vec::new();
        }
        let payload = read_bytes(base, cursor, payload_len);
        cursor += payload_len;

        frames.push(ReadFrameV2 { metadata: meta, payload });
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use rialto_common::protocol::MediaSegment;
    use rialto_common::shm_layout::ShmVersion as Version;

    fn alloc_region(size: usize) -> usize {
        let mut buf = vec![0u8; size].into_boxed_slice();
        let ptr = buf.as_mut_ptr() as usize;
        std::mem::forget(buf);
        ptr
    }

    fn partition() -> ShmPartition {
        ShmPartition {
            metadata_offset: 0,
            max_metadata_bytes: 2500,
            media_offset: 2500,
            max_media_bytes: 200_000,
        }
    }

    #[test]
    fn unknown_version_tag_yields_none_regardless_of_num_frames() {
        let size = 2500 + 200_000;
        let base = alloc_region(size);
        unsafe {
            std::ptr::write((base) as *mut u32, 3u32.to_le());
        }
        assert!(DataReaderFactory::read(
            base,
            size,
            &partition(),
            MediaSourceType::Audio,
            24
        )
        .is_none());
    }

    #[test]
    fn round_trips_frames_written_by_frame_writer() {
        use rialto_client::frame_writer::FrameWriter;

        let size = 2500 + 200_000;
        let base = alloc_region(size);
        let mut writer = FrameWriter::new(Version::V1, base, partition()).unwrap();

        let segment = MediaSegment {
            source_id: 7,
            timestamp_ns: 1_000,
            duration_ns: 20_000_000,
            extra_data: None,
            segment_alignment: None,
            encryption: None,
            sample_rate: Some(48_000),
            number_of_channels: Some(2),
            width: None,
            height: None,
            payload: vec![1, 2, 3, 4, 5],
        };
        writer.write_frame(&segment).unwrap();

        let batch = DataReaderFactory::read(base, size, &partition(), MediaSourceType::Audio, 1)
            .unwrap();
        match batch {
            FrameBatch::V1(frames) => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].payload, vec![1, 2, 3, 4, 5]);
                assert_eq!(frames[0].metadata.timestamp_ns, 1_000);
                assert!(frames[0].key_id.is_none());
            }
            FrameBatch::V2(_) => panic!("expected V1 batch"),
        }
    }

    #[test]
    fn malformed_v1_struct_run_discards_the_whole_batch() {
        let size = 2500 + 200_000;
        let base = alloc_region(size);
        unsafe {
            std::ptr::write(base as *mut u32, 1u32.to_le());
        }
        // Ask for more frames than the metadata region can hold: 24 * 104 +
        // 4 == 2500 exactly, so requesting 25 overruns the region.
        let batch =
            DataReaderFactory::read(base, size, &partition(), MediaSourceType::Audio, 25)
                .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn v2_round_trips_through_frame_writer() {
        use rialto_client::frame_writer::FrameWriter;

        let size = 2500 + 200_000;
        let base = alloc_region(size);
        let mut writer = FrameWriter::new(Version::V2, base, partition()).unwrap();

        let segment = MediaSegment {
            source_id: 3,
            timestamp_ns: 500,
            duration_ns: 20_000_000,
            extra_data: Some(vec![9, 9]),
            segment_alignment: None,
            encryption: None,
            sample_rate: None,
            number_of_channels: None,
            width: Some(1920),
            height: Some(1080),
            payload: vec![0xAA; 10],
        };
        writer.write_frame(&segment).unwrap();

        let batch = DataReaderFactory::read(base, size, &partition(), MediaSourceType::Video, 1)
            .unwrap();
        match batch {
            FrameBatch::V2(frames) => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].payload, vec![0xAA; 10]);
                assert_eq!(frames[0].metadata.extra_data, Some(vec![9, 9]));
            }
            FrameBatch::V1(_) => panic!("expected V2 batch"),
        }
    }
}
