//! `FrameWriter` (C5 writer half, §4.5): encodes a [`MediaSegment`] into a
//! shm partition as either a V1 fixed struct or a V2 self-describing record.
//!
//! Created lazily by `MediaPipelineSession::add_segment` on the first
//! segment of a `NeedDataRequest`, using that request's `ShmPartition`.

use std::ptr;

use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::shm_layout::{
    FrameMetadataV1, FrameMetadataV2, ShmPartition, ShmVersion, V1_MAX_INLINE_EXTRA_DATA,
};
use rialto_common::protocol::MediaSegment;

/// Outcome of one [`FrameWriter::write_frame`] call (§4.5: "`writeFrame`
/// returns `OK | NO_SPACE | ERROR`" — `ERROR` is the `Err` side of the
/// `RialtoResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,
    NoSpace,
}

/// Writes successive [`MediaSegment`]s into one [`ShmPartition`], tracking
/// how many frames were successfully written (`numFrames()`, §4.5).
pub struct FrameWriter {
    version: ShmVersion,
    base: usize,
    partition: ShmPartition,
    frames_written: u32,
    /// V1: byte offset from `partition.media_offset` for the next payload.
    /// V2: byte offset from `partition.metadata_offset + partition.max_metadata_bytes`
    /// for the next `meta_len | meta | payload` record.
    cursor: u32,
}

impl FrameWriter {
    /// Creates a writer for `partition` using `version`, writing the 4-byte
    /// version prefix into the metadata subregion immediately.
    pub fn new(version: ShmVersion, base: usize, partition: ShmPartition) -> RialtoResult<Self> {
        if !partition.is_valid() {
            return Err(RialtoError::Resource(
                "shm partition is smaller than the minimum metadata region".into(),
            ));
        }
        let writer = Self {
            version,
            base,
            partition,
            frames_written: 0,
            cursor: 0,
        };
        writer.write_version_prefix();
        Ok(writer)
    }

    fn write_version_prefix(&self) {
        let tag = self.version.tag().to_le_bytes();
        // Safety: `partition.is_valid()` guarantees at least 4 bytes of
        // metadata region, and `base` is the caller-mapped shm region.
        unsafe {
            let ptr = (self.base + self.partition.metadata_offset as usize) as *mut u8;
            ptr::copy_nonoverlapping(tag.as_ptr(), ptr, 4);
        }
    }

    #[must_use]
    pub fn num_frames(&self) -> u32 {
        self.frames_written
    }

    pub fn write_frame(&mut self, segment: &MediaSegment) -> RialtoResult<WriteStatus> {
        match self.version {
            ShmVersion::V1 => self.write_v1(segment),
            ShmVersion::V2 => self.write_v2(segment),
        }
    }

    fn write_v1(&mut self, segment: &MediaSegment) -> RialtoResult<WriteStatus> {
        use rialto_common::shm_layout::V1_FRAME_STRUCT_SIZE;

        if self.frames_written as usize >= rialto_common::shm_layout::MAX_FRAMES_PER_NEED_DATA {
            return Ok(WriteStatus::NoSpace);
        }

        let payload_len = segment.payload.len() as u32;
        if self.cursor + payload_len > self.partition.max_media_bytes {
            return Ok(WriteStatus::NoSpace);
        }
        let struct_offset =
            4 + self.frames_written as usize * V1_FRAME_STRUCT_SIZE;
        if struct_offset + V1_FRAME_STRUCT_SIZE > self.partition.max_metadata_bytes as usize {
            return Ok(WriteStatus::NoSpace);
        }

        let mut extra_data = [0u8; V1_MAX_INLINE_EXTRA_DATA];
        let extra_data_len = match &segment.extra_data {
            Some(bytes) if bytes.len() > V1_MAX_INLINE_EXTRA_DATA => {
                return Err(RialtoError::Protocol(format!(
                    "V1 extra data of {} bytes exceeds the {V1_MAX_INLINE_EXTRA_DATA}-byte inline limit",
                    bytes.len()
                )))
            }
            Some(bytes) => {
                extra_data[..bytes.len()].copy_from_slice(bytes);
                bytes.len() as u32
            }
            None => 0,
        };

        // Relative to the shm region base, not an absolute pointer: client and
        // server map the same fd at independent addresses, so only an offset
        // is portable between them (§3.1 FrameMetadata V1 "offset of payload in shm").
        let payload_offset = self.partition.media_offset as u64 + self.cursor as u64;
        let meta = FrameMetadataV1 {
            payload_offset,
            timestamp_ns: segment.timestamp_ns,
            duration_ns: segment.duration_ns,
            payload_length: payload_len,
            stream_id: segment.source_id,
            extra_data_len,
            // V1 is clear-only: a segment's encryption info, if any, is not
            // represented in this wire version (§4.5).
            key_session_id: 0,
            key_id_offset: 0,
            key_id_length: 0,
            iv_offset: 0,
            subsample_table_offset: 0,
            subsample_table_count: 0,
            init_with_last_15: 0,
            extra_1: segment.sample_rate.or(segment.width).unwrap_or(0),
            extra_2: segment.number_of_channels.or(segment.height).unwrap_or(0),
            extra_data,
        };

        unsafe {
            let struct_ptr =
                (self.base + self.partition.metadata_offset as usize + struct_offset) as *mut u8;
            ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&meta).as_ptr(),
                struct_ptr,
                V1_FRAME_STRUCT_SIZE,
            );
            let payload_ptr = (self.base
                + self.partition.media_offset as usize
                + self.cursor as usize) as *mut u8;
            ptr::copy_nonoverlapping(segment.payload.as_ptr(), payload_ptr, segment.payload.len());
        }

        self.cursor += payload_len;
        self.frames_written += 1;
        Ok(WriteStatus::Ok)
    }

    fn write_v2(&mut self, segment: &MediaSegment) -> RialtoResult<WriteStatus> {
        let encryption = segment.encryption.as_ref();
        let meta = FrameMetadataV2 {
            timestamp_ns: segment.timestamp_ns,
            duration_ns: segment.duration_ns,
            payload_length: segment.payload.len() as u32,
            extra_data: segment.extra_data.clone(),
            codec_data: None,
            segment_alignment: segment.segment_alignment,
            key_session_id: encryption.map(|e| e.key_session_id),
            key_id: encryption
                .map(|e| e.key_id.clone())
                .filter(|v| !v.is_empty()),
            init_vector: encryption
                .map(|e| e.init_vector.clone())
                .filter(|v| !v.is_empty()),
            init_with_last_15: encryption.map(|e| e.init_with_last_15),
            sub_samples: encryption
                .map(|e| e.sub_samples.clone())
                .filter(|v| !v.is_empty()),
            cipher_mode: encryption.and_then(|e| e.cipher_mode),
            crypt_byte_block: encryption.and_then(|e| e.crypt_byte_block),
            skip_byte_block: encryption.and_then(|e| e.skip_byte_block),
        };

        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| RialtoError::Protocol(format!("failed to encode V2 metadata: {e}")))?;
        let meta_len = encoded.len() as u32;
        let total = 4 + meta_len as usize + segment.payload.len();

        if self.cursor as usize + total > self.partition.max_media_bytes as usize {
            return Ok(WriteStatus::NoSpace);
        }

        let data_base =
            self.base + self.partition.metadata_offset as usize + self.partition.max_metadata_bytes as usize;
        unsafe {
            let mut write_ptr = (data_base + self.cursor as usize) as *mut u8;
            ptr::copy_nonoverlapping(meta_len.to_le_bytes().as_ptr(), write_ptr, 4);
            write_ptr = write_ptr.add(4);
            ptr::copy_nonoverlapping(encoded.as_ptr(), write_ptr, encoded.len());
            write_ptr = write_ptr.add(encoded.len());
            ptr::copy_nonoverlapping(segment.payload.as_ptr(), write_ptr, segment.payload.len());
        }

        self.cursor += total as u32;
        self.frames_written += 1;
        Ok(WriteStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rialto_common::protocol::SegmentAlignment;

    fn alloc_region(size: usize) -> usize {
        let mut buf = vec![0u8; size].into_boxed_slice();
        let ptr = buf.as_mut_ptr() as usize;
        std::mem::forget(buf); // leak for the test's lifetime
        ptr
    }

    fn segment(source_id: i32, ts: i64, payload: Vec<u8>) -> MediaSegment {
        MediaSegment {
            source_id,
            timestamp_ns: ts,
            duration_ns: 20_000_000,
            extra_data: None,
            segment_alignment: Some(SegmentAlignment::Au),
            encryption: None,
            sample_rate: Some(48_000),
            number_of_channels: Some(2),
            width: None,
            height: None,
            payload,
        }
    }

    #[test]
    fn v1_writes_three_frames_and_tracks_count() {
        let base = alloc_region(2500 + 200_000);
        let partition = ShmPartition {
            metadata_offset: 0,
            max_metadata_bytes: 2500,
            media_offset: 2500,
            max_media_bytes: 200_000,
        };
        let mut writer = FrameWriter::new(ShmVersion::V1, base, partition).unwrap();

        for (i, len) in [100usize, 150, 80].into_iter().enumerate() {
            let status = writer
                .write_frame(&segment(1, i as i64 * 20_000_000, vec![0xAB; len]))
                .unwrap();
            assert_eq!(status, WriteStatus::Ok);
        }
        assert_eq!(writer.num_frames(), 3);

        let version_tag = unsafe { ptr::read((base) as *const u32) };
        assert_eq!(version_tag, 1);
    }

    #[test]
    fn v1_rejects_extra_data_over_32_bytes() {
        let base = alloc_region(2500 + 200_000);
        let partition = ShmPartition {
            metadata_offset: 0,
            max_metadata_bytes: 2500,
            media_offset: 2500,
            max_media_bytes: 200_000,
        };
        let mut writer = FrameWriter::new(ShmVersion::V1, base, partition).unwrap();
        let mut seg = segment(1, 0, vec![1, 2, 3]);
        seg.extra_data = Some(vec![0u8; 33]);

        let err = writer.write_frame(&seg).unwrap_err();
        assert!(matches!(err, RialtoError::Protocol(_)));
    }

    #[test]
    fn v1_reports_no_space_when_media_region_is_exhausted() {
        let base = alloc_region(2500 + 100);
        let partition = ShmPartition {
            metadata_offset: 0,
            max_metadata_bytes: 2500,
            media_offset: 2500,
            max_media_bytes: 100,
        };
        let mut writer = FrameWriter::new(ShmVersion::V1, base, partition).unwrap();
        assert_eq!(
            writer.write_frame(&segment(1, 0, vec![0u8; 80])).unwrap(),
            WriteStatus::Ok
        );
        assert_eq!(
            writer.write_frame(&segment(1, 1, vec![0u8; 50])).unwrap(),
            WriteStatus::NoSpace
        );
    }

    #[test]
    fn v2_round_trips_optional_encryption_fields_through_the_wire_bytes() {
        let base = alloc_region(2500 + 200_000);
        let partition = ShmPartition {
            metadata_offset: 0,
            max_metadata_bytes: 2500,
            media_offset: 2500,
            max_media_bytes: 200_000,
        };
        let mut writer = FrameWriter::new(ShmVersion::V2, base, partition).unwrap();

        let mut seg = segment(2, 0, vec![9, 9, 9]);
        seg.encryption = Some(rialto_common::protocol::EncryptionInfo {
            key_session_id: 5,
            key_id: vec![1, 2, 3, 4],
            init_vector: vec![0u8; 16],
            init_with_last_15: true,
            sub_samples: vec![],
            cipher_mode: Some(rialto_common::protocol::CipherMode::Cenc),
            crypt_byte_block: None,
            skip_byte_block: None,
        });

        assert_eq!(writer.write_frame(&seg).unwrap(), WriteStatus::Ok);
        assert_eq!(writer.num_frames(), 1);

        let data_base = base + 0 + 2500;
        let meta_len = unsafe { ptr::read(data_base as *const u32) };
        let meta_bytes =
            unsafe { std::slice::from_raw_parts((data_base + 4) as *const u8, meta_len as usize) };
        let decoded: FrameMetadataV2 = serde_json::from_slice(meta_bytes).unwrap();
        assert!(decoded.is_encrypted());
        assert_eq!(decoded.key_session_id, Some(5));
    }
}
