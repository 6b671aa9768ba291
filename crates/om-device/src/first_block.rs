//! First block: the 4 KiB header at offset 0 of every formatted pdev.
//!
//! Carries the system header (magic, generation, product, uuid) and the
//! per-pdev header (layout, attributes, DM chunk records). The checksum
//! covers everything after the checksum field itself.

use crate::chunk::{ChunkInfo, CHUNK_INFO_SIZE};
use om_types::{
    read_fixed, read_le_u32, read_le_u64, trim_nul_padded, write_le_u32, write_le_u64, ByteOffset,
    ChunkId, ParseError, PdevId, FIRST_BLOCK_SIZE, OMSTORE_MAGIC, PRODUCT_NAME, PRODUCT_NAME_SIZE,
    SUPERBLOCK_VERSION,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Field offsets within the first block.
const OFF_MAGIC: usize = 0;
const OFF_CHECKSUM: usize = 4;
const OFF_GEN_CNT: usize = 8;
const OFF_VERSION: usize = 16;
const OFF_PRODUCT: usize = 20;
const OFF_NUM_PDEVS: usize = 84;
const OFF_MAX_VDEVS: usize = 88;
const OFF_MAX_CHUNKS: usize = 92;
const OFF_SYSTEM_UUID: usize = 96;
const OFF_PDEV_ID: usize = 112;
const OFF_DATA_OFFSET: usize = 116;
const OFF_PDEV_SIZE: usize = 124;
const OFF_PHYS_PAGE: usize = 132;
const OFF_ALIGN: usize = 136;
const OFF_ATOMIC_PAGE: usize = 140;
const OFF_NUM_STREAMS: usize = 144;
const OFF_FIRST_CHUNK: usize = 148;
const OFF_CUR_INDX: usize = 152;
const OFF_DM_CHUNKS: usize = 156;
const FIRST_BLOCK_USED: usize = OFF_DM_CHUNKS + 2 * CHUNK_INFO_SIZE;

/// Device attributes the engine expects from every pdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveAttrs {
    /// Optimal I/O unit of the underlying drive.
    pub phys_page_size: u32,
    /// DMA alignment supported by drive and kernel.
    pub align_size: u32,
    /// Unit below which writes are atomic on the drive.
    pub atomic_phys_page_size: u32,
    pub num_streams: u32,
}

impl Default for DriveAttrs {
    fn default() -> Self {
        Self {
            phys_page_size: 4096,
            align_size: 512,
            atomic_phys_page_size: 4096,
            num_streams: 1,
        }
    }
}

impl DriveAttrs {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.phys_page_size.is_power_of_two()
            && self.align_size.is_power_of_two()
            && self.atomic_phys_page_size.is_power_of_two()
    }
}

/// Parsed first block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBlock {
    pub gen_cnt: u64,
    pub version: u32,
    pub product_name: String,
    pub num_pdevs: u32,
    pub max_vdevs: u32,
    pub max_chunks: u32,
    pub system_uuid: Uuid,
    pub pdev_id: PdevId,
    pub data_offset: ByteOffset,
    pub pdev_size: u64,
    pub attrs: DriveAttrs,
    pub first_chunk_id: ChunkId,
    /// Index of the last-published DM chunk slot.
    pub cur_indx: u32,
    pub dm_chunk: [ChunkInfo; 2],
}

impl FirstBlock {
    /// Whether this block was written by a compatible OmStore.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.product_name == PRODUCT_NAME && self.version == SUPERBLOCK_VERSION
    }

    /// Serialize into a 4 KiB image with the checksum stamped.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; FIRST_BLOCK_SIZE];
        write_le_u32(&mut buf, OFF_MAGIC, OMSTORE_MAGIC);
        write_le_u64(&mut buf, OFF_GEN_CNT, self.gen_cnt);
        write_le_u32(&mut buf, OFF_VERSION, self.version);
        let name = self.product_name.as_bytes();
        let n = name.len().min(PRODUCT_NAME_SIZE - 1);
        buf[OFF_PRODUCT..OFF_PRODUCT + n].copy_from_slice(&name[..n]);
        write_le_u32(&mut buf, OFF_NUM_PDEVS, self.num_pdevs);
        write_le_u32(&mut buf, OFF_MAX_VDEVS, self.max_vdevs);
        write_le_u32(&mut buf, OFF_MAX_CHUNKS, self.max_chunks);
        buf[OFF_SYSTEM_UUID..OFF_SYSTEM_UUID + 16].copy_from_slice(self.system_uuid.as_bytes());
        write_le_u32(&mut buf, OFF_PDEV_ID, self.pdev_id.0);
        write_le_u64(&mut buf, OFF_DATA_OFFSET, self.data_offset.0);
        write_le_u64(&mut buf, OFF_PDEV_SIZE, self.pdev_size);
        write_le_u32(&mut buf, OFF_PHYS_PAGE, self.attrs.phys_page_size);
        write_le_u32(&mut buf, OFF_ALIGN, self.attrs.align_size);
        write_le_u32(&mut buf, OFF_ATOMIC_PAGE, self.attrs.atomic_phys_page_size);
        write_le_u32(&mut buf, OFF_NUM_STREAMS, self.attrs.num_streams);
        write_le_u32(&mut buf, OFF_FIRST_CHUNK, self.first_chunk_id.0);
        write_le_u32(&mut buf, OFF_CUR_INDX, self.cur_indx);
        for (i, dm) in self.dm_chunk.iter().enumerate() {
            let at = OFF_DM_CHUNKS + i * CHUNK_INFO_SIZE;
            dm.encode_into(&mut buf[at..at + CHUNK_INFO_SIZE]);
        }
        let checksum = crc32c::crc32c(&buf[OFF_GEN_CNT..]);
        write_le_u32(&mut buf, OFF_CHECKSUM, checksum);
        buf
    }

    /// Parse a first block image, verifying magic and checksum.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, OFF_MAGIC)?;
        if magic != OMSTORE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(OMSTORE_MAGIC),
                actual: u64::from(magic),
            });
        }
        if data.len() < FIRST_BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: FIRST_BLOCK_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        let stored = read_le_u32(data, OFF_CHECKSUM)?;
        let actual = crc32c::crc32c(&data[OFF_GEN_CNT..FIRST_BLOCK_SIZE]);
        if stored != actual {
            return Err(ParseError::InvalidField {
                field: "checksum",
                reason: "first block checksum mismatch",
            });
        }

        let product = read_fixed::<PRODUCT_NAME_SIZE>(data, OFF_PRODUCT)?;
        let uuid_bytes = read_fixed::<16>(data, OFF_SYSTEM_UUID)?;
        Ok(Self {
            gen_cnt: read_le_u64(data, OFF_GEN_CNT)?,
            version: read_le_u32(data, OFF_VERSION)?,
            product_name: trim_nul_padded(&product),
            num_pdevs: read_le_u32(data, OFF_NUM_PDEVS)?,
            max_vdevs: read_le_u32(data, OFF_MAX_VDEVS)?,
            max_chunks: read_le_u32(data, OFF_MAX_CHUNKS)?,
            system_uuid: Uuid::from_bytes(uuid_bytes),
            pdev_id: PdevId(read_le_u32(data, OFF_PDEV_ID)?),
            data_offset: ByteOffset(read_le_u64(data, OFF_DATA_OFFSET)?),
            pdev_size: read_le_u64(data, OFF_PDEV_SIZE)?,
            attrs: DriveAttrs {
                phys_page_size: read_le_u32(data, OFF_PHYS_PAGE)?,
                align_size: read_le_u32(data, OFF_ALIGN)?,
                atomic_phys_page_size: read_le_u32(data, OFF_ATOMIC_PAGE)?,
                num_streams: read_le_u32(data, OFF_NUM_STREAMS)?,
            },
            first_chunk_id: ChunkId(read_le_u32(data, OFF_FIRST_CHUNK)?),
            cur_indx: read_le_u32(data, OFF_CUR_INDX)?,
            dm_chunk: [
                ChunkInfo::decode(data, OFF_DM_CHUNKS)?,
                ChunkInfo::decode(data, OFF_DM_CHUNKS + CHUNK_INFO_SIZE)?,
            ],
        })
    }
}

impl fmt::Display for FirstBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen={} version={} product={} uuid={} pdev={} data_offset={} size={} first_chunk={} cur_indx={}",
            self.gen_cnt,
            self.version,
            self.product_name,
            self.system_uuid,
            self.pdev_id,
            self.data_offset,
            self.pdev_size,
            self.first_chunk_id.0,
            self.cur_indx,
        )
    }
}

const _: () = assert!(FIRST_BLOCK_USED <= FIRST_BLOCK_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use om_types::VdevId;

    fn sample() -> FirstBlock {
        let mut dm0 = ChunkInfo::new(ChunkId(1), PdevId(0), ByteOffset(1 << 24), 8192);
        dm0.is_sb_chunk = true;
        let mut dm1 = ChunkInfo::new(ChunkId(2), PdevId(0), ByteOffset((1 << 24) + 8192), 8192);
        dm1.is_sb_chunk = true;
        FirstBlock {
            gen_cnt: 5,
            version: SUPERBLOCK_VERSION,
            product_name: PRODUCT_NAME.to_owned(),
            num_pdevs: 1,
            max_vdevs: 1024,
            max_chunks: 256,
            system_uuid: Uuid::from_u128(0x1234_5678_90AB_CDEF_1234_5678_90AB_CDEF),
            pdev_id: PdevId(0),
            data_offset: ByteOffset(1 << 24),
            pdev_size: 1 << 30,
            attrs: DriveAttrs::default(),
            first_chunk_id: ChunkId(0),
            cur_indx: 1,
            dm_chunk: [dm0, dm1],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let fb = sample();
        let img = fb.encode();
        assert_eq!(img.len(), FIRST_BLOCK_SIZE);
        let back = FirstBlock::decode(&img).expect("decode");
        assert_eq!(fb, back);
        assert!(back.is_valid());
    }

    #[test]
    fn bad_magic_rejected() {
        let fb = sample();
        let mut img = fb.encode();
        img[0] ^= 0xFF;
        assert!(matches!(
            FirstBlock::decode(&img),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn torn_write_fails_checksum() {
        let fb = sample();
        let mut img = fb.encode();
        img[200] ^= 0x01;
        assert!(FirstBlock::decode(&img).is_err());
    }

    #[test]
    fn foreign_product_is_invalid() {
        let mut fb = sample();
        fb.product_name = "SomethingElse".to_owned();
        let back = FirstBlock::decode(&fb.encode()).expect("decode");
        assert!(!back.is_valid());
    }

    #[test]
    fn dm_chunks_survive_round_trip() {
        let fb = sample();
        let back = FirstBlock::decode(&fb.encode()).expect("decode");
        assert!(back.dm_chunk[0].is_sb_chunk);
        assert_eq!(back.dm_chunk[1].vdev_id, VdevId::INVALID);
        assert_eq!(back.dm_chunk[0].size, 8192);
    }
}
