use bytemuck::{Pod, Zeroable};

use crate::{
    compress::CompressorKind,
    error::{FormatError, WriteError},
    Result, MAX_BLOCK_SIZE_TYPE, MAX_COMPRESSION_LEVEL,
};

/// Genotypes are phased
pub const FLAG_PHASED: u8 = 1 << 7;

/// Nodes are position-ascending and non-overlapping per chromosome
pub const FLAG_ORDERED: u8 = 1 << 6;

/// The writer completed the file
pub const FLAG_FINISHED: u8 = 1 << 7;

const BLOCK_SIZE_SHIFT: u8 = 3;
const BLOCK_SIZE_MASK: u8 = 0b0011_1000;
const COMPRESSOR_MASK: u8 = 0b0000_0111;
const LEVEL_MASK: u8 = 0b0001_1111;
const RESERVED_MASK: u8 = 0b0110_0000;

/// Largest size of a single uncompressed stream in bytes
pub const MAX_STREAM_BYTES: usize = (1 << 31) - 2;

/// Largest subject count of any block size
pub const MAX_SUBJECTS: usize = (1 << 24) - 1;

/// The fixed-size leading bytes of a GTB file
///
/// ```text
/// byte 0: [7] phased  [6] ordered  [5..3] block size type  [2..0] compressor id
/// byte 1: [7] finished  [6..5] reserved  [4..0] compression level
/// byte 2..5: node count (24-bit little-endian)
/// ```
///
/// This is stored identically in memory and on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct FileHeader {
    flags: [u8; 2],
    node_count: [u8; 3],
}
impl Default for FileHeader {
    fn default() -> Self {
        let mut header = Self::zeroed();
        header.set_block_size_type(MAX_BLOCK_SIZE_TYPE);
        header
    }
}

/// Flag getters and setters
impl FileHeader {
    #[must_use]
    pub fn new(
        phased: bool,
        block_size_type: u8,
        compressor: CompressorKind,
        compression_level: u8,
    ) -> Self {
        let mut header = Self::zeroed();
        header.set_phased(phased);
        header.set_block_size_type(block_size_type);
        header.flags[0] |= compressor.id() & COMPRESSOR_MASK;
        header.flags[1] |= compression_level & LEVEL_MASK;
        header
    }

    pub fn set_phased(&mut self, phased: bool) {
        if phased {
            self.flags[0] |= FLAG_PHASED;
        } else {
            self.flags[0] &= !FLAG_PHASED;
        }
    }
    pub fn set_ordered(&mut self, ordered: bool) {
        if ordered {
            self.flags[0] |= FLAG_ORDERED;
        } else {
            self.flags[0] &= !FLAG_ORDERED;
        }
    }
    pub fn set_finished(&mut self, finished: bool) {
        if finished {
            self.flags[1] |= FLAG_FINISHED;
        } else {
            self.flags[1] &= !FLAG_FINISHED;
        }
    }
    pub fn set_block_size_type(&mut self, block_size_type: u8) {
        self.flags[0] = (self.flags[0] & !BLOCK_SIZE_MASK)
            | ((block_size_type.min(MAX_BLOCK_SIZE_TYPE) << BLOCK_SIZE_SHIFT) & BLOCK_SIZE_MASK);
    }
    pub fn set_node_count(&mut self, count: u32) {
        let bytes = count.to_le_bytes();
        self.node_count.copy_from_slice(&bytes[..3]);
    }

    #[must_use]
    pub fn is_phased(&self) -> bool {
        self.flags[0] & FLAG_PHASED != 0
    }
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.flags[0] & FLAG_ORDERED != 0
    }
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.flags[1] & FLAG_FINISHED != 0
    }
    #[must_use]
    pub fn block_size_type(&self) -> u8 {
        (self.flags[0] & BLOCK_SIZE_MASK) >> BLOCK_SIZE_SHIFT
    }
    #[must_use]
    pub fn block_size(&self) -> usize {
        block_size_of(self.block_size_type())
    }
    #[must_use]
    pub fn compression_level(&self) -> u8 {
        self.flags[1] & LEVEL_MASK
    }
    pub fn compressor(&self) -> Result<CompressorKind> {
        CompressorKind::from_id(self.flags[0] & COMPRESSOR_MASK)
    }
    #[must_use]
    pub fn node_count(&self) -> u32 {
        u32::from_le_bytes([self.node_count[0], self.node_count[1], self.node_count[2], 0])
    }
}

impl FileHeader {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < size_of::<Self>() {
            return Err(FormatError::Truncated {
                section: "file header",
                needed: size_of::<Self>(),
                found: bytes.len(),
            }
            .into());
        }
        let header: Self = bytemuck::pod_read_unaligned(&bytes[..size_of::<Self>()]);
        if header.flags[1] & RESERVED_MASK != 0 {
            return Err(FormatError::InvalidReservedBits(u16::from_le_bytes(header.flags)).into());
        }
        header.compressor()?;
        Ok(header)
    }
}

/// Number of records per node for a block size type (`2^(7 + t)`)
#[must_use]
pub fn block_size_of(block_size_type: u8) -> usize {
    1 << (7 + usize::from(block_size_type.min(MAX_BLOCK_SIZE_TYPE)))
}

/// Largest subject count supported by a block size type
#[must_use]
pub fn max_subjects_of(block_size_type: u8) -> usize {
    MAX_SUBJECTS.min(MAX_STREAM_BYTES / block_size_of(block_size_type))
}

/// Lowers a requested block size type until `num_subjects` fits
pub fn fit_block_size_type(requested: u8, num_subjects: usize) -> Result<u8> {
    let mut block_size_type = requested.min(MAX_BLOCK_SIZE_TYPE);
    loop {
        if num_subjects <= max_subjects_of(block_size_type) {
            return Ok(block_size_type);
        }
        if block_size_type == 0 {
            return Err(WriteError::TooManySubjects {
                subjects: num_subjects,
                max: max_subjects_of(0),
                block_size: block_size_of(0),
            }
            .into());
        }
        block_size_type -= 1;
    }
}

/// Smallest block size type whose size covers `limit` records
#[must_use]
pub fn covering_block_size_type(limit: usize) -> u8 {
    (0..=MAX_BLOCK_SIZE_TYPE)
        .find(|t| block_size_of(*t) >= limit)
        .unwrap_or(MAX_BLOCK_SIZE_TYPE)
}

/// Checks a compression level against the header field width
pub fn validate_compression_level(level: u8) -> Result<()> {
    if level > MAX_COMPRESSION_LEVEL {
        Err(WriteError::InvalidCompressionLevel(level).into())
    } else {
        Ok(())
    }
}
