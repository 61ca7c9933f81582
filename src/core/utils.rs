use std::ops::Range;

use super::header::MAX_STREAM_BYTES;

const SIZE_CLASS_BASE: u32 = 16;
const MAX_SIZE_CLASS: u8 = 15;

/// Smallest class `c` in `0..=15` with `size <= 2^(c + 16)`
pub(crate) fn size_class(size: usize) -> u8 {
    (0..=MAX_SIZE_CLASS)
        .find(|class| size <= class_capacity(*class))
        .unwrap_or(MAX_SIZE_CLASS)
}

/// Upper bound on the size of a stream of the given class
pub(crate) fn class_capacity(class: u8) -> usize {
    (1usize << (u32::from(class.min(MAX_SIZE_CLASS)) + SIZE_CLASS_BASE)).min(MAX_STREAM_BYTES)
}

/// Packs the genotype class and the larger of the position and allele classes
pub(crate) fn size_class_marker(genotype_bytes: usize, position_bytes: usize, allele_bytes: usize) -> u8 {
    (size_class(genotype_bytes) << 4) | size_class(position_bytes.max(allele_bytes))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    offset: u64,
    length: u64,
}
impl Span {
    #[must_use]
    pub fn new(offset: u64, length: u64) -> Self {
        Span { offset, length }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.length) as usize
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}
