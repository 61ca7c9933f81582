//! # Block encoder
//!
//! Turns a batch of variants of one chromosome into a node: three independently
//! compressed streams and the [`Node`] that locates them.
//!
//! ```text
//! genotype: [biallelic rows, MBEG packed][multiallelic rows, raw BEG]
//! position: [u32 LE] * rows
//! allele:   [REF '\t' ALT '/'] * rows
//! ```
//!
//! All three streams share one row order: biallelic rows first, then
//! multiallelic rows. With reordering enabled the rows of each partition are
//! sorted by a coarse per-window histogram of alternate allele counts so that
//! similar rows land next to each other. Decoding never depends on that order.

use std::{cmp::Ordering, io::Write};

use log::debug;

use crate::{
    codec::{self, GenotypeCodec, MAX_ALLELE_INDEX},
    compress::Compressor,
    core::{size_class_marker, Node, MAX_POSITION_STREAM, MAX_STREAM_BYTES},
    error::EncodingError,
    variant::Variant,
    Result, DEFAULT_WINDOW,
};

/// The compressed output of one block
#[derive(Debug, Clone, Default)]
pub struct EncodedBlock {
    /// Descriptor of the block, with offset and source left at zero
    pub node: Option<Node>,
    pub genotype: Vec<u8>,
    pub position: Vec<u8>,
    pub allele: Vec<u8>,
}
impl EncodedBlock {
    /// Total number of compressed bytes
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.genotype.len() + self.position.len() + self.allele.len()
    }

    /// Writes the three streams in payload order
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.genotype)?;
        writer.write_all(&self.position)?;
        writer.write_all(&self.allele)?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.node = None;
        self.genotype.clear();
        self.position.clear();
        self.allele.clear();
    }
}

/// Compression context for one worker
pub struct BlockEncoder {
    codec: GenotypeCodec,
    num_subjects: usize,
    reorder: bool,
    window: usize,
    compressor: Box<dyn Compressor>,

    /// Flat working buffer of BEG codes, one row of `num_subjects` per variant
    codes: Vec<u8>,
    /// Row order of the output streams
    order: Vec<usize>,
    /// Flat feature vectors, `window` entries per row
    features: Vec<u64>,

    genotype_buf: Vec<u8>,
    position_buf: Vec<u8>,
    allele_buf: Vec<u8>,
}
impl BlockEncoder {
    #[must_use]
    pub fn new(num_subjects: usize, phased: bool, compressor: Box<dyn Compressor>) -> Self {
        Self {
            codec: GenotypeCodec::new(phased),
            num_subjects,
            reorder: false,
            window: DEFAULT_WINDOW,
            compressor,
            codes: Vec::new(),
            order: Vec::new(),
            features: Vec::new(),
            genotype_buf: Vec::new(),
            position_buf: Vec::new(),
            allele_buf: Vec::new(),
        }
    }

    /// Enables the row-reordering heuristic with the given number of windows
    #[must_use]
    pub fn with_reorder(mut self, reorder: bool, window: usize) -> Self {
        self.reorder = reorder;
        self.window = window.max(1);
        self
    }

    #[must_use]
    pub fn codec(&self) -> GenotypeCodec {
        self.codec
    }

    #[must_use]
    pub fn num_subjects(&self) -> usize {
        self.num_subjects
    }

    /// Encodes a batch of variants of one chromosome into `block`
    pub fn encode(&mut self, variants: &[Variant], block: &mut EncodedBlock) -> Result<()> {
        block.clear();
        let Some(first) = variants.first() else {
            return Err(EncodingError::EmptyBlock.into());
        };
        if variants.len() > usize::from(u16::MAX) {
            return Err(EncodingError::StreamTooLarge {
                stream: "row",
                size: variants.len(),
            }
            .into());
        }

        self.load_codes(variants)?;
        self.order_rows(variants);
        let biallelic = self.order.partition_point(|row| variants[*row].is_biallelic());

        self.fill_genotypes(variants, biallelic)?;
        self.fill_positions(variants);
        self.fill_alleles(variants)?;

        self.compressor.compress(&self.genotype_buf, &mut block.genotype)?;
        self.compressor.compress(&self.position_buf, &mut block.position)?;
        self.compressor.compress(&self.allele_buf, &mut block.allele)?;

        let genotype_size = fit_u32("genotype", block.genotype.len(), u32::MAX)?;
        let position_size = fit_u32("position", block.position.len(), MAX_POSITION_STREAM)?;
        let allele_size = fit_u32("allele", block.allele.len(), u32::MAX)?;

        let (min_pos, max_pos) = variants
            .iter()
            .fold((u32::MAX, u32::MIN), |(lo, hi), v| (lo.min(v.position), hi.max(v.position)));

        let node = Node {
            chromosome: first.chromosome,
            min_pos,
            max_pos,
            biallelic: biallelic as u16,
            multiallelic: (variants.len() - biallelic) as u16,
            genotype_size,
            position_size,
            allele_size,
            size_class: size_class_marker(
                self.genotype_buf.len(),
                self.position_buf.len(),
                self.allele_buf.len(),
            ),
            offset: 0,
            source: 0,
        };
        debug!(
            "Encoded node on chromosome {} [{}, {}]: {} biallelic, {} multiallelic, {} bytes",
            node.chromosome,
            node.min_pos,
            node.max_pos,
            node.biallelic,
            node.multiallelic,
            block.payload_len()
        );
        block.node = Some(node);
        Ok(())
    }

    /// Validates every variant and copies its codes into the working buffer
    fn load_codes(&mut self, variants: &[Variant]) -> Result<()> {
        let chromosome = variants[0].chromosome;
        self.codes.clear();
        self.codes.reserve(variants.len() * self.num_subjects);
        for variant in variants {
            if variant.chromosome != chromosome {
                return Err(EncodingError::MixedChromosomes {
                    expected: chromosome,
                    found: variant.chromosome,
                }
                .into());
            }
            if variant.begs.len() != self.num_subjects {
                return Err(EncodingError::SubjectCountMismatch {
                    position: variant.position,
                    found: variant.begs.len(),
                    expected: self.num_subjects,
                }
                .into());
            }
            variant.validate_alleles()?;
            let alleles = variant.allele_count();
            if alleles > usize::from(MAX_ALLELE_INDEX) + 1 {
                return Err(EncodingError::TooManyAlleles {
                    position: variant.position,
                    alleles,
                }
                .into());
            }
            let biallelic = alleles <= 2;
            for &beg in &variant.begs {
                let beg = if self.codec.is_phased() {
                    beg
                } else {
                    codec::to_unphased(beg)
                };
                self.codec.validate(beg, biallelic)?;
                variant.check_allele_range(beg, alleles)?;
                self.codes.push(beg);
            }
        }
        Ok(())
    }

    fn row(&self, index: usize) -> &[u8] {
        &self.codes[index * self.num_subjects..(index + 1) * self.num_subjects]
    }

    /// Biallelic rows first; within each partition optionally sorted by feature
    fn order_rows(&mut self, variants: &[Variant]) {
        self.order.clear();
        self.order.extend(0..variants.len());
        if !self.reorder {
            self.order
                .sort_by_key(|row| !variants[*row].is_biallelic());
            return;
        }

        let window = self.window;
        self.features.clear();
        self.features.resize(variants.len() * window, 0);
        let n = self.num_subjects;
        for (index, (variant, feature)) in variants
            .iter()
            .zip(self.features.chunks_exact_mut(window))
            .enumerate()
        {
            fill_feature(&self.codes[index * n..(index + 1) * n], variant.ploidy, feature);
        }

        let features = &self.features;
        let feature = |row: usize| &features[row * window..(row + 1) * window];
        self.order.sort_by(|&a, &b| {
            let (a_bi, b_bi) = (variants[a].is_biallelic(), variants[b].is_biallelic());
            match (a_bi, b_bi) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (true, true) => feature(b).cmp(feature(a)),
                (false, false) => feature(a).cmp(feature(b)),
            }
        });
    }

    fn fill_genotypes(&mut self, variants: &[Variant], biallelic: usize) -> Result<()> {
        let packed_len = self.codec.packed_row_len(self.num_subjects);
        let total = biallelic * packed_len + (variants.len() - biallelic) * self.num_subjects;
        if total > MAX_STREAM_BYTES {
            return Err(EncodingError::StreamTooLarge {
                stream: "genotype",
                size: total,
            }
            .into());
        }

        let mut buf = std::mem::take(&mut self.genotype_buf);
        buf.clear();
        buf.reserve(total);
        for (rank, &row) in self.order.iter().enumerate() {
            if rank < biallelic {
                self.codec.pack_row(self.row(row), &mut buf)?;
            } else {
                buf.extend_from_slice(self.row(row));
            }
        }
        self.genotype_buf = buf;
        Ok(())
    }

    fn fill_positions(&mut self, variants: &[Variant]) {
        self.position_buf.clear();
        for &row in &self.order {
            self.position_buf
                .extend_from_slice(&variants[row].position.to_le_bytes());
        }
    }

    fn fill_alleles(&mut self, variants: &[Variant]) -> Result<()> {
        self.allele_buf.clear();
        for &row in &self.order {
            let variant = &variants[row];
            reserve_stream(&mut self.allele_buf, variant.allele_entry_len(), MAX_STREAM_BYTES)?;
            variant.write_alleles(&mut self.allele_buf);
        }
        Ok(())
    }
}

/// Feature vector of one row
///
/// The row is split into `feature.len()` windows of `ceil(n / windows)` samples.
/// Each entry sums the alternate allele counts of its window, weighted by the
/// distance of each sample to the window's upper bound.
pub fn fill_feature(row: &[u8], ploidy: u8, feature: &mut [u64]) {
    feature.fill(0);
    if feature.is_empty() || row.is_empty() {
        return;
    }
    let length = row.len().div_ceil(feature.len());
    for (entry, chunk) in feature.iter_mut().zip(row.chunks(length)) {
        let upper = chunk.len() as u64;
        *entry = chunk
            .iter()
            .enumerate()
            .map(|(j, beg)| u64::from(codec::alt_allele_count(ploidy, *beg)) * (upper - j as u64))
            .sum();
    }
}

/// Grows a stream buffer geometrically, never past `limit`
pub(crate) fn reserve_stream(buf: &mut Vec<u8>, additional: usize, limit: usize) -> Result<()> {
    let requested = buf.len().saturating_add(additional);
    if requested > limit {
        return Err(EncodingError::AlleleStreamOverflow { requested, limit }.into());
    }
    if requested > buf.capacity() {
        let target = requested.saturating_mul(2).min(limit);
        buf.reserve_exact(target - buf.len());
    }
    Ok(())
}

fn fit_u32(stream: &'static str, size: usize, limit: u32) -> Result<u32> {
    match u32::try_from(size) {
        Ok(value) if value <= limit => Ok(value),
        _ => Err(EncodingError::StreamTooLarge { stream, size }.into()),
    }
}
