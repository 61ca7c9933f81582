//! # Genotype codec
//!
//! Every sample's call at a variant is stored as a single BEG byte (byte-encoded
//! genotype). A pair of haplotype allele indices `(i, j)` maps to
//!
//! ```text
//! f(i, j) = j*j + i + 1        if i <= j
//! f(i, j) = i*i + i + j + 2    if i >  j
//! ```
//!
//! with `0` reserved for a missing call. Allele indices run from 0 (REF) to 14,
//! so there are 226 codes in total. For a biallelic site the phased alphabet is
//! `{0: ./., 1: 0|0, 2: 0|1, 3: 1|1, 4: 1|0}` and the unphased alphabet drops the
//! `1|0` code by canonicalising `(i, j)` with `i > j` to `(j, i)`.
//!
//! Biallelic rows are further packed into MBEG bytes: three phased codes in radix
//! 5 or four unphased codes in radix 4.
//!
//! ```text
//! phased:    g0*25 + g1*5 + g2          (125 values)
//! unphased:  g0*64 + g1*16 + g2*4 + g3  (256 values)
//! ```
//!
//! A row of `N` samples stores `N / g` packed bytes followed by the remaining
//! `N % g` samples as raw BEG bytes. The tail is never padded.

use crate::{error::EncodingError, Result};

/// BEG code of a missing call
pub const MISSING: u8 = 0;

/// Largest allele index representable by a BEG code
pub const MAX_ALLELE_INDEX: u8 = 14;

/// Number of distinct BEG codes (including the missing code)
pub const NUM_CODES: usize = (MAX_ALLELE_INDEX as usize + 1) * (MAX_ALLELE_INDEX as usize + 1) + 1;

/// Samples per MBEG byte in phased files
pub const PHASED_GROUP: usize = 3;

/// Samples per MBEG byte in unphased files
pub const UNPHASED_GROUP: usize = 4;

const PHASED_RADIX: usize = 5;
const UNPHASED_RADIX: usize = 4;
const PHASED_MBEG_CODES: usize = PHASED_RADIX * PHASED_RADIX * PHASED_RADIX;
const UNPHASED_MBEG_CODES: usize = UNPHASED_RADIX * UNPHASED_RADIX * UNPHASED_RADIX * UNPHASED_RADIX;

const fn beg_index(i: u8, j: u8) -> u8 {
    if i <= j {
        j * j + i + 1
    } else {
        i * i + i + j + 2
    }
}

const fn build_decode_table() -> [[u8; 2]; NUM_CODES] {
    let mut table = [[0u8; 2]; NUM_CODES];
    let mut i = 0;
    while i <= MAX_ALLELE_INDEX {
        let mut j = 0;
        while j <= MAX_ALLELE_INDEX {
            table[beg_index(i, j) as usize] = [i, j];
            j += 1;
        }
        i += 1;
    }
    table
}

const fn build_phased_pack() -> [[[u8; PHASED_RADIX]; PHASED_RADIX]; PHASED_RADIX] {
    let mut table = [[[0u8; PHASED_RADIX]; PHASED_RADIX]; PHASED_RADIX];
    let mut a = 0;
    while a < PHASED_RADIX {
        let mut b = 0;
        while b < PHASED_RADIX {
            let mut c = 0;
            while c < PHASED_RADIX {
                table[a][b][c] = (a * 25 + b * 5 + c) as u8;
                c += 1;
            }
            b += 1;
        }
        a += 1;
    }
    table
}

const fn build_phased_unpack() -> [[u8; PHASED_GROUP]; PHASED_MBEG_CODES] {
    let mut table = [[0u8; PHASED_GROUP]; PHASED_MBEG_CODES];
    let mut code = 0;
    while code < PHASED_MBEG_CODES {
        table[code] = [(code / 25) as u8, (code / 5 % 5) as u8, (code % 5) as u8];
        code += 1;
    }
    table
}

const fn build_unphased_pack(
) -> [[[[u8; UNPHASED_RADIX]; UNPHASED_RADIX]; UNPHASED_RADIX]; UNPHASED_RADIX] {
    let mut table = [[[[0u8; UNPHASED_RADIX]; UNPHASED_RADIX]; UNPHASED_RADIX]; UNPHASED_RADIX];
    let mut a = 0;
    while a < UNPHASED_RADIX {
        let mut b = 0;
        while b < UNPHASED_RADIX {
            let mut c = 0;
            while c < UNPHASED_RADIX {
                let mut d = 0;
                while d < UNPHASED_RADIX {
                    table[a][b][c][d] = (a * 64 + b * 16 + c * 4 + d) as u8;
                    d += 1;
                }
                c += 1;
            }
            b += 1;
        }
        a += 1;
    }
    table
}

const fn build_unphased_unpack() -> [[u8; UNPHASED_GROUP]; UNPHASED_MBEG_CODES] {
    let mut table = [[0u8; UNPHASED_GROUP]; UNPHASED_MBEG_CODES];
    let mut code = 0;
    while code < UNPHASED_MBEG_CODES {
        table[code] = [
            (code >> 6) as u8,
            ((code >> 4) & 3) as u8,
            ((code >> 2) & 3) as u8,
            (code & 3) as u8,
        ];
        code += 1;
    }
    table
}

const fn build_unphased_transfer() -> [u8; NUM_CODES] {
    let mut table = [0u8; NUM_CODES];
    let mut i = 0;
    while i <= MAX_ALLELE_INDEX {
        let mut j = 0;
        while j <= MAX_ALLELE_INDEX {
            let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
            table[beg_index(i, j) as usize] = beg_index(lo, hi);
            j += 1;
        }
        i += 1;
    }
    table
}

static DECODE: [[u8; 2]; NUM_CODES] = build_decode_table();
static PHASED_PACK: [[[u8; PHASED_RADIX]; PHASED_RADIX]; PHASED_RADIX] = build_phased_pack();
static PHASED_UNPACK: [[u8; PHASED_GROUP]; PHASED_MBEG_CODES] = build_phased_unpack();
static UNPHASED_PACK: [[[[u8; UNPHASED_RADIX]; UNPHASED_RADIX]; UNPHASED_RADIX]; UNPHASED_RADIX] =
    build_unphased_pack();
static UNPHASED_UNPACK: [[u8; UNPHASED_GROUP]; UNPHASED_MBEG_CODES] = build_unphased_unpack();
static UNPHASED_TRANSFER: [u8; NUM_CODES] = build_unphased_transfer();

/// A single sample's genotype call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenotypeCall {
    /// Number of haplotypes (1 or 2)
    pub ploidy: u8,
    /// First haplotype allele index, `None` when missing
    pub hap1: Option<u8>,
    /// Second haplotype allele index, always `None` for haploid calls
    pub hap2: Option<u8>,
}
impl GenotypeCall {
    #[must_use]
    pub fn diploid(hap1: u8, hap2: u8) -> Self {
        Self {
            ploidy: 2,
            hap1: Some(hap1),
            hap2: Some(hap2),
        }
    }

    #[must_use]
    pub fn haploid(hap: u8) -> Self {
        Self {
            ploidy: 1,
            hap1: Some(hap),
            hap2: None,
        }
    }

    #[must_use]
    pub fn missing(ploidy: u8) -> Self {
        Self {
            ploidy,
            hap1: None,
            hap2: None,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.hap1.is_none()
    }
}

/// Where a sample's code lives inside a biallelic row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSlot {
    /// Packed into the MBEG byte at `offset`, at position `slot` within the group
    Packed { offset: usize, slot: usize },
    /// Stored unpacked in the row tail at `offset`
    Raw { offset: usize },
}

/// Encoder/decoder for BEG and MBEG codes in one phasing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenotypeCodec {
    phased: bool,
}
impl GenotypeCodec {
    #[must_use]
    pub fn new(phased: bool) -> Self {
        Self { phased }
    }

    #[must_use]
    pub fn is_phased(&self) -> bool {
        self.phased
    }

    /// Number of samples packed into one MBEG byte
    #[must_use]
    pub fn group_size(&self) -> usize {
        if self.phased {
            PHASED_GROUP
        } else {
            UNPHASED_GROUP
        }
    }

    /// Number of distinct BEG codes of a biallelic site
    #[must_use]
    pub fn radix(&self) -> usize {
        if self.phased {
            PHASED_RADIX
        } else {
            UNPHASED_RADIX
        }
    }

    /// Encodes a diploid call from its haplotype allele indices
    pub fn encode(&self, hap1: u8, hap2: u8) -> Result<u8> {
        for allele in [hap1, hap2] {
            if allele > MAX_ALLELE_INDEX {
                return Err(EncodingError::AlleleIndexOverflow(allele).into());
            }
        }
        if self.phased || hap1 <= hap2 {
            Ok(beg_index(hap1, hap2))
        } else {
            Ok(beg_index(hap2, hap1))
        }
    }

    /// Encodes a haploid call as the homozygous code of its allele
    pub fn encode_haploid(&self, hap: u8) -> Result<u8> {
        self.encode(hap, hap)
    }

    /// Encodes a [`GenotypeCall`]; a call with any missing haplotype is missing
    pub fn encode_call(&self, call: &GenotypeCall) -> Result<u8> {
        match (call.ploidy, call.hap1, call.hap2) {
            (1, Some(hap), _) => self.encode_haploid(hap),
            (2, Some(hap1), Some(hap2)) => self.encode(hap1, hap2),
            (1 | 2, _, _) => Ok(MISSING),
            (ploidy, _, _) => Err(EncodingError::InvalidPloidy(ploidy).into()),
        }
    }

    /// Decodes a BEG code into a call of the given ploidy
    pub fn decode_call(&self, beg: u8, ploidy: u8) -> Result<GenotypeCall> {
        self.validate(beg, false)?;
        match (ploidy, to_allele_indices(beg)) {
            (1 | 2, None) => Ok(GenotypeCall::missing(ploidy)),
            (1, Some((hap, _))) => Ok(GenotypeCall::haploid(hap)),
            (2, Some((hap1, hap2))) => Ok(GenotypeCall::diploid(hap1, hap2)),
            (ploidy, _) => Err(EncodingError::InvalidPloidy(ploidy).into()),
        }
    }

    /// Checks that a BEG code belongs to this codec's alphabet
    pub fn validate(&self, beg: u8, biallelic: bool) -> Result<()> {
        let valid = if biallelic {
            (beg as usize) < self.radix()
        } else if (beg as usize) < NUM_CODES {
            self.phased || UNPHASED_TRANSFER[beg as usize] == beg
        } else {
            false
        };
        if valid {
            Ok(())
        } else {
            Err(EncodingError::InvalidBeg {
                code: beg,
                phased: self.phased,
                biallelic,
            }
            .into())
        }
    }

    /// Packs one full group of biallelic BEG codes into an MBEG byte
    pub fn pack(&self, begs: &[u8]) -> Result<u8> {
        for &beg in begs {
            self.validate(beg, true)?;
        }
        match (self.phased, begs) {
            (true, &[a, b, c]) => Ok(PHASED_PACK[a as usize][b as usize][c as usize]),
            (false, &[a, b, c, d]) => {
                Ok(UNPHASED_PACK[a as usize][b as usize][c as usize][d as usize])
            }
            _ => Err(EncodingError::SubjectCountMismatch {
                position: 0,
                found: begs.len(),
                expected: self.group_size(),
            }
            .into()),
        }
    }

    /// Recovers the BEG code at `slot` of an MBEG byte
    pub fn unpack(&self, mbeg: u8, slot: usize) -> Result<u8> {
        let decoded = if self.phased {
            PHASED_UNPACK.get(mbeg as usize).and_then(|group| group.get(slot))
        } else {
            UNPHASED_UNPACK[mbeg as usize].get(slot)
        };
        decoded.copied().ok_or_else(|| {
            EncodingError::InvalidMbeg {
                code: mbeg,
                phased: self.phased,
            }
            .into()
        })
    }

    /// Number of bytes of a biallelic row with `num_samples` samples
    #[must_use]
    pub fn packed_row_len(&self, num_samples: usize) -> usize {
        let group = self.group_size();
        num_samples / group + num_samples % group
    }

    /// Appends the packed form of a biallelic row to `dst`
    pub fn pack_row(&self, begs: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let group = self.group_size();
        let mut chunks = begs.chunks_exact(group);
        for chunk in chunks.by_ref() {
            dst.push(self.pack(chunk)?);
        }
        for &beg in chunks.remainder() {
            self.validate(beg, true)?;
            dst.push(beg);
        }
        Ok(())
    }

    /// Expands a packed biallelic row of `num_samples` samples into `dst`
    pub fn unpack_row(&self, row: &[u8], num_samples: usize, dst: &mut Vec<u8>) -> Result<()> {
        let group = self.group_size();
        let full = num_samples / group;
        let expected = self.packed_row_len(num_samples);
        if row.len() != expected {
            return Err(EncodingError::SubjectCountMismatch {
                position: 0,
                found: row.len(),
                expected,
            }
            .into());
        }
        for &mbeg in &row[..full] {
            if self.phased {
                let codes = PHASED_UNPACK.get(mbeg as usize).ok_or(EncodingError::InvalidMbeg {
                    code: mbeg,
                    phased: true,
                })?;
                dst.extend_from_slice(codes);
            } else {
                dst.extend_from_slice(&UNPHASED_UNPACK[mbeg as usize]);
            }
        }
        for &beg in &row[full..] {
            self.validate(beg, true)?;
            dst.push(beg);
        }
        Ok(())
    }

    /// Resolves where sample `index` lives in a biallelic row of `num_samples` samples
    #[must_use]
    pub fn resolve(&self, index: usize, num_samples: usize) -> SampleSlot {
        let group = self.group_size();
        let full = num_samples / group;
        if index < full * group {
            SampleSlot::Packed {
                offset: index / group,
                slot: index % group,
            }
        } else {
            SampleSlot::Raw {
                offset: full + (index - full * group),
            }
        }
    }

    /// Reads the BEG code of a resolved sample from a biallelic row
    pub fn sample_at(&self, row: &[u8], slot: SampleSlot) -> Result<u8> {
        let offset = match slot {
            SampleSlot::Packed { offset, .. } | SampleSlot::Raw { offset } => offset,
        };
        let byte = *row.get(offset).ok_or(EncodingError::SubjectCountMismatch {
            position: 0,
            found: row.len(),
            expected: offset + 1,
        })?;
        match slot {
            SampleSlot::Packed { slot, .. } => self.unpack(byte, slot),
            SampleSlot::Raw { .. } => {
                self.validate(byte, true)?;
                Ok(byte)
            }
        }
    }
}

/// Returns the haplotype allele indices of a BEG code, `None` when missing
#[must_use]
pub fn to_allele_indices(beg: u8) -> Option<(u8, u8)> {
    if beg == MISSING {
        return None;
    }
    DECODE.get(beg as usize).map(|&[hap1, hap2]| (hap1, hap2))
}

#[must_use]
pub fn is_missing(beg: u8) -> bool {
    beg == MISSING
}

/// Number of non-reference alleles carried by a call
#[must_use]
pub fn alt_allele_count(ploidy: u8, beg: u8) -> u32 {
    match to_allele_indices(beg) {
        None => 0,
        Some((hap1, hap2)) => {
            let first = u32::from(hap1 != 0);
            if ploidy == 1 {
                first
            } else {
                first + u32::from(hap2 != 0)
            }
        }
    }
}

/// Maps a phased BEG code to its unphased equivalent
#[must_use]
pub fn to_unphased(beg: u8) -> u8 {
    UNPHASED_TRANSFER.get(beg as usize).copied().unwrap_or(beg)
}

/// Appends the VCF text form of a call (`0|1`, `1/1`, `./.`, `0`, `.`)
pub fn format_genotype(beg: u8, ploidy: u8, phased: bool, dst: &mut Vec<u8>) {
    fn push_allele(allele: u8, dst: &mut Vec<u8>) {
        if allele < 10 {
            dst.push(b'0' + allele);
        } else {
            dst.extend_from_slice(&[b'1', b'0' + allele - 10]);
        }
    }

    let separator = if phased { b'|' } else { b'/' };
    match (to_allele_indices(beg), ploidy) {
        (None, 1) => dst.push(b'.'),
        (None, _) => dst.extend_from_slice(&[b'.', separator, b'.']),
        (Some((hap, _)), 1) => push_allele(hap, dst),
        (Some((hap1, hap2)), _) => {
            push_allele(hap1, dst);
            dst.push(separator);
            push_allele(hap2, dst);
        }
    }
}
