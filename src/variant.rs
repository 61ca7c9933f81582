use crate::{
    codec::{self, GenotypeCall, GenotypeCodec, MAX_ALLELE_INDEX},
    error::{BoundsError, EncodingError},
    Result,
};

/// Bytes that frame entries of the allele stream
const RESERVED_ALLELE_BYTES: [u8; 3] = [b'\t', b'/', b'\n'];

/// A single variant site with one BEG code per subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variant {
    /// Chromosome index as resolved by a [`ChromosomeRegistry`](crate::ChromosomeRegistry)
    pub chromosome: u8,
    /// 1-based position on the chromosome
    pub position: u32,
    /// Reference allele text
    pub ref_allele: Vec<u8>,
    /// Comma-separated alternative alleles (`.` when there are none)
    pub alt_allele: Vec<u8>,
    /// Number of haplotypes per call
    pub ploidy: u8,
    /// Whether the genotype codes are order-significant
    pub phased: bool,
    /// One BEG code per subject, empty when genotypes were not decoded
    pub begs: Vec<u8>,
}
impl Variant {
    #[must_use]
    pub fn new(chromosome: u8, position: u32, ref_allele: &[u8], alt_allele: &[u8]) -> Self {
        Self {
            chromosome,
            position,
            ref_allele: ref_allele.to_vec(),
            alt_allele: alt_allele.to_vec(),
            ploidy: 2,
            phased: false,
            begs: Vec::new(),
        }
    }

    /// Builds a variant by encoding a sequence of calls
    pub fn from_calls(
        chromosome: u8,
        position: u32,
        ref_allele: &[u8],
        alt_allele: &[u8],
        calls: &[GenotypeCall],
        codec: GenotypeCodec,
    ) -> Result<Self> {
        let mut variant = Self::new(chromosome, position, ref_allele, alt_allele);
        variant.phased = codec.is_phased();
        variant.ploidy = calls.first().map_or(2, |call| call.ploidy);
        variant.begs = calls
            .iter()
            .map(|call| codec.encode_call(call))
            .collect::<Result<Vec<_>>>()?;
        Ok(variant)
    }

    /// Resets the variant so that its buffers can be reused
    pub fn clear(&mut self) {
        self.ref_allele.clear();
        self.alt_allele.clear();
        self.begs.clear();
        self.position = 0;
    }

    #[must_use]
    pub fn num_subjects(&self) -> usize {
        self.begs.len()
    }

    /// Iterates over the alternative alleles
    pub fn alt_alleles(&self) -> impl Iterator<Item = &[u8]> {
        let empty = self.alt_allele.is_empty() || self.alt_allele == b".";
        self.alt_allele
            .split(|byte| *byte == b',')
            .filter(move |_| !empty)
    }

    /// Number of alleles including the reference
    #[must_use]
    pub fn allele_count(&self) -> usize {
        1 + self.alt_alleles().count()
    }

    /// A site with at most one alternative allele
    #[must_use]
    pub fn is_biallelic(&self) -> bool {
        self.allele_count() <= 2
    }

    /// Decodes the call of one subject
    pub fn call(&self, subject: usize) -> Result<GenotypeCall> {
        let beg = self
            .begs
            .get(subject)
            .ok_or(BoundsError::SubjectOutOfRange {
                requested_index: subject,
                max_index: self.begs.len(),
            })?;
        GenotypeCodec::new(self.phased).decode_call(*beg, self.ploidy)
    }

    /// Number of missing calls
    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.begs.iter().filter(|beg| codec::is_missing(**beg)).count()
    }

    /// Count of alternative alleles over all called haplotypes (AC)
    #[must_use]
    pub fn alternative_allele_count(&self) -> u32 {
        self.begs
            .iter()
            .map(|beg| codec::alt_allele_count(self.ploidy, *beg))
            .sum()
    }

    /// Total number of called alleles (AN)
    #[must_use]
    pub fn allele_number(&self) -> u32 {
        (self.num_subjects() - self.missing_count()) as u32 * u32::from(self.ploidy)
    }

    /// Alternative allele frequency (AF), `0.0` when no allele is called
    #[must_use]
    pub fn allele_frequency(&self) -> f64 {
        let an = self.allele_number();
        if an == 0 {
            0.0
        } else {
            f64::from(self.alternative_allele_count()) / f64::from(an)
        }
    }

    /// Per-allele counts, indexed by allele (0 is REF)
    #[must_use]
    pub fn allele_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.allele_count().max(2)];
        for &beg in &self.begs {
            if let Some((hap1, hap2)) = codec::to_allele_indices(beg) {
                let haps: &[u8] = if self.ploidy == 1 { &[hap1] } else { &[hap1, hap2] };
                for &hap in haps {
                    if let Some(count) = counts.get_mut(hap as usize) {
                        *count += 1;
                    }
                }
            }
        }
        counts
    }

    /// Checks the variant against a subject count and codec before encoding
    pub fn validate(&self, num_subjects: usize, codec: GenotypeCodec) -> Result<()> {
        if self.begs.len() != num_subjects {
            return Err(EncodingError::SubjectCountMismatch {
                position: self.position,
                found: self.begs.len(),
                expected: num_subjects,
            }
            .into());
        }
        if !matches!(self.ploidy, 1 | 2) {
            return Err(EncodingError::InvalidPloidy(self.ploidy).into());
        }
        self.validate_alleles()?;
        let alleles = self.allele_count();
        if alleles > MAX_ALLELE_INDEX as usize + 1 {
            return Err(EncodingError::TooManyAlleles {
                position: self.position,
                alleles,
            }
            .into());
        }
        let biallelic = alleles <= 2;
        for &beg in &self.begs {
            codec.validate(beg, biallelic)?;
            self.check_allele_range(beg, alleles)?;
        }
        Ok(())
    }

    /// Rejects empty alleles and alleles carrying the allele stream delimiters
    pub fn validate_alleles(&self) -> Result<()> {
        for (field, text) in [("REF", &self.ref_allele), ("ALT", &self.alt_allele)] {
            if let Some(&byte) = text.iter().find(|byte| RESERVED_ALLELE_BYTES.contains(byte)) {
                return Err(EncodingError::ReservedAlleleByte {
                    position: self.position,
                    field,
                    byte,
                }
                .into());
            }
        }
        let empty_alt = self.alt_allele.is_empty() || self.alt_alleles().any(<[u8]>::is_empty);
        if self.ref_allele.is_empty() || empty_alt {
            return Err(EncodingError::EmptyAllele {
                position: self.position,
                field: if self.ref_allele.is_empty() { "REF" } else { "ALT" },
            }
            .into());
        }
        Ok(())
    }

    /// Fails when a call names an allele index at or beyond `alleles`
    pub(crate) fn check_allele_range(&self, beg: u8, alleles: usize) -> Result<()> {
        match codec::to_allele_indices(beg) {
            Some((hap1, hap2)) if usize::from(hap1.max(hap2)) >= alleles => {
                Err(EncodingError::AlleleOutOfRange {
                    position: self.position,
                    allele: hap1.max(hap2),
                    alleles,
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Length of this variant's entry in the allele stream
    #[must_use]
    pub fn allele_entry_len(&self) -> usize {
        self.ref_allele.len() + self.alt_allele.len() + 2
    }

    /// Appends `REF '\t' ALT '/'` to an allele stream
    pub fn write_alleles(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.ref_allele);
        dst.push(b'\t');
        dst.extend_from_slice(&self.alt_allele);
        dst.push(b'/');
    }
}
