use memchr::memchr;

use crate::{
    codec::GenotypeCodec,
    compress::Compressor,
    error::{BoundsError, FormatError},
    Result,
};

use super::tree::Node;

/// Borrowed compressed streams of one node
#[derive(Debug, Clone, Copy)]
pub struct NodePayload<'a> {
    pub genotype: &'a [u8],
    pub position: &'a [u8],
    pub allele: &'a [u8],
}

/// Byte offsets of one row inside the decompressed allele stream
#[derive(Debug, Clone, Copy, Default)]
struct AlleleRow {
    start: usize,
    tab: usize,
    end: usize,
}

/// Decompression cache holding exactly one node
///
/// Rows are exposed by rank, their position order. Ties keep the row order of
/// the stream. The genotype stream is only decompressed when asked for.
pub struct BlockCache {
    key: Option<(u8, usize)>,
    node: Option<Node>,
    codec: GenotypeCodec,
    num_subjects: usize,
    compressor: Box<dyn Compressor>,

    /// Positions in row order
    positions: Vec<u32>,
    /// Positions in rank order
    sorted_positions: Vec<u32>,
    /// Row index of each rank
    order: Vec<usize>,

    alleles: Vec<u8>,
    allele_rows: Vec<AlleleRow>,

    genotypes: Vec<u8>,
    has_genotypes: bool,

    scratch: Vec<u8>,
}
impl BlockCache {
    #[must_use]
    pub fn new(num_subjects: usize, phased: bool, compressor: Box<dyn Compressor>) -> Self {
        Self {
            key: None,
            node: None,
            codec: GenotypeCodec::new(phased),
            num_subjects,
            compressor,
            positions: Vec::new(),
            sorted_positions: Vec::new(),
            order: Vec::new(),
            alleles: Vec::new(),
            allele_rows: Vec::new(),
            genotypes: Vec::new(),
            has_genotypes: false,
            scratch: Vec::new(),
        }
    }

    /// Key of the cached node, `(chromosome, node index)`
    #[must_use]
    pub fn key(&self) -> Option<(u8, usize)> {
        self.key
    }

    #[must_use]
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    #[must_use]
    pub fn codec(&self) -> GenotypeCodec {
        self.codec
    }

    #[must_use]
    pub fn has_genotypes(&self) -> bool {
        self.has_genotypes
    }

    /// Number of variants in the cached node
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.node = None;
        self.has_genotypes = false;
    }

    /// Loads a node unless it is already cached
    ///
    /// Site columns are always decompressed. The genotype stream is decompressed
    /// when `with_genotypes` is set and it is not already present.
    pub fn load(
        &mut self,
        key: (u8, usize),
        node: &Node,
        payload: NodePayload<'_>,
        with_genotypes: bool,
    ) -> Result<()> {
        if self.key != Some(key) {
            self.key = None;
            self.has_genotypes = false;
            self.load_sites(node, payload)?;
            self.node = Some(*node);
            self.key = Some(key);
        }
        if with_genotypes && !self.has_genotypes {
            self.load_genotypes(node, payload)?;
            self.has_genotypes = true;
        }
        Ok(())
    }

    fn load_sites(&mut self, node: &Node, payload: NodePayload<'_>) -> Result<()> {
        let count = node.num_variants();

        self.compressor
            .decompress(payload.position, &mut self.scratch, node.allele_hint())?;
        if self.scratch.len() != 4 * count {
            return Err(FormatError::StreamSize {
                stream: "position",
                found: self.scratch.len(),
                expected: 4 * count,
            }
            .into());
        }
        self.positions.clear();
        self.positions.extend(
            self.scratch
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        );

        self.compressor
            .decompress(payload.allele, &mut self.alleles, node.allele_hint())?;
        self.allele_rows.clear();
        let mut start = 0;
        while self.allele_rows.len() < count {
            let tab = memchr(b'\t', &self.alleles[start..]).map(|i| start + i);
            let end = tab.and_then(|tab| memchr(b'/', &self.alleles[tab..]).map(|i| tab + i));
            let (Some(tab), Some(end)) = (tab, end) else {
                return Err(FormatError::AlleleCount {
                    found: self.allele_rows.len(),
                    expected: count,
                }
                .into());
            };
            self.allele_rows.push(AlleleRow { start, tab, end });
            start = end + 1;
        }

        self.order.clear();
        self.order.extend(0..count);
        let positions = &self.positions;
        self.order.sort_by_key(|row| positions[*row]);
        self.sorted_positions.clear();
        self.sorted_positions
            .extend(self.order.iter().map(|row| self.positions[*row]));
        Ok(())
    }

    fn load_genotypes(&mut self, node: &Node, payload: NodePayload<'_>) -> Result<()> {
        self.compressor
            .decompress(payload.genotype, &mut self.genotypes, node.genotype_hint())?;
        let expected = usize::from(node.biallelic) * self.packed_row_len()
            + usize::from(node.multiallelic) * self.num_subjects;
        if self.genotypes.len() != expected {
            return Err(FormatError::StreamSize {
                stream: "genotype",
                found: self.genotypes.len(),
                expected,
            }
            .into());
        }
        Ok(())
    }

    fn packed_row_len(&self) -> usize {
        self.codec.packed_row_len(self.num_subjects)
    }

    fn check_rank(&self, rank: usize) -> Result<usize> {
        self.order.get(rank).copied().ok_or_else(|| {
            BoundsError::VariantOutOfRange {
                requested_index: rank,
                max_index: self.order.len(),
            }
            .into()
        })
    }

    /// Physical row of the variant at `rank`
    pub fn row_of(&self, rank: usize) -> Result<usize> {
        self.check_rank(rank)
    }

    /// Position of the variant at `rank`
    #[must_use]
    pub fn position(&self, rank: usize) -> Option<u32> {
        self.sorted_positions.get(rank).copied()
    }

    /// Rank of the first variant at or after `position`
    #[must_use]
    pub fn find(&self, position: u32) -> Option<usize> {
        let rank = self.sorted_positions.partition_point(|p| *p < position);
        (rank < self.sorted_positions.len()).then_some(rank)
    }

    /// REF text of a physical row, empty for an unknown row
    #[must_use]
    pub fn ref_allele(&self, row: usize) -> &[u8] {
        self.allele_rows
            .get(row)
            .map_or(&[][..], |entry| &self.alleles[entry.start..entry.tab])
    }

    /// ALT text of a physical row, empty for an unknown row
    #[must_use]
    pub fn alt_allele(&self, row: usize) -> &[u8] {
        self.allele_rows
            .get(row)
            .map_or(&[][..], |entry| &self.alleles[entry.tab + 1..entry.end])
    }

    /// Whether a physical row belongs to the packed biallelic sub-run
    #[must_use]
    pub fn is_biallelic_row(&self, row: usize) -> bool {
        self.node
            .is_some_and(|node| row < usize::from(node.biallelic))
    }

    /// Genotype bytes of a physical row, packed for biallelic rows
    pub fn genotype_row(&self, row: usize) -> Result<&[u8]> {
        let Some(node) = self.node.filter(|_| self.has_genotypes) else {
            return Err(FormatError::StreamSize {
                stream: "genotype",
                found: 0,
                expected: self.num_subjects,
            }
            .into());
        };
        let biallelic = usize::from(node.biallelic);
        let packed = self.packed_row_len();
        let range = if row < biallelic {
            row * packed..(row + 1) * packed
        } else {
            let start = biallelic * packed + (row - biallelic) * self.num_subjects;
            start..start + self.num_subjects
        };
        self.genotypes.get(range).ok_or_else(|| {
            BoundsError::VariantOutOfRange {
                requested_index: row,
                max_index: node.num_variants(),
            }
            .into()
        })
    }
}
