//! Random-access reading of GTB files
//!
//! A [`Reader`] walks a [`Manager`]'s block index with a [`Cursor`] pointing at
//! the next variant to read. The node under the cursor is decompressed once into
//! a [`BlockCache`]; moving within it only touches the cache.
//!
//! ```text
//! chromosome ──► node ──► variant (rank = position order)
//!      ▲           │          │
//!      └───────────┴──────────┘  `next` cascades on exhaustion
//! ```

use std::{ops::Range, sync::Arc};

use crate::{
    chromosome::ChromosomeRegistry,
    codec::{self, SampleSlot},
    core::BlockCache,
    error::{BoundsError, FormatError},
    manager::Manager,
    variant::Variant,
    Result,
};

/// Location of the next variant to be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub chromosome: u8,
    /// Index into the chromosome's node list
    pub node: usize,
    /// Rank of the variant within the node (position order)
    pub variant: usize,
}

/// A selected subject, resolved once for both row layouts
#[derive(Debug, Clone, Copy)]
struct Selected {
    index: usize,
    slot: SampleSlot,
}

/// Reads variants from one file
pub struct Reader {
    manager: Arc<Manager>,
    registry: Arc<dyn ChromosomeRegistry>,

    /// Chromosomes visible to the reader, ascending
    chromosomes: Vec<u8>,
    /// Visible node range of each chromosome
    ranges: Vec<Range<usize>>,
    /// `(chromosome slot, node, rank)`, `None` once exhausted
    cursor: Option<(usize, usize, usize)>,

    cache: BlockCache,
    decode_genotypes: bool,
    phased: bool,
    selection: Option<Vec<Selected>>,
}
impl Reader {
    #[must_use]
    pub fn new(manager: Arc<Manager>, registry: Arc<dyn ChromosomeRegistry>) -> Self {
        let cache = BlockCache::new(
            manager.num_subjects(),
            manager.is_phased(),
            manager.new_compressor(),
        );
        let phased = manager.is_phased();
        let mut reader = Self {
            manager,
            registry,
            chromosomes: Vec::new(),
            ranges: Vec::new(),
            cursor: None,
            cache,
            decode_genotypes: true,
            phased,
            selection: None,
        };
        reader.reset();
        reader
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Number of subjects in each decoded variant
    #[must_use]
    pub fn num_selected(&self) -> usize {
        self.selection
            .as_ref()
            .map_or(self.manager.num_subjects(), Vec::len)
    }

    /// Names of the subjects in output order
    #[must_use]
    pub fn selected_subjects(&self) -> Vec<&str> {
        let subjects = self.manager.subjects();
        match &self.selection {
            Some(selection) => selection
                .iter()
                .map(|selected| subjects[selected.index].as_str())
                .collect(),
            None => subjects.iter().map(String::as_str).collect(),
        }
    }

    /// Whether genotypes are decompressed (site columns are always read)
    pub fn set_decode_genotypes(&mut self, decode: bool) {
        self.decode_genotypes = decode;
    }

    #[must_use]
    pub fn decodes_genotypes(&self) -> bool {
        self.decode_genotypes
    }

    /// Reads a phased file as phased (`true`) or canonicalised unphased (`false`)
    ///
    /// Unphased files are always read unphased.
    pub fn set_phased(&mut self, phased: bool) {
        self.phased = phased && self.manager.is_phased();
    }

    #[must_use]
    pub fn is_phased(&self) -> bool {
        self.phased
    }

    /// Current position, `None` once every visible variant was read
    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor.map(|(slot, node, variant)| Cursor {
            chromosome: self.chromosomes[slot],
            node,
            variant,
        })
    }

    /// Makes every chromosome visible and rewinds
    pub fn reset(&mut self) {
        self.chromosomes = self.manager.tree().chromosomes();
        self.ranges = self
            .chromosomes
            .iter()
            .map(|chromosome| 0..self.node_count(*chromosome))
            .collect();
        self.rewind();
    }

    /// Moves the cursor to the first visible variant
    pub fn rewind(&mut self) {
        self.cursor = self.first_from(0);
    }

    /// Restricts the reader to a set of chromosomes and rewinds
    pub fn limit(&mut self, chromosomes: &[u8]) -> Result<()> {
        let mut visible = chromosomes.to_vec();
        visible.sort_unstable();
        visible.dedup();
        if let Some(missing) = visible.iter().find(|c| !self.manager.tree().contains(**c)) {
            return Err(BoundsError::MissingChromosome(*missing).into());
        }
        self.ranges = visible
            .iter()
            .map(|chromosome| 0..self.node_count(*chromosome))
            .collect();
        self.chromosomes = visible;
        self.rewind();
        Ok(())
    }

    /// Restricts the reader to a node range of one chromosome and rewinds
    pub fn limit_nodes(&mut self, chromosome: u8, nodes: Range<usize>) -> Result<()> {
        if nodes.start > nodes.end {
            return Err(BoundsError::InvalidRange {
                start: nodes.start,
                end: nodes.end,
            }
            .into());
        }
        let count = self.manager.nodes_of(chromosome)?.len();
        if nodes.end > count {
            return Err(BoundsError::NodeOutOfRange {
                chromosome,
                requested_index: nodes.end,
                max_index: count,
            }
            .into());
        }
        self.chromosomes = vec![chromosome];
        self.ranges = vec![nodes];
        self.rewind();
        Ok(())
    }

    /// Selects subjects by name, in the given output order
    pub fn select_subjects<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let indices = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.manager
                    .subject_index(name)
                    .ok_or_else(|| BoundsError::UnknownSubject(name.to_string()).into())
            })
            .collect::<Result<Vec<_>>>()?;
        self.select_subject_indices(&indices)
    }

    /// Selects subjects by index, in the given output order
    pub fn select_subject_indices(&mut self, indices: &[usize]) -> Result<()> {
        let num_subjects = self.manager.num_subjects();
        let codec = self.cache.codec();
        let selection = indices
            .iter()
            .map(|&index| {
                if index >= num_subjects {
                    return Err(BoundsError::SubjectOutOfRange {
                        requested_index: index,
                        max_index: num_subjects,
                    }
                    .into());
                }
                Ok(Selected {
                    index,
                    slot: codec.resolve(index, num_subjects),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.selection = Some(selection);
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    /// Positions the cursor on the first variant of `chromosome` at or after `position`
    ///
    /// Returns `false`, leaving the cursor untouched, when the chromosome is not
    /// visible or holds no such variant. Requires an ordered file.
    pub fn seek(&mut self, chromosome: u8, position: u32) -> Result<bool> {
        if !self.manager.is_ordered() {
            return Err(FormatError::UnorderedFile.into());
        }
        let Some(slot) = self.slot_of(chromosome) else {
            return Ok(false);
        };
        let range = self.ranges[slot].clone();
        let list = self.manager.nodes_of(chromosome)?;
        let first = list.find(position).map_or(range.end, |index| index.max(range.start));

        for node in first..range.end {
            self.load(chromosome, node, false)?;
            if let Some(rank) = self.cache.find(position) {
                self.cursor = Some((slot, node, rank));
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Positions the cursor on an explicit index after checking every component
    pub fn seek_index(&mut self, chromosome: u8, node: usize, variant: usize) -> Result<()> {
        let slot = self
            .slot_of(chromosome)
            .ok_or(BoundsError::MissingChromosome(chromosome))?;
        let range = &self.ranges[slot];
        if !range.contains(&node) {
            return Err(BoundsError::NodeOutOfRange {
                chromosome,
                requested_index: node,
                max_index: range.end,
            }
            .into());
        }
        let count = self.manager.node(chromosome, node)?.num_variants();
        if variant >= count {
            return Err(BoundsError::VariantOutOfRange {
                requested_index: variant,
                max_index: count,
            }
            .into());
        }
        self.cursor = Some((slot, node, variant));
        Ok(())
    }

    /// Reads the variant under the cursor and advances
    pub fn read_variant(&mut self) -> Result<Option<Variant>> {
        let mut variant = Variant::default();
        Ok(self.read_variant_into(&mut variant)?.then_some(variant))
    }

    /// Reads the variant under the cursor into a reusable buffer and advances
    ///
    /// Returns `false` once the visible variants are exhausted.
    pub fn read_variant_into(&mut self, variant: &mut Variant) -> Result<bool> {
        let Some((slot, node, rank)) = self.cursor else {
            return Ok(false);
        };
        let chromosome = self.chromosomes[slot];
        self.load(chromosome, node, self.decode_genotypes)?;

        let row = self.cache.row_of(rank)?;
        variant.clear();
        variant.chromosome = chromosome;
        variant.position = self.cache.position(rank).unwrap_or_default();
        variant.ref_allele.extend_from_slice(self.cache.ref_allele(row));
        variant.alt_allele.extend_from_slice(self.cache.alt_allele(row));
        variant.ploidy = self.registry.ploidy_of(chromosome);
        variant.phased = self.phased;
        if self.decode_genotypes {
            self.decode_row(row, &mut variant.begs)?;
        }

        self.next();
        Ok(true)
    }

    /// Moves the cursor to the next variant, cascading across nodes and chromosomes
    pub fn next(&mut self) {
        let Some((slot, node, rank)) = self.cursor else {
            return;
        };
        let chromosome = self.chromosomes[slot];
        let count = self
            .manager
            .node(chromosome, node)
            .map_or(0, |node| node.num_variants());
        self.cursor = if rank + 1 < count {
            Some((slot, node, rank + 1))
        } else if node + 1 < self.ranges[slot].end {
            Some((slot, node + 1, 0))
        } else {
            self.first_from(slot + 1)
        };
    }

    fn decode_row(&mut self, row: usize, begs: &mut Vec<u8>) -> Result<()> {
        let codec = self.cache.codec();
        let num_subjects = self.manager.num_subjects();
        let biallelic = self.cache.is_biallelic_row(row);
        let bytes = self.cache.genotype_row(row)?;

        match (&self.selection, biallelic) {
            (None, true) => codec.unpack_row(bytes, num_subjects, begs)?,
            (None, false) => begs.extend_from_slice(bytes),
            (Some(selection), true) => {
                for selected in selection {
                    begs.push(codec.sample_at(bytes, selected.slot)?);
                }
            }
            (Some(selection), false) => {
                begs.extend(selection.iter().map(|selected| bytes[selected.index]));
            }
        }
        if !biallelic {
            for beg in begs.iter() {
                codec.validate(*beg, false)?;
            }
        }
        if codec.is_phased() && !self.phased {
            for beg in begs.iter_mut() {
                *beg = codec::to_unphased(*beg);
            }
        }
        Ok(())
    }

    fn load(&mut self, chromosome: u8, node: usize, with_genotypes: bool) -> Result<()> {
        let entry = *self.manager.node(chromosome, node)?;
        let payload = self.manager.payload(&entry)?;
        self.cache
            .load((chromosome, node), &entry, payload, with_genotypes)
    }

    fn slot_of(&self, chromosome: u8) -> Option<usize> {
        self.chromosomes.binary_search(&chromosome).ok()
    }

    fn node_count(&self, chromosome: u8) -> usize {
        self.manager
            .tree()
            .nodes_of(chromosome)
            .map_or(0, |list| list.len())
    }

    /// First variant of the first non-empty chromosome starting at `slot`
    fn first_from(&self, slot: usize) -> Option<(usize, usize, usize)> {
        (slot..self.chromosomes.len())
            .find(|slot| !self.ranges[*slot].is_empty())
            .map(|slot| (slot, self.ranges[slot].start, 0))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        chromosome::HumanRegistry,
        codec::{GenotypeCall, GenotypeCodec},
        manager::Context,
        write::WriterBuilder,
    };

    const SCENARIO: [(u8, u32); 5] = [(0, 100), (0, 200), (0, 350), (1, 50), (1, 400)];

    fn calls_for(position: u32) -> Vec<GenotypeCall> {
        vec![
            GenotypeCall::diploid(0, u8::from(position % 2 == 0)),
            GenotypeCall::diploid(1, 0),
            GenotypeCall::missing(2),
            GenotypeCall::diploid(1, 1),
            GenotypeCall::diploid(0, 0),
        ]
    }

    fn write_file(path: &Path, phased: bool, sites: &[(u8, u32)], block_limit: usize) {
        let codec = GenotypeCodec::new(phased);
        let subjects = (0..5).map(|i| format!("s{i}")).collect();
        let mut writer = WriterBuilder::new()
            .phased(phased)
            .block_limit(block_limit)
            .build(path, subjects)
            .unwrap();
        for &(chromosome, position) in sites {
            let variant = Variant::from_calls(
                chromosome,
                position,
                b"A",
                b"G",
                &calls_for(position),
                codec,
            )
            .unwrap();
            writer.push(&variant).unwrap();
        }
        writer.finish().unwrap();
    }

    fn scenario_reader(phased: bool) -> (tempfile::TempDir, Reader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.gtb");
        write_file(&path, phased, &SCENARIO, 2);
        let reader = Context::default().reader(&path).unwrap();
        (dir, reader)
    }

    fn read_positions(reader: &mut Reader) -> Vec<(u8, u32)> {
        let mut out = Vec::new();
        while let Some(variant) = reader.read_variant().unwrap() {
            out.push((variant.chromosome, variant.position));
        }
        out
    }

    // ==================== Sequential Tests ====================

    #[test]
    fn test_read_all_in_order() {
        let (_dir, mut reader) = scenario_reader(false);
        assert_eq!(read_positions(&mut reader), SCENARIO.to_vec());
        assert!(reader.cursor().is_none());
        assert!(reader.read_variant().unwrap().is_none());
    }

    #[test]
    fn test_decoded_genotypes_round_trip() {
        for phased in [true, false] {
            let (_dir, mut reader) = scenario_reader(phased);
            let codec = GenotypeCodec::new(phased);
            while let Some(variant) = reader.read_variant().unwrap() {
                let expected = calls_for(variant.position)
                    .iter()
                    .map(|call| codec.encode_call(call).unwrap())
                    .collect::<Vec<_>>();
                assert_eq!(variant.begs, expected);
                assert_eq!(variant.ref_allele, b"A");
                assert_eq!(variant.alt_allele, b"G");
                assert_eq!(variant.phased, phased);
            }
        }
    }

    #[test]
    fn test_phased_file_read_unphased() {
        let (_dir, mut reader) = scenario_reader(true);
        reader.set_phased(false);
        let variant = reader.read_variant().unwrap().unwrap();
        assert!(!variant.phased);
        // 1|0 becomes 0/1
        assert_eq!(variant.begs[1], GenotypeCodec::new(false).encode(0, 1).unwrap());
    }

    #[test]
    fn test_sites_only() {
        let (_dir, mut reader) = scenario_reader(false);
        reader.set_decode_genotypes(false);
        let variant = reader.read_variant().unwrap().unwrap();
        assert_eq!(variant.position, 100);
        assert!(variant.begs.is_empty());
    }

    #[test]
    fn test_haploid_ploidy_from_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haploid.gtb");
        let y = HumanRegistry.index_of("Y").unwrap();
        write_file(&path, false, &[(y, 10)], 4);
        let mut reader = Context::default().reader(&path).unwrap();
        assert_eq!(reader.read_variant().unwrap().unwrap().ploidy, 1);
    }

    // ==================== Seek Tests ====================

    #[test]
    fn test_seek_scenario() {
        let (_dir, mut reader) = scenario_reader(false);
        assert!(reader.seek(0, 250).unwrap());
        assert_eq!(reader.read_variant().unwrap().unwrap().position, 350);

        let before = reader.cursor();
        assert!(!reader.seek(1, 500).unwrap());
        assert_eq!(reader.cursor(), before);
    }

    #[test]
    fn test_seek_boundaries() {
        let (_dir, mut reader) = scenario_reader(false);

        assert!(reader.seek(0, 1).unwrap());
        assert_eq!(reader.read_variant().unwrap().unwrap().position, 100);

        assert!(reader.seek(0, 200).unwrap());
        assert_eq!(reader.read_variant().unwrap().unwrap().position, 200);

        assert!(reader.seek(1, 400).unwrap());
        assert_eq!(reader.read_variant().unwrap().unwrap().position, 400);
        assert!(reader.read_variant().unwrap().is_none());

        assert!(!reader.seek(0, 351).unwrap());
        assert!(!reader.seek(7, 1).unwrap());
    }

    #[test]
    fn test_seek_continues_across_chromosomes() {
        let (_dir, mut reader) = scenario_reader(false);
        assert!(reader.seek(0, 300).unwrap());
        assert_eq!(read_positions(&mut reader), vec![(0, 350), (1, 50), (1, 400)]);
    }

    #[test]
    fn test_seek_index_checks_bounds() {
        let (_dir, mut reader) = scenario_reader(false);
        reader.seek_index(0, 1, 0).unwrap();
        assert_eq!(
            reader.cursor(),
            Some(Cursor {
                chromosome: 0,
                node: 1,
                variant: 0
            })
        );
        assert_eq!(reader.read_variant().unwrap().unwrap().position, 350);

        assert!(reader.seek_index(0, 2, 0).is_err());
        assert!(reader.seek_index(0, 1, 1).is_err());
        assert!(reader.seek_index(4, 0, 0).is_err());
    }

    // ==================== Limit Tests ====================

    #[test]
    fn test_limit_chromosomes() {
        let (_dir, mut reader) = scenario_reader(false);
        reader.limit(&[1]).unwrap();
        assert_eq!(read_positions(&mut reader), vec![(1, 50), (1, 400)]);
        assert!(!reader.seek(0, 100).unwrap());

        assert!(reader.limit(&[3]).is_err());
        reader.reset();
        assert_eq!(read_positions(&mut reader).len(), 5);
    }

    #[test]
    fn test_limit_nodes() {
        let (_dir, mut reader) = scenario_reader(false);
        reader.limit_nodes(0, 1..2).unwrap();
        assert_eq!(read_positions(&mut reader), vec![(0, 350)]);

        reader.limit_nodes(0, 0..0).unwrap();
        assert!(reader.read_variant().unwrap().is_none());

        assert!(reader.limit_nodes(0, 0..3).is_err());
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = 2..1;
        assert!(reader.limit_nodes(0, reversed).is_err());
        assert!(reader.limit_nodes(9, 0..1).is_err());
    }

    // ==================== Selection Tests ====================

    #[test]
    fn test_select_subjects() {
        for phased in [true, false] {
            let (_dir, mut reader) = scenario_reader(phased);
            let codec = GenotypeCodec::new(phased);
            reader.select_subjects(&["s4", "s1", "s3"]).unwrap();
            assert_eq!(reader.num_selected(), 3);
            assert_eq!(reader.selected_subjects(), vec!["s4", "s1", "s3"]);

            let variant = reader.read_variant().unwrap().unwrap();
            let calls = calls_for(variant.position);
            let expected = [4, 1, 3]
                .iter()
                .map(|&i| codec.encode_call(&calls[i]).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(variant.begs, expected);
        }
    }

    #[test]
    fn test_select_unknown_subject() {
        let (_dir, mut reader) = scenario_reader(false);
        assert!(reader.select_subjects(&["nobody"]).is_err());
        assert!(reader.select_subject_indices(&[5]).is_err());
        reader.select_subject_indices(&[0]).unwrap();
        reader.clear_selection();
        assert_eq!(reader.num_selected(), 5);
    }

    #[test]
    fn test_multiallelic_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.gtb");
        let codec = GenotypeCodec::new(false);
        let calls = [
            GenotypeCall::diploid(0, 2),
            GenotypeCall::diploid(1, 2),
            GenotypeCall::missing(2),
        ];
        let mut writer = WriterBuilder::new()
            .build(&path, vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        writer
            .push(&Variant::from_calls(0, 5, b"A", b"C,T", &calls, codec).unwrap())
            .unwrap();
        writer.finish().unwrap();

        let mut reader = Context::default().reader(&path).unwrap();
        reader.select_subjects(&["b"]).unwrap();
        let variant = reader.read_variant().unwrap().unwrap();
        assert_eq!(variant.alt_allele, b"C,T");
        assert_eq!(variant.begs, vec![codec.encode(1, 2).unwrap()]);
    }

    #[test]
    fn test_selection_rejects_corrupt_tail_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.gtb");
        let codec = GenotypeCodec::new(false);
        let calls = [GenotypeCall::diploid(0, 1), GenotypeCall::diploid(1, 1)];
        let mut writer = WriterBuilder::new()
            .compressor(crate::CompressorKind::Store)
            .build(&path, vec!["a".into(), "b".into()])
            .unwrap();
        writer
            .push(&Variant::from_calls(0, 5, b"A", b"C", &calls, codec).unwrap())
            .unwrap();
        writer.finish().unwrap();

        // two samples form a raw tail of two BEG bytes
        let offset = {
            let manager = crate::Manager::open(&path).unwrap();
            manager.node(0, 0).unwrap().genotype_span().offset() as usize
        };
        let mut bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[offset..offset + 2], &[2, 3]);
        bytes[offset + 1] = 9;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = Context::default().reader(&path).unwrap();
        reader.select_subject_indices(&[1]).unwrap();
        assert!(matches!(
            reader.read_variant(),
            Err(crate::Error::EncodingError(crate::error::EncodingError::InvalidBeg {
                code: 9,
                ..
            }))
        ));

        let mut reader = Context::default().reader(&path).unwrap();
        assert!(reader.read_variant().is_err());

        let mut reader = Context::default().reader(&path).unwrap();
        reader.select_subject_indices(&[0]).unwrap();
        let variant = reader.read_variant().unwrap().unwrap();
        assert_eq!(variant.begs, vec![2]);
    }

    // ==================== Unordered Tests ====================

    #[test]
    fn test_seek_rejects_unordered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unordered.gtb");
        write_file(&path, false, &[(0, 100), (0, 500), (0, 200), (0, 600)], 2);

        let mut reader = Context::default().reader(&path).unwrap();
        assert!(!reader.manager().is_ordered());
        assert!(reader.seek(0, 100).is_err());
        // overlapping nodes are read one after the other
        assert_eq!(
            read_positions(&mut reader),
            vec![(0, 100), (0, 500), (0, 200), (0, 600)]
        );
    }
}
