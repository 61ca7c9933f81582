use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{BoundsError, EncodingError, FormatError},
    Result,
};

use super::utils::{class_capacity, Span};

/// Size of one serialized node record
pub const NODE_RECORD_SIZE: usize = 25;

/// Largest compressed position stream a node record can describe (24 bits)
pub const MAX_POSITION_STREAM: u32 = (1 << 24) - 1;

/// The fixed-width footer record of a node
///
/// This is stored identically in memory and on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct NodeRecord {
    chromosome: u8,
    min_pos: [u8; 4],
    max_pos: [u8; 4],
    biallelic: [u8; 2],
    multiallelic: [u8; 2],
    genotype_size: [u8; 4],
    position_size: [u8; 3],
    allele_size: [u8; 4],
    size_class: u8,
}

/// A block descriptor: one independently compressed run of variants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    /// Chromosome index of every variant in the node
    pub chromosome: u8,
    /// Smallest position in the node
    pub min_pos: u32,
    /// Largest position in the node
    pub max_pos: u32,
    /// Number of biallelic (packed) rows
    pub biallelic: u16,
    /// Number of multiallelic (raw) rows
    pub multiallelic: u16,
    /// Compressed genotype stream size
    pub genotype_size: u32,
    /// Compressed position stream size
    pub position_size: u32,
    /// Compressed allele stream size
    pub allele_size: u32,
    /// Size classes of the uncompressed streams
    pub size_class: u8,
    /// Absolute offset of the first payload byte within its source file
    pub offset: u64,
    /// Tag of the file this node's payload lives in
    pub source: u16,
}
impl Node {
    #[must_use]
    pub fn from_record(record: &NodeRecord, offset: u64, source: u16) -> Self {
        Self {
            chromosome: record.chromosome,
            min_pos: u32::from_le_bytes(record.min_pos),
            max_pos: u32::from_le_bytes(record.max_pos),
            biallelic: u16::from_le_bytes(record.biallelic),
            multiallelic: u16::from_le_bytes(record.multiallelic),
            genotype_size: u32::from_le_bytes(record.genotype_size),
            position_size: LittleEndian::read_u24(&record.position_size),
            allele_size: u32::from_le_bytes(record.allele_size),
            size_class: record.size_class,
            offset,
            source,
        }
    }

    pub fn to_record(&self) -> Result<NodeRecord> {
        if self.position_size > MAX_POSITION_STREAM {
            return Err(EncodingError::StreamTooLarge {
                stream: "position",
                size: self.position_size as usize,
            }
            .into());
        }
        let mut position_size = [0u8; 3];
        LittleEndian::write_u24(&mut position_size, self.position_size);
        Ok(NodeRecord {
            chromosome: self.chromosome,
            min_pos: self.min_pos.to_le_bytes(),
            max_pos: self.max_pos.to_le_bytes(),
            biallelic: self.biallelic.to_le_bytes(),
            multiallelic: self.multiallelic.to_le_bytes(),
            genotype_size: self.genotype_size.to_le_bytes(),
            position_size,
            allele_size: self.allele_size.to_le_bytes(),
            size_class: self.size_class,
        })
    }

    /// Total number of variants
    #[must_use]
    pub fn num_variants(&self) -> usize {
        usize::from(self.biallelic) + usize::from(self.multiallelic)
    }

    /// Total size of the three compressed streams
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        u64::from(self.genotype_size) + u64::from(self.position_size) + u64::from(self.allele_size)
    }

    /// The contiguous byte range of all three streams
    #[must_use]
    pub fn payload_span(&self) -> Span {
        Span::new(self.offset, self.payload_len())
    }

    #[must_use]
    pub fn genotype_span(&self) -> Span {
        Span::new(self.offset, u64::from(self.genotype_size))
    }

    #[must_use]
    pub fn position_span(&self) -> Span {
        Span::new(self.genotype_span().end(), u64::from(self.position_size))
    }

    #[must_use]
    pub fn allele_span(&self) -> Span {
        Span::new(self.position_span().end(), u64::from(self.allele_size))
    }

    /// Upper bound on the decompressed genotype stream
    #[must_use]
    pub fn genotype_hint(&self) -> usize {
        class_capacity(self.size_class >> 4)
    }

    /// Upper bound on the decompressed position and allele streams
    #[must_use]
    pub fn allele_hint(&self) -> usize {
        class_capacity(self.size_class & 0x0F)
    }

    #[must_use]
    pub fn contains(&self, position: u32) -> bool {
        self.min_pos <= position && position <= self.max_pos
    }

    #[must_use]
    pub fn intersects(&self, lo: u32, hi: u32) -> bool {
        self.max_pos >= lo && self.min_pos <= hi
    }

    fn sort_key(&self) -> (u32, u32, u16, u64) {
        (self.min_pos, self.max_pos, self.source, self.offset)
    }
}

/// The ordered nodes of a single chromosome
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeList {
    chromosome: u8,
    nodes: Vec<Node>,
}
impl NodeList {
    #[must_use]
    pub fn new(chromosome: u8) -> Self {
        Self {
            chromosome,
            nodes: Vec::new(),
        }
    }

    #[must_use]
    pub fn chromosome(&self) -> u8 {
        self.chromosome
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    #[must_use]
    pub fn num_variants(&self) -> usize {
        self.nodes.iter().map(Node::num_variants).sum()
    }

    /// Index of the first node whose range reaches `position`
    ///
    /// Only meaningful for an ordered list.
    #[must_use]
    pub fn find(&self, position: u32) -> Option<usize> {
        let index = self.nodes.partition_point(|node| node.max_pos < position);
        (index < self.nodes.len()).then_some(index)
    }

    /// Whether any node overlaps `[lo, hi]`
    #[must_use]
    pub fn intersects(&self, lo: u32, hi: u32) -> bool {
        self.nodes.iter().any(|node| node.intersects(lo, hi))
    }

    /// Nodes are sorted by `min_pos` and no node starts before the previous one ends
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.nodes
            .windows(2)
            .all(|pair| pair[0].min_pos <= pair[1].min_pos && pair[0].max_pos <= pair[1].min_pos)
    }

    fn push(&mut self, node: Node) {
        self.nodes.push(node);
    }

    fn flush(&mut self, drop_duplicates: bool) {
        self.nodes.sort_by_key(Node::sort_key);
        if drop_duplicates {
            self.nodes.dedup();
        }
    }

    fn check_indices(&self, indices: &[usize]) -> Result<()> {
        match indices.iter().find(|index| **index >= self.nodes.len()) {
            Some(&index) => Err(BoundsError::NodeOutOfRange {
                chromosome: self.chromosome,
                requested_index: index,
                max_index: self.nodes.len(),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn retain_indices(&mut self, indices: &[usize], keep: bool) {
        let mut position = 0;
        self.nodes.retain(|_| {
            let selected = indices.contains(&position);
            position += 1;
            selected == keep
        });
    }
}
impl<'a> IntoIterator for &'a NodeList {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;
    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// Serializes nodes into footer records in iteration order
pub fn serialize_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for node in nodes {
        bytes.extend_from_slice(bytemuck::bytes_of(&node.to_record()?));
    }
    Ok(bytes)
}

/// The chromosome-indexed block index of one or more files
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    lists: BTreeMap<u8, NodeList>,
}
impl Tree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a footer, assigning offsets in footer order starting at `payload_start`
    pub fn deserialize(bytes: &[u8], payload_start: u64, source: u16) -> Result<Self> {
        if bytes.len() % NODE_RECORD_SIZE != 0 {
            return Err(FormatError::FooterSize(
                bytes.len(),
                bytes.len() / NODE_RECORD_SIZE * NODE_RECORD_SIZE,
            )
            .into());
        }
        let mut tree = Self::new();
        let mut offset = payload_start;
        for chunk in bytes.chunks_exact(NODE_RECORD_SIZE) {
            let record: NodeRecord = bytemuck::pod_read_unaligned(chunk);
            let node = Node::from_record(&record, offset, source);
            offset += node.payload_len();
            tree.add(node);
        }
        Ok(tree)
    }

    /// Serializes every node in tree order
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize_nodes(self.iter())
    }

    pub fn add(&mut self, node: Node) {
        self.lists
            .entry(node.chromosome)
            .or_insert_with(|| NodeList::new(node.chromosome))
            .push(node);
    }

    #[must_use]
    pub fn nodes_of(&self, chromosome: u8) -> Option<&NodeList> {
        self.lists.get(&chromosome)
    }

    #[must_use]
    pub fn contains(&self, chromosome: u8) -> bool {
        self.lists.contains_key(&chromosome)
    }

    /// Chromosome indices in ascending order
    #[must_use]
    pub fn chromosomes(&self) -> Vec<u8> {
        self.lists.keys().copied().collect()
    }

    /// Iterates over every node, chromosome by chromosome
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.lists.values().flat_map(NodeList::iter)
    }

    pub fn lists(&self) -> impl Iterator<Item = &NodeList> {
        self.lists.values()
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.lists.values().map(NodeList::len).sum()
    }

    #[must_use]
    pub fn num_variants(&self) -> usize {
        self.lists.values().map(NodeList::num_variants).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn remove_chromosomes(&mut self, chromosomes: &[u8]) {
        self.lists.retain(|chromosome, _| !chromosomes.contains(chromosome));
    }

    pub fn retain_chromosomes(&mut self, chromosomes: &[u8]) {
        self.lists.retain(|chromosome, _| chromosomes.contains(chromosome));
    }

    /// Removes nodes of one chromosome by their index in the list
    pub fn remove_nodes(&mut self, chromosome: u8, indices: &[usize]) -> Result<()> {
        self.edit_nodes(chromosome, indices, false)
    }

    /// Keeps only the listed nodes of one chromosome
    pub fn retain_nodes(&mut self, chromosome: u8, indices: &[usize]) -> Result<()> {
        self.edit_nodes(chromosome, indices, true)
    }

    fn edit_nodes(&mut self, chromosome: u8, indices: &[usize], keep: bool) -> Result<()> {
        let list = self
            .lists
            .get_mut(&chromosome)
            .ok_or(BoundsError::MissingChromosome(chromosome))?;
        list.check_indices(indices)?;
        list.retain_indices(indices, keep);
        if list.is_empty() {
            self.lists.remove(&chromosome);
        }
        Ok(())
    }

    /// Sorts every list by position and drops empty lists
    ///
    /// With `drop_duplicates`, nodes equal in range and payload location
    /// (offset and source tag) are kept once.
    pub fn flush(&mut self, drop_duplicates: bool) {
        self.lists.retain(|_, list| !list.is_empty());
        for list in self.lists.values_mut() {
            list.flush(drop_duplicates);
        }
    }

    /// Whether every chromosome's list is ordered
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.lists.values().all(NodeList::is_ordered)
    }

    /// Tags every node with the file its payload lives in
    pub fn bind(&mut self, source: u16) {
        for list in self.lists.values_mut() {
            for node in &mut list.nodes {
                node.source = source;
            }
        }
    }

    /// Appends all nodes of `other`, keeping their source tags
    pub fn merge(&mut self, other: &Tree) {
        for node in other.iter() {
            self.add(*node);
        }
    }
}
