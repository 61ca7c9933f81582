//! Opened files and the context that caches them
//!
//! A [`Manager`] memory-maps one GTB file and owns its parsed header, subject
//! list, and block index. Managers are immutable once opened and are shared
//! between workers through an [`Arc`]; each worker reads payload bytes straight
//! from the shared mapping.

use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use memchr::memchr;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::{
    chromosome::{ChromosomeRegistry, HumanRegistry},
    compress::{Compressor, CompressorKind},
    core::{
        FileHeader, Node, NodeList, NodePayload, Span, Tree, MAX_STREAM_BYTES, NODE_RECORD_SIZE,
    },
    error::{BoundsError, FormatError},
    read::Reader,
    Result,
};

const SUBJECT_LENGTH_BYTES: usize = 4;

/// A memory-mapped, fully validated GTB file
pub struct Manager {
    path: PathBuf,
    mmap: Mmap,
    header: FileHeader,
    compressor: CompressorKind,
    ordered: bool,
    reference: String,
    subjects: Vec<String>,
    subject_lookup: HashMap<String, usize>,
    /// Length prefix and compressed subject blob
    subject_span: Span,
    payload_span: Span,
    tree: Tree,
}
impl Manager {
    /// Opens and validates a file
    ///
    /// Fails on a truncated or unfinished file, unknown flags, or a footer that
    /// does not fit the payload region.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file) }?;

        let header = FileHeader::from_bytes(&mmap)?;
        if !header.is_finished() {
            return Err(FormatError::Unfinished.into());
        }
        let compressor = header.compressor()?;
        let mut cursor = size_of::<FileHeader>();

        // reference line
        let newline = memchr(b'\n', &mmap[cursor..]).ok_or(FormatError::Truncated {
            section: "reference",
            needed: 1,
            found: 0,
        })?;
        let reference = std::str::from_utf8(&mmap[cursor..cursor + newline])?.to_string();
        cursor += newline + 1;

        // subject blob
        let subject_start = cursor;
        let length_bytes = section(&mmap, cursor, SUBJECT_LENGTH_BYTES, "subject length")?;
        let blob_len = LittleEndian::read_u32(length_bytes) as usize;
        cursor += SUBJECT_LENGTH_BYTES;
        let blob = section(&mmap, cursor, blob_len, "subject blob")?;
        cursor += blob_len;
        let subject_span = Span::new(subject_start as u64, (cursor - subject_start) as u64);

        let mut names = Vec::new();
        compressor
            .build(header.compression_level())
            .decompress(blob, &mut names, MAX_STREAM_BYTES)?;
        let subjects = std::str::from_utf8(&names)?
            .split('\t')
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        let subject_lookup = subjects
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();

        // footer
        let footer_len = header.node_count() as usize * NODE_RECORD_SIZE;
        let footer_start = mmap
            .len()
            .checked_sub(footer_len)
            .filter(|start| *start >= cursor)
            .ok_or(FormatError::Truncated {
                section: "footer",
                needed: cursor + footer_len,
                found: mmap.len(),
            })?;
        let payload_span = Span::new(cursor as u64, (footer_start - cursor) as u64);
        let mut tree = Tree::deserialize(&mmap[footer_start..], cursor as u64, 0)?;
        let payload_len = tree.iter().map(Node::payload_len).sum::<u64>();
        if payload_len > payload_span.len() {
            return Err(FormatError::PayloadOverflow {
                offset: cursor as u64,
                length: payload_len,
                limit: payload_span.len(),
            }
            .into());
        }
        tree.flush(false);
        let ordered = header.is_ordered() && tree.is_ordered();

        debug!(
            "Opened {}: {} subjects, {} nodes, {} variants",
            path.display(),
            subjects.len(),
            tree.num_nodes(),
            tree.num_variants()
        );
        Ok(Self {
            path,
            mmap,
            header,
            compressor,
            ordered,
            reference,
            subjects,
            subject_lookup,
            subject_span,
            payload_span,
            tree,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> FileHeader {
        self.header
    }

    #[must_use]
    pub fn is_phased(&self) -> bool {
        self.header.is_phased()
    }

    /// Whether nodes are position-ascending and non-overlapping per chromosome
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.header.block_size()
    }

    #[must_use]
    pub fn compressor_kind(&self) -> CompressorKind {
        self.compressor
    }

    #[must_use]
    pub fn compression_level(&self) -> u8 {
        self.header.compression_level()
    }

    /// A fresh compressor matching this file's backend
    #[must_use]
    pub fn new_compressor(&self) -> Box<dyn Compressor> {
        self.compressor.build(self.compression_level())
    }

    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    #[must_use]
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    #[must_use]
    pub fn num_subjects(&self) -> usize {
        self.subjects.len()
    }

    #[must_use]
    pub fn subject_index(&self, name: &str) -> Option<usize> {
        self.subject_lookup.get(name).copied()
    }

    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    #[must_use]
    pub fn num_variants(&self) -> usize {
        self.tree.num_variants()
    }

    pub fn nodes_of(&self, chromosome: u8) -> Result<&NodeList> {
        self.tree
            .nodes_of(chromosome)
            .ok_or_else(|| BoundsError::MissingChromosome(chromosome).into())
    }

    /// Node `index` of a chromosome
    pub fn node(&self, chromosome: u8, index: usize) -> Result<&Node> {
        let list = self.nodes_of(chromosome)?;
        list.get(index).ok_or_else(|| {
            BoundsError::NodeOutOfRange {
                chromosome,
                requested_index: index,
                max_index: list.len(),
            }
            .into()
        })
    }

    /// The compressed streams of a node
    pub fn payload(&self, node: &Node) -> Result<NodePayload<'_>> {
        let bytes = self.raw_payload(node)?;
        let genotype_end = node.genotype_size as usize;
        let position_end = genotype_end + node.position_size as usize;
        Ok(NodePayload {
            genotype: &bytes[..genotype_end],
            position: &bytes[genotype_end..position_end],
            allele: &bytes[position_end..],
        })
    }

    /// The contiguous payload bytes of a node
    pub fn raw_payload(&self, node: &Node) -> Result<&[u8]> {
        let span = node.payload_span();
        if span.offset() < self.payload_span.offset() || span.end() > self.payload_span.end() {
            return Err(FormatError::PayloadOverflow {
                offset: span.offset(),
                length: span.len(),
                limit: self.payload_span.end(),
            }
            .into());
        }
        Ok(&self.mmap[span.range()])
    }

    /// Length prefix and compressed subject blob, as stored
    #[must_use]
    pub fn raw_subjects(&self) -> &[u8] {
        &self.mmap[self.subject_span.range()]
    }

    /// Creates a reader over this file
    #[must_use]
    pub fn reader(self: &Arc<Self>, registry: Arc<dyn ChromosomeRegistry>) -> Reader {
        Reader::new(self.clone(), registry)
    }
}

fn section<'a>(bytes: &'a [u8], start: usize, len: usize, name: &'static str) -> Result<&'a [u8]> {
    bytes.get(start..start + len).ok_or_else(|| {
        FormatError::Truncated {
            section: name,
            needed: start + len,
            found: bytes.len(),
        }
        .into()
    })
}

/// Explicit replacement for process-wide registries
///
/// A context owns the chromosome registry and a cache of opened files. Every
/// reader, writer, and edit takes one explicitly, so independent contexts can
/// coexist in one process.
pub struct Context {
    registry: Arc<dyn ChromosomeRegistry>,
    managers: Mutex<HashMap<PathBuf, Arc<Manager>>>,
    num_threads: usize,
}
impl Default for Context {
    fn default() -> Self {
        Self::new(HumanRegistry)
    }
}
impl Context {
    pub fn new<R: ChromosomeRegistry + 'static>(registry: R) -> Self {
        Self::with_registry(Arc::new(registry))
    }

    #[must_use]
    pub fn with_registry(registry: Arc<dyn ChromosomeRegistry>) -> Self {
        Self {
            registry,
            managers: Mutex::new(HashMap::new()),
            num_threads: 0,
        }
    }

    /// Sets the default worker count of pipelines (0 uses every core)
    #[must_use]
    pub fn threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ChromosomeRegistry> {
        &self.registry
    }

    /// Opens a file, reusing a cached manager when the same path was opened before
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Manager>> {
        let key = cache_key(path.as_ref());
        if let Some(manager) = self.managers.lock().get(&key) {
            return Ok(manager.clone());
        }
        let manager = Arc::new(Manager::open(path)?);
        self.managers.lock().insert(key, manager.clone());
        Ok(manager)
    }

    /// Opens a file and creates a reader over it
    pub fn reader<P: AsRef<Path>>(&self, path: P) -> Result<Reader> {
        let manager = self.open(path)?;
        Ok(Reader::new(manager, self.registry.clone()))
    }

    /// Drops a cached manager, e.g. after the file was replaced
    pub fn evict<P: AsRef<Path>>(&self, path: P) {
        self.managers.lock().remove(&cache_key(path.as_ref()));
    }

    pub fn clear(&self) {
        self.managers.lock().clear();
    }

    #[must_use]
    pub fn num_cached(&self) -> usize {
        self.managers.lock().len()
    }
}

fn cache_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
