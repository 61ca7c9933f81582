//! Writing GTB files
//!
//! Both writers share one configuration layer, [`WriterBuilder`], and one file
//! lifecycle:
//!
//! 1. the preamble (header, reference line, subject blob) is written to
//!    `<path>.tmp` with the `finished` bit cleared;
//! 2. node payloads are appended as blocks complete;
//! 3. `finish` appends the footer, patches the header with the node count and
//!    the `ordered` and `finished` flags, and renames the file into place.
//!
//! A writer dropped before `finish` removes its temporary file, so a failed or
//! aborted run never leaves a file that looks complete.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info};

use crate::{
    codec,
    compress::CompressorKind,
    core::{
        block_size_of, covering_block_size_type, fit_block_size_type, serialize_nodes,
        validate_compression_level, FileHeader, Node, Tree,
    },
    encoder::{BlockEncoder, EncodedBlock},
    error::WriteError,
    pipeline::{OutputSink, Pipeline, TaskProcessor, TaskSender},
    variant::Variant,
    Result, DEFAULT_BLOCK_SIZE_TYPE, DEFAULT_COMPRESSION_LEVEL, DEFAULT_WINDOW,
    MAX_BLOCK_SIZE, MAX_BLOCK_SIZE_TYPE, MAX_NODES,
};

/// Builder for [`GtbWriter`] and [`ParallelEncoder`]
///
/// | Setting | Default |
/// |---------|---------|
/// | `phased` | `false` |
/// | `block_size_type` | [`DEFAULT_BLOCK_SIZE_TYPE`] (16384 records) |
/// | `block_limit` | derived from the block size type |
/// | `compressor` | [`CompressorKind::Zstd`] |
/// | `compression_level` | [`DEFAULT_COMPRESSION_LEVEL`] |
/// | `reorder` | `true` |
/// | `window` | [`DEFAULT_WINDOW`] |
/// | `reference` | empty |
/// | `threads` | `0` (all cores) |
#[derive(Debug, Clone)]
pub struct WriterBuilder {
    phased: bool,
    block_size_type: u8,
    block_limit: Option<usize>,
    compressor: CompressorKind,
    compression_level: u8,
    reorder: bool,
    window: usize,
    reference: String,
    threads: usize,
}
impl Default for WriterBuilder {
    fn default() -> Self {
        Self {
            phased: false,
            block_size_type: DEFAULT_BLOCK_SIZE_TYPE,
            block_limit: None,
            compressor: CompressorKind::Zstd,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            reorder: true,
            window: DEFAULT_WINDOW,
            reference: String::new(),
            threads: 0,
        }
    }
}
impl WriterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the order of haplotypes within each call
    #[must_use]
    pub fn phased(mut self, phased: bool) -> Self {
        self.phased = phased;
        self
    }

    /// Block size type `t` for `2^(7 + t)` records per node
    ///
    /// Lowered automatically when the subject count does not fit.
    #[must_use]
    pub fn block_size_type(mut self, block_size_type: u8) -> Self {
        self.block_size_type = block_size_type;
        self
    }

    /// Explicit number of records per node in `1..=16384`
    #[must_use]
    pub fn block_limit(mut self, limit: usize) -> Self {
        self.block_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn compressor(mut self, compressor: CompressorKind) -> Self {
        self.compressor = compressor;
        self
    }

    #[must_use]
    pub fn compression_level(mut self, level: u8) -> Self {
        self.compression_level = level;
        self
    }

    /// Toggle the row-reordering heuristic
    #[must_use]
    pub fn reorder(mut self, reorder: bool) -> Self {
        self.reorder = reorder;
        self
    }

    /// Number of feature windows of the reordering heuristic
    #[must_use]
    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Reference genome label stored in the file (a single line)
    #[must_use]
    pub fn reference<S: Into<String>>(mut self, reference: S) -> Self {
        self.reference = reference.into();
        self
    }

    /// Number of encoder threads of a [`ParallelEncoder`] (0 uses every core)
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Creates a single-threaded, push-based writer
    pub fn build<P: AsRef<Path>>(self, path: P, subjects: Vec<String>) -> Result<GtbWriter> {
        let layout = self.resolve(&subjects)?;
        let file = self.create(path.as_ref(), &layout, &subjects)?;
        let encoder = self.encoder(subjects.len());
        Ok(GtbWriter {
            file,
            header: layout.header,
            encoder,
            block_limit: layout.block_limit,
            num_subjects: subjects.len(),
            phased: self.phased,
            batch: Vec::with_capacity(layout.block_limit),
            block: EncodedBlock::default(),
            nodes: Vec::new(),
        })
    }

    /// Creates an encoder that compresses blocks on the pipeline
    pub fn build_parallel<P: AsRef<Path>>(
        self,
        path: P,
        subjects: Vec<String>,
    ) -> Result<ParallelEncoder> {
        let layout = self.resolve(&subjects)?;
        let file = self.create(path.as_ref(), &layout, &subjects)?;
        Ok(ParallelEncoder {
            file,
            header: layout.header,
            block_limit: layout.block_limit,
            num_subjects: subjects.len(),
            config: self,
        })
    }

    fn encoder(&self, num_subjects: usize) -> BlockEncoder {
        BlockEncoder::new(
            num_subjects,
            self.phased,
            self.compressor.build(self.compression_level),
        )
        .with_reorder(self.reorder, self.window)
    }

    /// Validates the options against a subject list
    fn resolve(&self, subjects: &[String]) -> Result<Layout> {
        if subjects.is_empty() {
            return Err(WriteError::MissingSubjects.into());
        }
        let mut seen = std::collections::HashSet::with_capacity(subjects.len());
        for name in subjects {
            if name.is_empty() || name.contains('\t') || !seen.insert(name.as_str()) {
                return Err(WriteError::InvalidSubjectName(name.clone()).into());
            }
        }
        if self.reference.contains('\n') {
            return Err(WriteError::InvalidReference.into());
        }
        if self.block_size_type > MAX_BLOCK_SIZE_TYPE {
            return Err(WriteError::InvalidBlockSizeType(self.block_size_type).into());
        }
        validate_compression_level(self.compression_level)?;

        let (block_size_type, block_limit) = match self.block_limit {
            Some(limit) if !(1..=MAX_BLOCK_SIZE).contains(&limit) => {
                return Err(WriteError::InvalidBlockSize(limit).into());
            }
            Some(limit) => {
                let block_size_type =
                    fit_block_size_type(covering_block_size_type(limit), subjects.len())?;
                (block_size_type, limit.min(block_size_of(block_size_type)))
            }
            None => {
                let block_size_type = fit_block_size_type(self.block_size_type, subjects.len())?;
                (block_size_type, block_size_of(block_size_type))
            }
        };
        let header = FileHeader::new(
            self.phased,
            block_size_type,
            self.compressor,
            self.compression_level,
        );
        Ok(Layout {
            header,
            block_limit,
        })
    }

    /// Creates the temporary file and writes the preamble
    fn create(&self, path: &Path, layout: &Layout, subjects: &[String]) -> Result<PendingFile> {
        let joined = subjects.join("\t");
        let mut blob = Vec::new();
        self.compressor
            .build(self.compression_level)
            .compress(joined.as_bytes(), &mut blob)?;

        let mut file = PendingFile::create(path)?;
        file.write_all(layout.header.as_bytes())?;
        file.write_all(self.reference.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_u32::<LittleEndian>(u32::try_from(blob.len()).map_err(|_| {
            WriteError::TooManySubjects {
                subjects: subjects.len(),
                max: crate::core::MAX_SUBJECTS,
                block_size: layout.block_limit,
            }
        })?)?;
        file.write_all(&blob)?;
        debug!(
            "Created {} with {} subjects, block limit {}",
            file.temp.display(),
            subjects.len(),
            layout.block_limit
        );
        Ok(file)
    }
}

/// Header and node limit derived from validated options
struct Layout {
    header: FileHeader,
    block_limit: usize,
}

/// A file under construction at `<path>.tmp`
///
/// Only [`commit`](PendingFile::commit) moves it to its final path. Dropping an
/// uncommitted file removes it.
pub(crate) struct PendingFile {
    path: PathBuf,
    temp: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}
impl PendingFile {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        let writer = BufWriter::new(File::create(&temp)?);
        Ok(Self {
            path: path.to_path_buf(),
            temp,
            writer: Some(writer),
            bytes_written: 0,
        })
    }

    /// Number of bytes written so far
    pub(crate) fn position(&self) -> u64 {
        self.bytes_written
    }

    /// Rewrites the header and renames the file into place
    pub(crate) fn commit(mut self, header: &FileHeader) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Err(io::Error::other("pending file already committed").into());
        };
        let outcome = Self::complete(writer, header, &self.temp, &self.path);
        if outcome.is_err() {
            let _ = fs::remove_file(&self.temp);
        }
        outcome
    }

    fn complete(
        writer: BufWriter<File>,
        header: &FileHeader,
        temp: &Path,
        path: &Path,
    ) -> Result<()> {
        let mut file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(temp, path)?;
        Ok(())
    }

    fn inner(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("pending file already committed"))
    }
}
impl Write for PendingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner()?.write(buf)?;
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner()?.flush()
    }
}
impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            // uncommitted: discard the partial file
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Appends the footer and completes the file
pub(crate) fn finalize(mut file: PendingFile, mut header: FileHeader, nodes: &[Node]) -> Result<()> {
    if nodes.len() > MAX_NODES {
        return Err(WriteError::TooManyNodes(nodes.len()).into());
    }
    let footer = serialize_nodes(nodes)?;
    file.write_all(&footer)?;

    let mut tree = Tree::new();
    for node in nodes {
        tree.add(*node);
    }
    tree.flush(false);

    header.set_node_count(nodes.len() as u32);
    header.set_ordered(tree.is_ordered());
    header.set_finished(true);

    info!(
        "Wrote {}: {} nodes, {} variants, {} bytes (ordered: {})",
        file.path.display(),
        nodes.len(),
        tree.num_variants(),
        file.position(),
        header.is_ordered()
    );
    file.commit(&header)
}

/// Single-threaded, push-based writer
///
/// Variants are buffered until the chromosome changes or the block is full, then
/// encoded and appended. Call [`finish`](GtbWriter::finish) to complete the file.
pub struct GtbWriter {
    file: PendingFile,
    header: FileHeader,
    encoder: BlockEncoder,
    block_limit: usize,
    num_subjects: usize,
    phased: bool,
    batch: Vec<Variant>,
    block: EncodedBlock,
    nodes: Vec<Node>,
}
impl GtbWriter {
    /// Adds a variant
    ///
    /// Unphased writers canonicalise the calls. The variant is validated before
    /// it is buffered, so a rejected variant leaves the writer unchanged.
    pub fn push(&mut self, variant: &Variant) -> Result<()> {
        if self
            .batch
            .last()
            .is_some_and(|last| last.chromosome != variant.chromosome)
        {
            self.flush()?;
        }

        let mut owned = variant.clone();
        if !self.phased {
            for beg in &mut owned.begs {
                *beg = codec::to_unphased(*beg);
            }
        }
        owned.validate(self.num_subjects, self.encoder.codec())?;
        self.batch.push(owned);

        if self.batch.len() >= self.block_limit {
            self.flush()?;
        }
        Ok(())
    }

    /// Number of completed nodes
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn block_limit(&self) -> usize {
        self.block_limit
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.encoder.encode(&self.batch, &mut self.block)?;
        self.block.write_to(&mut self.file)?;
        if let Some(node) = self.block.node {
            self.nodes.push(node);
        }
        self.batch.clear();
        Ok(())
    }

    /// Flushes the last block, writes the footer, and renames the file into place
    pub fn finish(mut self) -> Result<()> {
        self.flush()?;
        finalize(self.file, self.header, &self.nodes)
    }
}

/// Encodes a record stream on the pipeline
///
/// The generator cuts the stream into blocks at chromosome changes and at the
/// block limit, workers compress the blocks, and a sink appends them to the file
/// in input order.
pub struct ParallelEncoder {
    file: PendingFile,
    header: FileHeader,
    block_limit: usize,
    num_subjects: usize,
    config: WriterBuilder,
}
impl ParallelEncoder {
    #[must_use]
    pub fn block_limit(&self) -> usize {
        self.block_limit
    }

    /// Encodes every record and completes the file
    ///
    /// On any failure the temporary file is removed and nothing is renamed.
    pub fn encode<I>(self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Variant>,
        I::IntoIter: Send,
    {
        let Self {
            file,
            header,
            block_limit,
            num_subjects,
            config,
        } = self;
        let pipeline = Pipeline::new(config.threads);
        let records = records.into_iter();

        let generator = move |sender: &TaskSender<Vec<Variant>>| -> Result<()> {
            let mut batch: Vec<Variant> = Vec::with_capacity(block_limit);
            for variant in records {
                let boundary = batch.len() >= block_limit
                    || batch
                        .last()
                        .is_some_and(|last| last.chromosome != variant.chromosome);
                if boundary && !sender.send(std::mem::take(&mut batch)) {
                    return Ok(());
                }
                batch.push(variant);
            }
            if !batch.is_empty() {
                sender.send(batch);
            }
            Ok(())
        };
        let factory = |_slot: usize| -> Result<BlockWorker> {
            Ok(BlockWorker {
                encoder: config.encoder(num_subjects),
                phased: config.phased,
            })
        };
        let sink = pipeline.run(
            generator,
            factory,
            BlockSink {
                file,
                nodes: Vec::new(),
            },
        )?;
        finalize(sink.file, header, &sink.nodes)
    }
}

/// Worker state of a [`ParallelEncoder`]
struct BlockWorker {
    encoder: BlockEncoder,
    phased: bool,
}
impl TaskProcessor<Vec<Variant>> for BlockWorker {
    type Output = EncodedBlock;

    fn process(&mut self, mut task: Vec<Variant>, output: &mut EncodedBlock) -> Result<()> {
        if !self.phased {
            for variant in &mut task {
                for beg in &mut variant.begs {
                    *beg = codec::to_unphased(*beg);
                }
            }
        }
        self.encoder.encode(&task, output)
    }
}

/// Appends encoded blocks in order and collects their nodes
struct BlockSink {
    file: PendingFile,
    nodes: Vec<Node>,
}
impl OutputSink<EncodedBlock> for BlockSink {
    fn write(&mut self, _slot: usize, output: &EncodedBlock) -> Result<()> {
        output.write_to(&mut self.file)?;
        if let Some(node) = output.node {
            self.nodes.push(node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        codec::{GenotypeCall, GenotypeCodec},
        error::{EncodingError, Error},
        manager::{Context, Manager},
    };

    fn subjects(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("sample_{i}")).collect()
    }

    fn random_variants(
        rng: &mut SmallRng,
        sites: &[(u8, u32)],
        num_subjects: usize,
        phased: bool,
    ) -> Vec<Variant> {
        let codec = GenotypeCodec::new(phased);
        sites
            .iter()
            .map(|&(chromosome, position)| {
                let multi = rng.random_bool(0.2);
                let max_allele = if multi { 3 } else { 1 };
                let alt: &[u8] = if multi { b"C,G,T" } else { b"C" };
                let calls = (0..num_subjects)
                    .map(|_| {
                        if rng.random_bool(0.05) {
                            GenotypeCall::missing(2)
                        } else {
                            GenotypeCall::diploid(
                                rng.random_range(0..=max_allele),
                                rng.random_range(0..=max_allele),
                            )
                        }
                    })
                    .collect::<Vec<_>>();
                Variant::from_calls(chromosome, position, b"A", alt, &calls, codec).unwrap()
            })
            .collect()
    }

    fn read_all(path: &Path) -> Vec<Variant> {
        let mut reader = Context::default().reader(path).unwrap();
        let mut out = Vec::new();
        while let Some(variant) = reader.read_variant().unwrap() {
            out.push(variant);
        }
        out
    }

    fn sites(count: u32) -> Vec<(u8, u32)> {
        (0..count)
            .map(|i| (u8::from(i >= count / 2), 1000 + i * 7))
            .collect()
    }

    // ==================== Builder Tests ====================

    #[test]
    fn test_builder_rejects_bad_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gtb");
        let cases: Vec<(WriterBuilder, Vec<String>)> = vec![
            (WriterBuilder::new(), Vec::new()),
            (WriterBuilder::new(), vec!["a\tb".into()]),
            (WriterBuilder::new(), vec![String::new()]),
            (WriterBuilder::new(), vec!["a".into(), "a".into()]),
            (WriterBuilder::new().block_size_type(8), subjects(2)),
            (WriterBuilder::new().block_limit(0), subjects(2)),
            (WriterBuilder::new().block_limit(MAX_BLOCK_SIZE + 1), subjects(2)),
            (WriterBuilder::new().compression_level(32), subjects(2)),
            (WriterBuilder::new().reference("a\nb"), subjects(2)),
        ];
        for (builder, names) in cases {
            let err = builder.build(&path, names).err().unwrap();
            assert!(matches!(err, Error::WriteError(_)), "{err}");
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_block_limit_sets_covering_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limit.gtb");
        let writer = WriterBuilder::new()
            .block_limit(300)
            .build(&path, subjects(3))
            .unwrap();
        assert_eq!(writer.block_limit(), 300);
        assert_eq!(writer.header.block_size(), 512);
    }

    // ==================== Writer Tests ====================

    #[test]
    fn test_round_trip_remainders() {
        // N mod g covers every tail length of both group sizes
        for num_subjects in [3, 4, 5, 6, 7] {
            for phased in [true, false] {
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("round.gtb");
                let mut rng = SmallRng::seed_from_u64(num_subjects as u64);
                let variants = random_variants(&mut rng, &sites(40), num_subjects, phased);

                let mut writer = WriterBuilder::new()
                    .phased(phased)
                    .block_limit(8)
                    .build(&path, subjects(num_subjects))
                    .unwrap();
                for variant in &variants {
                    writer.push(variant).unwrap();
                }
                writer.finish().unwrap();

                let decoded = read_all(&path);
                assert_eq!(decoded.len(), variants.len());
                for (expected, found) in variants.iter().zip(&decoded) {
                    assert_eq!(found.position, expected.position);
                    assert_eq!(found.alt_allele, expected.alt_allele);
                    assert_eq!(found.begs, expected.begs);
                }
            }
        }
    }

    #[test]
    fn test_unphased_writer_canonicalises() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canon.gtb");
        let phased = GenotypeCodec::new(true);
        let variant = Variant::from_calls(
            0,
            10,
            b"A",
            b"C",
            &[GenotypeCall::diploid(1, 0), GenotypeCall::diploid(0, 1)],
            phased,
        )
        .unwrap();
        let mut writer = WriterBuilder::new().build(&path, subjects(2)).unwrap();
        writer.push(&variant).unwrap();
        writer.finish().unwrap();

        let decoded = read_all(&path);
        let het = GenotypeCodec::new(false).encode(0, 1).unwrap();
        assert_eq!(decoded[0].begs, vec![het, het]);
    }

    #[test]
    fn test_rejected_variant_leaves_writer_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reject.gtb");
        let codec = GenotypeCodec::new(false);
        let mut writer = WriterBuilder::new().build(&path, subjects(2)).unwrap();
        let short =
            Variant::from_calls(0, 1, b"A", b"C", &[GenotypeCall::diploid(0, 1)], codec).unwrap();
        assert!(writer.push(&short).is_err());

        let good = Variant::from_calls(
            0,
            2,
            b"A",
            b"C",
            &[GenotypeCall::diploid(0, 1), GenotypeCall::missing(2)],
            codec,
        )
        .unwrap();
        writer.push(&good).unwrap();
        writer.finish().unwrap();
        assert_eq!(read_all(&path).len(), 1);
    }

    #[test]
    fn test_push_rejects_delimiter_in_alleles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alleles.gtb");
        let codec = GenotypeCodec::new(false);
        let calls = [GenotypeCall::diploid(0, 1), GenotypeCall::diploid(1, 1)];
        let mut writer = WriterBuilder::new().build(&path, subjects(2)).unwrap();

        let slash = Variant::from_calls(0, 10, b"A", b"C/G", &calls, codec).unwrap();
        assert!(matches!(
            writer.push(&slash),
            Err(Error::EncodingError(EncodingError::ReservedAlleleByte { byte: b'/', .. }))
        ));
        let tab = Variant::from_calls(0, 15, b"A\tT", b"C", &calls, codec).unwrap();
        assert!(writer.push(&tab).is_err());

        let good = Variant::from_calls(0, 20, b"T", b"A", &calls, codec).unwrap();
        writer.push(&good).unwrap();
        writer.finish().unwrap();

        let decoded = read_all(&path);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].position, 20);
        assert_eq!(decoded[0].ref_allele, b"T");
        assert_eq!(decoded[0].alt_allele, b"A");
    }

    #[test]
    fn test_push_rejects_allele_beyond_alt_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range.gtb");
        let codec = GenotypeCodec::new(false);
        let mut writer = WriterBuilder::new().build(&path, subjects(2)).unwrap();
        let calls = [GenotypeCall::diploid(0, 5), GenotypeCall::diploid(1, 2)];
        let variant = Variant::from_calls(0, 10, b"A", b"C,G", &calls, codec).unwrap();
        assert!(matches!(
            writer.push(&variant),
            Err(Error::EncodingError(EncodingError::AlleleOutOfRange { allele: 5, .. }))
        ));
    }

    #[test]
    fn test_chromosome_change_flushes_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.gtb");
        let mut rng = SmallRng::seed_from_u64(1);
        let variants = random_variants(&mut rng, &[(0, 1), (0, 2), (2, 3)], 4, false);
        let mut writer = WriterBuilder::new().build(&path, subjects(4)).unwrap();
        for variant in &variants {
            writer.push(variant).unwrap();
        }
        assert_eq!(writer.num_nodes(), 1);
        writer.finish().unwrap();

        let manager = Manager::open(&path).unwrap();
        assert_eq!(manager.tree().chromosomes(), vec![0, 2]);
    }

    #[test]
    fn test_dropped_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.gtb");
        {
            let mut rng = SmallRng::seed_from_u64(2);
            let mut writer = WriterBuilder::new().build(&path, subjects(3)).unwrap();
            for variant in random_variants(&mut rng, &sites(4), 3, false) {
                writer.push(&variant).unwrap();
            }
        }
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_store_compressor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.gtb");
        let mut rng = SmallRng::seed_from_u64(3);
        let variants = random_variants(&mut rng, &sites(10), 5, true);
        let mut writer = WriterBuilder::new()
            .phased(true)
            .compressor(CompressorKind::Store)
            .reorder(false)
            .build(&path, subjects(5))
            .unwrap();
        for variant in &variants {
            writer.push(variant).unwrap();
        }
        writer.finish().unwrap();

        let manager = Manager::open(&path).unwrap();
        assert_eq!(manager.compressor_kind(), CompressorKind::Store);
        let decoded = read_all(&path);
        assert_eq!(
            decoded.iter().map(|v| &v.begs).collect::<Vec<_>>(),
            variants.iter().map(|v| &v.begs).collect::<Vec<_>>()
        );
    }

    // ==================== Parallel Tests ====================

    #[test]
    fn test_parallel_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(4);
        let variants = random_variants(&mut rng, &sites(100), 6, false);

        let sequential = dir.path().join("sequential.gtb");
        let mut writer = WriterBuilder::new()
            .block_limit(7)
            .build(&sequential, subjects(6))
            .unwrap();
        for variant in &variants {
            writer.push(variant).unwrap();
        }
        writer.finish().unwrap();

        let parallel = dir.path().join("parallel.gtb");
        WriterBuilder::new()
            .block_limit(7)
            .threads(3)
            .build_parallel(&parallel, subjects(6))
            .unwrap()
            .encode(variants.clone())
            .unwrap();

        assert_eq!(fs::read(&sequential).unwrap(), fs::read(&parallel).unwrap());
        assert_eq!(read_all(&parallel).len(), variants.len());
    }

    #[test]
    fn test_parallel_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.gtb");
        let mut rng = SmallRng::seed_from_u64(5);
        let mut variants = random_variants(&mut rng, &sites(50), 4, false);
        variants[30].begs.pop();

        let err = WriterBuilder::new()
            .block_limit(4)
            .threads(2)
            .build_parallel(&path, subjects(4))
            .unwrap()
            .encode(variants)
            .err()
            .unwrap();
        assert!(err.is_pipeline_failure());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_parallel_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gtb");
        WriterBuilder::new()
            .build_parallel(&path, subjects(2))
            .unwrap()
            .encode(Vec::new())
            .unwrap();
        let manager = Manager::open(&path).unwrap();
        assert_eq!(manager.num_variants(), 0);
        assert!(manager.is_ordered());
    }
}
