//! Extraction into VCF-like text
//!
//! An [`ExtractRequest`] is first planned into node tasks: each task names one
//! node and a filter for the records inside it. Nodes whose `[min, max]` range
//! cannot match are never decompressed. The tasks then run on the pipeline,
//! every worker owning its own [`Reader`], and the text reaches the writer in
//! node order.

use std::{io::Write, path::Path, sync::Arc};

use log::info;

use crate::{
    chromosome::ChromosomeRegistry,
    codec,
    error::BoundsError,
    manager::{Context, Manager},
    pipeline::{Pipeline, TaskProcessor, WriterSink},
    read::Reader,
    stats::AlleleStats,
    variant::Variant,
    Result,
};

const FILE_FORMAT: &str = "##fileformat=VCFv4.2";
const INFO_LINES: [&str; 3] = [
    "##INFO=<ID=AC,Number=A,Type=Integer,Description=\"Allele count in genotypes\">",
    "##INFO=<ID=AN,Number=1,Type=Integer,Description=\"Total number of alleles in called genotypes\">",
    "##INFO=<ID=AF,Number=A,Type=Float,Description=\"Allele frequency\">",
];
const FORMAT_LINE: &str = "##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">";
const COLUMNS: &str = "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO";

/// Which records to extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractRequest {
    /// Every record
    All,
    /// Every record of some chromosomes
    Chromosomes(Vec<u8>),
    /// Records with `start <= position <= end`
    Range { chromosome: u8, start: u32, end: u32 },
    /// Records at exact positions
    Positions { chromosome: u8, positions: Vec<u32> },
    /// Every record of some nodes
    Nodes { chromosome: u8, indices: Vec<usize> },
}

/// Records of a node that pass a request
#[derive(Debug, Clone)]
enum Filter {
    All,
    Range { start: u32, end: u32 },
    /// Sorted, deduplicated positions
    Positions(Arc<[u32]>),
}
impl Filter {
    fn accepts(&self, position: u32) -> bool {
        match self {
            Self::All => true,
            Self::Range { start, end } => (*start..=*end).contains(&position),
            Self::Positions(positions) => positions.binary_search(&position).is_ok(),
        }
    }

    /// Nothing at or after `position` can pass
    fn exhausted(&self, position: u32) -> bool {
        match self {
            Self::All => false,
            Self::Range { end, .. } => position > *end,
            Self::Positions(positions) => !positions.last().is_some_and(|last| position <= *last),
        }
    }

    fn overlaps(&self, min: u32, max: u32) -> bool {
        match self {
            Self::All => true,
            Self::Range { start, end } => max >= *start && min <= *end,
            Self::Positions(positions) => {
                let first = positions.partition_point(|p| *p < min);
                positions.get(first).is_some_and(|p| *p <= max)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ExtractTask {
    chromosome: u8,
    node: usize,
    filter: Filter,
}

/// Resolves a request into node tasks in file order
fn plan(manager: &Manager, request: &ExtractRequest) -> Result<Vec<ExtractTask>> {
    let whole = |chromosome: u8| -> Result<Vec<ExtractTask>> {
        let list = manager.nodes_of(chromosome)?;
        Ok((0..list.len())
            .map(|node| ExtractTask {
                chromosome,
                node,
                filter: Filter::All,
            })
            .collect())
    };
    let filtered = |chromosome: u8, filter: Filter| -> Result<Vec<ExtractTask>> {
        let list = manager.nodes_of(chromosome)?;
        let mut tasks = Vec::new();
        // ordered lists are sorted by both bounds, so the scan can start late and stop early
        let first = if manager.is_ordered() {
            match &filter {
                Filter::Range { start, .. } => list.find(*start).unwrap_or(list.len()),
                Filter::Positions(positions) => positions
                    .first()
                    .and_then(|first| list.find(*first))
                    .unwrap_or(list.len()),
                Filter::All => 0,
            }
        } else {
            0
        };
        for (node, entry) in list.iter().enumerate().skip(first) {
            if manager.is_ordered() && filter.exhausted(entry.min_pos) {
                break;
            }
            if filter.overlaps(entry.min_pos, entry.max_pos) {
                tasks.push(ExtractTask {
                    chromosome,
                    node,
                    filter: filter.clone(),
                });
            }
        }
        Ok(tasks)
    };

    match request {
        ExtractRequest::All => Ok(manager
            .tree()
            .chromosomes()
            .into_iter()
            .map(whole)
            .collect::<Result<Vec<_>>>()?
            .concat()),
        ExtractRequest::Chromosomes(chromosomes) => {
            let mut chromosomes = chromosomes.clone();
            chromosomes.sort_unstable();
            chromosomes.dedup();
            Ok(chromosomes
                .into_iter()
                .map(whole)
                .collect::<Result<Vec<_>>>()?
                .concat())
        }
        ExtractRequest::Range {
            chromosome,
            start,
            end,
        } => {
            if start > end {
                return Err(BoundsError::InvalidRange {
                    start: *start as usize,
                    end: *end as usize,
                }
                .into());
            }
            filtered(
                *chromosome,
                Filter::Range {
                    start: *start,
                    end: *end,
                },
            )
        }
        ExtractRequest::Positions {
            chromosome,
            positions,
        } => {
            let mut positions = positions.clone();
            positions.sort_unstable();
            positions.dedup();
            filtered(*chromosome, Filter::Positions(positions.into()))
        }
        ExtractRequest::Nodes {
            chromosome,
            indices,
        } => {
            let list = manager.nodes_of(*chromosome)?;
            let mut indices = indices.clone();
            indices.sort_unstable();
            indices.dedup();
            indices
                .into_iter()
                .map(|node| {
                    if node >= list.len() {
                        return Err(BoundsError::NodeOutOfRange {
                            chromosome: *chromosome,
                            requested_index: node,
                            max_index: list.len(),
                        }
                        .into());
                    }
                    Ok(ExtractTask {
                        chromosome: *chromosome,
                        node,
                        filter: Filter::All,
                    })
                })
                .collect()
        }
    }
}

/// Decompresses records into VCF-like text
///
/// ```text
/// CHROM  POS  .  REF  ALT  .  .  AC=..;AN=..;AF=..  GT  calls...
/// ```
///
/// The INFO column is computed over the selected subjects. With hidden
/// genotypes it is `.`, the FORMAT and call columns are left out, and genotype
/// streams are never decompressed.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct Extractor {
    subjects: Option<Vec<String>>,
    phased: Option<bool>,
    hide_genotypes: bool,
    threads: Option<usize>,
}
impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts only these subjects, in this order
    pub fn subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = Some(subjects);
        self
    }

    /// Overrides the phasing of the output (phased files can be written unphased)
    pub fn phased(mut self, phased: bool) -> Self {
        self.phased = Some(phased);
        self
    }

    pub fn hide_genotypes(mut self, hide: bool) -> Self {
        self.hide_genotypes = hide;
        self
    }

    /// Overrides the context's thread count
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Writes the header and every requested record to `writer`
    pub fn run<P: AsRef<Path>, W: Write + Send>(
        &self,
        context: &Context,
        path: P,
        request: &ExtractRequest,
        mut writer: W,
    ) -> Result<W> {
        let manager = context.open(path)?;
        let tasks = plan(&manager, request)?;

        // fails on unknown subjects before any output is written
        let template = self.reader(&manager, context.registry().clone())?;
        self.write_header(&manager, &template, context.registry(), &tasks, &mut writer)?;

        let num_tasks = tasks.len();
        let pipeline = Pipeline::new(self.threads.unwrap_or(context.num_threads()));
        let sink = pipeline.run(
            move |sender| {
                for task in tasks {
                    if !sender.send(task) {
                        break;
                    }
                }
                Ok(())
            },
            |_slot| {
                Ok(ExtractWorker {
                    reader: self.reader(&manager, context.registry().clone())?,
                    registry: context.registry().clone(),
                    hide_genotypes: self.hide_genotypes,
                    variant: Variant::default(),
                    stats: AlleleStats::default(),
                })
            },
            WriterSink::new(writer),
        )?;
        info!(
            "Extracted {num_tasks} nodes from {} ({} bytes)",
            manager.path().display(),
            sink.bytes_written()
        );
        Ok(sink.into_inner())
    }

    fn reader(&self, manager: &Arc<Manager>, registry: Arc<dyn ChromosomeRegistry>) -> Result<Reader> {
        let mut reader = Reader::new(manager.clone(), registry);
        if let Some(subjects) = &self.subjects {
            reader.select_subjects(subjects)?;
        }
        reader.set_phased(self.phased.unwrap_or(manager.is_phased()));
        reader.set_decode_genotypes(!self.hide_genotypes);
        Ok(reader)
    }

    fn write_header<W: Write>(
        &self,
        manager: &Manager,
        reader: &Reader,
        registry: &Arc<dyn ChromosomeRegistry>,
        tasks: &[ExtractTask],
        writer: &mut W,
    ) -> Result<()> {
        writeln!(writer, "{FILE_FORMAT}")?;
        writeln!(writer, "##reference={}", manager.reference())?;
        let mut contigs = tasks.iter().map(|task| task.chromosome).collect::<Vec<_>>();
        contigs.dedup();
        for chromosome in contigs {
            writeln!(writer, "##contig=<ID={}>", registry.name_of(chromosome))?;
        }
        if !self.hide_genotypes {
            for line in INFO_LINES {
                writeln!(writer, "{line}")?;
            }
            writeln!(writer, "{FORMAT_LINE}")?;
        }
        write!(writer, "{COLUMNS}")?;
        if !self.hide_genotypes {
            write!(writer, "\tFORMAT")?;
            for subject in reader.selected_subjects() {
                write!(writer, "\t{subject}")?;
            }
        }
        writeln!(writer)?;
        Ok(())
    }
}

struct ExtractWorker {
    reader: Reader,
    registry: Arc<dyn ChromosomeRegistry>,
    hide_genotypes: bool,
    variant: Variant,
    stats: AlleleStats,
}
impl ExtractWorker {
    fn write_record(&mut self, chromosome: &str, dst: &mut Vec<u8>) -> Result<()> {
        let variant = &self.variant;
        dst.extend_from_slice(chromosome.as_bytes());
        dst.push(b'\t');
        dst.extend_from_slice(itoa::Buffer::new().format(variant.position).as_bytes());
        dst.extend_from_slice(b"\t.\t");
        dst.extend_from_slice(&variant.ref_allele);
        dst.push(b'\t');
        dst.extend_from_slice(&variant.alt_allele);
        dst.extend_from_slice(b"\t.\t.\t");
        if self.hide_genotypes {
            dst.push(b'.');
        } else {
            self.stats.update(variant);
            self.stats.write_info(dst)?;
            dst.extend_from_slice(b"\tGT");
            for &beg in &variant.begs {
                dst.push(b'\t');
                codec::format_genotype(beg, variant.ploidy, variant.phased, dst);
            }
        }
        dst.push(b'\n');
        Ok(())
    }
}
impl TaskProcessor<ExtractTask> for ExtractWorker {
    type Output = Vec<u8>;

    fn process(&mut self, task: ExtractTask, output: &mut Vec<u8>) -> Result<()> {
        output.clear();
        self.reader
            .limit_nodes(task.chromosome, task.node..task.node + 1)?;
        let name = self.registry.name_of(task.chromosome);
        while self.reader.read_variant_into(&mut self.variant)? {
            if task.filter.exhausted(self.variant.position) {
                break;
            }
            if task.filter.accepts(self.variant.position) {
                self.write_record(&name, output)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        codec::{GenotypeCall, GenotypeCodec},
        write::WriterBuilder,
    };

    /// chr1: 100 200 | 350 400 | 500    chr2: 50 400
    fn write_sample(dir: &Path, phased: bool) -> PathBuf {
        let path = dir.join("extract.gtb");
        let codec = GenotypeCodec::new(phased);
        let mut writer = WriterBuilder::new()
            .phased(phased)
            .block_limit(2)
            .reference("GRCh38")
            .build(&path, vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        for (chromosome, position) in [(0, 100), (0, 200), (0, 350), (0, 400), (0, 500), (1, 50), (1, 400)] {
            let calls = [
                GenotypeCall::diploid(1, 0),
                GenotypeCall::diploid(1, 1),
                GenotypeCall::missing(2),
            ];
            writer
                .push(&Variant::from_calls(chromosome, position, b"A", b"T", &calls, codec).unwrap())
                .unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn extract(path: &Path, extractor: &Extractor, request: &ExtractRequest) -> String {
        let context = Context::default().threads(2);
        let out = extractor.run(&context, path, request, Vec::new()).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn records(text: &str) -> Vec<(String, u32)> {
        text.lines()
            .filter(|line| !line.starts_with('#'))
            .map(|line| {
                let mut fields = line.split('\t');
                let chromosome = fields.next().unwrap().to_string();
                let position = fields.next().unwrap().parse().unwrap();
                (chromosome, position)
            })
            .collect()
    }

    fn positions(text: &str) -> Vec<u32> {
        records(text).into_iter().map(|(_, position)| position).collect()
    }

    // ==================== Planning Tests ====================

    #[test]
    fn test_plan_skips_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::open(write_sample(dir.path(), false)).unwrap();

        let tasks = plan(
            &manager,
            &ExtractRequest::Range {
                chromosome: 0,
                start: 360,
                end: 450,
            },
        )
        .unwrap();
        assert_eq!(tasks.iter().map(|t| t.node).collect::<Vec<_>>(), vec![1]);

        let tasks = plan(
            &manager,
            &ExtractRequest::Positions {
                chromosome: 0,
                positions: vec![500, 100],
            },
        )
        .unwrap();
        assert_eq!(tasks.iter().map(|t| t.node).collect::<Vec<_>>(), vec![0, 2]);

        assert_eq!(plan(&manager, &ExtractRequest::All).unwrap().len(), 4);
    }

    #[test]
    fn test_plan_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::open(write_sample(dir.path(), false)).unwrap();
        let requests = [
            ExtractRequest::Chromosomes(vec![0, 5]),
            ExtractRequest::Range {
                chromosome: 0,
                start: 10,
                end: 5,
            },
            ExtractRequest::Nodes {
                chromosome: 0,
                indices: vec![3],
            },
            ExtractRequest::Positions {
                chromosome: 9,
                positions: vec![1],
            },
        ];
        for request in &requests {
            assert!(plan(&manager, request).is_err(), "{request:?}");
        }
    }

    // ==================== Output Tests ====================

    #[test]
    fn test_extract_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), true);
        let text = extract(&path, &Extractor::new(), &ExtractRequest::All);

        let header = text.lines().take_while(|l| l.starts_with('#')).collect::<Vec<_>>();
        assert_eq!(header[0], "##fileformat=VCFv4.2");
        assert_eq!(header[1], "##reference=GRCh38");
        assert_eq!(header[2], "##contig=<ID=1>");
        assert_eq!(header[3], "##contig=<ID=2>");
        assert_eq!(
            header.last().unwrap(),
            &"#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ta\tb\tc"
        );

        let body = text.lines().filter(|l| !l.starts_with('#')).collect::<Vec<_>>();
        assert_eq!(body.len(), 7);
        assert_eq!(
            body[0],
            "1\t100\t.\tA\tT\t.\t.\tAC=3;AN=4;AF=0.75000000\tGT\t1|0\t1|1\t.|."
        );
        assert!(body[6].starts_with("2\t400\t"));
    }

    #[test]
    fn test_extract_range_and_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), false);
        let extractor = Extractor::new();

        let range = ExtractRequest::Range {
            chromosome: 0,
            start: 200,
            end: 400,
        };
        assert_eq!(positions(&extract(&path, &extractor, &range)), vec![200, 350, 400]);

        let exact = ExtractRequest::Positions {
            chromosome: 0,
            positions: vec![350, 100, 999],
        };
        assert_eq!(positions(&extract(&path, &extractor, &exact)), vec![100, 350]);

        let nodes = ExtractRequest::Nodes {
            chromosome: 0,
            indices: vec![2, 0],
        };
        assert_eq!(positions(&extract(&path, &extractor, &nodes)), vec![100, 200, 500]);

        let chromosomes = ExtractRequest::Chromosomes(vec![1]);
        assert_eq!(
            records(&extract(&path, &extractor, &chromosomes)),
            vec![("2".to_string(), 50), ("2".to_string(), 400)]
        );
    }

    #[test]
    fn test_extract_subjects_and_phasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), true);
        let extractor = Extractor::new()
            .subjects(vec!["c".into(), "a".into()])
            .phased(false)
            .threads(1);
        let text = extract(
            &path,
            &extractor,
            &ExtractRequest::Positions {
                chromosome: 1,
                positions: vec![50],
            },
        );
        assert!(text.contains("FORMAT\tc\ta\n"));
        let body = text.lines().last().unwrap();
        assert_eq!(body, "2\t50\t.\tA\tT\t.\t.\tAC=1;AN=2;AF=0.50000000\tGT\t./.\t0/1");
    }

    #[test]
    fn test_extract_hidden_genotypes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), false);
        let text = extract(
            &path,
            &Extractor::new().hide_genotypes(true),
            &ExtractRequest::Range {
                chromosome: 1,
                start: 0,
                end: 100,
            },
        );
        assert!(!text.contains("FORMAT"));
        assert!(text.lines().any(|l| l == "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO"));
        assert_eq!(text.lines().last().unwrap(), "2\t50\t.\tA\tT\t.\t.\t.");
    }

    #[test]
    fn test_extract_unknown_subject_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), false);
        let context = Context::default();
        let mut out = Vec::new();
        let result = Extractor::new()
            .subjects(vec!["zz".into()])
            .run(&context, &path, &ExtractRequest::All, &mut out);
        assert!(result.is_err());
        assert!(out.is_empty());
    }
}
