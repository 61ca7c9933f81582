//! Allele statistics
//!
//! Per-variant allele counts (AC), allele numbers (AN), frequencies (AF), and
//! missing call counts. [`StatsRunner`] writes them as a tab-separated table
//! with one row per variant, computed node by node on the pipeline.

use std::{io::Write, path::Path, sync::Arc};

use log::info;

use crate::{
    chromosome::ChromosomeRegistry,
    manager::Context,
    pipeline::{Pipeline, TaskProcessor, WriterSink},
    read::Reader,
    variant::Variant,
    Result,
};

/// Column names of the statistics table
pub const STATS_COLUMNS: [&str; 8] = ["CHROM", "POS", "REF", "ALT", "AC", "AN", "AF", "MISSING"];

/// Allele counts of one variant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlleleStats {
    /// Count of each alternative allele, in ALT order
    pub allele_counts: Vec<u32>,
    /// Number of called alleles
    pub allele_number: u32,
    /// Number of missing calls
    pub missing: usize,
}
impl AlleleStats {
    #[must_use]
    pub fn from_variant(variant: &Variant) -> Self {
        let mut stats = Self::default();
        stats.update(variant);
        stats
    }

    /// Recomputes the statistics in place
    pub fn update(&mut self, variant: &Variant) {
        let counts = variant.allele_counts();
        self.allele_counts.clear();
        self.allele_counts.extend_from_slice(&counts[1..]);
        self.allele_number = variant.allele_number();
        self.missing = variant.missing_count();
    }

    /// Count of all alternative alleles
    #[must_use]
    pub fn total_alternative(&self) -> u32 {
        self.allele_counts.iter().sum()
    }

    /// Frequencies of the alternative alleles, `0.0` when nothing is called
    pub fn allele_frequencies(&self) -> impl Iterator<Item = f64> + '_ {
        let an = self.allele_number;
        self.allele_counts.iter().map(move |ac| {
            if an == 0 {
                0.0
            } else {
                f64::from(*ac) / f64::from(an)
            }
        })
    }

    /// Appends `AC=..;AN=..;AF=..`
    pub fn write_info(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.extend_from_slice(b"AC=");
        self.write_counts(dst);
        dst.extend_from_slice(b";AN=");
        dst.extend_from_slice(itoa::Buffer::new().format(self.allele_number).as_bytes());
        dst.extend_from_slice(b";AF=");
        self.write_frequencies(dst)?;
        Ok(())
    }

    fn write_counts(&self, dst: &mut Vec<u8>) {
        let mut buffer = itoa::Buffer::new();
        for (index, count) in self.allele_counts.iter().enumerate() {
            if index > 0 {
                dst.push(b',');
            }
            dst.extend_from_slice(buffer.format(*count).as_bytes());
        }
    }

    fn write_frequencies(&self, dst: &mut Vec<u8>) -> Result<()> {
        for (index, frequency) in self.allele_frequencies().enumerate() {
            if index > 0 {
                dst.push(b',');
            }
            write!(dst, "{frequency:.8}")?;
        }
        Ok(())
    }

    /// Appends one tab-separated table row
    pub fn write_row(&self, chromosome: &str, variant: &Variant, dst: &mut Vec<u8>) -> Result<()> {
        let mut buffer = itoa::Buffer::new();
        dst.extend_from_slice(chromosome.as_bytes());
        dst.push(b'\t');
        dst.extend_from_slice(buffer.format(variant.position).as_bytes());
        dst.push(b'\t');
        dst.extend_from_slice(&variant.ref_allele);
        dst.push(b'\t');
        dst.extend_from_slice(&variant.alt_allele);
        dst.push(b'\t');
        self.write_counts(dst);
        dst.push(b'\t');
        dst.extend_from_slice(buffer.format(self.allele_number).as_bytes());
        dst.push(b'\t');
        self.write_frequencies(dst)?;
        dst.push(b'\t');
        dst.extend_from_slice(buffer.format(self.missing).as_bytes());
        dst.push(b'\n');
        Ok(())
    }
}

/// Writes the statistics table of a file
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct StatsRunner {
    threads: Option<usize>,
    chromosomes: Option<Vec<u8>>,
}
impl StatsRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the context's thread count
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Restricts the table to some chromosomes
    pub fn chromosomes(mut self, chromosomes: Vec<u8>) -> Self {
        self.chromosomes = Some(chromosomes);
        self
    }

    /// Writes the header line and one row per variant, in file order
    pub fn run<P: AsRef<Path>, W: Write + Send>(
        &self,
        context: &Context,
        path: P,
        mut writer: W,
    ) -> Result<W> {
        let manager = context.open(path)?;
        let mut tasks = Vec::new();
        for list in manager.tree().lists() {
            let chromosome = list.chromosome();
            if self
                .chromosomes
                .as_ref()
                .is_some_and(|visible| !visible.contains(&chromosome))
            {
                continue;
            }
            tasks.extend((0..list.len()).map(|node| (chromosome, node)));
        }

        writer.write_all(STATS_COLUMNS.join("\t").as_bytes())?;
        writer.write_all(b"\n")?;

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
                let mut reader = Reader::new(manager.clone(), context.registry().clone());
                reader.set_phased(false);
                reader.set_decode_genotypes(true);
                Ok(StatsWorker {
                    reader,
                    registry: context.registry().clone(),
                    variant: Variant::default(),
                    stats: AlleleStats::default(),
                })
            },
            WriterSink::new(writer),
        )?;
        info!(
            "Computed statistics of {num_tasks} nodes ({} bytes)",
            sink.bytes_written()
        );
        Ok(sink.into_inner())
    }
}

struct StatsWorker {
    reader: Reader,
    registry: Arc<dyn ChromosomeRegistry>,
    variant: Variant,
    stats: AlleleStats,
}
impl TaskProcessor<(u8, usize)> for StatsWorker {
    type Output = Vec<u8>;

    fn process(&mut self, (chromosome, node): (u8, usize), output: &mut Vec<u8>) -> Result<()> {
        output.clear();
        self.reader.limit_nodes(chromosome, node..node + 1)?;
        let name = self.registry.name_of(chromosome);
        while self.reader.read_variant_into(&mut self.variant)? {
            self.stats.update(&self.variant);
            self.stats.write_row(&name, &self.variant, output)?;
        }
        Ok(())
    }
}
