use std::{env, fs, io};

use anyhow::Result;
use gtb::{
    codec::GenotypeCall, edit, Context, ExtractRequest, Extractor, GenotypeCodec, StatsRunner,
    Variant, WriterBuilder,
};
use log::info;
use rand::{rngs::SmallRng, Rng, SeedableRng};

const NUM_SUBJECTS: usize = 1000;
const NUM_SITES: u32 = 20_000;
const NUM_CHROMOSOMES: u8 = 3;

/// Random genotypes with mostly biallelic sites and a few missing calls
fn random_variants(rng: &mut SmallRng, phased: bool) -> Result<Vec<Variant>> {
    let codec = GenotypeCodec::new(phased);
    let mut variants = Vec::with_capacity(NUM_SITES as usize);
    let mut calls = Vec::with_capacity(NUM_SUBJECTS);
    for site in 0..NUM_SITES {
        let chromosome = (site * u32::from(NUM_CHROMOSOMES) / NUM_SITES) as u8;
        let position = 10_000 + site * 13;
        let multiallelic = rng.random_bool(0.05);
        let (alt, max_allele): (&[u8], u8) = if multiallelic { (b"C,T", 2) } else { (b"C", 1) };
        let frequency = rng.random_range(0.01..0.5);

        calls.clear();
        for _ in 0..NUM_SUBJECTS {
            if rng.random_bool(0.01) {
                calls.push(GenotypeCall::missing(2));
                continue;
            }
            let mut haplotype = || {
                if rng.random_bool(frequency) {
                    rng.random_range(1..=max_allele)
                } else {
                    0
                }
            };
            let (first, second) = (haplotype(), haplotype());
            calls.push(GenotypeCall::diploid(first, second));
        }
        variants.push(Variant::from_calls(chromosome, position, b"A", alt, &calls, codec)?);
    }
    Ok(variants)
}

fn main() -> Result<()> {
    env_logger::init();
    let dir = env::temp_dir().join(format!("gtb-demo-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    let path = dir.join("demo.gtb");

    let mut rng = SmallRng::seed_from_u64(42);
    let variants = random_variants(&mut rng, true)?;
    let subjects = (0..NUM_SUBJECTS).map(|i| format!("S{i:04}")).collect();
    WriterBuilder::new()
        .phased(true)
        .block_size_type(3)
        .reference("GRCh38")
        .build_parallel(&path, subjects)?
        .encode(variants)?;
    info!(
        "Encoded {NUM_SITES} sites x {NUM_SUBJECTS} subjects into {} bytes",
        fs::metadata(&path)?.len()
    );

    let context = Context::default();
    let manager = context.open(&path)?;
    info!(
        "{} nodes, {} variants, ordered: {}",
        manager.tree().num_nodes(),
        manager.num_variants(),
        manager.is_ordered()
    );

    let mut reader = context.reader(&path)?;
    reader.select_subjects(&["S0001", "S0500"])?;
    if reader.seek(1, 100_000)? {
        if let Some(variant) = reader.read_variant()? {
            info!(
                "First site of chromosome 2 at or after 100000: {} ({} alt alleles)",
                variant.position,
                variant.alternative_allele_count()
            );
        }
    }

    let trimmed = dir.join("trimmed.gtb");
    edit::apply(
        &context,
        &path,
        &trimmed,
        &edit::Edit::RetainChromosomes(vec![0]),
    )?;
    StatsRunner::new()
        .chromosomes(vec![0])
        .run(&context, &trimmed, io::sink())?;

    Extractor::new()
        .subjects(vec!["S0000".into(), "S0001".into(), "S0002".into()])
        .run(
            &context,
            &path,
            &ExtractRequest::Range {
                chromosome: 0,
                start: 10_000,
                end: 10_200,
            },
            io::BufWriter::new(io::stdout()),
        )?;

    fs::remove_dir_all(&dir)?;
    Ok(())
}
