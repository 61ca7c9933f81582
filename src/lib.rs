//! # GTB
//!
//! A compressed, random-access block format for genotype matrices (subjects by
//! variant sites).
//!
//! Each subject's call at a site is reduced to a one byte BEG code. Biallelic
//! sites pack 3 (phased) or 4 (unphased) codes into every byte. Runs of up to
//! `block size` sites of one chromosome form a node whose genotype, position,
//! and allele streams are compressed independently. A footer indexes the nodes
//! by chromosome and position so that readers decompress only what they need.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ flags (2B) | node count (3B) │
//! │ reference line + '\n'        │
//! │ subject blob length (4B)     │
//! │ compressed subject blob      │
//! ├──────────────────────────────┤
//! │ node 0: genotype|pos|allele  │
//! │ node 1: genotype|pos|allele  │
//! │ ...                          │
//! ├──────────────────────────────┤
//! │ footer: 25B per node         │
//! └──────────────────────────────┘
//! ```
//!
//! Writing goes through [`WriterBuilder`], reading through a [`Context`] which
//! opens [`Manager`]s and hands out [`Reader`]s. Whole-file passes (extraction,
//! encoding, statistics) run on the ordered [`pipeline`].

mod core;

pub mod chromosome;
pub mod codec;
pub mod compress;
pub mod edit;
pub mod encoder;
pub mod error;
pub mod extract;
pub mod manager;
pub mod pipeline;
pub mod read;
pub mod stats;
pub mod variant;
pub mod write;

pub use self::core::{
    block_size_of, max_subjects_of, BlockCache, FileHeader, Node, NodeList, NodePayload, Tree,
    NODE_RECORD_SIZE,
};
pub use chromosome::{ChromosomeRegistry, HumanRegistry};
pub use codec::{GenotypeCall, GenotypeCodec, SampleSlot};
pub use compress::{Compressor, CompressorKind};
pub use edit::Edit;
pub use encoder::{BlockEncoder, EncodedBlock};
pub use error::{Error, IntoGtbError, Result};
pub use extract::{ExtractRequest, Extractor};
pub use manager::{Context, Manager};
pub use pipeline::{OutputSink, Pipeline, TaskProcessor, TaskSender, WriterSink};
pub use read::{Cursor, Reader};
pub use stats::{AlleleStats, StatsRunner};
pub use variant::Variant;
pub use write::{GtbWriter, ParallelEncoder, WriterBuilder};

/// Largest block size type (`2^(7 + 7)` = 16384 records per node)
pub const MAX_BLOCK_SIZE_TYPE: u8 = 7;

/// Largest compression level the header can record
pub const MAX_COMPRESSION_LEVEL: u8 = 31;

/// Largest explicit block limit
pub const MAX_BLOCK_SIZE: usize = 1 << 14;

/// Largest number of nodes in one file (24-bit node count)
pub const MAX_NODES: usize = (1 << 24) - 1;

pub const DEFAULT_BLOCK_SIZE_TYPE: u8 = 7;
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 16;

/// Default number of feature windows of the row-reordering heuristic
pub const DEFAULT_WINDOW: usize = 24;

/// Pipeline queue capacity per worker
pub const QUEUE_FACTOR: usize = 4;
