use std::error::Error as StdError;

/// Custom Result type for gtb operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the gtb library, encompassing all possible error cases
/// that can occur while encoding, indexing, or reading genotype blocks.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed or truncated header, footer, or payload
    #[error("Error processing file format: {0}")]
    FormatError(#[from] FormatError),

    /// A request outside of the available data
    #[error("Out of bounds: {0}")]
    BoundsError(#[from] BoundsError),

    /// A genotype byte or variant that cannot be represented
    #[error("Error encoding genotypes: {0}")]
    EncodingError(#[from] EncodingError),

    /// A concurrent run aborted
    #[error("Pipeline failed: {0}")]
    PipelineFailure(#[from] PipelineFailure),

    /// Errors that occur during write operations
    #[error("Error writing file: {0}")]
    WriteError(#[from] WriteError),

    /// Standard I/O errors
    #[error("Error with IO: {0}")]
    ResourceError(#[from] std::io::Error),

    /// UTF-8 conversion errors
    #[error("Error with UTF8: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),

    /// Generic errors for other unexpected situations
    #[error("Generic error: {0}")]
    GenericError(#[from] Box<dyn StdError + Send + Sync>),
}
impl Error {
    /// Checks if the error was raised while opening or parsing a file
    #[must_use]
    pub fn is_format(&self) -> bool {
        matches!(self, Self::FormatError(_))
    }

    /// Checks if the error is the failure of a concurrent run
    #[must_use]
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(self, Self::PipelineFailure(_))
    }
}

/// Errors specific to the on-disk layout of a GTB file
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    /// The file ended before the named section could be read
    #[error("File truncated while reading {section} (needed {needed} bytes, found {found})")]
    Truncated {
        section: &'static str,
        needed: usize,
        found: usize,
    },

    /// The reserved bits of the flag bytes are not zero
    #[error("Invalid reserved bits in file flags: {0:#06x}")]
    InvalidReservedBits(u16),

    /// The writer never completed this file
    #[error("File was not finalized by its writer")]
    Unfinished,

    /// The compressor id stored in the header is not known
    #[error("Unknown compressor id: {0}")]
    UnknownCompressor(u8),

    /// The footer size does not match the declared node count
    ///
    /// # Arguments
    /// * First `usize` - The number of footer bytes found
    /// * Second `usize` - The number of footer bytes expected
    #[error("Footer size mismatch: found {0} bytes, expected {1}")]
    FooterSize(usize, usize),

    /// A node's payload region extends past the end of the footer start
    #[error("Node payload at offset {offset} (length {length}) exceeds payload region ({limit})")]
    PayloadOverflow { offset: u64, length: u64, limit: u64 },

    /// A decompressed stream has an unexpected length
    #[error("Decompressed {stream} stream has {found} bytes, expected {expected}")]
    StreamSize {
        stream: &'static str,
        found: usize,
        expected: usize,
    },

    /// The allele stream holds fewer records than the node declares
    #[error("Allele stream holds {found} records, expected {expected}")]
    AlleleCount { found: usize, expected: usize },

    /// Random access was requested on a file without an ordered index
    #[error("Random access requires an ordered file")]
    UnorderedFile,

    /// The underlying compressor failed
    #[error("Compressor error: {0}")]
    Compressor(String),
}

/// Requests outside of the range covered by a file
#[derive(thiserror::Error, Debug)]
pub enum BoundsError {
    /// A subject name that is not part of the file
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    /// A subject index beyond the number of subjects
    #[error("Subject index ({requested_index}) is out of range ({max_index})")]
    SubjectOutOfRange {
        requested_index: usize,
        max_index: usize,
    },

    /// A chromosome that has no nodes in the file
    #[error("Chromosome {0} is not present")]
    MissingChromosome(u8),

    /// A node index beyond the end of a chromosome's node list
    #[error("Node index ({requested_index}) is out of range ({max_index}) on chromosome {chromosome}")]
    NodeOutOfRange {
        chromosome: u8,
        requested_index: usize,
        max_index: usize,
    },

    /// A variant index beyond the end of a node
    #[error("Variant index ({requested_index}) is out of range ({max_index})")]
    VariantOutOfRange {
        requested_index: usize,
        max_index: usize,
    },

    #[error("Invalid range specified: start ({start}) is greater than end ({end})")]
    InvalidRange { start: usize, end: usize },
}

/// Errors raised when genotype codes or variants cannot be represented
#[derive(thiserror::Error, Debug)]
pub enum EncodingError {
    /// A BEG byte outside the active alphabet
    #[error("Invalid BEG code {code} for {} {} row", phase_name(.phased), row_name(.biallelic))]
    InvalidBeg {
        code: u8,
        phased: bool,
        biallelic: bool,
    },

    /// An MBEG byte outside the packed alphabet
    #[error("Invalid MBEG code {code} for {} file", phase_name(.phased))]
    InvalidMbeg { code: u8, phased: bool },

    /// An allele index that does not fit the genotype alphabet
    #[error("Allele index {0} exceeds the supported maximum of 14")]
    AlleleIndexOverflow(u8),

    /// A variant with more alleles than the alphabet supports
    #[error("Variant at position {position} has {alleles} alleles (max 15)")]
    TooManyAlleles { position: u32, alleles: usize },

    /// A call referencing an allele the variant does not declare
    #[error("Call at position {position} references allele {allele} but the site has {alleles} alleles")]
    AlleleOutOfRange {
        position: u32,
        allele: u8,
        alleles: usize,
    },

    /// A REF or ALT allele that is empty
    #[error("Variant at position {position} has an empty {field} allele")]
    EmptyAllele { position: u32, field: &'static str },

    /// A REF or ALT allele containing a byte reserved by the allele stream
    #[error("Variant at position {position} has a {field} allele containing reserved byte {byte:#04x}")]
    ReservedAlleleByte {
        position: u32,
        field: &'static str,
        byte: u8,
    },

    /// The number of genotypes in a variant does not match the subject count
    #[error("Variant at position {position} has {found} genotypes, expected {expected}")]
    SubjectCountMismatch {
        position: u32,
        found: usize,
        expected: usize,
    },

    /// A ploidy other than 1 or 2
    #[error("Unsupported ploidy: {0}")]
    InvalidPloidy(u8),

    /// Allele text would exceed the maximum stream size
    #[error("Allele stream would grow to {requested} bytes, beyond the maximum of {limit}")]
    AlleleStreamOverflow { requested: usize, limit: usize },

    /// A compressed stream larger than its footer field can address
    #[error("Compressed {stream} stream of {size} bytes does not fit its footer field")]
    StreamTooLarge { stream: &'static str, size: usize },

    /// A block must hold variants of a single chromosome
    #[error("Block of chromosome {expected} received a variant of chromosome {found}")]
    MixedChromosomes { expected: u8, found: u8 },

    /// A block was requested with no variants
    #[error("Cannot encode an empty block")]
    EmptyBlock,
}

fn phase_name(phased: &bool) -> &'static str {
    if *phased {
        "phased"
    } else {
        "unphased"
    }
}

fn row_name(biallelic: &bool) -> &'static str {
    if *biallelic {
        "biallelic"
    } else {
        "multiallelic"
    }
}

/// Failures of a concurrent run
#[derive(thiserror::Error, Debug)]
pub enum PipelineFailure {
    /// A worker returned an error while processing a task
    #[error("Worker {slot} failed: {source}")]
    Worker {
        slot: usize,
        #[source]
        source: Box<Error>,
    },

    /// The task generator returned an error
    #[error("Task generator failed: {0}")]
    Generator(#[source] Box<Error>),

    /// The output sink rejected a write
    #[error("Output sink failed on worker {slot}: {source}")]
    Sink {
        slot: usize,
        #[source]
        source: Box<Error>,
    },

    /// A thread panicked
    #[error("Thread {0} panicked")]
    Panicked(String),
}

/// Errors that can occur while configuring or driving a writer
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    /// No subjects were given to the writer
    #[error("Writer requires at least one subject")]
    MissingSubjects,

    /// Subject count beyond what any block size supports
    #[error("{subjects} subjects exceed the maximum of {max} supported at block size {block_size}")]
    TooManySubjects {
        subjects: usize,
        max: usize,
        block_size: usize,
    },

    /// An explicit block size outside of `1..=16384`
    #[error("Invalid block size {0}: expected 1..=16384")]
    InvalidBlockSize(usize),

    /// A block size type beyond the 3-bit header field
    #[error("Invalid block size type {0}: expected 0..=7")]
    InvalidBlockSizeType(u8),

    /// A subject name that cannot be stored in the tab-joined subject blob
    #[error("Invalid subject name: {0:?}")]
    InvalidSubjectName(String),

    /// More nodes than the 24-bit node count can record
    #[error("{0} nodes exceed the maximum of 16777215")]
    TooManyNodes(usize),

    /// A compression level the header cannot record
    #[error("Invalid compression level {0}: expected 0..=31")]
    InvalidCompressionLevel(u8),

    /// Inputs to a concat or edit that cannot be combined
    #[error("Cannot combine files: {0}")]
    IncompatibleFiles(String),

    /// The input and output paths of an edit are the same
    #[error("Output path equals input path: {0}")]
    SamePath(String),

    /// The reference line contains a newline
    #[error("Reference must be a single line")]
    InvalidReference,
}

/// Trait for converting arbitrary errors into `Error`
pub trait IntoGtbError {
    fn into_gtb_error(self) -> Error;
}

// Implement conversion for Box<dyn Error>
impl<E> IntoGtbError for E
where
    E: StdError + Send + Sync + 'static,
{
    fn into_gtb_error(self) -> Error {
        Error::GenericError(Box::new(self))
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    // ==================== Conversion Tests ====================

    #[test]
    fn test_format_error_converts() {
        let err: Error = FormatError::Unfinished.into();
        assert!(err.is_format());
        assert!(!err.is_pipeline_failure());
    }

    #[test]
    fn test_io_error_is_resource_error() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, Error::ResourceError(_)));
    }

    #[test]
    fn test_pipeline_failure_wraps_source() {
        let inner: Error = BoundsError::MissingChromosome(3).into();
        let err: Error = PipelineFailure::Worker {
            slot: 2,
            source: Box::new(inner),
        }
        .into();
        assert!(err.is_pipeline_failure());
        let msg = err.to_string();
        assert!(msg.contains("Worker 2"));
        assert!(msg.contains("Chromosome 3"));
    }

    #[test]
    fn test_into_gtb_error() {
        let err = std::fmt::Error.into_gtb_error();
        assert!(matches!(err, Error::GenericError(_)));
    }

    // ==================== Display Tests ====================

    #[test]
    fn test_invalid_beg_display() {
        let err = EncodingError::InvalidBeg {
            code: 9,
            phased: true,
            biallelic: true,
        };
        assert_eq!(err.to_string(), "Invalid BEG code 9 for phased biallelic row");
    }
}
