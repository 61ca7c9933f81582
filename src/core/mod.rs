mod block;
mod header;
mod tree;
mod utils;

pub use block::{BlockCache, NodePayload};
pub use header::{
    block_size_of, covering_block_size_type, fit_block_size_type, max_subjects_of,
    validate_compression_level, FileHeader, MAX_STREAM_BYTES, MAX_SUBJECTS,
};
pub use tree::{serialize_nodes, Node, NodeList, Tree, MAX_POSITION_STREAM, NODE_RECORD_SIZE};
pub use utils::Span;
pub(crate) use utils::size_class_marker;
