//! Index-level edits
//!
//! Edits never re-encode genotypes. They rewrite the block index and copy the
//! selected node payloads byte for byte into a new file:
//!
//! ```text
//! inputs ──► trees ──► edit / merge ──► payload copy (tree order) ──► footer
//! ```
//!
//! The output goes through the same temporary-file lifecycle as the writers, and
//! its `ordered` flag is recomputed from the resulting index.

use std::{io::Write, path::Path, sync::Arc};

use log::info;

use crate::{
    core::{FileHeader, Node, Tree},
    error::WriteError,
    manager::{Context, Manager},
    write::{finalize, PendingFile},
    Result,
};

/// An edit of a single file's index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Keep only these chromosomes
    RetainChromosomes(Vec<u8>),
    /// Drop these chromosomes
    DeleteChromosomes(Vec<u8>),
    /// Keep only these nodes of a chromosome (indices into its node list)
    RetainNodes { chromosome: u8, indices: Vec<usize> },
    /// Drop these nodes of a chromosome
    DeleteNodes { chromosome: u8, indices: Vec<usize> },
}

/// Applies an edit to `input` and writes the result to `output`
pub fn apply<P: AsRef<Path>, Q: AsRef<Path>>(
    context: &Context,
    input: P,
    output: Q,
    edit: &Edit,
) -> Result<()> {
    let output = output.as_ref();
    let manager = context.open(input)?;
    check_distinct(manager.path(), output)?;

    let mut tree = manager.tree().clone();
    match edit {
        Edit::RetainChromosomes(chromosomes) => tree.retain_chromosomes(chromosomes),
        Edit::DeleteChromosomes(chromosomes) => tree.remove_chromosomes(chromosomes),
        Edit::RetainNodes {
            chromosome,
            indices,
        } => tree.retain_nodes(*chromosome, indices)?,
        Edit::DeleteNodes {
            chromosome,
            indices,
        } => tree.remove_nodes(*chromosome, indices)?,
    }
    tree.flush(false);

    write_tree(&[manager], &tree, output)?;
    context.evict(output);
    Ok(())
}

/// Concatenates files with identical subjects, phasing, and compressor
///
/// Nodes of all inputs are merged per chromosome and sorted by position.
/// Duplicates are dropped per source file only: a file listed twice
/// contributes every node twice.
pub fn concat<P: AsRef<Path>, Q: AsRef<Path>>(
    context: &Context,
    inputs: &[P],
    output: Q,
) -> Result<()> {
    let output = output.as_ref();
    if inputs.is_empty() {
        return Err(WriteError::IncompatibleFiles("no input files".to_string()).into());
    }
    if inputs.len() > usize::from(u16::MAX) + 1 {
        return Err(WriteError::IncompatibleFiles(format!(
            "{} inputs exceed the maximum of {}",
            inputs.len(),
            usize::from(u16::MAX) + 1
        ))
        .into());
    }
    let managers = inputs
        .iter()
        .map(|input| context.open(input))
        .collect::<Result<Vec<_>>>()?;
    for manager in &managers {
        check_distinct(manager.path(), output)?;
    }
    check_compatible(&managers)?;

    let mut tree = Tree::new();
    for (source, manager) in managers.iter().enumerate() {
        let mut part = manager.tree().clone();
        part.bind(source as u16);
        tree.merge(&part);
    }
    tree.flush(true);

    write_tree(&managers, &tree, output)?;
    context.evict(output);
    Ok(())
}

fn check_distinct(input: &Path, output: &Path) -> Result<()> {
    let same = match (input.canonicalize(), output.canonicalize()) {
        (Ok(input), Ok(output)) => input == output,
        _ => input == output,
    };
    if same {
        return Err(WriteError::SamePath(output.display().to_string()).into());
    }
    Ok(())
}

fn check_compatible(managers: &[Arc<Manager>]) -> Result<()> {
    let Some((first, rest)) = managers.split_first() else {
        return Ok(());
    };
    for other in rest {
        let reason = if other.subjects() != first.subjects() {
            "subjects differ"
        } else if other.is_phased() != first.is_phased() {
            "phasing differs"
        } else if other.compressor_kind() != first.compressor_kind() {
            "compressors differ"
        } else {
            continue;
        };
        return Err(WriteError::IncompatibleFiles(format!(
            "{} and {}: {reason}",
            first.path().display(),
            other.path().display()
        ))
        .into());
    }
    Ok(())
}

/// Writes a file holding the nodes of `tree`, in tree order
fn write_tree(sources: &[Arc<Manager>], tree: &Tree, output: &Path) -> Result<()> {
    let Some(template) = sources.first() else {
        return Err(WriteError::IncompatibleFiles("no input files".to_string()).into());
    };
    let block_size_type = sources
        .iter()
        .map(|manager| manager.header().block_size_type())
        .max()
        .unwrap_or_default();
    let header = FileHeader::new(
        template.is_phased(),
        block_size_type,
        template.compressor_kind(),
        template.compression_level(),
    );

    let mut file = PendingFile::create(output)?;
    file.write_all(header.as_bytes())?;
    file.write_all(template.reference().as_bytes())?;
    file.write_all(b"\n")?;
    file.write_all(template.raw_subjects())?;

    let mut nodes: Vec<Node> = Vec::with_capacity(tree.num_nodes());
    for node in tree.iter() {
        let source = &sources[usize::from(node.source)];
        file.write_all(source.raw_payload(node)?)?;
        nodes.push(*node);
    }
    info!(
        "Copied {} nodes from {} file(s) into {}",
        nodes.len(),
        sources.len(),
        output.display()
    );
    finalize(file, header, &nodes)
}
