use auto_impl::auto_impl;

/// Largest chromosome index a node record can hold
pub const MAX_CHROMOSOME_INDEX: u8 = u8::MAX;

/// Resolves chromosome names, indices, and ploidy
///
/// The format only stores a one-byte chromosome index per node. A registry gives
/// those indices their names when reading and supplies the ploidy used to
/// reconstruct calls.
#[auto_impl(&, Box, Arc)]
pub trait ChromosomeRegistry: Send + Sync {
    /// Index of a chromosome name, `None` when unknown
    fn index_of(&self, name: &str) -> Option<u8>;

    /// Number of haplotypes per call on a chromosome
    fn ploidy_of(&self, index: u8) -> u8;

    /// Display name of a chromosome index
    fn name_of(&self, index: u8) -> String;
}

/// Default human registry
///
/// Indices `0..=21` are the autosomes `1..=22`, followed by `X` (22), `Y` (23)
/// and `MT` (24). `Y` and `MT` are haploid. Any other index `i` is named `i + 1`
/// and is treated as diploid. Names may carry a `chr` prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct HumanRegistry;

const X_INDEX: u8 = 22;
const Y_INDEX: u8 = 23;
const MT_INDEX: u8 = 24;

impl ChromosomeRegistry for HumanRegistry {
    fn index_of(&self, name: &str) -> Option<u8> {
        let name = name
            .strip_prefix("chr")
            .or_else(|| name.strip_prefix("CHR"))
            .unwrap_or(name);
        match name {
            "X" | "x" => Some(X_INDEX),
            "Y" | "y" => Some(Y_INDEX),
            "M" | "MT" | "m" | "mt" => Some(MT_INDEX),
            _ => match name.parse::<u16>() {
                Ok(value) if (1..=u16::from(MAX_CHROMOSOME_INDEX) + 1).contains(&value) => {
                    Some((value - 1) as u8)
                }
                _ => None,
            },
        }
    }

    fn ploidy_of(&self, index: u8) -> u8 {
        match index {
            Y_INDEX | MT_INDEX => 1,
            _ => 2,
        }
    }

    fn name_of(&self, index: u8) -> String {
        match index {
            X_INDEX => "X".to_string(),
            Y_INDEX => "Y".to_string(),
            MT_INDEX => "MT".to_string(),
            _ => (u16::from(index) + 1).to_string(),
        }
    }
}
