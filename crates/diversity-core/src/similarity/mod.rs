//! Abundance-weighted species similarities.
//!
//! Every backend answers one question: for a species × k matrix of relative
//! abundances `p`, return `Z · p`, where `Z` is the species × species
//! similarity matrix. The backends differ only in where `Z` lives:
//!
//! | Backend                     | `Z` held as                          |
//! |-----------------------------|--------------------------------------|
//! | [`SimilarityFromTable`]     | in-memory matrix keyed by species    |
//! | [`SimilarityFromArray`]     | in-memory matrix, positional         |
//! | [`SimilarityFromMemmap`]    | raw f64 file, memory-mapped          |
//! | [`SimilarityFromFile`]      | delimited file, streamed in chunks   |
//! | [`SimilarityFromFunction`]  | never materialized; computed per chunk |

pub mod file;
pub mod function;
pub mod memory;
pub mod mmap;

pub use file::SimilarityFromFile;
pub use function::{SimilarityFn, SimilarityFromFunction};
pub use memory::{SimilarityFromArray, SimilarityFromTable};
pub use mmap::{write_memmap, SimilarityFromMemmap};

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

/// Computes `similarity · relative_abundances`.
pub trait Similarity: Send + Sync {
    /// Number of species (rows and columns of the similarity matrix).
    fn n_species(&self) -> usize;

    /// Species names in row order, for backends that know them. Positional
    /// backends return `None`; their rows follow the caller's order.
    fn species_order(&self) -> Option<&[String]>;

    /// `relative_abundances` is species × k, rows aligned to this backend's
    /// species order. Returns species × k where entry `[i, j]` is
    /// `Σ_m similarity(i, m) · relative_abundances[m, j]`.
    fn weighted_similarities(&self, relative_abundances: MatrixView<'_>) -> Result<Matrix>;
}

/// Row-chunking for the streamed and function-computed backends. Larger
/// chunks mean fewer reads / tasks and more memory per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { chunk_size: 100 }
    }
}

impl ChunkConfig {
    pub fn new(chunk_size: usize) -> Result<Self> {
        let config = Self { chunk_size };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DiversityError::InvalidArgument("chunk_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where similarities come from.
#[derive(Clone)]
pub enum SimilaritySource {
    /// Square matrix whose rows and columns are both labelled by `species`.
    Table { species: Vec<String>, matrix: Matrix },
    /// Square matrix aligned by position with the counts.
    Array(Matrix),
    /// Raw little-endian f64 file holding an n × n matrix.
    MemoryMapped(PathBuf),
    /// Delimited file: header of species names, then one row per species.
    File(PathBuf),
    /// Pairwise function over per-species feature rows.
    Function { function: SimilarityFn, features: Matrix },
}

impl fmt::Debug for SimilaritySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table { species, .. } => write!(f, "Table({} species)", species.len()),
            Self::Array(m) => write!(f, "Array({:?})", m.shape()),
            Self::MemoryMapped(p) => write!(f, "MemoryMapped({})", p.display()),
            Self::File(p) => write!(f, "File({})", p.display()),
            Self::Function { features, .. } => write!(f, "Function(features {:?})", features.shape()),
        }
    }
}

impl SimilaritySource {
    /// Choose a file-backed source from the extension: `.csv`/`.tsv`/`.txt`
    /// stream as delimited text, `.bin`/`.f64` map as raw f64.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Ok(Self::File(path)),
            "bin" | "f64" => Ok(Self::MemoryMapped(path)),
            other => Err(DiversityError::InvalidArgument(format!(
                "unsupported similarity source type '{other}' for {}; expected .csv, .tsv, .txt, .bin or .f64",
                path.display()
            ))),
        }
    }
}

/// Build the backend matching `source`.
///
/// `species_subset` restricts the named backends (table, file) to the given
/// species, keeping the backend's own order. Positional backends require the
/// subset, when given, to cover every one of their rows.
pub fn make_similarity(
    source: SimilaritySource,
    species_subset: Option<&[String]>,
    chunk: ChunkConfig,
) -> Result<Box<dyn Similarity>> {
    debug!(?source, subset = species_subset.map(<[String]>::len), ?chunk, "make_similarity");
    chunk.validate()?;
    let similarity: Box<dyn Similarity> = match source {
        SimilaritySource::Table { species, matrix } => {
            Box::new(SimilarityFromTable::new(species, matrix, species_subset)?)
        }
        SimilaritySource::Array(matrix) => Box::new(SimilarityFromArray::new(matrix)?),
        SimilaritySource::MemoryMapped(path) => Box::new(SimilarityFromMemmap::open(path)?),
        SimilaritySource::File(path) => {
            Box::new(SimilarityFromFile::new(path, species_subset, chunk)?)
        }
        SimilaritySource::Function { function, features } => {
            Box::new(SimilarityFromFunction::new(function, features, chunk)?)
        }
    };
    if similarity.species_order().is_none() {
        if let Some(subset) = species_subset {
            if subset.len() != similarity.n_species() {
                return Err(DiversityError::InvalidArgument(format!(
                    "positional similarity covers {} species but {} were requested",
                    similarity.n_species(),
                    subset.len()
                )));
            }
        }
    }
    Ok(similarity)
}

/// Species of `all` that appear in `subset` (all of them when `subset` is
/// `None`), in the order of `all`, paired with their positions.
pub(crate) fn restrict_species(all: &[String], subset: Option<&[String]>) -> Result<(Vec<String>, Vec<usize>)> {
    let mut seen = HashSet::with_capacity(all.len());
    if let Some(dup) = all.iter().find(|s| !seen.insert(s.as_str())) {
        return Err(DiversityError::InvalidArgument(format!("species '{dup}' listed twice")));
    }
    let keep: Option<HashSet<&str>> = subset.map(|s| s.iter().map(String::as_str).collect());
    let (species, indices): (Vec<String>, Vec<usize>) = all
        .iter()
        .enumerate()
        .filter(|(_, s)| keep.as_ref().map_or(true, |k| k.contains(s.as_str())))
        .map(|(i, s)| (s.clone(), i))
        .unzip();
    if species.is_empty() {
        return Err(DiversityError::InvalidArgument(
            "species subset matches no species of the similarity matrix".into(),
        ));
    }
    Ok((species, indices))
}

/// Rejects abundance matrices whose rows do not match the species count.
pub(crate) fn check_rows(n_species: usize, relative_abundances: MatrixView<'_>) -> Result<()> {
    if relative_abundances.rows() != n_species {
        return Err(DiversityError::ShapeMismatch {
            context: "weighted_similarities",
            expected: (n_species, relative_abundances.cols()),
            got: relative_abundances.shape(),
        });
    }
    Ok(())
}

/// Rejects negative, NaN and infinite similarities.
pub(crate) fn validate_similarities(values: &[f64], context: &str) -> Result<()> {
    match values.iter().position(|v| !v.is_finite() || *v < 0.0) {
        Some(i) => Err(DiversityError::InvalidArgument(format!(
            "{context}: similarity must be finite and non-negative, found {} at flat index {i}",
            values[i]
        ))),
        None => Ok(()),
    }
}
