//! Similarity computed on the fly from per-species features.
//!
//! The species axis is split into row chunks and each chunk becomes one
//! independent task: compute its `chunk × n` block of similarities against
//! every feature row, multiply by the abundances, return `chunk × k`. Tasks
//! share only read-only inputs. All tasks are joined before the blocks are
//! stacked in chunk order, so the full `n × n` matrix never exists at once.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::{check_rows, ChunkConfig, Similarity};
use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

/// Pairwise similarity of two feature rows. Must be symmetric and return a
/// finite, non-negative value.
pub type SimilarityFn = Arc<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>;

#[derive(Clone)]
pub struct SimilarityFromFunction {
    function: SimilarityFn,
    features: Arc<Matrix>,
    chunk_size: usize,
    #[cfg(feature = "threading")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl fmt::Debug for SimilarityFromFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimilarityFromFunction")
            .field("features", &self.features.shape())
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl SimilarityFromFunction {
    /// `features` holds one row per species, in the counts' species order.
    pub fn new(function: SimilarityFn, features: Matrix, chunk: ChunkConfig) -> Result<Self> {
        chunk.validate()?;
        let chunk_size = chunk.chunk_size;
        if features.rows() == 0 {
            return Err(DiversityError::InvalidArgument("feature matrix has no species rows".into()));
        }
        debug!(shape = ?features.shape(), chunk_size, "SimilarityFromFunction::new");
        Ok(Self {
            function,
            features: Arc::new(features),
            chunk_size,
            #[cfg(feature = "threading")]
            pool: None,
        })
    }

    /// Run chunk tasks on `pool` instead of the global rayon pool.
    #[cfg(feature = "threading")]
    pub fn with_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Chunk start rows, in order.
    fn chunk_starts(&self) -> Vec<usize> {
        (0..self.features.rows()).step_by(self.chunk_size).collect()
    }

    /// One task: rows `start..end` of `similarity · relative_abundances`.
    fn compute_chunk(&self, start: usize, relative_abundances: MatrixView<'_>) -> Result<Matrix> {
        let n = self.features.rows();
        let end = (start + self.chunk_size).min(n);
        let outcome = catch_unwind(AssertUnwindSafe(|| -> std::result::Result<Matrix, String> {
            let mut block = Matrix::zeros(end - start, n);
            for i in start..end {
                let left = self.features.row(i);
                for j in 0..n {
                    let s = (self.function)(left, self.features.row(j));
                    if !s.is_finite() || s < 0.0 {
                        return Err(format!("similarity({i}, {j}) = {s} is not finite and non-negative"));
                    }
                    block.set(i - start, j, s);
                }
            }
            block.dot(relative_abundances).map_err(|e| e.to_string())
        }));
        trace!(start, end, "similarity chunk task finished");
        match outcome {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(message)) => Err(DiversityError::WorkerFailed { start, end, message }),
            Err(payload) => Err(DiversityError::WorkerFailed { start, end, message: panic_message(payload) }),
        }
    }

    #[cfg(feature = "threading")]
    fn dispatch(&self, starts: &[usize], relative_abundances: MatrixView<'_>) -> Vec<Result<Matrix>> {
        use rayon::prelude::*;
        let run = || {
            starts
                .par_iter()
                .map(|&start| self.compute_chunk(start, relative_abundances))
                .collect::<Vec<_>>()
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    #[cfg(not(feature = "threading"))]
    fn dispatch(&self, starts: &[usize], relative_abundances: MatrixView<'_>) -> Vec<Result<Matrix>> {
        starts
            .iter()
            .map(|&start| self.compute_chunk(start, relative_abundances))
            .collect()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "task panicked".to_string(),
        },
    }
}

impl Similarity for SimilarityFromFunction {
    fn n_species(&self) -> usize {
        self.features.rows()
    }

    fn species_order(&self) -> Option<&[String]> {
        None
    }

    fn weighted_similarities(&self, relative_abundances: MatrixView<'_>) -> Result<Matrix> {
        check_rows(self.n_species(), relative_abundances)?;
        let starts = self.chunk_starts();
        info!(
            n_species = self.n_species(),
            chunks = starts.len(),
            chunk_size = self.chunk_size,
            "computing similarities from function"
        );
        // Every task has finished here; the first failure in chunk order wins.
        let blocks = self
            .dispatch(&starts, relative_abundances)
            .into_iter()
            .collect::<Result<Vec<Matrix>>>()?;
        Matrix::vstack(blocks, relative_abundances.cols())
    }
}
