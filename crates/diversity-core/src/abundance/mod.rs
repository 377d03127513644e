//! Relative species abundances in a metacommunity.
//!
//! A metacommunity is represented by a species × subcommunity matrix of
//! counts. Two implementations share the [`RelativeAbundance`] contract:
//! [`Abundance`] caches every derived quantity side by side, while
//! [`SharedAbundance`] keeps a single rescaled buffer in shared memory.

pub mod shared;

pub use shared::{ElementType, SharedAbundance, SharedArray, SharedArrayManager, SharedArraySpec, Stored};

use tracing::debug;

use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

/// Relative abundances at subcommunity and metacommunity scope.
///
/// Accessors take `&mut self`: implementations compute lazily and may
/// rescale their storage in place.
pub trait RelativeAbundance {
    /// `(n_species, n_subcommunities)`.
    fn shape(&self) -> (usize, usize);

    /// Counts divided by the total count; the whole matrix sums to 1.
    fn subcommunity_abundance(&mut self) -> Result<MatrixView<'_>>;

    /// Row sums of the subcommunity abundance, shape `(n_species, 1)`.
    fn metacommunity_abundance(&mut self) -> Result<MatrixView<'_>>;

    /// Fraction of the metacommunity held by each subcommunity.
    fn subcommunity_normalizing_constants(&mut self) -> Result<&[f64]>;

    /// Subcommunity abundance with every column rescaled to sum to 1.
    fn normalized_subcommunity_abundance(&mut self) -> Result<MatrixView<'_>>;
}

/// Fills `slot` on first use and hands out a reference to its contents.
pub(crate) fn cached<T>(slot: &mut Option<T>, init: impl FnOnce() -> Result<T>) -> Result<&T> {
    match slot {
        Some(value) => Ok(&*value),
        None => Ok(&*slot.insert(init()?)),
    }
}

/// Rejects negative, NaN and infinite counts.
pub(crate) fn validate_counts(counts: &[f64]) -> Result<()> {
    match counts.iter().position(|c| !c.is_finite() || *c < 0.0) {
        Some(i) => Err(DiversityError::InvalidArgument(format!(
            "counts must be finite and non-negative, found {} at flat index {i}",
            counts[i]
        ))),
        None => Ok(()),
    }
}

pub(crate) fn nonzero_total(total: f64) -> Result<f64> {
    if total > 0.0 {
        Ok(total)
    } else {
        Err(DiversityError::Domain("metacommunity has zero total abundance".into()))
    }
}

/// Fails on the first subcommunity with no individuals.
pub(crate) fn empty_subcommunity(constants: &[f64]) -> Result<()> {
    match constants.iter().position(|c| *c <= 0.0) {
        Some(j) => Err(DiversityError::Domain(format!(
            "subcommunity {j} has zero total count; normalized abundance is undefined"
        ))),
        None => Ok(()),
    }
}

/// Fast, memory-heavy abundances: every derived quantity is computed once
/// and kept alongside the counts.
#[derive(Debug, Clone)]
pub struct Abundance {
    counts: Matrix,
    total: f64,
    subcommunity: Option<Matrix>,
    metacommunity: Option<Matrix>,
    constants: Option<Vec<f64>>,
    normalized: Option<Matrix>,
}

impl Abundance {
    /// `counts` has one row per species and one column per subcommunity.
    pub fn new(counts: Matrix) -> Result<Self> {
        debug!(shape = ?counts.shape(), "Abundance::new");
        validate_counts(counts.as_slice())?;
        let total = counts.sum();
        Ok(Self {
            counts,
            total,
            subcommunity: None,
            metacommunity: None,
            constants: None,
            normalized: None,
        })
    }

    pub fn counts(&self) -> &Matrix {
        &self.counts
    }
}

impl RelativeAbundance for Abundance {
    fn shape(&self) -> (usize, usize) {
        self.counts.shape()
    }

    fn subcommunity_abundance(&mut self) -> Result<MatrixView<'_>> {
        let (counts, total) = (&self.counts, self.total);
        let m = cached(&mut self.subcommunity, || {
            let total = nonzero_total(total)?;
            let mut m = counts.clone();
            m.as_mut_slice().iter_mut().for_each(|v| *v /= total);
            Ok(m)
        })?;
        Ok(m.view())
    }

    fn metacommunity_abundance(&mut self) -> Result<MatrixView<'_>> {
        let (counts, total) = (&self.counts, self.total);
        let m = cached(&mut self.metacommunity, || {
            let total = nonzero_total(total)?;
            let mut m = counts.row_sums();
            m.as_mut_slice().iter_mut().for_each(|v| *v /= total);
            Ok(m)
        })?;
        Ok(m.view())
    }

    fn subcommunity_normalizing_constants(&mut self) -> Result<&[f64]> {
        let (counts, total) = (&self.counts, self.total);
        let c = cached(&mut self.constants, || {
            let total = nonzero_total(total)?;
            Ok(counts.column_sums().into_iter().map(|s| s / total).collect())
        })?;
        Ok(c)
    }

    fn normalized_subcommunity_abundance(&mut self) -> Result<MatrixView<'_>> {
        let counts = &self.counts;
        let m = cached(&mut self.normalized, || {
            nonzero_total(counts.sum())?;
            let column_totals = counts.column_sums();
            empty_subcommunity(&column_totals)?;
            let mut m = counts.clone();
            let cols = m.cols();
            for (i, v) in m.as_mut_slice().iter_mut().enumerate() {
                *v /= column_totals[i % cols];
            }
            Ok(m)
        })?;
        Ok(m.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn counts() -> Matrix {
        Matrix::from_rows(vec![
            vec![1.0, 0.0, 4.0],
            vec![3.0, 2.0, 0.0],
            vec![0.0, 6.0, 1.0],
            vec![2.0, 1.0, 0.0],
        ])
        .unwrap()
    }

    #[test]
    fn subcommunity_and_metacommunity_abundances_sum_to_one() {
        let mut a = Abundance::new(counts()).unwrap();
        assert_abs_diff_eq!(a.subcommunity_abundance().unwrap().as_slice().iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        let meta = a.metacommunity_abundance().unwrap();
        assert_eq!(meta.shape(), (4, 1));
        assert_abs_diff_eq!(meta.as_slice().iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(meta.get(1, 0), 5.0 / 20.0, epsilon = 1e-12);
    }

    #[test]
    fn normalizing_constants_are_subcommunity_fractions() {
        let mut a = Abundance::new(counts()).unwrap();
        let c = a.subcommunity_normalizing_constants().unwrap().to_vec();
        assert_abs_diff_eq!(c[0], 6.0 / 20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c[1], 9.0 / 20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c[2], 5.0 / 20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn normalized_columns_sum_to_one_independently() {
        let mut a = Abundance::new(counts()).unwrap();
        let n = a.normalized_subcommunity_abundance().unwrap();
        for s in n.column_sums() {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(n.get(0, 2), 0.8, epsilon = 1e-12);
    }

    #[test]
    fn zero_total_is_domain_error() {
        let mut a = Abundance::new(Matrix::zeros(3, 2)).unwrap();
        assert!(matches!(a.subcommunity_abundance(), Err(DiversityError::Domain(_))));
        assert!(matches!(a.metacommunity_abundance(), Err(DiversityError::Domain(_))));
    }

    #[test]
    fn empty_subcommunity_only_fails_normalization() {
        let m = Matrix::from_rows(vec![vec![1.0, 0.0], vec![2.0, 0.0]]).unwrap();
        let mut a = Abundance::new(m).unwrap();
        assert!(a.subcommunity_abundance().is_ok());
        assert!(matches!(a.normalized_subcommunity_abundance(), Err(DiversityError::Domain(_))));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let m = Matrix::from_rows(vec![vec![1.0, -1.0]]).unwrap();
        assert!(matches!(Abundance::new(m), Err(DiversityError::InvalidArgument(_))));
    }
}
