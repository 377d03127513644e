//! Similarity-sensitive diversity of a metacommunity and its subcommunities.
//!
//! Every measure is a power mean of order `1 - viewpoint` over ratios of
//! abundance-weighted similarities:
//!
//! | measure   | numerator                 | denominator                  |
//! |-----------|---------------------------|------------------------------|
//! | alpha     | 1                         | subcommunity similarity      |
//! | rho       | metacommunity similarity  | subcommunity similarity      |
//! | beta      | 1 / rho                   |                              |
//! | gamma     | 1                         | metacommunity similarity     |
//!
//! Normalized alpha, rho and beta use the normalized subcommunity similarity
//! in place of the subcommunity similarity. Subcommunity measures weight by
//! normalized subcommunity abundance; metacommunity measures are power means
//! of the subcommunity measures weighted by the normalizing constants.
//!
//! A ratio with a zero denominator is 0: zero weighted similarity only
//! occurs where the species carries no abundance weight.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abundance::{cached, RelativeAbundance};
use crate::error::{DiversityError, Result};
use crate::matrix::Matrix;
use crate::power_mean::{power_mean, power_mean_columns};
use crate::similarity::Similarity;

/// Community label of the metacommunity row in tabular output.
pub const METACOMMUNITY_LABEL: &str = "metacommunity";

/// All eight measures for one community at one viewpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiversityRecord {
    pub community: String,
    pub viewpoint: f64,
    pub alpha: f64,
    pub rho: f64,
    pub beta: f64,
    pub gamma: f64,
    pub normalized_alpha: f64,
    pub normalized_rho: f64,
    pub normalized_beta: f64,
}

/// Power-mean order for a viewpoint in `[0, ∞]`.
fn order_for(viewpoint: f64) -> Result<f64> {
    if viewpoint.is_nan() || viewpoint < 0.0 {
        return Err(DiversityError::InvalidArgument(format!(
            "viewpoint must lie in [0, inf], got {viewpoint}"
        )));
    }
    Ok(1.0 - viewpoint)
}

/// `numerator / denominator` element-wise, 0 where the denominator is 0.
fn divide(numerator: &Matrix, denominator: &Matrix) -> Result<Matrix> {
    if numerator.shape() != denominator.shape() {
        return Err(DiversityError::ShapeMismatch {
            context: "similarity ratio",
            expected: denominator.shape(),
            got: numerator.shape(),
        });
    }
    let data = numerator
        .as_slice()
        .iter()
        .zip(denominator.as_slice())
        .map(|(n, d)| if *d == 0.0 { 0.0 } else { n / d })
        .collect();
    Matrix::from_vec(denominator.rows(), denominator.cols(), data)
}

fn reciprocal(denominator: &Matrix) -> Matrix {
    let mut m = denominator.clone();
    m.as_mut_slice().iter_mut().for_each(|d| *d = if *d == 0.0 { 0.0 } else { d.recip() });
    m
}

fn invert(values: Vec<f64>) -> Vec<f64> {
    values.into_iter().map(|v| if v == 0.0 { 0.0 } else { v.recip() }).collect()
}

/// Diversity measures over a [`RelativeAbundance`] and a [`Similarity`].
///
/// Weighted similarities are computed on first use and kept for the
/// lifetime of the metacommunity. Measures take `&mut self` because the
/// abundance may rescale its storage; one metacommunity serves one caller
/// at a time.
pub struct Metacommunity<A: RelativeAbundance> {
    similarity: Box<dyn Similarity>,
    abundance: A,
    subcommunity_names: Vec<String>,
    metacommunity_similarity: Option<Matrix>,
    subcommunity_similarity: Option<Matrix>,
    normalized_subcommunity_similarity: Option<Matrix>,
}

impl<A: RelativeAbundance> Metacommunity<A> {
    /// Abundance rows must follow the similarity's species order.
    /// Subcommunities are named by column index until
    /// [`with_subcommunity_names`](Self::with_subcommunity_names).
    pub fn new(similarity: Box<dyn Similarity>, abundance: A) -> Result<Self> {
        let (n_species, n_subcommunities) = abundance.shape();
        if n_species != similarity.n_species() {
            return Err(DiversityError::ShapeMismatch {
                context: "Metacommunity::new",
                expected: (similarity.n_species(), n_subcommunities),
                got: abundance.shape(),
            });
        }
        debug!(n_species, n_subcommunities, "Metacommunity::new");
        Ok(Self {
            similarity,
            abundance,
            subcommunity_names: (0..n_subcommunities).map(|j| j.to_string()).collect(),
            metacommunity_similarity: None,
            subcommunity_similarity: None,
            normalized_subcommunity_similarity: None,
        })
    }

    pub fn with_subcommunity_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.subcommunity_names.len() {
            return Err(DiversityError::InvalidArgument(format!(
                "{} names for {} subcommunities",
                names.len(),
                self.subcommunity_names.len()
            )));
        }
        self.subcommunity_names = names;
        Ok(self)
    }

    pub fn subcommunity_names(&self) -> &[String] {
        &self.subcommunity_names
    }

    pub fn species_order(&self) -> Option<&[String]> {
        self.similarity.species_order()
    }

    pub fn abundance(&self) -> &A {
        &self.abundance
    }

    pub fn abundance_mut(&mut self) -> &mut A {
        &mut self.abundance
    }

    // ── Weighted similarities ──────────────────────────────────────────

    /// Similarity · metacommunity abundance, species × 1.
    pub fn metacommunity_similarity(&mut self) -> Result<&Matrix> {
        let (similarity, abundance) = (&self.similarity, &mut self.abundance);
        cached(&mut self.metacommunity_similarity, || {
            similarity.weighted_similarities(abundance.metacommunity_abundance()?)
        })
    }

    /// Similarity · subcommunity abundance, species × subcommunities.
    pub fn subcommunity_similarity(&mut self) -> Result<&Matrix> {
        let (similarity, abundance) = (&self.similarity, &mut self.abundance);
        cached(&mut self.subcommunity_similarity, || {
            similarity.weighted_similarities(abundance.subcommunity_abundance()?)
        })
    }

    /// Similarity · normalized subcommunity abundance.
    pub fn normalized_subcommunity_similarity(&mut self) -> Result<&Matrix> {
        let (similarity, abundance) = (&self.similarity, &mut self.abundance);
        cached(&mut self.normalized_subcommunity_similarity, || {
            similarity.weighted_similarities(abundance.normalized_subcommunity_abundance()?)
        })
    }

    // ── Subcommunity measures ──────────────────────────────────────────

    fn subcommunity_measure(&mut self, viewpoint: f64, ratios: &Matrix) -> Result<Vec<f64>> {
        let order = order_for(viewpoint)?;
        let weights = self.abundance.normalized_subcommunity_abundance()?;
        power_mean_columns(order, weights, ratios.view())
    }

    fn broadcast_metacommunity_similarity(&mut self) -> Result<Matrix> {
        let k = self.abundance.shape().1;
        self.metacommunity_similarity()?.broadcast_columns(k)
    }

    pub fn subcommunity_alpha(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        order_for(viewpoint)?;
        let ratios = reciprocal(self.subcommunity_similarity()?);
        self.subcommunity_measure(viewpoint, &ratios)
    }

    pub fn subcommunity_rho(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        order_for(viewpoint)?;
        let numerator = self.broadcast_metacommunity_similarity()?;
        let ratios = divide(&numerator, self.subcommunity_similarity()?)?;
        self.subcommunity_measure(viewpoint, &ratios)
    }

    pub fn subcommunity_beta(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        self.subcommunity_rho(viewpoint).map(invert)
    }

    pub fn subcommunity_gamma(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        order_for(viewpoint)?;
        let ratios = reciprocal(&self.broadcast_metacommunity_similarity()?);
        self.subcommunity_measure(viewpoint, &ratios)
    }

    pub fn normalized_subcommunity_alpha(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        order_for(viewpoint)?;
        let ratios = reciprocal(self.normalized_subcommunity_similarity()?);
        self.subcommunity_measure(viewpoint, &ratios)
    }

    pub fn normalized_subcommunity_rho(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        order_for(viewpoint)?;
        let numerator = self.broadcast_metacommunity_similarity()?;
        let ratios = divide(&numerator, self.normalized_subcommunity_similarity()?)?;
        self.subcommunity_measure(viewpoint, &ratios)
    }

    pub fn normalized_subcommunity_beta(&mut self, viewpoint: f64) -> Result<Vec<f64>> {
        self.normalized_subcommunity_rho(viewpoint).map(invert)
    }

    // ── Metacommunity measures ─────────────────────────────────────────

    fn metacommunity_measure(&mut self, viewpoint: f64, subcommunity: Vec<f64>) -> Result<f64> {
        let order = order_for(viewpoint)?;
        let constants = self.abundance.subcommunity_normalizing_constants()?;
        power_mean(order, constants, &subcommunity)
    }

    pub fn metacommunity_alpha(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.subcommunity_alpha(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    pub fn metacommunity_rho(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.subcommunity_rho(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    pub fn metacommunity_beta(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.subcommunity_beta(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    pub fn metacommunity_gamma(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.subcommunity_gamma(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    pub fn normalized_metacommunity_alpha(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.normalized_subcommunity_alpha(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    pub fn normalized_metacommunity_rho(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.normalized_subcommunity_rho(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    pub fn normalized_metacommunity_beta(&mut self, viewpoint: f64) -> Result<f64> {
        let values = self.normalized_subcommunity_beta(viewpoint)?;
        self.metacommunity_measure(viewpoint, values)
    }

    // ── Records ────────────────────────────────────────────────────────

    /// One record per subcommunity, in column order.
    pub fn subcommunities_to_records(&mut self, viewpoint: f64) -> Result<Vec<DiversityRecord>> {
        let alpha = self.subcommunity_alpha(viewpoint)?;
        let rho = self.subcommunity_rho(viewpoint)?;
        let beta = self.subcommunity_beta(viewpoint)?;
        let gamma = self.subcommunity_gamma(viewpoint)?;
        let normalized_alpha = self.normalized_subcommunity_alpha(viewpoint)?;
        let normalized_rho = self.normalized_subcommunity_rho(viewpoint)?;
        let normalized_beta = self.normalized_subcommunity_beta(viewpoint)?;
        Ok(self
            .subcommunity_names
            .iter()
            .enumerate()
            .map(|(j, name)| DiversityRecord {
                community: name.clone(),
                viewpoint,
                alpha: alpha[j],
                rho: rho[j],
                beta: beta[j],
                gamma: gamma[j],
                normalized_alpha: normalized_alpha[j],
                normalized_rho: normalized_rho[j],
                normalized_beta: normalized_beta[j],
            })
            .collect())
    }

    /// The metacommunity row, labelled [`METACOMMUNITY_LABEL`].
    pub fn metacommunity_to_record(&mut self, viewpoint: f64) -> Result<DiversityRecord> {
        Ok(DiversityRecord {
            community: METACOMMUNITY_LABEL.to_string(),
            viewpoint,
            alpha: self.metacommunity_alpha(viewpoint)?,
            rho: self.metacommunity_rho(viewpoint)?,
            beta: self.metacommunity_beta(viewpoint)?,
            gamma: self.metacommunity_gamma(viewpoint)?,
            normalized_alpha: self.normalized_metacommunity_alpha(viewpoint)?,
            normalized_rho: self.normalized_metacommunity_rho(viewpoint)?,
            normalized_beta: self.normalized_metacommunity_beta(viewpoint)?,
        })
    }
}
