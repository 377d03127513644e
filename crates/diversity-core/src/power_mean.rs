//! Weighted generalized power mean.
//!
//! `M_t(w, v) = (Σ w_i · v_i^t)^(1/t)`, evaluated only over entries with
//! positive weight. The limits are handled exactly:
//!   t = 0   → weighted geometric mean `exp(Σ w_i · ln v_i)`
//!   t = +∞  → max of positively weighted values
//!   t = −∞  → min of positively weighted values
//!
//! For finite t the largest (t > 0) or smallest (t < 0) value is factored
//! out before exponentiating so that every powered term lies in [0, 1].
//! The sum is accumulated as its excess over the total weight with
//! `exp_m1` and `ln_1p`, which keeps orders near 0 continuous with the
//! geometric mean.
use crate::error::{DiversityError, Result};
use crate::matrix::MatrixView;

/// Weights whose total is within this distance of 1 are taken as normalized.
const NORMALIZED_TOLERANCE: f64 = 1e-9;

/// Power mean of `values` weighted by `weights` (same length, weights ≥ 0).
pub fn power_mean(order: f64, weights: &[f64], values: &[f64]) -> Result<f64> {
    if weights.len() != values.len() {
        return Err(DiversityError::ShapeMismatch {
            context: "power_mean",
            expected: (weights.len(), 1),
            got: (values.len(), 1),
        });
    }
    if order.is_nan() {
        return Err(DiversityError::InvalidArgument("power mean order is NaN".into()));
    }
    if let Some(w) = weights.iter().find(|w| !(**w >= 0.0)) {
        return Err(DiversityError::InvalidArgument(format!(
            "power mean weights must be non-negative, got {w}"
        )));
    }

    // Zero-weight entries drop out entirely, including zero values.
    let weighted = || weights.iter().zip(values).filter(|(w, _)| **w > 0.0);

    if order == 0.0 {
        let log_sum: f64 = weighted().map(|(w, v)| w * v.ln()).sum();
        return Ok(log_sum.exp());
    }

    if order.is_infinite() {
        let extreme = if order > 0.0 {
            weighted().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max)
        } else {
            weighted().map(|(_, v)| *v).fold(f64::INFINITY, f64::min)
        };
        if extreme.is_infinite() && weighted().next().is_none() {
            return Err(DiversityError::Domain(
                "extremal power mean over values with no positive weight".into(),
            ));
        }
        return Ok(extreme);
    }

    if order < 0.0 && weighted().any(|(_, v)| *v == 0.0) {
        return Err(DiversityError::Domain(format!(
            "zero raised to negative power {order} in power mean"
        )));
    }

    let pivot = if order > 0.0 {
        weighted().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max)
    } else {
        weighted().map(|(_, v)| *v).fold(f64::INFINITY, f64::min)
    };
    if pivot.is_infinite() && weighted().next().is_none() {
        return Ok(0f64.powf(order.recip()));
    }
    if pivot == 0.0 {
        return Ok(0.0);
    }

    // Σ w·r^t = W·(1 + excess/W) with r = v / pivot.
    let total: f64 = weighted().map(|(w, _)| *w).sum();
    let excess: f64 = weighted().map(|(w, v)| w * (order * (v / pivot).ln()).exp_m1()).sum();
    let log_total = if (total - 1.0).abs() <= NORMALIZED_TOLERANCE { 0.0 } else { total.ln() };
    Ok(pivot * ((log_total + (excess / total).ln_1p()) / order).exp())
}

/// Column-wise power mean: column `j` of `values` weighted by column `j`
/// of `weights`. Both matrices must share a shape.
pub fn power_mean_columns(order: f64, weights: MatrixView<'_>, values: MatrixView<'_>) -> Result<Vec<f64>> {
    if weights.shape() != values.shape() {
        return Err(DiversityError::ShapeMismatch {
            context: "power_mean_columns",
            expected: weights.shape(),
            got: values.shape(),
        });
    }
    (0..values.cols())
        .map(|j| power_mean(order, &weights.column(j), &values.column(j)))
        .collect()
}
