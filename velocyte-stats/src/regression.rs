//! Least-squares regression on paired expression columns.
//!
//! The steady-state velocity model regresses unspliced on spliced abundance
//! over a subset of cells, either through the origin or with an intercept.
//! [`projection_coefficient`] is the one-parameter generalized regression
//! `argmin_a ‖x − a·c‖²` used to re-estimate kinetic rates from fixed
//! basis curves.

use velocyte_core::{Result, Scored, Summarizable, VelocyteError};

/// Normal-equation pivots below this are treated as singular.
const SINGULAR_EPS: f64 = 1e-12;

/// A fitted line `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    /// Zero when fitted through the origin.
    pub intercept: f64,
    /// Coefficient of determination on the fitted points, clamped to `[0, 1]`.
    pub r_squared: f64,
    /// Mean squared residual on the fitted points.
    pub residual_variance: f64,
    /// Number of points used.
    pub n: usize,
}

impl LinearFit {
    /// Predicted `y` at `x`.
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

impl Scored for LinearFit {
    fn score(&self) -> f64 {
        self.r_squared
    }
}

impl Summarizable for LinearFit {
    fn summary(&self) -> String {
        format!(
            "LinearFit: slope={:.4}, intercept={:.4}, r2={:.4}, n={}",
            self.slope, self.intercept, self.r_squared, self.n
        )
    }
}

/// Fit `y = slope * x` over the points selected by `mask` (all when `None`).
///
/// Fails when the selected `x` carry no signal (`Σx² ≈ 0`), i.e. the
/// regression is rank deficient.
pub fn fit_through_origin(x: &[f64], y: &[f64], mask: Option<&[bool]>) -> Result<LinearFit> {
    let points = select(x, y, mask)?;
    let sxx: f64 = points.iter().map(|(xi, _)| xi * xi).sum();
    let sxy: f64 = points.iter().map(|(xi, yi)| xi * yi).sum();
    if sxx < SINGULAR_EPS {
        return Err(VelocyteError::InvalidInput(
            "fit_through_origin: rank-deficient design (x has no signal)".into(),
        ));
    }
    Ok(finish(&points, sxy / sxx, 0.0))
}

/// Ordinary least squares `y = slope * x + intercept` over the selected points.
pub fn fit_with_intercept(x: &[f64], y: &[f64], mask: Option<&[bool]>) -> Result<LinearFit> {
    let points = select(x, y, mask)?;
    if points.len() < 2 {
        return Err(VelocyteError::InvalidInput(
            "fit_with_intercept: need at least 2 points".into(),
        ));
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(xi, _)| xi).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, yi)| yi).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (xi, yi) in &points {
        sxx += (xi - mean_x) * (xi - mean_x);
        sxy += (xi - mean_x) * (yi - mean_y);
    }
    if sxx < SINGULAR_EPS {
        return Err(VelocyteError::InvalidInput(
            "fit_with_intercept: rank-deficient design (x is constant)".into(),
        ));
    }
    let slope = sxy / sxx;
    Ok(finish(&points, slope, mean_y - slope * mean_x))
}

/// Coefficient `a` minimizing `Σ (x_i − a·c_i)²`.
///
/// Returns `None` when the basis `c` is identically zero.
pub fn projection_coefficient(c: &[f64], x: &[f64]) -> Option<f64> {
    let cc: f64 = c.iter().map(|v| v * v).sum();
    if cc < SINGULAR_EPS {
        return None;
    }
    let cx: f64 = c.iter().zip(x).map(|(a, b)| a * b).sum();
    Some(cx / cc)
}

fn select(x: &[f64], y: &[f64], mask: Option<&[bool]>) -> Result<Vec<(f64, f64)>> {
    if x.len() != y.len() {
        return Err(VelocyteError::InvalidInput(format!(
            "regression: x and y must have the same length ({} vs {})",
            x.len(),
            y.len()
        )));
    }
    if let Some(m) = mask {
        if m.len() != x.len() {
            return Err(VelocyteError::InvalidInput(format!(
                "regression: mask length {} does not match data length {}",
                m.len(),
                x.len()
            )));
        }
    }
    let points: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .enumerate()
        .filter(|(i, _)| mask.map_or(true, |m| m[*i]))
        .map(|(_, (&xi, &yi))| (xi, yi))
        .collect();
    if points.is_empty() {
        return Err(VelocyteError::InvalidInput(
            "regression: no points selected".into(),
        ));
    }
    Ok(points)
}

fn finish(points: &[(f64, f64)], slope: f64, intercept: f64) -> LinearFit {
    let n = points.len() as f64;
    let mean_y = points.iter().map(|(_, yi)| yi).sum::<f64>() / n;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for &(xi, yi) in points {
        let r = yi - (slope * xi + intercept);
        ss_res += r * r;
        ss_tot += (yi - mean_y) * (yi - mean_y);
    }
    let r_squared = if ss_tot > 0.0 {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    } else if ss_res <= SINGULAR_EPS {
        1.0
    } else {
        0.0
    };
    LinearFit {
        slope,
        intercept,
        r_squared,
        residual_variance: ss_res / n,
        n: points.len(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn origin_fit_recovers_slope() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [0.5, 1.0, 1.5, 2.0];
        let fit = fit_through_origin(&x, &y, None).unwrap();
        assert!((fit.slope - 0.5).abs() < TOL);
        assert_eq!(fit.intercept, 0.0);
        assert!((fit.r_squared - 1.0).abs() < TOL);
        assert!(fit.residual_variance < TOL);
        assert_eq!(fit.n, 4);
    }

    #[test]
    fn origin_fit_respects_mask() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 100.0, 3.0, -50.0];
        let mask = [true, false, true, false];
        let fit = fit_through_origin(&x, &y, Some(&mask)).unwrap();
        assert!((fit.slope - 1.0).abs() < TOL);
        assert_eq!(fit.n, 2);
    }

    #[test]
    fn origin_fit_rank_deficient() {
        assert!(fit_through_origin(&[0.0, 0.0], &[1.0, 2.0], None).is_err());
    }

    #[test]
    fn intercept_fit() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let fit = fit_with_intercept(&x, &y, None).unwrap();
        assert!((fit.slope - 2.0).abs() < TOL);
        assert!((fit.intercept - 1.0).abs() < TOL);
        assert!((fit.predict(10.0) - 21.0).abs() < TOL);
        assert!((fit.score() - 1.0).abs() < TOL);
    }

    #[test]
    fn intercept_fit_constant_x() {
        assert!(fit_with_intercept(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0], None).is_err());
    }

    #[test]
    fn mask_length_checked() {
        assert!(fit_through_origin(&[1.0, 2.0], &[1.0, 2.0], Some(&[true])).is_err());
        assert!(fit_through_origin(&[1.0, 2.0], &[1.0, 2.0], Some(&[false, false])).is_err());
    }

    #[test]
    fn projection_basic() {
        let c = [1.0, 2.0, 3.0];
        let x = [3.0, 6.0, 9.0];
        assert!((projection_coefficient(&c, &x).unwrap() - 3.0).abs() < TOL);
        assert!(projection_coefficient(&[0.0, 0.0], &[1.0, 1.0]).is_none());
    }

    #[test]
    fn r_squared_bounded_for_bad_fit() {
        // Through-origin fit to data with a large offset explains little.
        let x = [1.0, 2.0, 3.0];
        let y = [10.0, 9.0, 8.0];
        let fit = fit_through_origin(&x, &y, None).unwrap();
        assert!((0.0..=1.0).contains(&fit.r_squared));
    }

    #[test]
    fn summary_mentions_slope() {
        let fit = fit_through_origin(&[1.0, 2.0], &[2.0, 4.0], None).unwrap();
        assert!(fit.summary().contains("slope=2.0000"));
    }
}
