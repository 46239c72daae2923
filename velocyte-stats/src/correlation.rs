//! Correlation and directional similarity.
//!
//! [`pearson`] measures linear association between two series. The
//! [`cosine_similarity`] variant is the one the velocity graph relies on: it
//! refuses to produce a value when either vector is too short to have a
//! direction, so "orthogonal" (0.0) and "unmeasurable" (`None`) stay distinct.

use velocyte_core::{Result, VelocyteError};

/// Pearson product-moment correlation coefficient between `x` and `y`.
///
/// Returns 0.0 if either series is constant (zero variance).
pub fn pearson(x: &[f64], y: &[f64]) -> Result<f64> {
    validate_paired(x, y)?;
    if x.len() < 2 {
        return Err(VelocyteError::InvalidInput(
            "correlation: need at least 2 observations".into(),
        ));
    }

    let n = x.len() as f64;
    let mean_x: f64 = x.iter().sum::<f64>() / n;
    let mean_y: f64 = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (xi, yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }
    Ok(cov / denom)
}

/// Dot product of two equal-length slices.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
pub fn l2_norm(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Cosine of the angle between `a` and `b`.
///
/// Returns `Ok(None)` when either norm is at or below `min_norm`: a vector
/// that short has no direction to compare. The result is clamped to
/// `[-1, 1]` to absorb rounding.
pub fn cosine_similarity(a: &[f64], b: &[f64], min_norm: f64) -> Result<Option<f64>> {
    validate_paired(a, b)?;
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a <= min_norm || norm_b <= min_norm {
        return Ok(None);
    }
    Ok(Some((dot(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0)))
}

fn validate_paired(x: &[f64], y: &[f64]) -> Result<()> {
    if x.len() != y.len() {
        return Err(VelocyteError::InvalidInput(format!(
            "correlation: x and y must have the same length ({} vs {})",
            x.len(),
            y.len(),
        )));
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn pearson_perfect_positive() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.0, 6.0, 8.0, 10.0];
        assert!((pearson(&x, &y).unwrap() - 1.0).abs() < TOL);
    }

    #[test]
    fn pearson_perfect_negative() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [10.0, 8.0, 6.0, 4.0, 2.0];
        assert!((pearson(&x, &y).unwrap() - (-1.0)).abs() < TOL);
    }

    #[test]
    fn pearson_constant_series() {
        let x = [3.0, 3.0, 3.0];
        let y = [1.0, 2.0, 3.0];
        assert!((pearson(&x, &y).unwrap()).abs() < TOL);
    }

    #[test]
    fn pearson_length_mismatch() {
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_err());
        assert!(pearson(&[1.0], &[2.0]).is_err());
    }

    #[test]
    fn cosine_identical_direction() {
        let sim = cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0], 1e-12).unwrap();
        assert!((sim.unwrap() - 1.0).abs() < TOL);
    }

    #[test]
    fn cosine_orthogonal_is_zero_not_none() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0], 1e-12).unwrap();
        assert_eq!(sim, Some(0.0));
    }

    #[test]
    fn cosine_zero_vector_is_undefined() {
        let sim = cosine_similarity(&[0.0, 0.0], &[1.0, 2.0], 1e-12).unwrap();
        assert!(sim.is_none());
    }

    #[test]
    fn cosine_threshold_is_configurable() {
        let short = [1e-4, 0.0];
        assert!(cosine_similarity(&short, &[1.0, 0.0], 1e-12).unwrap().is_some());
        assert!(cosine_similarity(&short, &[1.0, 0.0], 1e-3).unwrap().is_none());
    }

    #[test]
    fn cosine_length_mismatch() {
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0], 0.0).is_err());
    }
}
