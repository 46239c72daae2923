//! Descriptive statistics over gene expression columns.
//!
//! Plain functions ([`mean`], [`variance`], [`quantile`], [`percentile`]) plus
//! the masked variants the kinetics fitter uses to restrict a column to a
//! subset of cells without copying it first.

use velocyte_core::{Result, VelocyteError};

// ── Individual functions ───────────────────────────────────────────────────

/// Arithmetic mean.
pub fn mean(data: &[f64]) -> Result<f64> {
    if data.is_empty() {
        return Err(VelocyteError::InvalidInput(
            "mean: data must not be empty".into(),
        ));
    }
    Ok(data.iter().sum::<f64>() / data.len() as f64)
}

/// Variance with given degrees-of-freedom correction.
///
/// - `ddof = 0` → population variance
/// - `ddof = 1` → sample variance (Bessel's correction)
pub fn variance(data: &[f64], ddof: usize) -> Result<f64> {
    let n = data.len();
    if n <= ddof {
        return Err(VelocyteError::InvalidInput(format!(
            "variance: need more than {} observations (got {})",
            ddof, n,
        )));
    }
    let m = mean(data)?;
    let ss: f64 = data.iter().map(|&x| (x - m).powi(2)).sum();
    Ok(ss / (n - ddof) as f64)
}

/// Standard deviation with given degrees-of-freedom correction.
pub fn std_dev(data: &[f64], ddof: usize) -> Result<f64> {
    Ok(variance(data, ddof)?.sqrt())
}

/// Quantile using linear interpolation between closest ranks.
pub fn quantile(data: &[f64], q: f64) -> Result<f64> {
    if data.is_empty() {
        return Err(VelocyteError::InvalidInput(
            "quantile: data must not be empty".into(),
        ));
    }
    if !(0.0..=1.0).contains(&q) {
        return Err(VelocyteError::InvalidInput(
            "quantile: q must be in [0, 1]".into(),
        ));
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Ok(quantile_sorted(&sorted, q))
}

/// Percentile on the `[0, 100]` scale, interpolated like [`quantile`].
pub fn percentile(data: &[f64], p: f64) -> Result<f64> {
    if !(0.0..=100.0).contains(&p) {
        return Err(VelocyteError::InvalidInput(
            "percentile: p must be in [0, 100]".into(),
        ));
    }
    quantile(data, p / 100.0)
}

/// Mean of the entries of `data` where `mask` is set.
///
/// Returns `None` when no entry is selected.
pub fn masked_mean(data: &[f64], mask: &[bool]) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (&x, &keep) in data.iter().zip(mask) {
        if keep {
            sum += x;
            n += 1;
        }
    }
    (n > 0).then(|| sum / n as f64)
}

/// Percentile of the entries of `data` where `mask` is set.
pub fn masked_percentile(data: &[f64], mask: &[bool], p: f64) -> Result<f64> {
    let selected: Vec<f64> = data
        .iter()
        .zip(mask)
        .filter_map(|(&x, &keep)| keep.then_some(x))
        .collect();
    percentile(&selected, p)
}

// ── Internal ───────────────────────────────────────────────────────────────

/// Compute a quantile from a pre-sorted slice using linear interpolation.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = lo + 1;
    let frac = pos - lo as f64;
    if hi >= n {
        sorted[n - 1]
    } else {
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn mean_basic() {
        assert!((mean(&[2.0, 4.0, 6.0]).unwrap() - 4.0).abs() < TOL);
    }

    #[test]
    fn mean_empty() {
        assert!(mean(&[]).is_err());
    }

    #[test]
    fn variance_population() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((variance(&data, 0).unwrap() - 4.0).abs() < TOL);
        assert!((std_dev(&data, 0).unwrap() - 2.0).abs() < TOL);
    }

    #[test]
    fn variance_too_few() {
        assert!(variance(&[1.0], 1).is_err());
        assert!(variance(&[], 0).is_err());
    }

    #[test]
    fn quantile_basic() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((quantile(&data, 0.0).unwrap() - 1.0).abs() < TOL);
        assert!((quantile(&data, 1.0).unwrap() - 5.0).abs() < TOL);
        assert!((quantile(&data, 0.5).unwrap() - 3.0).abs() < TOL);
    }

    #[test]
    fn percentile_interpolates() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        // position 0.95 * 4 = 3.8
        assert!((percentile(&data, 95.0).unwrap() - 4.8).abs() < TOL);
        assert!(percentile(&data, 101.0).is_err());
    }

    #[test]
    fn masked_helpers() {
        let data = [1.0, 10.0, 3.0, 100.0];
        let mask = [true, false, true, false];
        assert!((masked_mean(&data, &mask).unwrap() - 2.0).abs() < TOL);
        assert!((masked_percentile(&data, &mask, 100.0).unwrap() - 3.0).abs() < TOL);
        assert!(masked_mean(&data, &[false; 4]).is_none());
        assert!(masked_percentile(&data, &[false; 4], 50.0).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn quantile_within_range(
            data in proptest::collection::vec(-1e6f64..1e6, 1..64),
            q in 0.0f64..=1.0,
        ) {
            let v = quantile(&data, q).unwrap();
            let lo = data.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(v >= lo - 1e-9 && v <= hi + 1e-9);
        }

        #[test]
        fn variance_non_negative(data in proptest::collection::vec(0.0f64..1e4, 1..64)) {
            prop_assert!(variance(&data, 0).unwrap() >= 0.0);
        }
    }
}
