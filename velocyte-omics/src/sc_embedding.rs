//! Projection of the velocity graph onto a low-dimensional embedding.
//!
//! Each cell's arrow is the transition-weighted sum of unit vectors pointing
//! from the cell to its graph neighbors in embedding space, corrected by a
//! baseline so that a cell with no preferred direction gets a short arrow.
//! [`velocity_grid`] averages arrows over a coarse grid for flow plots.

use std::collections::BTreeMap;

use velocyte_core::{Result, Summarizable, VelocyteError};
use velocyte_stats::l2_norm;

use crate::sc_velocity_graph::{transition_matrix, TransitionConfig, TransitionMatrices};
use crate::single_cell::AnnData;

/// Correction subtracted from each cell's weighted direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Baseline {
    /// Raw weighted sum.
    None,
    /// Subtract the mean weight times the sum of unit vectors, so uniform
    /// transition weights give a zero arrow.
    #[default]
    Uniform,
    /// Subtract the same sum computed with the negative-cosine weights.
    Negative,
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EmbeddingConfig {
    pub baseline: Baseline,
    pub transition: TransitionConfig,
}

/// Per-cell velocity arrows in embedding space.
///
/// `embedding` is n_obs × d. Cells without outgoing transitions get a zero
/// vector.
pub fn project_velocity(
    transitions: &TransitionMatrices,
    embedding: &[Vec<f64>],
    config: &EmbeddingConfig,
) -> Result<Vec<Vec<f64>>> {
    let n_obs = embedding.len();
    let (n_rows, n_cols) = transitions.positive.shape();
    if n_rows != n_obs || n_cols != n_obs {
        return Err(VelocyteError::dimension("transition matrix cells", n_obs, n_rows.max(n_cols)));
    }
    if transitions.negative.shape() != (n_rows, n_cols) {
        return Err(VelocyteError::dimension(
            "negative transition cells",
            n_obs,
            transitions.negative.shape().0,
        ));
    }
    let dim = embedding.first().map_or(0, Vec::len);
    if let Some(row) = embedding.iter().find(|r| r.len() != dim) {
        return Err(VelocyteError::dimension("embedding dimensions", dim, row.len()));
    }

    let positive = transitions.positive.row_entries();
    let negative = transitions.negative.row_entries();

    let unit = |i: usize, j: usize| -> Vec<f64> {
        let mut d: Vec<f64> = embedding[j].iter().zip(&embedding[i]).map(|(a, b)| a - b).collect();
        let norm = l2_norm(&d);
        if norm > 0.0 {
            d.iter_mut().for_each(|x| *x /= norm);
        } else {
            d.iter_mut().for_each(|x| *x = 0.0);
        }
        d
    };
    let weighted_sum = |i: usize, row: &[(usize, f64)], out: &mut [f64], sign: f64| {
        for &(j, p) in row {
            for (o, e) in out.iter_mut().zip(unit(i, j)) {
                *o += sign * p * e;
            }
        }
    };

    let project = |i: usize| -> Vec<f64> {
        let mut v = vec![0.0; dim];
        let row = &positive[i];
        weighted_sum(i, row, &mut v, 1.0);
        match config.baseline {
            Baseline::None => {}
            Baseline::Uniform => {
                if !row.is_empty() {
                    let mean_p = row.iter().map(|&(_, p)| p).sum::<f64>() / row.len() as f64;
                    let flat: Vec<(usize, f64)> = row.iter().map(|&(j, _)| (j, mean_p)).collect();
                    weighted_sum(i, &flat, &mut v, -1.0);
                }
            }
            Baseline::Negative => weighted_sum(i, &negative[i], &mut v, -1.0),
        }
        v
    };

    #[cfg(feature = "parallel")]
    let vectors = {
        use rayon::prelude::*;
        (0..n_obs).into_par_iter().map(project).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let vectors = (0..n_obs).map(project).collect();

    Ok(vectors)
}

/// Project `obsp["velocity_graph"]` onto `obsm["X_<basis>"]` and store the
/// arrows in `obsm["velocity_<basis>"]`.
pub fn velocity_embedding(
    adata: &mut AnnData,
    basis: &str,
    config: &EmbeddingConfig,
) -> Result<Vec<Vec<f64>>> {
    let key = format!("X_{basis}");
    let embedding = adata.get_obsm(&key).ok_or_else(|| {
        VelocyteError::Configuration(format!("obsm['{key}'] not found"))
    })?;
    let graph = adata.get_obsp("velocity_graph").ok_or_else(|| {
        VelocyteError::Configuration(
            "obsp['velocity_graph'] not found; run velocity_graph first".into(),
        )
    })?;
    let transitions = transition_matrix(graph, &config.transition)?;
    let vectors = project_velocity(&transitions, embedding, config)?;
    adata.add_obsm(&format!("velocity_{basis}"), vectors.clone())?;
    tracing::debug!(basis, n_obs = vectors.len(), "projected velocity onto embedding");
    Ok(vectors)
}

// ── Grid flow ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GridConfig {
    /// Bins per embedding dimension.
    pub n_bins: usize,
    /// Bins with fewer cells are dropped.
    pub min_count: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { n_bins: 20, min_count: 3 }
    }
}

/// Averaged arrows on the occupied grid bins.
#[derive(Debug, Clone, Default)]
pub struct GridFlow {
    /// Bin centers, one per kept bin.
    pub centers: Vec<Vec<f64>>,
    /// Mean arrow of the cells in each bin.
    pub vectors: Vec<Vec<f64>>,
    /// Cells per bin.
    pub counts: Vec<usize>,
}

impl GridFlow {
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }
}

impl Summarizable for GridFlow {
    fn summary(&self) -> String {
        format!(
            "GridFlow: {} bins, {} cells",
            self.len(),
            self.counts.iter().sum::<usize>()
        )
    }
}

/// Bin cells on a regular grid spanning the embedding and average their
/// arrows per bin.
///
/// Cells with a non-finite coordinate or arrow are skipped. Bins are
/// returned in lexicographic bin order.
pub fn velocity_grid(
    embedding: &[Vec<f64>],
    vectors: &[Vec<f64>],
    config: &GridConfig,
) -> Result<GridFlow> {
    if config.n_bins == 0 {
        return Err(VelocyteError::Configuration("n_bins must be at least 1".into()));
    }
    if embedding.len() != vectors.len() {
        return Err(VelocyteError::dimension("velocity vectors", embedding.len(), vectors.len()));
    }
    let dim = embedding.first().map_or(0, Vec::len);
    for (e, v) in embedding.iter().zip(vectors) {
        if e.len() != dim || v.len() != dim {
            return Err(VelocyteError::dimension("embedding dimensions", dim, e.len().max(v.len())));
        }
    }

    let usable: Vec<usize> = (0..embedding.len())
        .filter(|&i| {
            embedding[i].iter().chain(&vectors[i]).all(|x| x.is_finite())
        })
        .collect();
    if usable.is_empty() {
        return Ok(GridFlow::default());
    }

    let mut lo = vec![f64::INFINITY; dim];
    let mut hi = vec![f64::NEG_INFINITY; dim];
    for &i in &usable {
        for (d, &x) in embedding[i].iter().enumerate() {
            lo[d] = lo[d].min(x);
            hi[d] = hi[d].max(x);
        }
    }
    let width: Vec<f64> = lo
        .iter()
        .zip(&hi)
        .map(|(l, h)| (h - l) / config.n_bins as f64)
        .collect();

    let mut bins: BTreeMap<Vec<usize>, (Vec<f64>, usize)> = BTreeMap::new();
    for &i in &usable {
        let key: Vec<usize> = embedding[i]
            .iter()
            .enumerate()
            .map(|(d, &x)| {
                if width[d] > 0.0 {
                    (((x - lo[d]) / width[d]) as usize).min(config.n_bins - 1)
                } else {
                    0
                }
            })
            .collect();
        let (sum, count) = bins.entry(key).or_insert_with(|| (vec![0.0; dim], 0));
        for (s, v) in sum.iter_mut().zip(&vectors[i]) {
            *s += v;
        }
        *count += 1;
    }

    let mut flow = GridFlow::default();
    let mut n_dropped = 0usize;
    for (key, (sum, count)) in bins {
        if count < config.min_count {
            n_dropped += 1;
            continue;
        }
        flow.centers.push(
            key.iter()
                .enumerate()
                .map(|(d, &b)| lo[d] + (b as f64 + 0.5) * width[d])
                .collect(),
        );
        flow.vectors.push(sum.iter().map(|s| s / count as f64).collect());
        flow.counts.push(count);
    }
    tracing::debug!(n_bins = flow.len(), n_dropped, "binned velocity grid");
    Ok(flow)
}
