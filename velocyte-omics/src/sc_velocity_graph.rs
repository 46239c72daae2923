//! Velocity graph: cosine similarity between each cell's velocity and its
//! displacement toward nearby cells.
//!
//! Entry `(i, j)` compares the velocity of cell `i` with `Ms[j] − Ms[i]` over
//! the velocity genes. The graph is asymmetric, never stores the diagonal,
//! and keeps two kinds of "nothing" apart: a stored `0.0` means the
//! directions are orthogonal, while an absent entry means `j` was outside the
//! candidate set or one of the vectors was too short to have a direction.

use velocyte_core::{Result, Summarizable, VelocyteError};
use velocyte_stats::cosine_similarity;

use crate::neighbors::NeighborGraph;
use crate::sc_velocity::{stored_velocity, VelocityMatrix};
use crate::single_cell::AnnData;
use crate::sparse::SparseMatrix;

// ── Configuration ──────────────────────────────────────────────────────────

/// Monotone map applied to each measured cosine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SimilarityTransform {
    /// Store the cosine as is.
    #[default]
    Identity,
    /// `expm1(scale·c) / expm1(scale)`: sharpens positive correlations and
    /// keeps `0 ↦ 0` and `1 ↦ 1`.
    Exponential { scale: f64 },
}

impl SimilarityTransform {
    pub fn apply(&self, c: f64) -> f64 {
        match *self {
            Self::Identity => c,
            Self::Exponential { scale } => (scale * c).exp_m1() / scale.exp_m1(),
        }
    }
}

/// Configuration for [`build_velocity_graph`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VelocityGraphConfig {
    /// Neighbors taken from `obsp["distances"]` per cell.
    pub n_neighbors: usize,
    /// Times the candidate set is expanded through neighbors of neighbors.
    pub n_recurse_neighbors: usize,
    /// Apply a signed square root to displacement and velocity.
    pub sqrt_transform: bool,
    /// Vectors with an L2 norm at or below this have no direction.
    pub min_norm: f64,
    pub transform: SimilarityTransform,
}

impl Default for VelocityGraphConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 30,
            n_recurse_neighbors: 1,
            sqrt_transform: false,
            min_norm: 1e-12,
            transform: SimilarityTransform::Identity,
        }
    }
}

impl VelocityGraphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_neighbors == 0 {
            return Err(VelocyteError::Configuration(
                "n_neighbors must be at least 1".into(),
            ));
        }
        if !(self.min_norm >= 0.0 && self.min_norm.is_finite()) {
            return Err(VelocyteError::Configuration(format!(
                "min_norm must be finite and non-negative, got {}",
                self.min_norm
            )));
        }
        if let SimilarityTransform::Exponential { scale } = self.transform {
            if !(scale > 0.0 && scale.is_finite()) {
                return Err(VelocyteError::Configuration(format!(
                    "exponential transform scale must be positive, got {scale}"
                )));
            }
        }
        Ok(())
    }
}

// ── Graph ──────────────────────────────────────────────────────────────────

/// A velocity graph and its bookkeeping.
#[derive(Debug, Clone)]
pub struct VelocityGraph {
    /// n_obs × n_obs transformed cosines.
    pub graph: SparseMatrix,
    /// Candidate pairs examined.
    pub n_candidates: usize,
    /// Candidate pairs left absent because a vector had no direction.
    pub n_undefined: usize,
}

impl Summarizable for VelocityGraph {
    fn summary(&self) -> String {
        let (n, _) = self.graph.shape();
        format!(
            "VelocityGraph: {} cells, {} entries ({} of {} candidates undefined)",
            n,
            self.graph.nnz(),
            self.n_undefined,
            self.n_candidates
        )
    }
}

fn signed_sqrt(x: f64) -> f64 {
    x.signum() * x.abs().sqrt()
}

/// Build the velocity graph.
///
/// `expression` is the cell-major first-moment matrix (`Ms`) the velocity
/// was computed from. Rows are computed independently and merged in row
/// order.
pub fn build_velocity_graph(
    velocity: &VelocityMatrix,
    expression: &[Vec<f64>],
    graph: &NeighborGraph,
    config: &VelocityGraphConfig,
) -> Result<VelocityGraph> {
    config.validate()?;
    let n_obs = velocity.n_obs();
    if expression.len() != n_obs {
        return Err(VelocyteError::dimension("expression cells", n_obs, expression.len()));
    }
    if let Some(row) = expression.iter().find(|r| r.len() != velocity.n_vars()) {
        return Err(VelocyteError::dimension("expression genes", velocity.n_vars(), row.len()));
    }
    graph.validate(n_obs)?;

    let genes = velocity.velocity_genes();
    if genes.is_empty() {
        tracing::warn!(n_obs, "no velocity genes; velocity graph is empty");
    }

    let row = |i: usize| -> Result<(Vec<(usize, f64)>, usize, usize)> {
        let mut v = velocity.cell_vector(i, &genes);
        if config.sqrt_transform {
            v.iter_mut().for_each(|x| *x = signed_sqrt(*x));
        }
        let candidates = graph.expanded_neighbors(i, config.n_recurse_neighbors);
        let mut entries = Vec::with_capacity(candidates.len());
        let mut undefined = 0usize;
        let mut dx = vec![0.0; genes.len()];
        for &j in &candidates {
            for (d, &g) in dx.iter_mut().zip(&genes) {
                let diff = expression[j][g] - expression[i][g];
                *d = if config.sqrt_transform { signed_sqrt(diff) } else { diff };
            }
            match cosine_similarity(&v, &dx, config.min_norm)? {
                Some(c) => entries.push((j, config.transform.apply(c))),
                None => undefined += 1,
            }
        }
        Ok((entries, candidates.len(), undefined))
    };

    #[cfg(feature = "parallel")]
    let rows: Vec<(Vec<(usize, f64)>, usize, usize)> = {
        use rayon::prelude::*;
        (0..n_obs).into_par_iter().map(row).collect::<Result<_>>()?
    };
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<(Vec<(usize, f64)>, usize, usize)> =
        (0..n_obs).map(row).collect::<Result<_>>()?;

    let mut n_candidates = 0;
    let mut n_undefined = 0;
    let mut row_entries = Vec::with_capacity(n_obs);
    for (entries, candidates, undefined) in rows {
        n_candidates += candidates;
        n_undefined += undefined;
        row_entries.push(entries);
    }
    let matrix = SparseMatrix::from_row_entries(row_entries, n_obs)?;

    tracing::debug!(
        n_obs,
        n_velocity_genes = genes.len(),
        nnz = matrix.nnz(),
        n_undefined,
        "built velocity graph"
    );
    Ok(VelocityGraph {
        graph: matrix,
        n_candidates,
        n_undefined,
    })
}

/// Build the velocity graph from `adata` and store it in
/// `obsp["velocity_graph"]`.
///
/// Requires `layers["velocity"]`, `layers["Ms"]` and `obsp["distances"]`.
pub fn velocity_graph(adata: &mut AnnData, config: &VelocityGraphConfig) -> Result<VelocityGraph> {
    let velocity = stored_velocity(adata)?;
    let expression = adata.require_layer("Ms")?.to_dense_rows();
    let distances = adata.get_obsp("distances").ok_or_else(|| {
        VelocyteError::Configuration(
            "obsp['distances'] not found; a neighbor graph is required for the velocity graph"
                .into(),
        )
    })?;
    let neighbors = NeighborGraph::from_distances(distances, config.n_neighbors)?;
    let result = build_velocity_graph(&velocity, &expression, &neighbors, config)?;
    adata.add_obsp("velocity_graph", result.graph.clone())?;
    tracing::info!(
        nnz = result.graph.nnz(),
        n_undefined = result.n_undefined,
        "stored velocity graph"
    );
    Ok(result)
}

// ── Transition probabilities ───────────────────────────────────────────────

/// Configuration for [`transition_matrix`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransitionConfig {
    /// Kernel width applied to the cosines before exponentiation.
    pub scale: f64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self { scale: 10.0 }
    }
}

/// Row-normalized transition weights from positive and negative cosines.
#[derive(Debug, Clone)]
pub struct TransitionMatrices {
    pub positive: SparseMatrix,
    pub negative: SparseMatrix,
}

/// Convert a velocity graph into transition probabilities.
///
/// Each stored cosine `c` gives weight `expm1(scale·c)` to the positive
/// matrix when `c > 0` and `expm1(scale·|c|)` to the negative matrix when
/// `c < 0`. Rows are then normalized to sum to one; rows with no weight
/// stay empty.
pub fn transition_matrix(graph: &SparseMatrix, config: &TransitionConfig) -> Result<TransitionMatrices> {
    if !(config.scale > 0.0 && config.scale.is_finite()) {
        return Err(VelocyteError::Configuration(format!(
            "transition scale must be positive, got {}",
            config.scale
        )));
    }
    let (n_rows, n_cols) = graph.shape();
    let rows = graph.row_entries();
    let weights = |sign: f64| -> Vec<Vec<(usize, f64)>> {
        rows.iter()
            .map(|row| {
                let mut w: Vec<(usize, f64)> = row
                    .iter()
                    .filter(|&&(_, c)| sign * c > 0.0)
                    .map(|&(j, c)| (j, (config.scale * sign * c).exp_m1()))
                    .collect();
                let total: f64 = w.iter().map(|&(_, x)| x).sum();
                if total > 0.0 {
                    w.iter_mut().for_each(|(_, x)| *x /= total);
                } else {
                    w.clear();
                }
                w
            })
            .collect()
    };
    let positive = SparseMatrix::from_row_entries(weights(1.0), n_cols)?;
    let negative = SparseMatrix::from_row_entries(weights(-1.0), n_cols)?;
    debug_assert_eq!(positive.shape(), (n_rows, n_cols));
    Ok(TransitionMatrices { positive, negative })
}
