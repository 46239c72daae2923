//! Neighborhood moments of spliced and unspliced abundance.
//!
//! Each cell's counts are smoothed by averaging the cell with its `k`
//! neighbors under uniform weights. First moments (`Ms`, `Mu`) feed both
//! kinetic models. Second moments (`⟨s²⟩`, `⟨us⟩`, `⟨u²⟩`) are stored
//! alongside as `Mss`, `Mus` and `Muu`.
//!
//! Uniform non-negative weights on non-negative counts cannot produce a
//! negative average.

use velocyte_core::{Result, Summarizable, VelocyteError};

use crate::neighbors::NeighborGraph;
use crate::single_cell::{AnnData, MatrixData};

/// Configuration for moment estimation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MomentsConfig {
    /// Neighbors taken from `obsp["distances"]` per cell.
    pub n_neighbors: usize,
    /// Also compute second-order moments.
    pub second_order: bool,
}

impl Default for MomentsConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 30,
            second_order: true,
        }
    }
}

/// Second-order raw moments, cell-major.
#[derive(Debug, Clone)]
pub struct SecondMoments {
    /// ⟨s²⟩ per cell and gene.
    pub mss: Vec<Vec<f64>>,
    /// ⟨u·s⟩ per cell and gene.
    pub mus: Vec<Vec<f64>>,
    /// ⟨u²⟩ per cell and gene.
    pub muu: Vec<Vec<f64>>,
}

/// Smoothed per-cell, per-gene moments.
#[derive(Debug, Clone)]
pub struct Moments {
    /// ⟨s⟩ per cell and gene.
    pub ms: Vec<Vec<f64>>,
    /// ⟨u⟩ per cell and gene.
    pub mu: Vec<Vec<f64>>,
    /// Present when computed with `second_order`.
    pub second: Option<SecondMoments>,
}

impl Moments {
    /// Wrap precomputed first moments (e.g. read back from `Ms`/`Mu`).
    pub fn from_first_order(ms: Vec<Vec<f64>>, mu: Vec<Vec<f64>>) -> Result<Self> {
        if ms.len() != mu.len() {
            return Err(VelocyteError::dimension("Mu cells", ms.len(), mu.len()));
        }
        let n_vars = ms.first().map_or(0, Vec::len);
        for (row_s, row_u) in ms.iter().zip(&mu) {
            if row_s.len() != n_vars || row_u.len() != n_vars {
                return Err(VelocyteError::dimension(
                    "moment genes",
                    n_vars,
                    row_s.len().max(row_u.len()),
                ));
            }
        }
        Ok(Self { ms, mu, second: None })
    }

    /// Number of cells.
    pub fn n_obs(&self) -> usize {
        self.ms.len()
    }

    /// Number of genes.
    pub fn n_vars(&self) -> usize {
        self.ms.first().map_or(0, Vec::len)
    }

    /// ⟨s⟩ across cells for one gene.
    pub fn spliced_column(&self, gene: usize) -> Vec<f64> {
        self.ms.iter().map(|row| row[gene]).collect()
    }

    /// ⟨u⟩ across cells for one gene.
    pub fn unspliced_column(&self, gene: usize) -> Vec<f64> {
        self.mu.iter().map(|row| row[gene]).collect()
    }
}

impl Summarizable for Moments {
    fn summary(&self) -> String {
        format!(
            "Moments: {} cells \u{00d7} {} genes ({} order)",
            self.n_obs(),
            self.n_vars(),
            if self.second.is_some() { "second" } else { "first" }
        )
    }
}

/// Per-cell accumulator for one neighborhood.
struct CellMoments {
    s: Vec<f64>,
    u: Vec<f64>,
    ss: Vec<f64>,
    us: Vec<f64>,
    uu: Vec<f64>,
}

/// Average each cell with its neighbors.
///
/// # Errors
///
/// - `DimensionMismatch` when the layers differ in shape or the graph covers
///   a different number of cells.
/// - `Configuration` when a layer has ragged rows or holds negative or
///   non-finite values.
pub fn compute_moments(
    spliced: &MatrixData,
    unspliced: &MatrixData,
    graph: &NeighborGraph,
    config: &MomentsConfig,
) -> Result<Moments> {
    require_rectangular("spliced", spliced)?;
    require_rectangular("unspliced", unspliced)?;
    let (n_obs, n_vars) = spliced.shape();
    let (u_obs, u_vars) = unspliced.shape();
    if u_obs != n_obs {
        return Err(VelocyteError::dimension("unspliced cells", n_obs, u_obs));
    }
    if u_vars != n_vars {
        return Err(VelocyteError::dimension("unspliced genes", n_vars, u_vars));
    }
    graph.validate(n_obs)?;

    let s_rows = spliced.to_dense_rows();
    let u_rows = unspliced.to_dense_rows();
    check_counts("spliced", &s_rows)?;
    check_counts("unspliced", &u_rows)?;

    let second_order = config.second_order;
    let smooth = |i: usize| -> CellMoments {
        let members = std::iter::once(i).chain(graph.neighbors(i).iter().copied());
        let mut acc = CellMoments {
            s: vec![0.0; n_vars],
            u: vec![0.0; n_vars],
            ss: Vec::new(),
            us: Vec::new(),
            uu: Vec::new(),
        };
        if second_order {
            acc.ss = vec![0.0; n_vars];
            acc.us = vec![0.0; n_vars];
            acc.uu = vec![0.0; n_vars];
        }
        let mut n = 0usize;
        for j in members {
            n += 1;
            for g in 0..n_vars {
                let (s, u) = (s_rows[j][g], u_rows[j][g]);
                acc.s[g] += s;
                acc.u[g] += u;
                if second_order {
                    acc.ss[g] += s * s;
                    acc.us[g] += u * s;
                    acc.uu[g] += u * u;
                }
            }
        }
        let w = 1.0 / n as f64;
        for v in acc
            .s
            .iter_mut()
            .chain(acc.u.iter_mut())
            .chain(acc.ss.iter_mut())
            .chain(acc.us.iter_mut())
            .chain(acc.uu.iter_mut())
        {
            *v *= w;
        }
        acc
    };

    #[cfg(feature = "parallel")]
    let cells: Vec<CellMoments> = {
        use rayon::prelude::*;
        (0..n_obs).into_par_iter().map(smooth).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let cells: Vec<CellMoments> = (0..n_obs).map(smooth).collect();

    let mut ms = Vec::with_capacity(n_obs);
    let mut mu = Vec::with_capacity(n_obs);
    let mut second = second_order.then(|| SecondMoments {
        mss: Vec::with_capacity(n_obs),
        mus: Vec::with_capacity(n_obs),
        muu: Vec::with_capacity(n_obs),
    });
    for cell in cells {
        ms.push(cell.s);
        mu.push(cell.u);
        if let Some(sm) = second.as_mut() {
            sm.mss.push(cell.ss);
            sm.mus.push(cell.us);
            sm.muu.push(cell.uu);
        }
    }

    tracing::debug!(n_obs, n_vars, k = graph.k(), second_order, "computed moments");
    Ok(Moments { ms, mu, second })
}

/// Compute moments from the layers and kNN graph stored in `adata`.
///
/// Requires `layers["spliced"]`, `layers["unspliced"]` and
/// `obsp["distances"]`. Stores `layers["Ms"]` and `layers["Mu"]`, plus
/// `Mss`, `Mus` and `Muu` when second moments are requested.
pub fn moments(adata: &mut AnnData, config: &MomentsConfig) -> Result<Moments> {
    let distances = adata.get_obsp("distances").ok_or_else(|| {
        VelocyteError::Configuration(
            "obsp['distances'] not found; a neighbor graph is required for moments".into(),
        )
    })?;
    let graph = NeighborGraph::from_distances(distances, config.n_neighbors)?;
    let result = compute_moments(
        adata.require_layer("spliced")?,
        adata.require_layer("unspliced")?,
        &graph,
        config,
    )?;

    adata.add_layer("Ms", MatrixData::Dense(result.ms.clone()))?;
    adata.add_layer("Mu", MatrixData::Dense(result.mu.clone()))?;
    if let Some(sm) = &result.second {
        adata.add_layer("Mss", MatrixData::Dense(sm.mss.clone()))?;
        adata.add_layer("Mus", MatrixData::Dense(sm.mus.clone()))?;
        adata.add_layer("Muu", MatrixData::Dense(sm.muu.clone()))?;
    }
    adata.add_uns("moments_n_neighbors", graph.k().to_string());
    Ok(result)
}

/// Reject dense layers whose rows differ in length.
pub(crate) fn require_rectangular(name: &str, layer: &MatrixData) -> Result<()> {
    if layer.is_rectangular() {
        Ok(())
    } else {
        Err(VelocyteError::Configuration(format!(
            "layers['{name}'] has rows of different lengths"
        )))
    }
}

fn check_counts(name: &str, rows: &[Vec<f64>]) -> Result<()> {
    for (i, row) in rows.iter().enumerate() {
        if let Some(g) = row.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(VelocyteError::Configuration(format!(
                "layers['{name}'] has invalid value {} at cell {i}, gene {g}; counts must be finite and non-negative",
                row[g]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseMatrix;

    const TOL: f64 = 1e-12;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}_{i}")).collect()
    }

    fn ring(n: usize) -> NeighborGraph {
        let indices = (0..n).map(|i| vec![(i + 1) % n, (i + n - 1) % n]).collect();
        NeighborGraph::from_indices(indices).unwrap()
    }

    #[test]
    fn first_moments_average_self_and_neighbors() {
        let s = MatrixData::Dense(vec![vec![3.0], vec![0.0], vec![6.0], vec![9.0]]);
        let u = MatrixData::Dense(vec![vec![1.0], vec![2.0], vec![0.0], vec![3.0]]);
        let m = compute_moments(&s, &u, &ring(4), &MomentsConfig::default()).unwrap();
        // cell 0 averages cells 0, 1, 3
        assert!((m.ms[0][0] - 4.0).abs() < TOL);
        assert!((m.mu[0][0] - 2.0).abs() < TOL);
        // cell 2 averages cells 2, 3, 1
        assert!((m.ms[2][0] - 5.0).abs() < TOL);
    }

    #[test]
    fn second_moments_average_products() {
        let s = MatrixData::Dense(vec![vec![1.0], vec![3.0], vec![5.0]]);
        let u = MatrixData::Dense(vec![vec![2.0], vec![2.0], vec![2.0]]);
        let m = compute_moments(&s, &u, &ring(3), &MomentsConfig::default()).unwrap();
        let sm = m.second.as_ref().unwrap();
        // every cell sees {1, 3, 5}
        assert!((sm.mss[0][0] - 35.0 / 3.0).abs() < 1e-10);
        assert!((sm.mus[1][0] - 6.0).abs() < 1e-10);
        assert!((sm.muu[2][0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn first_order_only() {
        let s = MatrixData::Dense(vec![vec![1.0], vec![3.0]]);
        let u = s.clone();
        let graph = NeighborGraph::from_indices(vec![vec![1], vec![0]]).unwrap();
        let config = MomentsConfig { second_order: false, ..Default::default() };
        let m = compute_moments(&s, &u, &graph, &config).unwrap();
        assert!(m.second.is_none());
        assert_eq!(m.summary(), "Moments: 2 cells \u{00d7} 1 genes (first order)");
    }

    #[test]
    fn sparse_zero_inflated_input_stays_non_negative() {
        let mut sp = SparseMatrix::new(5, 3);
        sp.insert(0, 0, 4.0).unwrap();
        sp.insert(3, 2, 1.0).unwrap();
        let s = MatrixData::Sparse(sp.clone());
        let u = MatrixData::Sparse(sp);
        let m = compute_moments(&s, &u, &ring(5), &MomentsConfig::default()).unwrap();
        for c in 0..5 {
            for g in 0..3 {
                assert!(m.ms[c][g] >= 0.0);
                assert!(m.second.as_ref().unwrap().mss[c][g] >= 0.0);
            }
        }
        assert!((m.ms[1][0] - 4.0 / 3.0).abs() < TOL);
    }

    #[test]
    fn negative_counts_rejected() {
        let s = MatrixData::Dense(vec![vec![1.0], vec![-1.0]]);
        let graph = NeighborGraph::from_indices(vec![vec![1], vec![0]]).unwrap();
        let err = compute_moments(&s, &s.clone(), &graph, &MomentsConfig::default()).unwrap_err();
        assert!(matches!(err, VelocyteError::Configuration(_)));
    }

    #[test]
    fn ragged_dense_layer_rejected() {
        let s = MatrixData::Dense(vec![vec![1.0, 2.0], vec![3.0]]);
        let graph = NeighborGraph::from_indices(vec![vec![1], vec![0]]).unwrap();
        let err = compute_moments(&s, &s.clone(), &graph, &MomentsConfig::default()).unwrap_err();
        assert!(matches!(err, VelocyteError::Configuration(_)));
    }

    #[test]
    fn graph_cell_count_mismatch() {
        let s = MatrixData::Dense(vec![vec![1.0]; 3]);
        let err = compute_moments(&s, &s.clone(), &ring(4), &MomentsConfig::default()).unwrap_err();
        assert!(matches!(err, VelocyteError::DimensionMismatch { .. }));
    }

    #[test]
    fn layer_shape_mismatch() {
        let s = MatrixData::Dense(vec![vec![1.0, 2.0]; 3]);
        let u = MatrixData::Dense(vec![vec![1.0]; 3]);
        let err = compute_moments(&s, &u, &ring(3), &MomentsConfig::default()).unwrap_err();
        assert!(matches!(err, VelocyteError::DimensionMismatch { .. }));
    }

    #[test]
    fn adata_moments_require_distances() {
        let s = MatrixData::Dense(vec![vec![1.0], vec![2.0]]);
        let mut adata = AnnData::from_layers(s.clone(), s, names("cell", 2), names("gene", 1)).unwrap();
        let err = moments(&mut adata, &MomentsConfig::default()).unwrap_err();
        assert!(matches!(err, VelocyteError::Configuration(_)));
    }

    #[test]
    fn adata_moments_store_layers() {
        let s = MatrixData::Dense(vec![vec![1.0], vec![3.0]]);
        let u = MatrixData::Dense(vec![vec![2.0], vec![4.0]]);
        let mut adata = AnnData::from_layers(s, u, names("cell", 2), names("gene", 1)).unwrap();
        let mut d = SparseMatrix::new(2, 2);
        d.insert(0, 1, 1.0).unwrap();
        d.insert(1, 0, 1.0).unwrap();
        adata.add_obsp("distances", d).unwrap();

        moments(&mut adata, &MomentsConfig::default()).unwrap();
        assert!((adata.get_layer("Ms").unwrap().get(0, 0) - 2.0).abs() < TOL);
        assert!((adata.get_layer("Mu").unwrap().get(1, 0) - 3.0).abs() < TOL);
        assert_eq!(adata.get_uns("moments_n_neighbors"), Some("1"));
        // ⟨s²⟩ over {1, 3}
        assert!((adata.get_layer("Mss").unwrap().get(0, 0) - 5.0).abs() < TOL);
    }
}
