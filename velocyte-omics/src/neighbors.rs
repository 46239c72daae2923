//! Fixed-size cell neighborhoods.
//!
//! [`NeighborGraph`] is the adjacency-list view of a precomputed kNN graph:
//! every cell has exactly `k` neighbors, none of them itself. It is built
//! from the `obsp["distances"]` matrix produced by preprocessing, or directly
//! from index lists.

use std::collections::BTreeSet;

use velocyte_core::{Result, Summarizable, VelocyteError};

use crate::sparse::SparseMatrix;

/// A kNN graph with a fixed number of neighbors per cell.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    indices: Vec<Vec<usize>>,
    distances: Vec<Vec<f64>>,
    k: usize,
}

impl NeighborGraph {
    /// Build from neighbor index lists and matching distances.
    ///
    /// Every row must have the same length, no neighbor index may be out of
    /// range, and no cell may list itself.
    pub fn new(indices: Vec<Vec<usize>>, distances: Vec<Vec<f64>>) -> Result<Self> {
        if indices.len() != distances.len() {
            return Err(VelocyteError::Configuration(format!(
                "neighbor graph has {} index rows but {} distance rows",
                indices.len(),
                distances.len()
            )));
        }
        let k = indices.first().map_or(0, Vec::len);
        for (i, (idx, dist)) in indices.iter().zip(&distances).enumerate() {
            if idx.len() != k || dist.len() != k {
                return Err(VelocyteError::Configuration(format!(
                    "neighbor graph row {i} has {} neighbors and {} distances, expected {k}",
                    idx.len(),
                    dist.len()
                )));
            }
        }
        let graph = Self { indices, distances, k };
        graph.check_indices()?;
        Ok(graph)
    }

    /// Build from neighbor index lists only (all distances zero).
    pub fn from_indices(indices: Vec<Vec<usize>>) -> Result<Self> {
        let distances = indices.iter().map(|row| vec![0.0; row.len()]).collect();
        Self::new(indices, distances)
    }

    /// Extract the `n_neighbors` closest neighbors per cell from a kNN
    /// distance matrix.
    ///
    /// Self entries are ignored. When some cell stores fewer than
    /// `n_neighbors` neighbors, every cell is truncated to that shorter
    /// length so the graph keeps a fixed `k`.
    pub fn from_distances(distances: &SparseMatrix, n_neighbors: usize) -> Result<Self> {
        let (n_rows, n_cols) = distances.shape();
        if n_rows != n_cols {
            return Err(VelocyteError::Configuration(format!(
                "distance graph must be square, got ({n_rows}, {n_cols})"
            )));
        }
        if n_neighbors == 0 {
            return Err(VelocyteError::Configuration(
                "n_neighbors must be at least 1".into(),
            ));
        }

        let mut rows: Vec<Vec<(usize, f64)>> = distances.row_entries();
        for (i, row) in rows.iter_mut().enumerate() {
            row.retain(|&(j, d)| j != i && d.is_finite());
            row.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        }
        let shortest = rows.iter().map(Vec::len).min().unwrap_or(0);
        if shortest == 0 && n_rows > 0 {
            let empty = rows.iter().position(Vec::is_empty).unwrap_or(0);
            return Err(VelocyteError::Configuration(format!(
                "cell {empty} has no neighbors in the distance graph"
            )));
        }
        let k = n_neighbors.min(shortest);
        if k < n_neighbors {
            let cell = rows.iter().position(|r| r.len() == shortest).unwrap_or(0);
            tracing::warn!(
                requested = n_neighbors,
                available = k,
                cell,
                "distance graph has fewer neighbors than requested; truncating every cell to the shortest row"
            );
        }

        let (indices, dists): (Vec<Vec<usize>>, Vec<Vec<f64>>) = rows
            .into_iter()
            .map(|row| row.into_iter().take(k).unzip())
            .unzip();
        Self::new(indices, dists)
    }

    /// Number of cells.
    pub fn n_obs(&self) -> usize {
        self.indices.len()
    }

    /// Neighbors per cell.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Neighbor indices of `cell`.
    pub fn neighbors(&self, cell: usize) -> &[usize] {
        &self.indices[cell]
    }

    /// Distances from `cell` to its neighbors, in neighbor order.
    pub fn distances(&self, cell: usize) -> &[f64] {
        &self.distances[cell]
    }

    /// Check that the graph covers exactly `n_obs` cells.
    pub fn validate(&self, n_obs: usize) -> Result<()> {
        if self.n_obs() != n_obs {
            return Err(VelocyteError::dimension(
                "neighbor graph cells",
                n_obs,
                self.n_obs(),
            ));
        }
        Ok(())
    }

    /// Neighbors reachable from `cell` within `depth + 1` hops, sorted,
    /// excluding `cell` itself.
    ///
    /// `depth = 0` returns the direct neighbors.
    pub fn expanded_neighbors(&self, cell: usize, depth: usize) -> Vec<usize> {
        let mut seen: BTreeSet<usize> = self.indices[cell].iter().copied().collect();
        let mut frontier: Vec<usize> = seen.iter().copied().collect();
        for _ in 0..depth {
            let mut next = Vec::new();
            for &j in &frontier {
                for &n in &self.indices[j] {
                    if seen.insert(n) {
                        next.push(n);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        seen.remove(&cell);
        seen.into_iter().collect()
    }

    fn check_indices(&self) -> Result<()> {
        let n = self.indices.len();
        for (i, row) in self.indices.iter().enumerate() {
            for &j in row {
                if j >= n {
                    return Err(VelocyteError::Configuration(format!(
                        "cell {i} lists neighbor {j}, but the graph has {n} cells"
                    )));
                }
                if j == i {
                    return Err(VelocyteError::Configuration(format!(
                        "cell {i} lists itself as a neighbor"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Summarizable for NeighborGraph {
    fn summary(&self) -> String {
        format!("NeighborGraph: {} cells, k={}", self.n_obs(), self.k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> NeighborGraph {
        let indices = (0..n)
            .map(|i| vec![if i + 1 < n { i + 1 } else { i - 1 }])
            .collect();
        NeighborGraph::from_indices(indices).unwrap()
    }

    #[test]
    fn ragged_rows_rejected() {
        let err = NeighborGraph::from_indices(vec![vec![1], vec![0, 2], vec![1]]).unwrap_err();
        assert!(matches!(err, VelocyteError::Configuration(_)));
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(NeighborGraph::from_indices(vec![vec![1], vec![5]]).is_err());
    }

    #[test]
    fn self_loop_rejected() {
        assert!(NeighborGraph::from_indices(vec![vec![0], vec![0]]).is_err());
    }

    #[test]
    fn from_distances_sorts_and_truncates() {
        let mut d = SparseMatrix::new(3, 3);
        d.insert(0, 2, 0.5).unwrap();
        d.insert(0, 1, 1.5).unwrap();
        d.insert(1, 0, 1.0).unwrap();
        d.insert(1, 2, 0.2).unwrap();
        d.insert(2, 1, 0.3).unwrap();
        d.insert(2, 2, 0.0).unwrap(); // self entry is ignored
        let g = NeighborGraph::from_distances(&d, 5).unwrap();
        assert_eq!(g.k(), 1);
        assert_eq!(g.neighbors(0), &[2]);
        assert_eq!(g.neighbors(1), &[2]);
        assert_eq!(g.neighbors(2), &[1]);
        assert_eq!(g.distances(2), &[0.3]);
    }

    #[test]
    fn from_distances_empty_row_is_configuration_error() {
        let mut d = SparseMatrix::new(2, 2);
        d.insert(0, 1, 1.0).unwrap();
        let err = NeighborGraph::from_distances(&d, 1).unwrap_err();
        assert!(matches!(err, VelocyteError::Configuration(_)));
    }

    #[test]
    fn validate_cell_count() {
        let g = chain(4);
        assert!(g.validate(4).is_ok());
        assert!(matches!(
            g.validate(5).unwrap_err(),
            VelocyteError::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn expansion_reaches_second_hop() {
        let g = chain(5);
        assert_eq!(g.expanded_neighbors(0, 0), vec![1]);
        assert_eq!(g.expanded_neighbors(0, 1), vec![1, 2]);
        assert_eq!(g.expanded_neighbors(0, 3), vec![1, 2, 3, 4]);
        // the chain end points back to its predecessor, never to itself
        assert_eq!(g.expanded_neighbors(4, 1), vec![3]);
    }

    #[test]
    fn summary() {
        assert_eq!(chain(3).summary(), "NeighborGraph: 3 cells, k=1");
    }
}
