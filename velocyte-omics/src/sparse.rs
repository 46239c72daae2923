//! Coordinate-format (COO) sparse matrix.
//!
//! [`SparseMatrix`] stores entries as `(row, col, value)` triplets. A stored
//! entry is meaningful even when its value is 0.0: the velocity graph uses
//! "stored zero" for an orthogonal transition and "absent" for a transition
//! that could not be measured, so [`SparseMatrix::entry`] distinguishes the
//! two while [`SparseMatrix::get`] keeps the familiar zero-fill view.

use velocyte_core::{Result, Summarizable, VelocyteError};

/// A sparse matrix in COO (coordinate) format.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
    n_rows: usize,
    n_cols: usize,
}

impl SparseMatrix {
    /// Create an empty sparse matrix with the given dimensions.
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            rows: Vec::new(),
            cols: Vec::new(),
            values: Vec::new(),
            n_rows,
            n_cols,
        }
    }

    /// Assemble a matrix from per-row `(col, value)` lists, in row order.
    ///
    /// This is how row-parallel builders merge their independent results.
    pub fn from_row_entries(row_entries: Vec<Vec<(usize, f64)>>, n_cols: usize) -> Result<Self> {
        let n_rows = row_entries.len();
        let nnz = row_entries.iter().map(Vec::len).sum();
        let mut m = Self {
            rows: Vec::with_capacity(nnz),
            cols: Vec::with_capacity(nnz),
            values: Vec::with_capacity(nnz),
            n_rows,
            n_cols,
        };
        for (r, entries) in row_entries.into_iter().enumerate() {
            for (c, v) in entries {
                m.insert(r, c, v)?;
            }
        }
        Ok(m)
    }

    /// Insert a single entry. Returns an error if indices are out of bounds.
    pub fn insert(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        if row >= self.n_rows || col >= self.n_cols {
            return Err(VelocyteError::InvalidInput(format!(
                "index ({row}, {col}) out of bounds for ({}, {})",
                self.n_rows, self.n_cols
            )));
        }
        self.rows.push(row);
        self.cols.push(col);
        self.values.push(value);
        Ok(())
    }

    /// The stored value at `(row, col)`, or `None` if nothing is stored.
    ///
    /// When an entry was inserted twice the last insertion wins. O(nnz).
    pub fn entry(&self, row: usize, col: usize) -> Option<f64> {
        (0..self.values.len())
            .rev()
            .find(|&i| self.rows[i] == row && self.cols[i] == col)
            .map(|i| self.values[i])
    }

    /// Get the value at `(row, col)`. Returns 0.0 if no entry is stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entry(row, col).unwrap_or(0.0)
    }

    /// Number of stored entries (explicit zeros included).
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Fraction of entries that are stored: `nnz / (n_rows * n_cols)`.
    pub fn density(&self) -> f64 {
        let total = self.n_rows as f64 * self.n_cols as f64;
        if total == 0.0 {
            return 0.0;
        }
        self.values.len() as f64 / total
    }

    /// (n_rows, n_cols).
    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Convert to a dense 2D vector with zero fill.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.n_cols]; self.n_rows];
        for (r, c, v) in self.iter() {
            dense[r][c] = v;
        }
        dense
    }

    /// Group stored entries by row, each row sorted by column.
    ///
    /// Duplicate `(row, col)` pairs collapse to the last inserted value.
    pub fn row_entries(&self) -> Vec<Vec<(usize, f64)>> {
        let mut out: Vec<Vec<(usize, f64)>> = vec![Vec::new(); self.n_rows];
        for (r, c, v) in self.iter() {
            out[r].push((c, v));
        }
        for row in &mut out {
            // stable sort keeps insertion order among duplicates
            row.sort_by_key(|&(c, _)| c);
            let mut dedup: Vec<(usize, f64)> = Vec::with_capacity(row.len());
            for &(c, v) in row.iter() {
                match dedup.last_mut() {
                    Some(last) if last.0 == c => last.1 = v,
                    _ => dedup.push((c, v)),
                }
            }
            *row = dedup;
        }
        out
    }

    /// Number of stored entries in a given row.
    pub fn row_nnz(&self, row: usize) -> usize {
        self.rows.iter().filter(|&&r| r == row).count()
    }

    /// Number of stored entries on the main diagonal.
    pub fn diagonal_nnz(&self) -> usize {
        self.rows
            .iter()
            .zip(&self.cols)
            .filter(|(r, c)| r == c)
            .count()
    }

    /// Iterate over stored triplets `(row, col, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.rows
            .iter()
            .zip(self.cols.iter())
            .zip(self.values.iter())
            .map(|((&r, &c), &v)| (r, c, v))
    }
}

impl Summarizable for SparseMatrix {
    fn summary(&self) -> String {
        format!(
            "SparseMatrix: {}\u{00d7}{}, {} stored ({:.2}% density)",
            self.n_rows,
            self.n_cols,
            self.nnz(),
            self.density() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_empty() {
        let m = SparseMatrix::new(10, 20);
        assert_eq!(m.shape(), (10, 20));
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.density(), 0.0);
    }

    #[test]
    fn stored_zero_differs_from_absent() {
        let mut m = SparseMatrix::new(2, 2);
        m.insert(0, 1, 0.0).unwrap();
        assert_eq!(m.entry(0, 1), Some(0.0));
        assert_eq!(m.entry(1, 0), None);
        assert_eq!(m.get(1, 0), 0.0);
        assert_eq!(m.nnz(), 1);
    }

    #[test]
    fn last_insert_wins() {
        let mut m = SparseMatrix::new(2, 2);
        m.insert(0, 0, 1.0).unwrap();
        m.insert(0, 0, 2.0).unwrap();
        assert_eq!(m.get(0, 0), 2.0);
        assert_eq!(m.row_entries()[0], vec![(0, 2.0)]);
    }

    #[test]
    fn insert_out_of_bounds() {
        let mut m = SparseMatrix::new(3, 3);
        assert!(m.insert(10, 0, 1.0).is_err());
    }

    #[test]
    fn from_row_entries_keeps_order() {
        let m = SparseMatrix::from_row_entries(
            vec![vec![(2, 0.5), (1, -0.5)], vec![], vec![(0, 1.0)]],
            3,
        )
        .unwrap();
        assert_eq!(m.shape(), (3, 3));
        assert_eq!(m.nnz(), 3);
        let rows = m.row_entries();
        assert_eq!(rows[0], vec![(1, -0.5), (2, 0.5)]);
        assert!(rows[1].is_empty());
        assert_eq!(m.row_nnz(2), 1);
    }

    #[test]
    fn from_row_entries_rejects_bad_column() {
        assert!(SparseMatrix::from_row_entries(vec![vec![(5, 1.0)]], 2).is_err());
    }

    #[test]
    fn dense_view_fills_zero() {
        let mut m = SparseMatrix::new(2, 2);
        m.insert(0, 1, 3.0).unwrap();
        m.insert(1, 0, 7.0).unwrap();
        assert_eq!(m.to_dense(), vec![vec![0.0, 3.0], vec![7.0, 0.0]]);
    }

    #[test]
    fn diagonal_count() {
        let m = SparseMatrix::from_row_entries(vec![vec![(0, 1.0)], vec![(0, 2.0), (1, 0.0)]], 2)
            .unwrap();
        assert_eq!(m.diagonal_nnz(), 2);
    }

    #[test]
    fn summary() {
        let mut m = SparseMatrix::new(100, 50);
        m.insert(0, 0, 1.0).unwrap();
        assert_eq!(
            m.summary(),
            "SparseMatrix: 100\u{00d7}50, 1 stored (0.02% density)"
        );
    }
}
