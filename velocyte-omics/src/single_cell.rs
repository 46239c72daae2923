//! AnnData-like container for spliced/unspliced single-cell data.
//!
//! An in-memory stand-in for the annotated data object of the scverse
//! ecosystem. The velocity engine reads its inputs from here and writes its
//! outputs back under the conventional keys:
//!
//! - `layers["spliced"]`, `layers["unspliced"]` — raw count layers (input)
//! - `obsp["distances"]` — kNN distance graph (input, from preprocessing)
//! - `obsm["X_<basis>"]` — embedding coordinates (input, optional)
//! - `layers["Ms"]`, `layers["Mu"]` — first moments
//! - `layers["velocity"]`, `obsp["velocity_graph"]`, `obsm["velocity_<basis>"]`
//! - `var["fit_*"]` — per-gene kinetic parameters
//! - `varm["loss"]` — per-gene loss trace of the dynamical fit, NaN-padded
//!
//! # Example
//!
//! ```
//! use velocyte_omics::single_cell::{AnnData, MatrixData};
//!
//! let s = MatrixData::Dense(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
//! let u = MatrixData::Dense(vec![vec![0.5, 1.0], vec![1.5, 2.0]]);
//! let adata = AnnData::from_layers(
//!     s,
//!     u,
//!     vec!["cell_1".into(), "cell_2".into()],
//!     vec!["gene_a".into(), "gene_b".into()],
//! ).unwrap();
//! assert_eq!(adata.n_obs(), 2);
//! assert!(adata.get_layer("unspliced").is_some());
//! ```

use std::collections::HashMap;

use velocyte_core::{Result, Summarizable, VelocyteError};

use crate::sparse::SparseMatrix;

/// A cell × gene matrix, either dense or sparse.
#[derive(Debug, Clone)]
pub enum MatrixData {
    /// Dense row-major matrix (n_obs × n_vars).
    Dense(Vec<Vec<f64>>),
    /// Sparse COO matrix; absent entries read as 0.0.
    Sparse(SparseMatrix),
}

impl MatrixData {
    /// (n_obs, n_vars).
    pub fn shape(&self) -> (usize, usize) {
        match self {
            MatrixData::Dense(rows) => {
                let n_obs = rows.len();
                let n_vars = rows.first().map_or(0, |r| r.len());
                (n_obs, n_vars)
            }
            MatrixData::Sparse(s) => s.shape(),
        }
    }

    /// Get a value at (obs_idx, var_idx).
    pub fn get(&self, obs: usize, var: usize) -> f64 {
        match self {
            MatrixData::Dense(rows) => {
                rows.get(obs).and_then(|r| r.get(var)).copied().unwrap_or(0.0)
            }
            MatrixData::Sparse(s) => s.get(obs, var),
        }
    }

    /// Dense copy, one row per cell.
    pub fn to_dense_rows(&self) -> Vec<Vec<f64>> {
        match self {
            MatrixData::Dense(rows) => rows.clone(),
            MatrixData::Sparse(s) => s.to_dense(),
        }
    }

    /// Dense copy, one vector per gene.
    pub fn to_dense_columns(&self) -> Vec<Vec<f64>> {
        let (n_obs, n_vars) = self.shape();
        let mut cols = vec![vec![0.0; n_obs]; n_vars];
        match self {
            MatrixData::Dense(rows) => {
                for (i, row) in rows.iter().enumerate() {
                    for (j, &v) in row.iter().enumerate() {
                        cols[j][i] = v;
                    }
                }
            }
            MatrixData::Sparse(s) => {
                for (r, c, v) in s.iter() {
                    cols[c][r] = v;
                }
            }
        }
        cols
    }

    /// Whether every row of a dense matrix has the same length.
    pub fn is_rectangular(&self) -> bool {
        match self {
            MatrixData::Dense(rows) => {
                let n_vars = rows.first().map_or(0, |r| r.len());
                rows.iter().all(|r| r.len() == n_vars)
            }
            MatrixData::Sparse(_) => true,
        }
    }
}

/// A metadata column with typed data.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Free-text string values.
    Strings(Vec<String>),
    /// Numeric (f64) values; NaN marks "not available".
    Numeric(Vec<f64>),
    /// Boolean flags (e.g. gene masks).
    Bool(Vec<bool>),
}

impl ColumnData {
    /// Number of elements in this column.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Strings(v) => v.len(),
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
        }
    }

    /// Whether the column is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to get as numeric slice. Returns `None` if not `Numeric` variant.
    pub fn as_numeric(&self) -> Option<&Vec<f64>> {
        match self {
            ColumnData::Numeric(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as boolean slice. Returns `None` if not `Bool` variant.
    pub fn as_bool(&self) -> Option<&Vec<bool>> {
        match self {
            ColumnData::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// AnnData-like container for single-cell data.
#[derive(Debug, Clone)]
pub struct AnnData {
    /// Primary data matrix (n_obs × n_vars).
    x: MatrixData,
    /// Observation (cell) names.
    obs_names: Vec<String>,
    /// Variable (gene) names.
    var_names: Vec<String>,
    /// Per-gene metadata.
    var: HashMap<String, ColumnData>,
    /// Multi-dimensional observation annotations (embeddings).
    obsm: HashMap<String, Vec<Vec<f64>>>,
    /// Multi-dimensional per-gene annotations.
    varm: HashMap<String, Vec<Vec<f64>>>,
    /// Alternative data layers (same shape as X).
    layers: HashMap<String, MatrixData>,
    /// Pairwise observation annotations (kNN graphs, velocity graph).
    obsp: HashMap<String, SparseMatrix>,
    /// Unstructured metadata (free-form key-value pairs).
    uns: HashMap<String, String>,
}

impl AnnData {
    /// Create a new AnnData container.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix dimensions don't match the name vectors.
    pub fn new(x: MatrixData, obs_names: Vec<String>, var_names: Vec<String>) -> Result<Self> {
        if !x.is_rectangular() {
            return Err(VelocyteError::InvalidInput(
                "X must have the same number of genes in every row".into(),
            ));
        }
        let (n_obs, n_vars) = x.shape();
        if obs_names.len() != n_obs {
            return Err(VelocyteError::dimension("obs_names length", n_obs, obs_names.len()));
        }
        if var_names.len() != n_vars {
            return Err(VelocyteError::dimension("var_names length", n_vars, var_names.len()));
        }

        Ok(Self {
            x,
            obs_names,
            var_names,
            var: HashMap::new(),
            obsm: HashMap::new(),
            varm: HashMap::new(),
            layers: HashMap::new(),
            obsp: HashMap::new(),
            uns: HashMap::new(),
        })
    }

    /// Build a container from spliced and unspliced counts.
    ///
    /// X is the spliced layer; both layers are stored under their
    /// conventional names.
    pub fn from_layers(
        spliced: MatrixData,
        unspliced: MatrixData,
        obs_names: Vec<String>,
        var_names: Vec<String>,
    ) -> Result<Self> {
        let mut adata = Self::new(spliced.clone(), obs_names, var_names)?;
        adata.add_layer("spliced", spliced)?;
        adata.add_layer("unspliced", unspliced)?;
        Ok(adata)
    }

    /// Number of observations (cells).
    pub fn n_obs(&self) -> usize {
        self.obs_names.len()
    }

    /// Number of variables (genes).
    pub fn n_vars(&self) -> usize {
        self.var_names.len()
    }

    /// Shape of the primary data matrix.
    pub fn shape(&self) -> (usize, usize) {
        (self.n_obs(), self.n_vars())
    }

    /// The primary data matrix.
    pub fn x(&self) -> &MatrixData {
        &self.x
    }

    /// Observation names.
    pub fn obs_names(&self) -> &[String] {
        &self.obs_names
    }

    /// Variable names.
    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    /// Add a per-gene metadata column.
    pub fn add_var_column(&mut self, key: &str, data: ColumnData) -> Result<()> {
        if data.len() != self.n_vars() {
            return Err(VelocyteError::dimension(
                format!("var column '{key}' length"),
                self.n_vars(),
                data.len(),
            ));
        }
        self.var.insert(key.to_string(), data);
        Ok(())
    }

    /// Add a numeric per-gene column.
    pub fn add_var_numeric(&mut self, key: &str, values: Vec<f64>) -> Result<()> {
        self.add_var_column(key, ColumnData::Numeric(values))
    }

    /// Get a per-gene metadata column.
    pub fn get_var(&self, key: &str) -> Option<&ColumnData> {
        self.var.get(key)
    }

    /// Add a multi-dimensional observation annotation (embedding).
    pub fn add_obsm(&mut self, key: &str, data: Vec<Vec<f64>>) -> Result<()> {
        if data.len() != self.n_obs() {
            return Err(VelocyteError::dimension(
                format!("obsm '{key}' rows"),
                self.n_obs(),
                data.len(),
            ));
        }
        self.obsm.insert(key.to_string(), data);
        Ok(())
    }

    /// Get a multi-dimensional observation annotation.
    pub fn get_obsm(&self, key: &str) -> Option<&Vec<Vec<f64>>> {
        self.obsm.get(key)
    }

    /// Add a per-gene matrix, one row per gene. Rows may differ in width.
    pub fn add_varm(&mut self, key: &str, data: Vec<Vec<f64>>) -> Result<()> {
        if data.len() != self.n_vars() {
            return Err(VelocyteError::dimension(
                format!("varm '{key}' rows"),
                self.n_vars(),
                data.len(),
            ));
        }
        self.varm.insert(key.to_string(), data);
        Ok(())
    }

    pub fn get_varm(&self, key: &str) -> Option<&Vec<Vec<f64>>> {
        self.varm.get(key)
    }

    /// Add an alternative data layer.
    pub fn add_layer(&mut self, key: &str, layer: MatrixData) -> Result<()> {
        if !layer.is_rectangular() {
            return Err(VelocyteError::InvalidInput(format!(
                "layer '{key}' has rows of different lengths"
            )));
        }
        let (n_obs, n_vars) = layer.shape();
        if n_obs != self.n_obs() {
            return Err(VelocyteError::dimension(format!("layer '{key}' cells"), self.n_obs(), n_obs));
        }
        if n_vars != self.n_vars() {
            return Err(VelocyteError::dimension(format!("layer '{key}' genes"), self.n_vars(), n_vars));
        }
        self.layers.insert(key.to_string(), layer);
        Ok(())
    }

    /// Get an alternative data layer.
    pub fn get_layer(&self, key: &str) -> Option<&MatrixData> {
        self.layers.get(key)
    }

    /// Get a layer or fail with a configuration error naming it.
    pub fn require_layer(&self, key: &str) -> Result<&MatrixData> {
        self.get_layer(key).ok_or_else(|| {
            VelocyteError::Configuration(format!("layers['{key}'] not found"))
        })
    }

    /// Add a pairwise observation annotation (e.g. kNN graph).
    ///
    /// The matrix must be n_obs × n_obs.
    pub fn add_obsp(&mut self, key: &str, matrix: SparseMatrix) -> Result<()> {
        let (r, c) = matrix.shape();
        if r != self.n_obs() || c != self.n_obs() {
            return Err(VelocyteError::dimension(
                format!("obsp '{key}' shape ({r}, {c})"),
                self.n_obs(),
                if r != self.n_obs() { r } else { c },
            ));
        }
        self.obsp.insert(key.to_string(), matrix);
        Ok(())
    }

    /// Get a pairwise observation annotation.
    pub fn get_obsp(&self, key: &str) -> Option<&SparseMatrix> {
        self.obsp.get(key)
    }

    /// Add unstructured metadata.
    pub fn add_uns(&mut self, key: &str, value: String) {
        self.uns.insert(key.to_string(), value);
    }

    /// Get unstructured metadata.
    pub fn get_uns(&self, key: &str) -> Option<&str> {
        self.uns.get(key).map(|s| s.as_str())
    }
}

impl Summarizable for AnnData {
    fn summary(&self) -> String {
        let mut layers: Vec<&str> = self.layers.keys().map(String::as_str).collect();
        layers.sort_unstable();
        format!(
            "AnnData: {} cells \u{00d7} {} genes, layers [{}]",
            self.n_obs(),
            self.n_vars(),
            layers.join(", ")
        )
    }
}
