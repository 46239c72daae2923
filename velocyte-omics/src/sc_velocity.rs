//! RNA velocity: from per-gene kinetics to the cell × gene velocity matrix.
//!
//! [`aggregate_velocity`] turns gene fits into velocity columns and decides
//! which genes are trusted. A gene that is excluded has no column at all;
//! its entries are undefined rather than zero, so it cannot tilt the
//! direction of any cell. [`velocity`] runs moments, kinetics and
//! aggregation on an [`AnnData`] in one call.

use std::str::FromStr;

use velocyte_core::{Result, Summarizable, VelocyteError};
use velocyte_stats::descriptive::std_dev;

use crate::sc_kinetics::{
    fit_kinetics, kinetics_input, write_fits, CancelToken, FitMode, FitSummary, GeneFit,
    KineticsConfig, KineticsInput,
};
use crate::sc_moments::{moments, MomentsConfig};
use crate::single_cell::{AnnData, ColumnData, MatrixData};

/// Spliced standard deviations below this are left unscaled.
const MIN_SCALE: f64 = 1e-12;

// ── Configuration ──────────────────────────────────────────────────────────

/// Which genes contribute velocity.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeneFilterConfig {
    /// Minimum fit likelihood.
    pub min_likelihood: f64,
    /// Minimum cells with both raw unspliced and raw spliced counts.
    pub min_expressed_cells: usize,
    /// Divide each gene's velocity by its spliced standard deviation.
    pub rescale_by_variance: bool,
}

impl Default for GeneFilterConfig {
    fn default() -> Self {
        Self {
            min_likelihood: 0.01,
            min_expressed_cells: 3,
            rescale_by_variance: false,
        }
    }
}

/// Options for the velocity pipeline.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VelocityConfig {
    pub mode: FitMode,
    /// Neighbors used for moments.
    pub n_neighbors: usize,
    pub min_likelihood: f64,
    /// Worker threads for the gene fits; `None` uses all cores.
    pub n_jobs: Option<usize>,
    pub convergence_tolerance: f64,
    pub max_iterations: usize,
    /// Seed for the dynamical model's random candidates.
    pub seed: u64,
    pub min_expressed_cells: usize,
    pub rescale_by_variance: bool,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        let kinetics = KineticsConfig::default();
        let filter = GeneFilterConfig::default();
        Self {
            mode: FitMode::SteadyState,
            n_neighbors: MomentsConfig::default().n_neighbors,
            min_likelihood: filter.min_likelihood,
            n_jobs: None,
            convergence_tolerance: kinetics.convergence_tolerance,
            max_iterations: kinetics.max_iterations,
            seed: kinetics.seed,
            min_expressed_cells: filter.min_expressed_cells,
            rescale_by_variance: filter.rescale_by_variance,
        }
    }
}

impl VelocityConfig {
    /// Build from `(key, value)` option pairs on top of the defaults.
    pub fn from_options<'a>(options: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in options {
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one option from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "mode" => self.mode = value.parse()?,
            "n_neighbors" => self.n_neighbors = parse_option(key, value)?,
            "min_likelihood" => self.min_likelihood = parse_option(key, value)?,
            "n_jobs" => {
                self.n_jobs = match value.trim() {
                    "all" | "-1" | "none" | "" => None,
                    v => Some(parse_option(key, v)?),
                }
            }
            "convergence_tolerance" => self.convergence_tolerance = parse_option(key, value)?,
            "max_iterations" => self.max_iterations = parse_option(key, value)?,
            "seed" => self.seed = parse_option(key, value)?,
            "min_expressed_cells" => self.min_expressed_cells = parse_option(key, value)?,
            "rescale_by_variance" => self.rescale_by_variance = parse_option(key, value)?,
            other => {
                return Err(VelocyteError::Configuration(format!(
                    "unrecognized velocity option '{other}'"
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_neighbors == 0 {
            return Err(VelocyteError::Configuration(
                "n_neighbors must be at least 1".into(),
            ));
        }
        self.kinetics().validate()
    }

    pub fn moments(&self) -> MomentsConfig {
        MomentsConfig {
            n_neighbors: self.n_neighbors,
            ..Default::default()
        }
    }

    pub fn kinetics(&self) -> KineticsConfig {
        KineticsConfig {
            mode: self.mode,
            max_iterations: self.max_iterations,
            convergence_tolerance: self.convergence_tolerance,
            seed: self.seed,
            min_likelihood: self.min_likelihood,
            n_jobs: self.n_jobs,
            ..Default::default()
        }
    }

    pub fn gene_filter(&self) -> GeneFilterConfig {
        GeneFilterConfig {
            min_likelihood: self.min_likelihood,
            min_expressed_cells: self.min_expressed_cells,
            rescale_by_variance: self.rescale_by_variance,
        }
    }
}

fn parse_option<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        VelocyteError::Configuration(format!("invalid value '{value}' for option '{key}'"))
    })
}

// ── Velocity matrix ────────────────────────────────────────────────────────

/// Cell × gene velocities with masked genes left undefined.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityMatrix {
    n_obs: usize,
    /// One column per gene; `None` for masked genes.
    columns: Vec<Option<Vec<f64>>>,
}

impl VelocityMatrix {
    /// Build from per-gene columns. Present columns must have `n_obs`
    /// finite values.
    pub fn new(n_obs: usize, columns: Vec<Option<Vec<f64>>>) -> Result<Self> {
        for (g, col) in columns.iter().enumerate() {
            if let Some(col) = col {
                if col.len() != n_obs {
                    return Err(VelocyteError::dimension(
                        format!("velocity column {g}"),
                        n_obs,
                        col.len(),
                    ));
                }
                if col.iter().any(|v| !v.is_finite()) {
                    return Err(VelocyteError::InvalidInput(format!(
                        "velocity column {g} has non-finite values"
                    )));
                }
            }
        }
        Ok(Self { n_obs, columns })
    }

    /// Read back a cell-major matrix where masked genes are NaN columns.
    ///
    /// A gene is kept when `gene_mask` allows it and all its values are
    /// finite.
    pub fn from_dense_nan(rows: &[Vec<f64>], gene_mask: &[bool]) -> Result<Self> {
        let n_obs = rows.len();
        let n_vars = gene_mask.len();
        if let Some(row) = rows.iter().find(|r| r.len() != n_vars) {
            return Err(VelocyteError::dimension("velocity genes", n_vars, row.len()));
        }
        let columns = (0..n_vars)
            .map(|g| {
                let col: Vec<f64> = rows.iter().map(|r| r[g]).collect();
                (gene_mask[g] && col.iter().all(|v| v.is_finite())).then_some(col)
            })
            .collect();
        Ok(Self { n_obs, columns })
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_vars(&self) -> usize {
        self.columns.len()
    }

    /// `true` for genes that contribute velocity.
    pub fn gene_mask(&self) -> Vec<bool> {
        self.columns.iter().map(Option::is_some).collect()
    }

    /// Indices of the contributing genes.
    pub fn velocity_genes(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(g, c)| c.as_ref().map(|_| g))
            .collect()
    }

    pub fn n_velocity_genes(&self) -> usize {
        self.columns.iter().filter(|c| c.is_some()).count()
    }

    /// Velocity of `gene` in `cell`, `None` if the gene is masked.
    pub fn get(&self, cell: usize, gene: usize) -> Option<f64> {
        self.columns.get(gene)?.as_ref().map(|c| c[cell])
    }

    pub fn column(&self, gene: usize) -> Option<&[f64]> {
        self.columns.get(gene)?.as_deref()
    }

    /// Velocity of `cell` restricted to `genes` (which must be unmasked).
    pub fn cell_vector(&self, cell: usize, genes: &[usize]) -> Vec<f64> {
        genes
            .iter()
            .map(|&g| self.get(cell, g).unwrap_or(f64::NAN))
            .collect()
    }

    /// Cell-major dense copy with NaN in masked columns.
    pub fn to_dense_nan(&self) -> Vec<Vec<f64>> {
        (0..self.n_obs)
            .map(|i| {
                self.columns
                    .iter()
                    .map(|c| c.as_ref().map_or(f64::NAN, |c| c[i]))
                    .collect()
            })
            .collect()
    }
}

impl Summarizable for VelocityMatrix {
    fn summary(&self) -> String {
        format!(
            "VelocityMatrix: {} cells \u{00d7} {} genes ({} velocity genes)",
            self.n_obs,
            self.n_vars(),
            self.n_velocity_genes()
        )
    }
}

// ── Aggregation ────────────────────────────────────────────────────────────

/// Velocity columns for genes that pass the filter.
///
/// A gene contributes when it was fitted, its likelihood reaches
/// `min_likelihood`, enough cells express both layers, and every velocity
/// value is finite.
pub fn aggregate_velocity(
    fits: &[GeneFit],
    input: &KineticsInput,
    config: &GeneFilterConfig,
) -> Result<VelocityMatrix> {
    if fits.len() != input.n_vars() {
        return Err(VelocyteError::dimension("gene fits", input.n_vars(), fits.len()));
    }

    let mut n_low_likelihood = 0usize;
    let mut n_low_expression = 0usize;
    let columns: Vec<Option<Vec<f64>>> = fits
        .iter()
        .enumerate()
        .map(|(g, fit)| {
            let params = fit.params()?;
            if params.likelihood < config.min_likelihood {
                n_low_likelihood += 1;
                return None;
            }
            let data = input.gene(g);
            let expressed = data
                .u_raw
                .iter()
                .zip(data.s_raw)
                .filter(|&(&u, &s)| u > 0.0 && s > 0.0)
                .count();
            if expressed < config.min_expressed_cells {
                n_low_expression += 1;
                return None;
            }
            let mut v = params.velocity(data.u, data.s);
            if config.rescale_by_variance {
                let sd = std_dev(data.s, 0).unwrap_or(0.0);
                if sd > MIN_SCALE {
                    v.iter_mut().for_each(|x| *x /= sd);
                }
            }
            v.iter().all(|x| x.is_finite()).then_some(v)
        })
        .collect();

    let matrix = VelocityMatrix::new(input.n_obs(), columns)?;
    tracing::debug!(
        n_velocity_genes = matrix.n_velocity_genes(),
        n_low_likelihood,
        n_low_expression,
        "aggregated velocity"
    );
    Ok(matrix)
}

// ── Pipeline ───────────────────────────────────────────────────────────────

/// Outcome of [`velocity`].
#[derive(Debug, Clone)]
pub struct VelocityReport {
    pub fits: Vec<GeneFit>,
    pub summary: FitSummary,
    pub velocity: VelocityMatrix,
}

impl Summarizable for VelocityReport {
    fn summary(&self) -> String {
        format!("{}; {}", self.velocity.summary(), self.summary.summary())
    }
}

/// Estimate RNA velocity for every gene.
///
/// Requires `layers["spliced"]` and `layers["unspliced"]`, plus either
/// `obsp["distances"]` or precomputed `layers["Ms"]`/`layers["Mu"]`. When the
/// graph is present the moments are recomputed with `config.n_neighbors`, so
/// repeated runs never read moments from an earlier configuration.
/// Stores `layers["velocity"]` (NaN for masked genes),
/// `var["velocity_genes"]` and the `fit_*` parameter columns.
pub fn velocity(adata: &mut AnnData, config: &VelocityConfig) -> Result<VelocityReport> {
    velocity_with_cancel(adata, config, &CancelToken::new())
}

/// [`velocity`] with a cancellation handle for the gene fits.
pub fn velocity_with_cancel(
    adata: &mut AnnData,
    config: &VelocityConfig,
    cancel: &CancelToken,
) -> Result<VelocityReport> {
    config.validate()?;
    let stored = adata.get_layer("Ms").is_some() && adata.get_layer("Mu").is_some();
    if adata.get_obsp("distances").is_some() || !stored {
        moments(adata, &config.moments())?;
    } else {
        tracing::debug!("no distance graph; using stored moments");
    }

    let input = kinetics_input(adata)?;
    let genes: Vec<usize> = (0..input.n_vars()).collect();
    let kinetics = fit_kinetics(&input, &genes, &config.kinetics(), cancel)?;
    let matrix = aggregate_velocity(&kinetics.fits, &input, &config.gene_filter())?;

    adata.add_layer("velocity", MatrixData::Dense(matrix.to_dense_nan()))?;
    adata.add_var_column("velocity_genes", ColumnData::Bool(matrix.gene_mask()))?;
    write_fits(adata, &kinetics.fits, &genes)?;
    adata.add_uns("velocity_mode", config.mode.to_string());

    tracing::info!(
        mode = %config.mode,
        n_velocity_genes = matrix.n_velocity_genes(),
        n_genes = matrix.n_vars(),
        "computed velocity"
    );
    Ok(VelocityReport {
        fits: kinetics.fits,
        summary: kinetics.summary,
        velocity: matrix,
    })
}

/// Read the velocity matrix stored by [`velocity`].
pub fn stored_velocity(adata: &AnnData) -> Result<VelocityMatrix> {
    let layer = adata.get_layer("velocity").ok_or_else(|| {
        VelocyteError::Configuration("layers['velocity'] not found; run velocity first".into())
    })?;
    let mask = match adata.get_var("velocity_genes") {
        Some(ColumnData::Bool(mask)) => mask.clone(),
        Some(_) => {
            return Err(VelocyteError::Configuration(
                "var['velocity_genes'] must be a boolean column".into(),
            ))
        }
        None => vec![true; adata.n_vars()],
    };
    VelocityMatrix::from_dense_nan(&layer.to_dense_rows(), &mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sc_dynamics;
    use crate::sc_kinetics::{FitFailure, KineticsConfig};
    use crate::sc_velocity_graph::{velocity_graph, VelocityGraphConfig};
    use crate::sparse::SparseMatrix;

    const TOL: f64 = 1e-10;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}_{i}")).collect()
    }

    /// kNN chain 0 → 1 → 2, with cell 2 pointing back at 1.
    fn chain_distances(n: usize) -> SparseMatrix {
        let mut d = SparseMatrix::new(n, n);
        for i in 0..n {
            let j = if i + 1 < n { i + 1 } else { i - 1 };
            d.insert(i, j, 1.0).unwrap();
        }
        d
    }

    /// Gene A: u = s = [1, 2, 3]. Gene B: u = s = [5, 5, 5].
    fn three_cell_two_gene() -> AnnData {
        let layer = MatrixData::Dense(vec![vec![1.0, 5.0], vec![2.0, 5.0], vec![3.0, 5.0]]);
        let mut adata =
            AnnData::from_layers(layer.clone(), layer, names("cell", 3), names("gene", 2)).unwrap();
        adata.add_obsp("distances", chain_distances(3)).unwrap();
        adata
    }

    #[test]
    fn end_to_end_three_cells_two_genes() {
        let mut adata = three_cell_two_gene();
        let report = velocity(&mut adata, &VelocityConfig::default()).unwrap();

        let a = report.fits[0].params().unwrap();
        assert!((a.gamma - 1.0).abs() < TOL);
        assert!((a.likelihood - 1.0).abs() < TOL);
        assert!(matches!(
            report.fits[1],
            GeneFit::Failed(FitFailure::ZeroVariance { .. })
        ));
        assert_eq!(report.summary.n_fitted, 1);
        assert_eq!(report.summary.n_failed(), 1);

        for cell in 0..3 {
            assert!(report.velocity.get(cell, 0).unwrap().abs() < TOL);
            assert_eq!(report.velocity.get(cell, 1), None);
        }
        assert_eq!(report.velocity.gene_mask(), vec![true, false]);

        let stored = adata.get_layer("velocity").unwrap();
        assert!(stored.get(0, 1).is_nan());
        assert!(stored.get(2, 0).abs() < TOL);

        let graph = velocity_graph(&mut adata, &VelocityGraphConfig::default()).unwrap();
        let g = adata.get_obsp("velocity_graph").unwrap();
        assert_eq!(g.shape(), (3, 3));
        assert_eq!(g.diagonal_nnz(), 0);
        for i in 0..3 {
            assert_eq!(g.get(i, i), 0.0);
        }
        // every velocity vector is zero, so no transition is measurable
        assert_eq!(graph.n_undefined, graph.n_candidates);
    }

    /// Every pair of the `n` cells, at distance `|i − j|`.
    fn line_distances(n: usize) -> SparseMatrix {
        let mut d = SparseMatrix::new(n, n);
        for i in 0..n {
            for j in (0..n).filter(|&j| j != i) {
                d.insert(i, j, i.abs_diff(j) as f64).unwrap();
            }
        }
        d
    }

    #[test]
    fn moments_follow_n_neighbors() {
        let s = MatrixData::Dense(vec![vec![1.0, 4.0], vec![2.0, 1.0], vec![3.0, 3.0], vec![4.0, 2.0]]);
        let u = MatrixData::Dense(vec![vec![1.0, 2.0], vec![2.0, 1.0], vec![4.0, 3.0], vec![4.0, 2.0]]);
        let mut adata = AnnData::from_layers(s, u, names("cell", 4), names("gene", 2)).unwrap();
        adata.add_obsp("distances", line_distances(4)).unwrap();

        let one = VelocityConfig { n_neighbors: 1, ..Default::default() };
        velocity(&mut adata, &one).unwrap();
        assert_eq!(adata.get_uns("moments_n_neighbors"), Some("1"));
        let ms_one = adata.get_layer("Ms").unwrap().to_dense_rows();
        // cell 0 averages itself with cell 1
        assert!((ms_one[0][0] - 1.5).abs() < TOL);

        let two = VelocityConfig { n_neighbors: 2, ..Default::default() };
        velocity(&mut adata, &two).unwrap();
        assert_eq!(adata.get_uns("moments_n_neighbors"), Some("2"));
        let ms_two = adata.get_layer("Ms").unwrap().to_dense_rows();
        assert!((ms_two[0][0] - 2.0).abs() < TOL);
        assert_ne!(ms_one, ms_two);
    }

    #[test]
    fn stored_moments_used_without_graph() {
        let layer = MatrixData::Dense(vec![vec![1.0], vec![2.0], vec![3.0]]);
        let mut adata =
            AnnData::from_layers(layer.clone(), layer.clone(), names("cell", 3), names("gene", 1)).unwrap();
        adata.add_layer("Ms", layer.clone()).unwrap();
        adata.add_layer("Mu", layer).unwrap();
        let report = velocity(&mut adata, &VelocityConfig::default()).unwrap();
        assert!((report.fits[0].params().unwrap().gamma - 1.0).abs() < TOL);
        assert!(adata.get_uns("moments_n_neighbors").is_none());
    }

    /// Two switching genes and one constant gene over 40 cells ordered in
    /// latent time, linked as a kNN chain.
    fn switching_chain() -> AnnData {
        let n = 40;
        let times: Vec<f64> = (0..n).map(|i| 10.0 * (i as f64 + 0.5) / n as f64).collect();
        let (ua, sa) = sc_dynamics::simulate_switching(5.0, 0.5, 5.0, 1.0, &times);
        let (ub, sb) = sc_dynamics::simulate_switching(3.0, 1.0, 4.0, 0.5, &times);
        let s = MatrixData::Dense((0..n).map(|i| vec![sa[i], sb[i], 2.0]).collect());
        let u = MatrixData::Dense((0..n).map(|i| vec![ua[i], ub[i], 2.0]).collect());
        let mut adata = AnnData::from_layers(s, u, names("cell", n), names("gene", 3)).unwrap();
        adata.add_obsp("distances", chain_distances(n)).unwrap();
        adata
    }

    #[test]
    fn dynamical_pipeline_stores_fits() {
        let mut adata = switching_chain();
        let config = VelocityConfig {
            mode: FitMode::Dynamical,
            n_neighbors: 1,
            max_iterations: 20,
            seed: 3,
            ..Default::default()
        };
        let report = velocity(&mut adata, &config).unwrap();

        for g in 0..2 {
            let p = report.fits[g].params().unwrap();
            assert_eq!(p.mode, FitMode::Dynamical);
            assert!(p.likelihood > 0.9, "gene {g}: likelihood {}", p.likelihood);
        }
        let gamma_a = report.fits[0].params().unwrap().gamma;
        assert!((gamma_a - 0.5).abs() / 0.5 < 0.1, "gamma {gamma_a}");
        assert!(matches!(report.fits[2], GeneFit::Failed(FitFailure::ZeroVariance { .. })));
        assert_eq!(report.velocity.gene_mask(), vec![true, true, false]);
        assert_eq!(adata.get_uns("velocity_mode"), Some("dynamical"));

        let alpha = adata.get_var("fit_alpha").unwrap().as_numeric().unwrap();
        assert!(alpha[0] > 0.0 && alpha[1] > 0.0);
        assert!(alpha[2].is_nan());

        let fit_t = adata.get_layer("fit_t").unwrap().to_dense_rows();
        assert_eq!(fit_t.len(), 40);
        for row in &fit_t {
            assert!(row[0].is_finite() && row[0] >= 0.0);
            assert!(row[1].is_finite() && row[1] >= 0.0);
            assert!(row[2].is_nan());
        }
        let loss = adata.get_varm("loss").unwrap();
        assert!(loss[0][0].is_finite() && loss[1][0].is_finite());
        assert!(loss[2].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn masked_gene_has_no_entries() {
        let mut adata = three_cell_two_gene();
        let report = velocity(&mut adata, &VelocityConfig::default()).unwrap();
        assert!(report.velocity.column(1).is_none());
        assert!(report.velocity.to_dense_nan().iter().all(|row| row[1].is_nan()));
        assert_eq!(report.velocity.velocity_genes(), vec![0]);
        match adata.get_var("velocity_genes").unwrap() {
            ColumnData::Bool(mask) => assert_eq!(mask, &vec![true, false]),
            other => panic!("unexpected column {other:?}"),
        }
    }

    #[test]
    fn missing_graph_is_configuration_error() {
        let layer = MatrixData::Dense(vec![vec![1.0], vec![2.0]]);
        let mut adata =
            AnnData::from_layers(layer.clone(), layer, names("cell", 2), names("gene", 1)).unwrap();
        let err = velocity(&mut adata, &VelocityConfig::default()).unwrap_err();
        assert!(matches!(err, VelocyteError::Configuration(_)));
    }

    fn linear_input() -> KineticsInput {
        let s: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let u: Vec<f64> = s.iter().map(|v| 0.5 * v + 1.0).collect();
        let sparse_u: Vec<f64> = (0..10).map(|i| if i < 2 { 1.0 + i as f64 } else { 0.0 }).collect();
        KineticsInput::from_columns(
            vec![s.clone(), s.clone()],
            vec![u.clone(), sparse_u.clone()],
            vec![s.clone(), s],
            vec![u, sparse_u],
        )
        .unwrap()
    }

    #[test]
    fn filter_requires_expressed_cells() {
        let input = linear_input();
        let result = fit_kinetics(&input, &[0, 1], &KineticsConfig::default(), &CancelToken::new())
            .unwrap();
        let config = GeneFilterConfig { min_likelihood: 0.0, ..Default::default() };
        let m = aggregate_velocity(&result.fits, &input, &config).unwrap();
        assert!(m.column(0).is_some());
        // gene 1 has raw unspliced counts in only two cells
        assert!(m.column(1).is_none());
    }

    #[test]
    fn filter_requires_likelihood() {
        let input = linear_input();
        let result = fit_kinetics(&input, &[0], &KineticsConfig::default(), &CancelToken::new())
            .unwrap();
        let likelihood = result.fits[0].params().unwrap().likelihood;
        assert!(likelihood < 1.0);
        let strict = GeneFilterConfig { min_likelihood: 1.0, ..Default::default() };
        let m = aggregate_velocity(&result.fits, &input, &strict).unwrap();
        assert_eq!(m.n_velocity_genes(), 0);
    }

    #[test]
    fn rescaling_divides_by_spliced_sd() {
        let input = linear_input();
        let result = fit_kinetics(&input, &[0], &KineticsConfig::default(), &CancelToken::new())
            .unwrap();
        let plain = GeneFilterConfig { min_likelihood: 0.0, ..Default::default() };
        let scaled = GeneFilterConfig { rescale_by_variance: true, ..plain.clone() };
        let a = aggregate_velocity(&result.fits, &input, &plain).unwrap();
        let b = aggregate_velocity(&result.fits, &input, &scaled).unwrap();
        let sd = std_dev(input.gene(0).s, 0).unwrap();
        for cell in 0..10 {
            assert!((a.get(cell, 0).unwrap() / sd - b.get(cell, 0).unwrap()).abs() < TOL);
        }
    }

    #[test]
    fn options_parse() {
        let config = VelocityConfig::from_options([
            ("mode", "dynamical"),
            ("n_neighbors", "15"),
            ("min_likelihood", "0.1"),
            ("n_jobs", "4"),
            ("convergence_tolerance", "1e-3"),
            ("max_iterations", "20"),
        ])
        .unwrap();
        assert_eq!(config.mode, FitMode::Dynamical);
        assert_eq!(config.n_neighbors, 15);
        assert_eq!(config.n_jobs, Some(4));
        assert_eq!(config.kinetics().max_iterations, 20);
        assert_eq!(config.gene_filter().min_likelihood, 0.1);

        assert!(VelocityConfig::from_options([("n_neighbors", "many")]).is_err());
        assert!(VelocityConfig::from_options([("colour", "red")]).is_err());
        assert!(VelocityConfig::from_options([("n_neighbors", "0")]).is_err());
        assert_eq!(VelocityConfig::from_options([("n_jobs", "all")]).unwrap().n_jobs, None);
    }

    #[test]
    fn dense_nan_roundtrip_keeps_mask() {
        let m = VelocityMatrix::new(2, vec![Some(vec![1.0, -1.0]), None]).unwrap();
        let back = VelocityMatrix::from_dense_nan(&m.to_dense_nan(), &[true, true]).unwrap();
        assert_eq!(back, m);
        assert_eq!(m.summary(), "VelocityMatrix: 2 cells \u{00d7} 2 genes (1 velocity genes)");
    }

    #[test]
    fn non_finite_column_rejected() {
        assert!(VelocityMatrix::new(1, vec![Some(vec![f64::NAN])]).is_err());
        assert!(VelocityMatrix::new(2, vec![Some(vec![1.0])]).is_err());
    }
}
