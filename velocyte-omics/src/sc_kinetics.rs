//! Per-gene transcription kinetics.
//!
//! Each gene is fit independently, either with the closed-form steady-state
//! model (`u = γ·s` on the extreme quantiles) or with the dynamical
//! switching model in [`crate::sc_dynamics`]. A gene's outcome is a
//! [`GeneFit`]: fitted parameters, a typed failure, or "not fit" when the
//! batch was cancelled before the gene was reached. Failures never abort the
//! batch; only structural problems (missing layers, mismatched shapes) are
//! returned as errors.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use velocyte_core::{Result, Scored, Summarizable, VelocyteError};
use velocyte_stats::descriptive::{masked_mean, percentile, variance};
use velocyte_stats::regression::{fit_through_origin, fit_with_intercept};

use crate::sc_dynamics::{self, TimeAssignment, TranscriptionState, WarmStart};
use crate::sc_moments::{require_rectangular, Moments};
use crate::single_cell::{AnnData, ColumnData, MatrixData};

/// Variance at or below this marks a layer as constant.
const ZERO_VARIANCE_EPS: f64 = 1e-12;

// ── Configuration ──────────────────────────────────────────────────────────

/// Kinetic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FitMode {
    /// Linear `u = γ·s` fit on the extreme quantiles.
    #[default]
    SteadyState,
    /// Four-state switching model fit by alternating time assignment and
    /// rate re-estimation.
    Dynamical,
}

impl FitMode {
    /// Option-string form.
    pub fn as_str(self) -> &'static str {
        match self {
            FitMode::SteadyState => "steady-state",
            FitMode::Dynamical => "dynamical",
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FitMode {
    type Err = VelocyteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "steady-state" | "steady_state" | "deterministic" => Ok(FitMode::SteadyState),
            "dynamical" | "dynamic" => Ok(FitMode::Dynamical),
            other => Err(VelocyteError::Configuration(format!(
                "unknown velocity mode '{other}', expected 'steady-state' or 'dynamical'"
            ))),
        }
    }
}

/// Configuration for kinetic fitting.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KineticsConfig {
    /// Model used by [`fit_kinetics`].
    pub mode: FitMode,
    /// Upper percentile of the extreme-quantile selection, in (50, 100).
    pub extreme_percentile: f64,
    /// Fit an intercept in the steady-state regression.
    pub fit_offset: bool,
    /// Floor applied to every fitted rate.
    pub min_rate: f64,
    /// Dynamical fit: maximum EM iterations.
    pub max_iterations: usize,
    /// Dynamical fit: converged once an iteration, followed by the joint
    /// refinement it triggers, lowers the loss by less than this fraction.
    pub convergence_tolerance: f64,
    /// Dynamical fit: seeded random degradation-rate candidates per iteration.
    pub n_random_candidates: usize,
    /// Dynamical fit: cells with positive raw counts required to fit.
    pub min_weighted_cells: usize,
    /// Dynamical fit: outlier cutoff percentile for cell weights.
    pub weight_percentile: f64,
    /// Dynamical fit: latent time assignment strategy.
    pub time_assignment: TimeAssignment,
    /// Dynamical fit: rescale time so each gene's latest cell sits at `t_max`.
    pub t_max: Option<f64>,
    /// Base seed; each gene derives its own stream from it.
    pub seed: u64,
    /// Fits below this likelihood are counted as low confidence.
    pub min_likelihood: f64,
    /// Worker threads; `None` uses the global pool.
    pub n_jobs: Option<usize>,
    /// Dynamical fits on an [`AnnData`] resume from the stored `var["fit_*"]`
    /// rates where a gene has them.
    pub warm_start: bool,
}

impl Default for KineticsConfig {
    fn default() -> Self {
        Self {
            mode: FitMode::SteadyState,
            extreme_percentile: 95.0,
            fit_offset: false,
            min_rate: 1e-6,
            max_iterations: 100,
            convergence_tolerance: 1e-4,
            n_random_candidates: 3,
            min_weighted_cells: 10,
            weight_percentile: 99.0,
            time_assignment: TimeAssignment::Explicit,
            t_max: None,
            seed: 0,
            min_likelihood: 0.01,
            n_jobs: None,
            warm_start: false,
        }
    }
}

impl KineticsConfig {
    /// Reject out-of-range options.
    pub fn validate(&self) -> Result<()> {
        if !(self.extreme_percentile > 50.0 && self.extreme_percentile < 100.0) {
            return Err(VelocyteError::Configuration(format!(
                "extreme_percentile must be in (50, 100), got {}",
                self.extreme_percentile
            )));
        }
        if !(self.weight_percentile > 0.0 && self.weight_percentile <= 100.0) {
            return Err(VelocyteError::Configuration(format!(
                "weight_percentile must be in (0, 100], got {}",
                self.weight_percentile
            )));
        }
        if !(self.min_rate > 0.0 && self.min_rate.is_finite()) {
            return Err(VelocyteError::Configuration(
                "min_rate must be a positive finite number".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(VelocyteError::Configuration(
                "max_iterations must be at least 1".into(),
            ));
        }
        if !(self.convergence_tolerance >= 0.0) {
            return Err(VelocyteError::Configuration(format!(
                "convergence_tolerance must be non-negative, got {}",
                self.convergence_tolerance
            )));
        }
        if !(0.0..=1.0).contains(&self.min_likelihood) {
            return Err(VelocyteError::Configuration(format!(
                "min_likelihood must be in [0, 1], got {}",
                self.min_likelihood
            )));
        }
        if let Some(t_max) = self.t_max {
            if !(t_max > 0.0 && t_max.is_finite()) {
                return Err(VelocyteError::Configuration(format!(
                    "t_max must be positive, got {t_max}"
                )));
            }
        }
        if let TimeAssignment::Projection { n_points } = self.time_assignment {
            if n_points < 2 {
                return Err(VelocyteError::Configuration(
                    "projection time assignment needs at least 2 grid points".into(),
                ));
            }
        }
        if self.n_jobs == Some(0) {
            return Err(VelocyteError::Configuration("n_jobs must be at least 1".into()));
        }
        Ok(())
    }

    /// Seed for one gene's random stream.
    pub fn gene_seed(&self, gene: usize) -> u64 {
        self.seed ^ (gene as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

// ── Fit results ────────────────────────────────────────────────────────────

/// Mean abundance of the extreme cells on each end of the phase portrait.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SteadyStateBounds {
    pub u_upper: f64,
    pub s_upper: f64,
    pub u_lower: f64,
    pub s_lower: f64,
}

/// Per-cell outcome of a dynamical fit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DynamicsFit {
    /// Time at which transcription switches off.
    pub switching_time: f64,
    /// Latent time per cell (`tau` for on-phase cells, `switching_time + tau`
    /// for off-phase cells).
    pub latent_time: Vec<f64>,
    /// Time since the start of the cell's current phase.
    pub tau: Vec<f64>,
    /// Assigned transcriptional state per cell.
    pub states: Vec<TranscriptionState>,
    pub iterations: usize,
    pub converged: bool,
    /// Loss after initialization and after each iteration.
    pub loss_history: Vec<f64>,
}

/// Fitted kinetic rates for one gene.
///
/// Rates are non-negative and `likelihood` lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KineticParameters {
    pub mode: FitMode,
    /// Transcription rate; the steady-state model does not estimate it.
    pub alpha: Option<f64>,
    /// Splicing rate.
    pub beta: f64,
    /// Degradation rate.
    pub gamma: f64,
    /// Steady-state intercept (zero unless fit with an offset).
    pub offset: f64,
    /// Ratio between observed and modelled unspliced abundance.
    pub scaling: f64,
    pub likelihood: f64,
    /// Mean squared residual of the fit.
    pub variance: f64,
    pub steady_state: SteadyStateBounds,
    pub dynamics: Option<DynamicsFit>,
}

impl KineticParameters {
    /// Steady-state ratio `γ / β`.
    pub fn ratio(&self) -> f64 {
        self.gamma / self.beta
    }

    /// Per-cell velocity for this gene.
    ///
    /// The steady-state model returns `u − γ·s − offset` on the given
    /// abundances. The dynamical model evaluates `β·u(t) − γ·s(t)` on the
    /// fitted curve at each cell's latent time, so `u` and `s` are only used
    /// for their length.
    pub fn velocity(&self, u: &[f64], s: &[f64]) -> Vec<f64> {
        match (&self.dynamics, self.alpha) {
            (Some(dynamics), Some(alpha)) => {
                let rates = sc_dynamics::Rates {
                    alpha,
                    beta: self.beta,
                    gamma: self.gamma,
                    t_switch: dynamics.switching_time,
                    scaling: self.scaling,
                };
                dynamics
                    .states
                    .iter()
                    .zip(&dynamics.tau)
                    .map(|(&state, &tau)| rates.velocity(state, tau))
                    .collect()
            }
            _ => u
                .iter()
                .zip(s)
                .map(|(&ui, &si)| ui - self.gamma * si - self.offset)
                .collect(),
        }
    }
}

impl Scored for KineticParameters {
    fn score(&self) -> f64 {
        self.likelihood
    }
}

impl Summarizable for KineticParameters {
    fn summary(&self) -> String {
        match self.alpha {
            Some(alpha) => format!(
                "KineticParameters ({}): alpha={alpha:.4}, beta={:.4}, gamma={:.4}, likelihood={:.4}",
                self.mode, self.beta, self.gamma, self.likelihood
            ),
            None => format!(
                "KineticParameters ({}): gamma={:.4}, likelihood={:.4}",
                self.mode, self.gamma, self.likelihood
            ),
        }
    }
}

/// Category of a per-gene failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitFailureKind {
    /// The data cannot identify the model.
    NumericDegeneracy,
    /// The optimization produced non-finite values.
    ConvergenceFailure,
}

/// Why a gene could not be fit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FitFailure {
    /// A layer is constant across cells.
    ZeroVariance { layer: String },
    /// Not enough usable cells.
    TooFewCells { n: usize },
    /// The regression design has no signal.
    RankDeficient,
    /// The fitted degradation slope is negative.
    NegativeSlope,
    /// Parameters or loss became non-finite.
    Diverged { iteration: usize },
}

impl FitFailure {
    pub fn kind(&self) -> FitFailureKind {
        match self {
            FitFailure::Diverged { .. } => FitFailureKind::ConvergenceFailure,
            _ => FitFailureKind::NumericDegeneracy,
        }
    }

    /// Short machine-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            FitFailure::ZeroVariance { .. } => "zero_variance",
            FitFailure::TooFewCells { .. } => "too_few_cells",
            FitFailure::RankDeficient => "rank_deficient",
            FitFailure::NegativeSlope => "negative_slope",
            FitFailure::Diverged { .. } => "diverged",
        }
    }
}

impl fmt::Display for FitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitFailure::ZeroVariance { layer } => write!(f, "zero variance in {layer}"),
            FitFailure::TooFewCells { n } => write!(f, "too few usable cells ({n})"),
            FitFailure::RankDeficient => f.write_str("rank-deficient regression"),
            FitFailure::NegativeSlope => f.write_str("negative degradation slope"),
            FitFailure::Diverged { iteration } => write!(f, "diverged at iteration {iteration}"),
        }
    }
}

/// Outcome of fitting one gene.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum GeneFit {
    Fitted(KineticParameters),
    Failed(FitFailure),
    /// Not attempted, or abandoned on cancellation.
    #[default]
    NotFit,
}

impl GeneFit {
    pub fn is_fitted(&self) -> bool {
        matches!(self, GeneFit::Fitted(_))
    }

    pub fn params(&self) -> Option<&KineticParameters> {
        match self {
            GeneFit::Fitted(p) => Some(p),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FitFailure> {
        match self {
            GeneFit::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// `fitted`, `not_fit`, or the failure label.
    pub fn status(&self) -> &'static str {
        match self {
            GeneFit::Fitted(_) => "fitted",
            GeneFit::Failed(f) => f.label(),
            GeneFit::NotFit => "not_fit",
        }
    }
}

/// Counts over a batch of gene fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FitSummary {
    pub n_genes: usize,
    pub n_fitted: usize,
    pub n_numeric_degeneracy: usize,
    pub n_convergence_failure: usize,
    /// Fitted genes whose likelihood is below the configured minimum.
    pub n_low_confidence: usize,
    pub n_not_fit: usize,
}

impl FitSummary {
    pub fn from_fits(fits: &[GeneFit], min_likelihood: f64) -> Self {
        let mut summary = FitSummary {
            n_genes: fits.len(),
            ..Default::default()
        };
        for fit in fits {
            match fit {
                GeneFit::Fitted(p) => {
                    summary.n_fitted += 1;
                    if p.likelihood < min_likelihood {
                        summary.n_low_confidence += 1;
                    }
                }
                GeneFit::Failed(f) => match f.kind() {
                    FitFailureKind::NumericDegeneracy => summary.n_numeric_degeneracy += 1,
                    FitFailureKind::ConvergenceFailure => summary.n_convergence_failure += 1,
                },
                GeneFit::NotFit => summary.n_not_fit += 1,
            }
        }
        summary
    }

    pub fn n_failed(&self) -> usize {
        self.n_numeric_degeneracy + self.n_convergence_failure
    }
}

impl Summarizable for FitSummary {
    fn summary(&self) -> String {
        format!(
            "FitSummary: {} genes, {} fitted ({} low confidence), {} failed ({} degenerate, {} not converged), {} not fit",
            self.n_genes,
            self.n_fitted,
            self.n_low_confidence,
            self.n_failed(),
            self.n_numeric_degeneracy,
            self.n_convergence_failure,
            self.n_not_fit
        )
    }
}

/// Cooperative cancellation flag shared with a running batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the batch to stop. Genes already fit keep their results.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Input ──────────────────────────────────────────────────────────────────

/// Gene-major copy of the moments and raw counts, shared read-only by all
/// fitting workers.
#[derive(Debug, Clone)]
pub struct KineticsInput {
    ms: Vec<Vec<f64>>,
    mu: Vec<Vec<f64>>,
    s_raw: Vec<Vec<f64>>,
    u_raw: Vec<Vec<f64>>,
    n_obs: usize,
    warm_starts: Vec<Option<WarmStart>>,
}

/// One gene's columns.
#[derive(Debug, Clone, Copy)]
pub struct GeneColumns<'a> {
    /// Smoothed spliced abundance.
    pub s: &'a [f64],
    /// Smoothed unspliced abundance.
    pub u: &'a [f64],
    pub s_raw: &'a [f64],
    pub u_raw: &'a [f64],
}

impl KineticsInput {
    /// Collect columns from moments and the raw layers.
    pub fn new(moments: &Moments, spliced: &MatrixData, unspliced: &MatrixData) -> Result<Self> {
        let shape = (moments.n_obs(), moments.n_vars());
        for (name, rows) in [("Ms", &moments.ms), ("Mu", &moments.mu)] {
            if rows.len() != shape.0 {
                return Err(VelocyteError::dimension(format!("{name} cells"), shape.0, rows.len()));
            }
            if let Some(row) = rows.iter().find(|r| r.len() != shape.1) {
                return Err(VelocyteError::dimension(format!("{name} genes"), shape.1, row.len()));
            }
        }
        for (name, layer) in [("spliced", spliced), ("unspliced", unspliced)] {
            require_rectangular(name, layer)?;
            let (n_obs, n_vars) = layer.shape();
            if n_obs != shape.0 {
                return Err(VelocyteError::dimension(format!("{name} cells"), shape.0, n_obs));
            }
            if n_vars != shape.1 {
                return Err(VelocyteError::dimension(format!("{name} genes"), shape.1, n_vars));
            }
        }
        Self::from_columns(
            (0..shape.1).map(|g| moments.spliced_column(g)).collect(),
            (0..shape.1).map(|g| moments.unspliced_column(g)).collect(),
            spliced.to_dense_columns(),
            unspliced.to_dense_columns(),
        )
    }

    /// Build from gene-major columns.
    pub fn from_columns(
        ms: Vec<Vec<f64>>,
        mu: Vec<Vec<f64>>,
        s_raw: Vec<Vec<f64>>,
        u_raw: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let n_vars = ms.len();
        let n_obs = ms.first().map_or(0, Vec::len);
        for (name, cols) in [("Ms", &ms), ("Mu", &mu), ("spliced", &s_raw), ("unspliced", &u_raw)] {
            if cols.len() != n_vars {
                return Err(VelocyteError::dimension(format!("{name} genes"), n_vars, cols.len()));
            }
            for (g, col) in cols.iter().enumerate() {
                if col.len() != n_obs {
                    return Err(VelocyteError::dimension(format!("{name} cells"), n_obs, col.len()));
                }
                if let Some(v) = col.iter().find(|v| !v.is_finite() || **v < 0.0) {
                    return Err(VelocyteError::Configuration(format!(
                        "{name} gene {g} holds invalid value {v}; expected finite non-negative abundance"
                    )));
                }
            }
        }
        let warm_starts = vec![None; n_vars];
        Ok(Self { ms, mu, s_raw, u_raw, n_obs, warm_starts })
    }

    /// Attach per-gene start rates for dynamical fits.
    pub fn with_warm_starts(mut self, starts: Vec<Option<WarmStart>>) -> Result<Self> {
        if starts.len() != self.n_vars() {
            return Err(VelocyteError::dimension("warm start genes", self.n_vars(), starts.len()));
        }
        self.warm_starts = starts;
        Ok(self)
    }

    pub fn warm_start(&self, gene: usize) -> Option<&WarmStart> {
        self.warm_starts.get(gene).and_then(Option::as_ref)
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_vars(&self) -> usize {
        self.ms.len()
    }

    pub fn gene(&self, gene: usize) -> GeneColumns<'_> {
        GeneColumns {
            s: &self.ms[gene],
            u: &self.mu[gene],
            s_raw: &self.s_raw[gene],
            u_raw: &self.u_raw[gene],
        }
    }
}

// ── Single-gene fits ───────────────────────────────────────────────────────

/// Fit one gene with the requested model.
///
/// Cancellation is checked between EM iterations of the dynamical model;
/// an interrupted gene is reported as [`GeneFit::NotFit`].
pub fn fit_gene(
    data: &GeneColumns<'_>,
    mode: FitMode,
    config: &KineticsConfig,
    seed: u64,
    cancel: &CancelToken,
) -> GeneFit {
    fit_gene_from(data, mode, config, seed, None, cancel)
}

/// [`fit_gene`] with optional start rates for the dynamical model. The
/// steady-state model ignores `start`.
pub fn fit_gene_from(
    data: &GeneColumns<'_>,
    mode: FitMode,
    config: &KineticsConfig,
    seed: u64,
    start: Option<&WarmStart>,
    cancel: &CancelToken,
) -> GeneFit {
    if cancel.is_cancelled() {
        return GeneFit::NotFit;
    }
    if let Some(failure) = check_variance(data) {
        return GeneFit::Failed(failure);
    }
    match mode {
        FitMode::SteadyState => match steady_state_params(data.u, data.s, config) {
            Ok(params) => GeneFit::Fitted(params),
            Err(failure) => GeneFit::Failed(failure),
        },
        FitMode::Dynamical => sc_dynamics::fit_dynamics_from(data, config, seed, start, cancel),
    }
}

/// Closed-form steady-state fit of one gene.
pub fn fit_steady_state(data: &GeneColumns<'_>, config: &KineticsConfig) -> GeneFit {
    fit_gene(data, FitMode::SteadyState, config, 0, &CancelToken::new())
}

fn check_variance(data: &GeneColumns<'_>) -> Option<FitFailure> {
    if data.u.len() < 2 {
        return Some(FitFailure::TooFewCells { n: data.u.len() });
    }
    for (layer, values) in [("unspliced", data.u), ("spliced", data.s)] {
        let var = variance(values, 0).unwrap_or(0.0);
        if var <= ZERO_VARIANCE_EPS {
            return Some(FitFailure::ZeroVariance { layer: layer.to_string() });
        }
    }
    None
}

/// Cells at or below the lower, or at or above the upper, percentile of the
/// max-normalized `u + s`.
pub(crate) fn extreme_quantile_masks(
    u: &[f64],
    s: &[f64],
    perc: f64,
) -> std::result::Result<(Vec<bool>, Vec<bool>), FitFailure> {
    let u_max = u.iter().cloned().fold(0.0, f64::max);
    let s_max = s.iter().cloned().fold(0.0, f64::max);
    if u_max <= 0.0 || s_max <= 0.0 {
        return Err(FitFailure::RankDeficient);
    }
    let x: Vec<f64> = u.iter().zip(s).map(|(&ui, &si)| ui / u_max + si / s_max).collect();
    let lo = percentile(&x, 100.0 - perc).map_err(|_| FitFailure::TooFewCells { n: x.len() })?;
    let hi = percentile(&x, perc).map_err(|_| FitFailure::TooFewCells { n: x.len() })?;
    let lower = x.iter().map(|&v| v <= lo).collect();
    let upper = x.iter().map(|&v| v >= hi).collect();
    Ok((lower, upper))
}

fn steady_state_params(
    u: &[f64],
    s: &[f64],
    config: &KineticsConfig,
) -> std::result::Result<KineticParameters, FitFailure> {
    let (lower, upper) = extreme_quantile_masks(u, s, config.extreme_percentile)?;
    let selected: Vec<bool> = lower.iter().zip(&upper).map(|(&l, &h)| l || h).collect();
    let n_selected = selected.iter().filter(|&&m| m).count();
    if n_selected < 2 {
        return Err(FitFailure::TooFewCells { n: n_selected });
    }

    let fit = if config.fit_offset {
        fit_with_intercept(s, u, Some(&selected))
    } else {
        fit_through_origin(s, u, Some(&selected))
    }
    .map_err(|_| FitFailure::RankDeficient)?;

    if !fit.slope.is_finite() || !fit.intercept.is_finite() {
        return Err(FitFailure::Diverged { iteration: 0 });
    }
    if fit.slope < 0.0 {
        return Err(FitFailure::NegativeSlope);
    }

    let steady_state = SteadyStateBounds {
        u_upper: masked_mean(u, &upper).unwrap_or(0.0),
        s_upper: masked_mean(s, &upper).unwrap_or(0.0),
        u_lower: masked_mean(u, &lower).unwrap_or(0.0),
        s_lower: masked_mean(s, &lower).unwrap_or(0.0),
    };

    Ok(KineticParameters {
        mode: FitMode::SteadyState,
        alpha: None,
        beta: 1.0,
        gamma: fit.slope.max(config.min_rate),
        offset: fit.intercept,
        scaling: 1.0,
        likelihood: fit.r_squared,
        variance: fit.residual_variance,
        steady_state,
        dynamics: None,
    })
}

// ── Batch ──────────────────────────────────────────────────────────────────

/// Per-gene fits for a batch, one slot per gene of the input.
#[derive(Debug, Clone)]
pub struct KineticsResult {
    /// Indexed by gene; genes outside the batch are [`GeneFit::NotFit`].
    pub fits: Vec<GeneFit>,
    pub summary: FitSummary,
}

/// Fit the listed genes with `config.mode`.
pub fn fit_kinetics(
    input: &KineticsInput,
    genes: &[usize],
    config: &KineticsConfig,
    cancel: &CancelToken,
) -> Result<KineticsResult> {
    let tasks: Vec<(usize, FitMode)> = genes.iter().map(|&g| (g, config.mode)).collect();
    fit_kinetics_with_modes(input, &tasks, config, cancel)
}

/// Fit genes with a model chosen per gene.
///
/// Genes run in parallel and write into pre-allocated slots. Once `cancel`
/// is set, genes not yet finished are left as [`GeneFit::NotFit`].
pub fn fit_kinetics_with_modes(
    input: &KineticsInput,
    tasks: &[(usize, FitMode)],
    config: &KineticsConfig,
    cancel: &CancelToken,
) -> Result<KineticsResult> {
    config.validate()?;
    let n_vars = input.n_vars();
    if let Some(&(g, _)) = tasks.iter().find(|(g, _)| *g >= n_vars) {
        return Err(VelocyteError::InvalidInput(format!(
            "gene index {g} out of range for {n_vars} genes"
        )));
    }

    let run = |&(gene, mode): &(usize, FitMode)| -> (usize, GeneFit) {
        let start = input.warm_start(gene);
        let fit = fit_gene_from(&input.gene(gene), mode, config, config.gene_seed(gene), start, cancel);
        if let GeneFit::Failed(failure) = &fit {
            tracing::debug!(gene, %failure, "gene fit failed");
        }
        (gene, fit)
    };

    #[cfg(feature = "parallel")]
    let results: Vec<(usize, GeneFit)> = {
        use rayon::prelude::*;
        match config.n_jobs {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| VelocyteError::Configuration(format!("thread pool: {e}")))?
                .install(|| tasks.par_iter().map(run).collect()),
            None => tasks.par_iter().map(run).collect(),
        }
    };
    #[cfg(not(feature = "parallel"))]
    let results: Vec<(usize, GeneFit)> = tasks.iter().map(run).collect();

    let mut fits = vec![GeneFit::NotFit; n_vars];
    for (gene, fit) in results {
        fits[gene] = fit;
    }

    let summary = FitSummary::from_fits(&fits, config.min_likelihood);
    if cancel.is_cancelled() {
        tracing::warn!(n_fitted = summary.n_fitted, n_not_fit = summary.n_not_fit, "kinetics fit cancelled");
    }
    tracing::info!(
        n_genes = tasks.len(),
        n_fitted = summary.n_fitted,
        n_failed = summary.n_failed(),
        n_low_confidence = summary.n_low_confidence,
        n_not_fit = summary.n_not_fit,
        "fitted kinetics"
    );
    Ok(KineticsResult { fits, summary })
}

// ── AnnData ────────────────────────────────────────────────────────────────

/// Build fitting input from `layers["Ms"]`, `layers["Mu"]` and the raw
/// `spliced`/`unspliced` layers.
pub fn kinetics_input(adata: &AnnData) -> Result<KineticsInput> {
    let ms = adata.get_layer("Ms").ok_or_else(|| {
        VelocyteError::Configuration("layers['Ms'] not found; compute moments first".into())
    })?;
    let mu = adata.get_layer("Mu").ok_or_else(|| {
        VelocyteError::Configuration("layers['Mu'] not found; compute moments first".into())
    })?;
    let moments = Moments::from_first_order(ms.to_dense_rows(), mu.to_dense_rows())?;
    KineticsInput::new(
        &moments,
        adata.require_layer("spliced")?,
        adata.require_layer("unspliced")?,
    )
}

/// Genes an [`AnnData`] driver fits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GeneSelection {
    #[default]
    All,
    /// Genes flagged in `var["velocity_genes"]`, or every gene when the
    /// column is absent.
    VelocityGenes,
    Names(Vec<String>),
}

impl GeneSelection {
    /// Gene indices in `adata`, in selection order.
    pub fn resolve(&self, adata: &AnnData) -> Result<Vec<usize>> {
        match self {
            GeneSelection::All => Ok((0..adata.n_vars()).collect()),
            GeneSelection::VelocityGenes => match adata.get_var("velocity_genes") {
                Some(ColumnData::Bool(mask)) => {
                    Ok(mask.iter().enumerate().filter(|(_, &m)| m).map(|(g, _)| g).collect())
                }
                Some(_) => Err(VelocyteError::Configuration(
                    "var['velocity_genes'] must be a boolean column".into(),
                )),
                None => {
                    tracing::warn!("var['velocity_genes'] not found; fitting all genes");
                    Ok((0..adata.n_vars()).collect())
                }
            },
            GeneSelection::Names(names) => names
                .iter()
                .map(|name| {
                    adata
                        .var_names()
                        .iter()
                        .position(|v| v == name)
                        .ok_or_else(|| VelocyteError::Configuration(format!("unknown gene '{name}'")))
                })
                .collect(),
        }
    }
}

/// Fit the dynamical model for the selected genes and store the parameters.
///
/// Writes `var` columns `fit_alpha`, `fit_beta`, `fit_gamma`, `fit_t_`,
/// `fit_scaling`, `fit_likelihood`, `fit_variance`, `fit_status`, the
/// latent time layer `fit_t` and the loss traces in `varm["loss"]`. Genes
/// outside the selection keep whatever an earlier run stored. With
/// `config.warm_start` each gene resumes from its stored rates.
pub fn recover_dynamics(
    adata: &mut AnnData,
    genes: &GeneSelection,
    config: &KineticsConfig,
    cancel: &CancelToken,
) -> Result<KineticsResult> {
    let config = KineticsConfig {
        mode: FitMode::Dynamical,
        ..config.clone()
    };
    fit_selection(adata, genes, &config, cancel)
}

/// Fit the genes named in `var_names` with `config.mode` and store the
/// parameters. Genes not listed keep their stored columns, or read as not
/// fit when nothing was stored.
pub fn fit_genes(
    adata: &mut AnnData,
    var_names: &[&str],
    config: &KineticsConfig,
    cancel: &CancelToken,
) -> Result<KineticsResult> {
    let selection = GeneSelection::Names(var_names.iter().map(|n| n.to_string()).collect());
    fit_selection(adata, &selection, config, cancel)
}

fn fit_selection(
    adata: &mut AnnData,
    selection: &GeneSelection,
    config: &KineticsConfig,
    cancel: &CancelToken,
) -> Result<KineticsResult> {
    let genes = selection.resolve(adata)?;
    let mut input = kinetics_input(adata)?;
    if config.warm_start && config.mode == FitMode::Dynamical {
        let starts = stored_warm_starts(adata);
        let n_resumed = genes.iter().filter(|&&g| starts[g].is_some()).count();
        tracing::debug!(n_resumed, n_genes = genes.len(), "resuming dynamical fits");
        input = input.with_warm_starts(starts)?;
    }
    let result = fit_kinetics(&input, &genes, config, cancel)?;
    write_fits(adata, &result.fits, &genes)?;
    Ok(result)
}

/// Start rates from the `var["fit_*"]` columns of an earlier dynamical run.
fn stored_warm_starts(adata: &AnnData) -> Vec<Option<WarmStart>> {
    let column = |key: &str| adata.get_var(key).and_then(ColumnData::as_numeric);
    match (
        column("fit_alpha"),
        column("fit_beta"),
        column("fit_gamma"),
        column("fit_t_"),
        column("fit_scaling"),
    ) {
        (Some(alpha), Some(beta), Some(gamma), Some(t_switch), Some(scaling)) => (0..adata.n_vars())
            .map(|g| {
                let start = WarmStart {
                    alpha: alpha[g],
                    beta: beta[g],
                    gamma: gamma[g],
                    switching_time: t_switch[g],
                    scaling: scaling[g],
                };
                start.is_usable().then_some(start)
            })
            .collect(),
        _ => vec![None; adata.n_vars()],
    }
}

/// Store the fits of `genes` in `var` (NaN where no parameter exists), their
/// latent times in `layers["fit_t"]` and their loss traces in
/// `varm["loss"]`. Other genes keep what is already stored.
///
/// The latent time layer and loss traces are written once any gene has been
/// fit dynamically; loss rows are NaN-padded to the longest trace.
pub fn write_fits(adata: &mut AnnData, fits: &[GeneFit], genes: &[usize]) -> Result<()> {
    let (n_obs, n_vars) = adata.shape();
    if fits.len() != n_vars {
        return Err(VelocyteError::dimension("gene fits", n_vars, fits.len()));
    }
    if let Some(&g) = genes.iter().find(|&&g| g >= n_vars) {
        return Err(VelocyteError::InvalidInput(format!(
            "gene index {g} out of range for {n_vars} genes"
        )));
    }
    let dynamics = |g: usize| fits[g].params().and_then(|p| p.dynamics.as_ref());

    let columns: [(&str, fn(&KineticParameters) -> Option<f64>); 7] = [
        ("fit_alpha", |p| p.alpha),
        ("fit_beta", |p| Some(p.beta)),
        ("fit_gamma", |p| Some(p.gamma)),
        ("fit_t_", |p| p.dynamics.as_ref().map(|d| d.switching_time)),
        ("fit_scaling", |p| Some(p.scaling)),
        ("fit_likelihood", |p| Some(p.likelihood)),
        ("fit_variance", |p| Some(p.variance)),
    ];
    for (key, param) in columns {
        let mut column = match adata.get_var(key) {
            Some(ColumnData::Numeric(v)) => v.clone(),
            _ => vec![f64::NAN; n_vars],
        };
        for &g in genes {
            column[g] = fits[g].params().and_then(param).unwrap_or(f64::NAN);
        }
        adata.add_var_numeric(key, column)?;
    }

    let mut status = match adata.get_var("fit_status") {
        Some(ColumnData::Strings(v)) => v.clone(),
        _ => vec![GeneFit::NotFit.status().to_string(); n_vars],
    };
    for &g in genes {
        status[g] = fits[g].status().to_string();
    }
    adata.add_var_column("fit_status", ColumnData::Strings(status))?;

    let any_dynamics = genes.iter().any(|&g| dynamics(g).is_some());
    if any_dynamics || adata.get_layer("fit_t").is_some() {
        let mut latent = match adata.get_layer("fit_t") {
            Some(layer) => layer.to_dense_rows(),
            None => vec![vec![f64::NAN; n_vars]; n_obs],
        };
        for &g in genes {
            let times = dynamics(g).map(|d| d.latent_time.as_slice());
            for (i, row) in latent.iter_mut().enumerate() {
                row[g] = times.and_then(|t| t.get(i).copied()).unwrap_or(f64::NAN);
            }
        }
        adata.add_layer("fit_t", MatrixData::Dense(latent))?;
    }

    if any_dynamics || adata.get_varm("loss").is_some() {
        let mut loss = adata.get_varm("loss").cloned().unwrap_or_else(|| vec![Vec::new(); n_vars]);
        for &g in genes {
            loss[g] = dynamics(g).map(|d| d.loss_history.clone()).unwrap_or_default();
        }
        let width = loss.iter().map(Vec::len).max().unwrap_or(0);
        for row in &mut loss {
            row.resize(width, f64::NAN);
        }
        adata.add_varm("loss", loss)?;
    }
    Ok(())
}
