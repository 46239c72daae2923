//! Dynamical model of transcription.
//!
//! A gene switches transcription on at time 0 with rate `α` and off at the
//! switching time `t_`. Unspliced (`u`) and spliced (`s`) abundance follow
//!
//! ```text
//! du/dt = α − β·u
//! ds/dt = β·u − γ·s
//! ```
//!
//! with closed-form solutions on each phase. Every cell is placed in one of
//! four states (induction, repression, or one of the two steady states) with
//! a phase time `tau`. The fit alternates between assigning cells to the
//! nearest point of the current trajectory and re-estimating the switching
//! time, `α`, `γ` and the unspliced scaling, accepting a move only when the
//! weighted squared distance to the trajectory decreases.
//!
//! Single-parameter moves stall on the ridge where `α` and the unspliced
//! scaling compensate each other. When an iteration no longer lowers the
//! loss, a joint `α × γ` grid and a downhill simplex over all four log-rates
//! take over; the fit has converged only once those fail as well.
//!
//! `β` is held at 1: the model is invariant under rescaling time, so only
//! the rate ratios are identifiable. An optional `t_max` rescales time and
//! rates afterwards.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use velocyte_stats::descriptive::{masked_mean, masked_percentile, percentile, variance};
use velocyte_stats::regression::{fit_through_origin, projection_coefficient};

use crate::sc_kinetics::{
    CancelToken, DynamicsFit, FitFailure, FitMode, GeneColumns, GeneFit, KineticParameters,
    KineticsConfig, SteadyStateBounds,
};

/// Arguments of `ln` are clipped to `[LOG_EPS, 1 − LOG_EPS]`.
const LOG_EPS: f64 = 1e-6;
/// `|γ − β|` below this uses the `γ = β` limit.
const RATE_TIE_EPS: f64 = 1e-8;
/// Initial unspliced scaling is this times `Σu / Σs`.
const INITIAL_SCALING_FACTOR: f64 = 1.3;
/// Relative half-width of the local candidate sweeps.
const SWEEP_WIDTH: f64 = 0.1;
/// Relative offsets of the joint `α × γ` grid tried on a stall.
const GRID_OFFSETS: [f64; 5] = [-0.5, -0.25, 0.0, 0.25, 0.5];
/// Initial simplex edge, in log-rate units.
const SIMPLEX_STEP: f64 = 0.1;
const SIMPLEX_MAX_ITERATIONS: usize = 500;
/// The simplex stops once its vertex losses agree to this relative spread.
const SIMPLEX_TOLERANCE: f64 = 1e-10;
const SIMPLEX_RESTARTS: usize = 4;
/// Log-rates beyond this magnitude are rejected by the simplex.
const MAX_LOG_RATE: f64 = 50.0;

// ── Analytic solutions ─────────────────────────────────────────────────────

/// Unspliced abundance after `tau` from `u0` under transcription rate `alpha`.
pub fn unspliced(tau: f64, u0: f64, alpha: f64, beta: f64) -> f64 {
    let expu = (-beta * tau).exp();
    u0 * expu + alpha / beta * (1.0 - expu)
}

/// Spliced abundance after `tau` from `(u0, s0)`.
///
/// Uses the exact limit when `gamma` equals `beta`.
pub fn spliced(tau: f64, s0: f64, u0: f64, alpha: f64, beta: f64, gamma: f64) -> f64 {
    let exps = (-gamma * tau).exp();
    s0 * exps + alpha / gamma * (1.0 - exps) + (alpha - beta * u0) * decay_diff(tau, beta, gamma)
}

/// `(e^{−γτ} − e^{−βτ}) / (γ − β)`, continuous at `γ = β`.
fn decay_diff(tau: f64, beta: f64, gamma: f64) -> f64 {
    if (gamma - beta).abs() < RATE_TIE_EPS {
        -tau * (-beta * tau).exp()
    } else {
        ((-gamma * tau).exp() - (-beta * tau).exp()) / (gamma - beta)
    }
}

fn inv(x: f64) -> f64 {
    if x.abs() < RATE_TIE_EPS {
        0.0
    } else {
        1.0 / x
    }
}

fn clipped_log(x: f64) -> f64 {
    if x.is_nan() {
        return LOG_EPS.ln();
    }
    x.clamp(LOG_EPS, 1.0 - LOG_EPS).ln()
}

/// Time for unspliced abundance to move from `u0` to `u`.
pub fn tau_u(u: f64, u0: f64, alpha: f64, beta: f64) -> f64 {
    let u_inf = alpha / beta;
    -1.0 / beta * clipped_log((u - u_inf) / (u0 - u_inf))
}

/// Phase time of `(u, s)` on the trajectory starting at `(u0, s0)`.
///
/// Eliminates `e^{−βτ}` between the two solutions, which leaves a single
/// exponential in `γ`.
pub fn tau_inv(u: f64, s: f64, u0: f64, s0: f64, alpha: f64, beta: f64, gamma: f64) -> f64 {
    let beta_ = beta * inv(gamma - beta);
    let ceta_ = alpha / gamma - beta_ * alpha / beta;
    let c0 = s0 - beta_ * u0 - ceta_;
    let cs = s - beta_ * u - ceta_;
    -1.0 / gamma * clipped_log(cs / c0)
}

// ── States and rates ───────────────────────────────────────────────────────

/// Transcriptional state of a cell for one gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TranscriptionState {
    /// Transcription on, approaching the upper steady state.
    Induction,
    /// Transcription off, decaying from the switching point.
    Repression,
    /// Equilibrium with transcription on: `(α/β, α/γ)`.
    SteadyStateOn,
    /// Equilibrium with transcription off: `(0, 0)`.
    SteadyStateOff,
}

impl TranscriptionState {
    /// Whether transcription is on.
    pub fn is_on(self) -> bool {
        matches!(self, TranscriptionState::Induction | TranscriptionState::SteadyStateOn)
    }
}

/// How cells are placed on the trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeAssignment {
    /// Invert the closed-form solution per phase.
    #[default]
    Explicit,
    /// Project onto a grid of `n_points` times per phase.
    Projection { n_points: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Rates {
    pub(crate) alpha: f64,
    pub(crate) beta: f64,
    pub(crate) gamma: f64,
    pub(crate) t_switch: f64,
    pub(crate) scaling: f64,
}

impl Rates {
    /// `(u, s)` at the switching time, in scaled unspliced units.
    fn switch_point(&self) -> (f64, f64) {
        (
            unspliced(self.t_switch, 0.0, self.alpha, self.beta),
            spliced(self.t_switch, 0.0, 0.0, self.alpha, self.beta, self.gamma),
        )
    }

    /// Model `(u, s)` of a cell in `state` at phase time `tau`.
    fn predict(&self, state: TranscriptionState, tau: f64) -> (f64, f64) {
        let Rates { alpha, beta, gamma, .. } = *self;
        match state {
            TranscriptionState::Induction => (
                unspliced(tau, 0.0, alpha, beta),
                spliced(tau, 0.0, 0.0, alpha, beta, gamma),
            ),
            TranscriptionState::Repression => {
                let (u0, s0) = self.switch_point();
                (unspliced(tau, u0, 0.0, beta), spliced(tau, s0, u0, 0.0, beta, gamma))
            }
            TranscriptionState::SteadyStateOn => (alpha / beta, alpha / gamma),
            TranscriptionState::SteadyStateOff => (0.0, 0.0),
        }
    }

    /// `ds/dt` of the trajectory at `(state, tau)`.
    pub(crate) fn velocity(&self, state: TranscriptionState, tau: f64) -> f64 {
        let (u, s) = self.predict(state, tau);
        self.beta * u - self.gamma * s
    }

    fn floored(self, min_rate: f64) -> Self {
        Self {
            alpha: self.alpha.max(min_rate),
            beta: self.beta.max(min_rate),
            gamma: self.gamma.max(min_rate),
            t_switch: self.t_switch.max(min_rate),
            scaling: self.scaling.max(min_rate),
        }
    }

    fn is_finite(&self) -> bool {
        [self.alpha, self.beta, self.gamma, self.t_switch, self.scaling]
            .iter()
            .all(|v| v.is_finite())
    }

    /// `ln` of the free rates `(α, γ, t_, scaling)`; `β` stays fixed.
    fn log_coordinates(&self) -> [f64; 4] {
        [self.alpha.ln(), self.gamma.ln(), self.t_switch.ln(), self.scaling.ln()]
    }

    fn from_log_coordinates(&self, x: &[f64; 4]) -> Self {
        Self {
            alpha: x[0].exp(),
            beta: self.beta,
            gamma: x[1].exp(),
            t_switch: x[2].exp(),
            scaling: x[3].exp(),
        }
    }
}

/// Rates to resume a dynamical fit from, e.g. the `var["fit_*"]` columns of
/// an earlier run.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WarmStart {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub switching_time: f64,
    pub scaling: f64,
}

impl WarmStart {
    /// The rates of an earlier dynamical fit.
    pub fn from_params(params: &KineticParameters) -> Option<Self> {
        let start = Self {
            alpha: params.alpha?,
            beta: params.beta,
            gamma: params.gamma,
            switching_time: params.dynamics.as_ref()?.switching_time,
            scaling: params.scaling,
        };
        start.is_usable().then_some(start)
    }

    /// Whether every rate is finite and positive.
    pub fn is_usable(&self) -> bool {
        [self.alpha, self.beta, self.gamma, self.switching_time, self.scaling]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }

    fn rates(&self) -> Rates {
        Rates {
            alpha: self.alpha,
            beta: self.beta,
            gamma: self.gamma,
            t_switch: self.switching_time,
            scaling: self.scaling,
        }
    }
}

// ── Time assignment ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    tau: Vec<f64>,
    states: Vec<TranscriptionState>,
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

fn dist2(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

/// Longest repression time worth considering: the largest off-phase time
/// among cells with spliced signal.
fn repression_horizon(tau_off: &[f64], s: &[f64]) -> f64 {
    let with_signal = tau_off
        .iter()
        .zip(s)
        .filter(|(_, &si)| si > 0.0)
        .map(|(&t, _)| t)
        .fold(f64::NEG_INFINITY, f64::max);
    if with_signal.is_finite() {
        with_signal
    } else {
        tau_off.iter().cloned().fold(0.0, f64::max)
    }
}

/// Place each cell `(u[i], s[i])` (unspliced already scaled) on the
/// trajectory, choosing the nearest of the four states.
fn assign(u: &[f64], s: &[f64], rates: &Rates, method: TimeAssignment) -> Assignment {
    let (u0_, s0_) = rates.switch_point();
    let Rates { alpha, beta, gamma, t_switch, .. } = *rates;

    // (tau_on, tau_off) candidates per cell
    let (tau_on, tau_off, off_end): (Vec<f64>, Vec<f64>, f64) = match method {
        TimeAssignment::Explicit => {
            let on: Vec<f64> = u
                .iter()
                .zip(s)
                .map(|(&ui, &si)| tau_inv(ui, si, 0.0, 0.0, alpha, beta, gamma).clamp(0.0, t_switch))
                .collect();
            let off_raw: Vec<f64> = u
                .iter()
                .zip(s)
                .map(|(&ui, &si)| tau_inv(ui, si, u0_, s0_, 0.0, beta, gamma).max(0.0))
                .collect();
            let horizon = repression_horizon(&off_raw, s);
            let off = off_raw.into_iter().map(|t| t.min(horizon)).collect();
            (on, off, horizon)
        }
        TimeAssignment::Projection { n_points } => {
            let u_min = u
                .iter()
                .zip(s)
                .filter(|(_, &si)| si > 0.0)
                .map(|(&ui, _)| ui)
                .fold(f64::INFINITY, f64::min);
            let u_min = if u_min.is_finite() { u_min } else { 0.0 };
            let horizon = tau_u(u_min, u0_, 0.0, beta);
            let on_grid = linspace(0.0, t_switch, n_points);
            let off_grid: Vec<f64> = linspace(0.0, horizon, n_points).into_iter().skip(1).collect();
            let on_curve: Vec<(f64, f64)> = on_grid
                .iter()
                .map(|&t| rates.predict(TranscriptionState::Induction, t))
                .collect();
            let off_curve: Vec<(f64, f64)> = off_grid
                .iter()
                .map(|&t| rates.predict(TranscriptionState::Repression, t))
                .collect();
            let nearest = |grid: &[f64], curve: &[(f64, f64)], x: (f64, f64)| -> f64 {
                curve
                    .iter()
                    .zip(grid)
                    .map(|(&p, &t)| (dist2(p, x), t))
                    .fold((f64::INFINITY, 0.0), |best, cur| if cur.0 < best.0 { cur } else { best })
                    .1
            };
            let on = u
                .iter()
                .zip(s)
                .map(|(&ui, &si)| nearest(&on_grid, &on_curve, (ui, si)))
                .collect();
            let off = u
                .iter()
                .zip(s)
                .map(|(&ui, &si)| nearest(&off_grid, &off_curve, (ui, si)))
                .collect();
            (on, off, horizon)
        }
    };

    let mut tau = Vec::with_capacity(u.len());
    let mut states = Vec::with_capacity(u.len());
    for i in 0..u.len() {
        let x = (u[i], s[i]);
        let candidates = [
            (TranscriptionState::Induction, tau_on[i]),
            (TranscriptionState::Repression, tau_off[i]),
            (TranscriptionState::SteadyStateOn, t_switch),
            (TranscriptionState::SteadyStateOff, off_end),
        ];
        let mut best = candidates[0];
        let mut best_d = dist2(rates.predict(best.0, best.1), x);
        for &cand in &candidates[1..] {
            let d = dist2(rates.predict(cand.0, cand.1), x);
            if d < best_d {
                best = cand;
                best_d = d;
            }
        }
        states.push(best.0);
        tau.push(best.1);
    }
    Assignment { tau, states }
}

// ── Fit state ──────────────────────────────────────────────────────────────

/// One gene's observations with the cell weights used by the loss.
struct Observations<'a> {
    u: &'a [f64],
    s: &'a [f64],
    weights: Vec<bool>,
    n_weighted: usize,
}

impl<'a> Observations<'a> {
    /// Keep cells with positive raw counts below the outlier percentile.
    fn new(data: &GeneColumns<'a>, weight_percentile: f64) -> Self {
        let keep = |values: &[f64], raw: &[f64]| -> Vec<bool> {
            let expressed: Vec<bool> = raw.iter().map(|&r| r > 0.0).collect();
            match masked_percentile(values, &expressed, weight_percentile) {
                Ok(cutoff) if weight_percentile < 100.0 => expressed
                    .iter()
                    .zip(values)
                    .map(|(&e, &v)| e && v < cutoff)
                    .collect(),
                _ => expressed,
            }
        };
        let s_keep = keep(data.s, data.s_raw);
        let u_keep = keep(data.u, data.u_raw);
        let weights: Vec<bool> = s_keep.iter().zip(&u_keep).map(|(&a, &b)| a && b).collect();
        let n_weighted = weights.iter().filter(|&&w| w).count();
        Self { u: data.u, s: data.s, weights, n_weighted }
    }

    fn scaled_u(&self, scaling: f64) -> Vec<f64> {
        self.u.iter().map(|&v| v / scaling).collect()
    }

    fn weighted<'b>(&'b self, values: &'b [f64]) -> impl Iterator<Item = (usize, f64)> + 'b {
        values
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.weights[*i])
            .map(|(i, &v)| (i, v))
    }

    /// Mean squared distance of weighted cells to their assigned points, in
    /// observed units.
    fn loss(&self, rates: &Rates, assignment: &Assignment) -> f64 {
        let mut total = 0.0;
        for (i, &w) in self.weights.iter().enumerate() {
            if !w {
                continue;
            }
            let (u_hat, s_hat) = rates.predict(assignment.states[i], assignment.tau[i]);
            total += (rates.scaling * u_hat - self.u[i]).powi(2) + (s_hat - self.s[i]).powi(2);
        }
        total / self.n_weighted as f64
    }

    /// Total variance of the weighted cells.
    fn total_variance(&self) -> f64 {
        let u: Vec<f64> = self.weighted(self.u).map(|(_, v)| v).collect();
        let s: Vec<f64> = self.weighted(self.s).map(|(_, v)| v).collect();
        variance(&u, 0).unwrap_or(0.0) + variance(&s, 0).unwrap_or(0.0)
    }
}

/// Iterate state of the alternating fit.
struct DynamicsState {
    rates: Rates,
    assignment: Assignment,
    loss: f64,
    iteration: usize,
    loss_history: Vec<f64>,
}

impl DynamicsState {
    /// Rates from the top-percentile cells: `γ` from a steady-state
    /// regression on the highest spliced cells, `α` from the highest
    /// unspliced cells.
    fn initialize(
        obs: &Observations<'_>,
        config: &KineticsConfig,
    ) -> Result<Self, FitFailure> {
        let sum_u: f64 = obs.u.iter().sum();
        let sum_s: f64 = obs.s.iter().sum();
        if sum_s <= 0.0 || sum_u <= 0.0 {
            return Err(FitFailure::RankDeficient);
        }
        let scaling = sum_u / sum_s * INITIAL_SCALING_FACTOR;
        let u = obs.scaled_u(scaling);

        let u_w: Vec<f64> = obs.weighted(&u).map(|(_, v)| v).collect();
        let s_w: Vec<f64> = obs.weighted(obs.s).map(|(_, v)| v).collect();
        let perc = config.extreme_percentile;
        let too_few = |_| FitFailure::TooFewCells { n: obs.n_weighted };

        let s_cut = percentile(&s_w, perc).map_err(too_few)?;
        let top_s: Vec<bool> = s_w.iter().map(|&v| v >= s_cut).collect();
        let gamma = fit_through_origin(&s_w, &u_w, Some(&top_s))
            .map_err(|_| FitFailure::RankDeficient)?
            .slope;
        if !gamma.is_finite() {
            return Err(FitFailure::Diverged { iteration: 0 });
        }
        if gamma < 0.0 {
            return Err(FitFailure::NegativeSlope);
        }

        let u_cut = percentile(&u_w, perc).map_err(too_few)?;
        let top_u: Vec<bool> = u_w.iter().map(|&v| v >= u_cut).collect();
        let alpha = masked_mean(&u_w, &top_u).unwrap_or(0.0);
        if alpha <= 0.0 {
            return Err(FitFailure::RankDeficient);
        }

        let beta = 1.0;
        let mut rates = Rates {
            alpha,
            beta,
            gamma,
            t_switch: tau_u(alpha, 0.0, alpha, beta),
            scaling,
        }
        .floored(config.min_rate);

        // the switch happens at the latest induction cell
        let first = assign(&u, obs.s, &rates, config.time_assignment);
        let latest_on = first
            .states
            .iter()
            .zip(&first.tau)
            .filter(|(st, _)| **st == TranscriptionState::Induction)
            .map(|(_, &t)| t)
            .fold(f64::NEG_INFINITY, f64::max);
        if latest_on.is_finite() {
            rates.t_switch = latest_on.max(config.min_rate);
        }

        let assignment = assign(&u, obs.s, &rates, config.time_assignment);
        let loss = obs.loss(&rates, &assignment);
        if !loss.is_finite() {
            return Err(FitFailure::Diverged { iteration: 0 });
        }
        Ok(Self {
            rates,
            assignment,
            loss,
            iteration: 0,
            loss_history: vec![loss],
        })
    }

    /// Start from stored rates. `None` when they do not give a finite loss.
    fn resume(obs: &Observations<'_>, start: &WarmStart, config: &KineticsConfig) -> Option<Self> {
        let (rates, assignment, loss) = evaluate(obs, start.rates(), config)?;
        Some(Self {
            rates,
            assignment,
            loss,
            iteration: 0,
            loss_history: vec![loss],
        })
    }

    /// Reassign times under `candidate` and keep it if the loss drops.
    fn try_update(&mut self, obs: &Observations<'_>, candidate: Rates, config: &KineticsConfig) -> bool {
        match evaluate(obs, candidate, config) {
            Some((rates, assignment, loss)) if loss < self.loss => {
                self.rates = rates;
                self.assignment = assignment;
                self.loss = loss;
                true
            }
            _ => false,
        }
    }

    /// Switching time from the off-phase cells by closed-form regression.
    fn regress_switching_time(&self, obs: &Observations<'_>) -> f64 {
        let Rates { alpha, beta, gamma, .. } = self.rates;
        let u = obs.scaled_u(self.rates.scaling);
        let beta_ = beta * inv(gamma - beta);
        let ceta_ = alpha / gamma - beta_ * alpha / beta;

        let (mut sxy, mut sxx) = (0.0, 0.0);
        let mut latest_on = f64::NEG_INFINITY;
        for (i, _) in obs.weighted(obs.s) {
            let tau = self.assignment.tau[i];
            match self.assignment.states[i] {
                TranscriptionState::Repression => {
                    let x = -ceta_ * (-gamma * tau).exp();
                    let y = obs.s[i] - beta_ * u[i];
                    sxy += x * y;
                    sxx += x * x;
                }
                TranscriptionState::Induction => latest_on = latest_on.max(tau),
                _ => {}
            }
        }
        if sxx > 0.0 {
            let exp_t = sxy / sxx;
            if exp_t > -1.0 && exp_t < 0.0 {
                return -1.0 / gamma * clipped_log(exp_t + 1.0);
            }
        }
        if latest_on.is_finite() {
            latest_on
        } else {
            self.rates.t_switch
        }
    }

    /// Transcription rate by generalized linear regression of the observed
    /// abundances on the unit-rate trajectory.
    fn regress_alpha(&self, obs: &Observations<'_>) -> Option<f64> {
        let Rates { beta, gamma, t_switch, .. } = self.rates;
        let u = obs.scaled_u(self.rates.scaling);
        let expu0 = (-beta * t_switch).exp();
        let exps0 = (-gamma * t_switch).exp();
        let s_switch = (1.0 - exps0) / gamma + decay_diff(t_switch, beta, gamma);

        let mut basis = Vec::with_capacity(2 * obs.n_weighted);
        let mut target = Vec::with_capacity(2 * obs.n_weighted);
        for (i, _) in obs.weighted(obs.s) {
            let tau = self.assignment.tau[i];
            let (cu, cs) = match self.assignment.states[i] {
                TranscriptionState::Induction => (
                    (1.0 - (-beta * tau).exp()) / beta,
                    (1.0 - (-gamma * tau).exp()) / gamma + decay_diff(tau, beta, gamma),
                ),
                TranscriptionState::Repression => (
                    (1.0 - expu0) / beta * (-beta * tau).exp(),
                    s_switch * (-gamma * tau).exp() - (1.0 - expu0) * decay_diff(tau, beta, gamma),
                ),
                TranscriptionState::SteadyStateOn => (1.0 / beta, 1.0 / gamma),
                TranscriptionState::SteadyStateOff => continue,
            };
            basis.push(cu);
            target.push(u[i]);
            basis.push(cs);
            target.push(obs.s[i]);
        }
        projection_coefficient(&basis, &target).filter(|a| a.is_finite() && *a > 0.0)
    }

    /// Multiplicative correction of the unspliced scaling.
    fn regress_scaling(&self, obs: &Observations<'_>) -> Option<f64> {
        let u = obs.scaled_u(self.rates.scaling);
        let (model, observed): (Vec<f64>, Vec<f64>) = obs
            .weighted(&u)
            .map(|(i, ui)| {
                let (u_hat, _) = self.rates.predict(self.assignment.states[i], self.assignment.tau[i]);
                (u_hat, ui)
            })
            .unzip();
        projection_coefficient(&model, &observed)
            .filter(|f| f.is_finite() && *f > 0.0)
            .map(|f| f * self.rates.scaling)
    }

    /// One alternating update of switching time, `α`, `γ` and scaling.
    fn step(&mut self, obs: &Observations<'_>, config: &KineticsConfig, rng: &mut StdRng) {
        let sweep = [-1.0, -0.5, 0.0, 0.5, 1.0].map(|k| 1.0 + k * SWEEP_WIDTH);

        let t0 = self.regress_switching_time(obs);
        for f in sweep {
            let candidate = Rates { t_switch: t0 * f, ..self.rates };
            self.try_update(obs, candidate, config);
        }

        if let Some(alpha) = self.regress_alpha(obs) {
            for f in sweep {
                let candidate = Rates { alpha: alpha * f, ..self.rates };
                self.try_update(obs, candidate, config);
            }
        }

        let gamma = self.rates.gamma;
        let random: Vec<f64> = (0..config.n_random_candidates)
            .map(|_| rng.gen_range(0.5..1.5))
            .collect();
        for f in sweep.into_iter().filter(|&f| f != 1.0).chain(random) {
            let candidate = Rates { gamma: gamma * f, ..self.rates };
            self.try_update(obs, candidate, config);
        }

        if let Some(scaling) = self.regress_scaling(obs) {
            let candidate = Rates { scaling, ..self.rates };
            self.try_update(obs, candidate, config);
        }
    }

    /// Joint moves for a stalled fit: the best point of an `α × γ` grid
    /// around the current rates, then simplex restarts over all log-rates
    /// until a restart stops paying off.
    fn refine(&mut self, obs: &Observations<'_>, config: &KineticsConfig) {
        let mut best: Option<(f64, Rates)> = None;
        for da in GRID_OFFSETS {
            for dg in GRID_OFFSETS {
                let candidate = Rates {
                    alpha: self.rates.alpha * (1.0 + da),
                    gamma: self.rates.gamma * (1.0 + dg),
                    ..self.rates
                };
                let loss = evaluate(obs, candidate, config).map_or(f64::INFINITY, |(_, _, l)| l);
                if best.map_or(true, |(b, _)| loss < b) {
                    best = Some((loss, candidate));
                }
            }
        }
        if let Some((_, candidate)) = best {
            self.try_update(obs, candidate, config);
        }

        for _ in 0..SIMPLEX_RESTARTS {
            let before = self.loss;
            let origin = self.rates;
            let objective = |x: &[f64; 4]| -> f64 {
                if x.iter().any(|v| !v.is_finite() || v.abs() > MAX_LOG_RATE) {
                    return f64::INFINITY;
                }
                evaluate(obs, origin.from_log_coordinates(x), config)
                    .map_or(f64::INFINITY, |(_, _, l)| l)
            };
            let x = simplex_minimize(objective, origin.log_coordinates());
            self.try_update(obs, origin.from_log_coordinates(&x), config);
            if stalled(before, self.loss, config.convergence_tolerance) {
                break;
            }
        }
    }
}

/// Floor `candidate`, place the cells on its trajectory and score it.
fn evaluate(
    obs: &Observations<'_>,
    candidate: Rates,
    config: &KineticsConfig,
) -> Option<(Rates, Assignment, f64)> {
    let candidate = candidate.floored(config.min_rate);
    if !candidate.is_finite() {
        return None;
    }
    let u = obs.scaled_u(candidate.scaling);
    let assignment = assign(&u, obs.s, &candidate, config.time_assignment);
    let loss = obs.loss(&candidate, &assignment);
    loss.is_finite().then_some((candidate, assignment, loss))
}

/// Whether going from `before` to `after` lowered the loss by less than
/// `tolerance`, relative.
fn stalled(before: f64, after: f64, tolerance: f64) -> bool {
    before <= 0.0 || (before - after) / before < tolerance
}

/// Nelder–Mead downhill simplex from `x0`. Returns the best vertex.
fn simplex_minimize<const N: usize>(f: impl Fn(&[f64; N]) -> f64, x0: [f64; N]) -> [f64; N] {
    let mut points: Vec<[f64; N]> = Vec::with_capacity(N + 1);
    points.push(x0);
    for i in 0..N {
        let mut p = x0;
        p[i] += SIMPLEX_STEP;
        points.push(p);
    }
    let mut values: Vec<f64> = points.iter().map(&f).collect();

    for iteration in 0..SIMPLEX_MAX_ITERATIONS {
        let mut order: Vec<usize> = (0..=N).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        points = order.iter().map(|&i| points[i]).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let (best, worst) = (values[0], values[N]);
        if iteration > 0 && (worst - best).abs() <= SIMPLEX_TOLERANCE * best.abs().max(f64::MIN_POSITIVE) {
            break;
        }

        let mut centroid = [0.0; N];
        for p in &points[..N] {
            for (c, v) in centroid.iter_mut().zip(p) {
                *c += v;
            }
        }
        for c in &mut centroid {
            *c /= N as f64;
        }
        let worst_point = points[N];
        let along = |t: f64| -> [f64; N] {
            std::array::from_fn(|j| centroid[j] + t * (worst_point[j] - centroid[j]))
        };

        let reflected = along(-1.0);
        let f_reflected = f(&reflected);
        if f_reflected < best {
            let expanded = along(-2.0);
            let f_expanded = f(&expanded);
            if f_expanded < f_reflected {
                points[N] = expanded;
                values[N] = f_expanded;
            } else {
                points[N] = reflected;
                values[N] = f_reflected;
            }
        } else if f_reflected < values[N - 1] {
            points[N] = reflected;
            values[N] = f_reflected;
        } else {
            let contracted = if f_reflected < worst { along(-0.5) } else { along(0.5) };
            let f_contracted = f(&contracted);
            if f_contracted < f_reflected.min(worst) {
                points[N] = contracted;
                values[N] = f_contracted;
            } else {
                let anchor = points[0];
                for i in 1..=N {
                    let vertex = points[i];
                    points[i] = std::array::from_fn(|j| anchor[j] + 0.5 * (vertex[j] - anchor[j]));
                    values[i] = f(&points[i]);
                }
            }
        }
    }

    let best = (0..=N)
        .min_by(|&a, &b| values[a].total_cmp(&values[b]))
        .unwrap_or(0);
    points[best]
}

// ── Entry point ────────────────────────────────────────────────────────────

/// Fit the dynamical model to one gene.
///
/// `data.u`/`data.s` are the smoothed abundances; the raw columns only
/// decide which cells carry weight. The random stream for `γ` candidates is
/// seeded with `seed`, so repeated fits are identical.
pub fn fit_dynamics(
    data: &GeneColumns<'_>,
    config: &KineticsConfig,
    seed: u64,
    cancel: &CancelToken,
) -> GeneFit {
    fit_dynamics_from(data, config, seed, None, cancel)
}

/// [`fit_dynamics`] starting from `start` instead of the extreme-quantile
/// initialization. Unusable start rates fall back to the initialization.
pub fn fit_dynamics_from(
    data: &GeneColumns<'_>,
    config: &KineticsConfig,
    seed: u64,
    start: Option<&WarmStart>,
    cancel: &CancelToken,
) -> GeneFit {
    let obs = Observations::new(data, config.weight_percentile);
    let needed = config.min_weighted_cells.max(2);
    if obs.n_weighted < needed {
        return GeneFit::Failed(FitFailure::TooFewCells { n: obs.n_weighted });
    }

    let resumed = start
        .filter(|s| s.is_usable())
        .and_then(|s| DynamicsState::resume(&obs, s, config));
    let mut state = match resumed {
        Some(state) => state,
        None => match DynamicsState::initialize(&obs, config) {
            Ok(state) => state,
            Err(failure) => return GeneFit::Failed(failure),
        },
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let tolerance = config.convergence_tolerance;
    let mut converged = false;
    while state.iteration < config.max_iterations {
        if cancel.is_cancelled() {
            return GeneFit::NotFit;
        }
        let before = state.loss;
        state.step(&obs, config, &mut rng);
        if stalled(before, state.loss, tolerance) {
            let stalled_at = state.loss;
            state.refine(&obs, config);
            converged = stalled(stalled_at, state.loss, tolerance);
        }
        state.iteration += 1;
        state.loss_history.push(state.loss);
        if !state.loss.is_finite() || !state.rates.is_finite() {
            return GeneFit::Failed(FitFailure::Diverged { iteration: state.iteration });
        }
        if converged {
            break;
        }
    }

    GeneFit::Fitted(finish(state, &obs, config, converged))
}

fn finish(
    state: DynamicsState,
    obs: &Observations<'_>,
    config: &KineticsConfig,
    converged: bool,
) -> KineticParameters {
    let DynamicsState { mut rates, assignment, loss, iteration, loss_history } = state;
    let Assignment { mut tau, states } = assignment;

    let mut latent_time: Vec<f64> = states
        .iter()
        .zip(&tau)
        .map(|(st, &t)| if st.is_on() { t } else { rates.t_switch + t })
        .collect();

    if let Some(t_max) = config.t_max {
        let latest = latent_time.iter().cloned().fold(0.0, f64::max);
        if latest > 0.0 {
            let m = t_max / latest;
            rates.alpha /= m;
            rates.beta /= m;
            rates.gamma /= m;
            rates.t_switch *= m;
            for t in latent_time.iter_mut().chain(tau.iter_mut()) {
                *t *= m;
            }
        }
    }

    let sigma2 = obs.total_variance();
    let likelihood = if sigma2 > 0.0 {
        (-loss / (2.0 * sigma2)).exp().clamp(0.0, 1.0)
    } else if loss <= f64::EPSILON {
        1.0
    } else {
        0.0
    };

    let steady_state = SteadyStateBounds {
        u_upper: rates.scaling * rates.alpha / rates.beta,
        s_upper: rates.alpha / rates.gamma,
        u_lower: 0.0,
        s_lower: 0.0,
    };

    KineticParameters {
        mode: FitMode::Dynamical,
        alpha: Some(rates.alpha),
        beta: rates.beta,
        gamma: rates.gamma,
        offset: 0.0,
        scaling: rates.scaling,
        likelihood,
        variance: loss,
        steady_state,
        dynamics: Some(DynamicsFit {
            switching_time: rates.t_switch,
            latent_time,
            tau,
            states,
            iterations: iteration,
            converged,
            loss_history,
        }),
    }
}

/// Noise-free `(u, s)` of a switching gene with `β = 1`, sampled at the
/// given latent times. `u` is multiplied by `scaling`.
#[cfg(test)]
pub(crate) fn simulate_switching(
    alpha: f64,
    gamma: f64,
    t_switch: f64,
    scaling: f64,
    times: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    let rates = Rates { alpha, beta: 1.0, gamma, t_switch, scaling };
    times
        .iter()
        .map(|&t| {
            let (u, s) = if t < t_switch {
                rates.predict(TranscriptionState::Induction, t)
            } else {
                rates.predict(TranscriptionState::Repression, t - t_switch)
            };
            (scaling * u, s)
        })
        .unzip()
}
