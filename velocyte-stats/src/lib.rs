//! Statistical building blocks for velocyte.
//!
//! - **Descriptive statistics** — mean, variance, quantiles, masked variants
//! - **Regression** — least squares through the origin or with intercept,
//!   one-parameter projections
//! - **Correlation** — Pearson correlation, cosine similarity with an
//!   explicit "undefined" outcome

pub mod correlation;
pub mod descriptive;
pub mod regression;

pub use correlation::{cosine_similarity, dot, l2_norm, pearson};
pub use descriptive::{mean, percentile, quantile, std_dev, variance};
pub use regression::{fit_through_origin, fit_with_intercept, projection_coefficient, LinearFit};
