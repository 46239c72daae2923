//! Single-cell containers and the RNA velocity engine for velocyte.
//!
//! This crate provides:
//!
//! - **Containers** — [`AnnData`] with spliced/unspliced layers, [`SparseMatrix`]
//!   in COO format, fixed-size [`NeighborGraph`]s
//! - **Moments** — neighborhood-smoothed first and second moments
//! - **Kinetics** — per-gene steady-state and dynamical model fits
//! - **Velocity** — the masked cell × gene velocity matrix
//! - **Velocity graph** — cosine similarities between velocity and displacement
//! - **Embedding** — per-cell arrows and grid flow in a low-dimensional embedding
//!
//! The velocity modules are behind the `single-cell` feature (on by default).
//!
//! # Quick start
//!
//! ```
//! use velocyte_omics::{velocity, AnnData, MatrixData, SparseMatrix, VelocityConfig};
//!
//! let counts = MatrixData::Dense(vec![vec![1.0, 5.0], vec![2.0, 5.0], vec![3.0, 5.0]]);
//! let names = |p: &str| (0..3).map(|i| format!("{p}{i}")).collect::<Vec<_>>();
//! let mut adata = AnnData::from_layers(
//!     counts.clone(),
//!     counts,
//!     names("cell"),
//!     vec!["A".into(), "B".into()],
//! ).unwrap();
//!
//! let mut distances = SparseMatrix::new(3, 3);
//! distances.insert(0, 1, 1.0).unwrap();
//! distances.insert(1, 2, 1.0).unwrap();
//! distances.insert(2, 1, 1.0).unwrap();
//! adata.add_obsp("distances", distances).unwrap();
//!
//! let report = velocity(&mut adata, &VelocityConfig::default()).unwrap();
//! assert_eq!(report.velocity.gene_mask(), vec![true, false]);
//! ```

pub mod neighbors;
pub mod single_cell;
pub mod sparse;
#[cfg(feature = "single-cell")]
pub mod sc_dynamics;
#[cfg(feature = "single-cell")]
pub mod sc_embedding;
#[cfg(feature = "single-cell")]
pub mod sc_kinetics;
#[cfg(feature = "single-cell")]
pub mod sc_moments;
#[cfg(feature = "single-cell")]
pub mod sc_velocity;
#[cfg(feature = "single-cell")]
pub mod sc_velocity_graph;

pub use neighbors::NeighborGraph;
pub use single_cell::{AnnData, ColumnData, MatrixData};
pub use sparse::SparseMatrix;

#[cfg(feature = "single-cell")]
pub use sc_dynamics::{TimeAssignment, TranscriptionState, WarmStart};
#[cfg(feature = "single-cell")]
pub use sc_embedding::{
    project_velocity, velocity_embedding, velocity_grid, Baseline, EmbeddingConfig, GridConfig,
    GridFlow,
};
#[cfg(feature = "single-cell")]
pub use sc_kinetics::{
    fit_gene, fit_gene_from, fit_genes, fit_kinetics, fit_kinetics_with_modes, recover_dynamics,
    CancelToken, DynamicsFit, FitFailure, FitFailureKind, FitMode, FitSummary, GeneFit,
    GeneSelection, KineticParameters, KineticsConfig, KineticsInput, KineticsResult,
    SteadyStateBounds,
};
#[cfg(feature = "single-cell")]
pub use sc_moments::{compute_moments, moments, Moments, MomentsConfig, SecondMoments};
#[cfg(feature = "single-cell")]
pub use sc_velocity::{
    aggregate_velocity, velocity, velocity_with_cancel, GeneFilterConfig, VelocityConfig,
    VelocityMatrix, VelocityReport,
};
#[cfg(feature = "single-cell")]
pub use sc_velocity_graph::{
    build_velocity_graph, transition_matrix, velocity_graph, SimilarityTransform,
    TransitionConfig, TransitionMatrices, VelocityGraph, VelocityGraphConfig,
};
