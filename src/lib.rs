//! `dkl_segregation`: hierarchical KL-divergence segregation metrics.
//!
//! Given long-format demographic counts keyed by (geographic unit, category) and a mapping of
//! units to their county and metropolitan region, this crate measures how far each unit's
//! composition diverges from its region's, and rolls those divergences up into a
//! population-weighted mutual-information score per region.
//!
//! ## Quantities
//!
//! For a fixed category group, unit \(i\), category \(j\) and region \(R \ni i\):
//!
//! \[
//! p_{n_i} = \frac{t_i}{T_R},\quad p_{y_j} = \frac{C_{R,j}}{T_R},\quad
//! p_{y_j|n_i} = \frac{c_{i,j}}{t_i},\quad p_{n_i|y_j} = \frac{c_{i,j}}{C_{R,j}}
//! \]
//!
//! - One-way divergence (bits): \(D_i = \sum_j p_{y_j|n_i} \log_2 (p_{y_j|n_i} / p_{y_j})\).
//! - Per-category divergence: \(D_j = \sum_i p_{n_i|y_j} \log_2 (p_{n_i|y_j} / p_{n_i})\).
//! - Mutual information: \(\mathrm{MI}(R) = \sum_{i \in R} p_{n_i} D_i\).
//!
//! The joint form over two groups (e.g. race × income) and its residual interaction term live
//! in [`joint`].
//!
//! ## Pipeline
//!
//! [`run`] executes the stages in order: validate the [`CountTable`], resolve geography
//! ([`geography`]), materialize aggregates ([`aggregate`]), then fan out per category group
//! through [`probability`], [`divergence`] and [`mutual_info`]. Recoverable data problems are
//! reported in [`Diagnostics`] next to the results; contract violations by the caller are
//! [`SegregationError`]s.
//!
//! ## Quick example
//!
//! ```rust
//! use dkl_segregation::{run, CountRecord, CountTable, GeographyIndex, GeographyLink};
//!
//! let table = CountTable::new(vec![
//!     CountRecord::new("a", "income", "low", 80.0),
//!     CountRecord::new("a", "income", "high", 20.0),
//!     CountRecord::new("b", "income", "low", 20.0),
//!     CountRecord::new("b", "income", "high", 80.0),
//! ]);
//! let geo = GeographyIndex::from_links([
//!     GeographyLink::new("a", "c1", "metro"),
//!     GeographyLink::new("b", "c1", "metro"),
//! ])
//! .unwrap();
//!
//! let out = run(&table, &geo).unwrap();
//! let mi = &out.mutual_information[0];
//! assert_eq!(mi.region_id, "metro");
//! assert!((mi.mutual_information - 0.278_071_905_112_638).abs() < 1e-9);
//! ```

#![forbid(unsafe_code)]

use thiserror::Error;

pub mod aggregate;
pub mod diagnostics;
pub mod divergence;
pub mod geography;
pub mod joint;
pub mod mutual_info;
pub mod pipeline;
pub mod probability;
pub mod table;
pub mod taxonomy;

pub use aggregate::{aggregate, Aggregator, GroupTotals, LevelCounts};
pub use diagnostics::{Diagnostic, DiagnosticCounts, Diagnostics, InconsistencyKind, Level};
pub use divergence::{
    CategoryDivergence, DivergenceEngine, DivergenceEntry, DivergenceTable, DivergenceTerm,
};
pub use geography::{GeographyIndex, GeographyLink, Placement, RegionInfo, ResolvedGeography};
pub use joint::{
    factored_joint_divergence, GroupPair, JointCategory, JointCountRecord, JointCountTable,
    JointDivergenceEngine, JointDivergenceEntry, JointDivergenceTable, JointRegionSummary,
};
pub use mutual_info::{mutual_information, RegionMutualInformation};
pub use pipeline::{run, run_with_config, EngineConfig, RunOutput};
pub use probability::{ProbabilityEntry, ProbabilityModel, ProbabilityTable, UnitDistribution};
pub use table::{CountRecord, CountTable, ReportedTotal};
pub use taxonomy::{CategoryTaxonomy, GroupTaxonomy, RawRule};

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViolationReason {
    #[error("negative count {0}")]
    NegativeCount(f64),

    #[error("non-finite count {0}")]
    NonFiniteCount(f64),

    #[error("duplicate key")]
    DuplicateKey,

    #[error("empty identifier")]
    EmptyIdentifier,

    #[error("unknown category group")]
    UnknownCategoryGroup,

    #[error("unknown category")]
    UnknownCategory,

    #[error("signed combination produced a negative count {0}")]
    NegativeCombinedCount(f64),
}

/// A record that breaks the input contract, named by its position and key.
#[derive(Debug, Clone, PartialEq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("record {index} ({unit_id} / {category_group} / {category}): {reason}")]
pub struct SchemaViolation {
    /// Position in the input the record came from.
    pub index: usize,
    pub unit_id: String,
    pub category_group: String,
    pub category: String,
    pub reason: ViolationReason,
}

/// Errors that reject a run.
#[derive(Debug, Error)]
pub enum SegregationError {
    #[error("schema violation: {0}")]
    SchemaViolation(#[from] SchemaViolation),

    #[error("invalid input: {0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Logp(#[from] logp::Error),
}

pub type Result<T> = core::result::Result<T, SegregationError>;

/// A category label usable as an aggregation key.
///
/// One-way groups key on `String`; the joint engine keys on [`JointCategory`].
pub trait CategoryKey: Ord + Clone + core::fmt::Debug + core::fmt::Display + Send + Sync {}

impl<T> CategoryKey for T where
    T: Ord + Clone + core::fmt::Debug + core::fmt::Display + Send + Sync
{
}
