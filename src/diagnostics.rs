//! Data-quality events raised while a run proceeds.
//!
//! Nothing in here aborts a run. Conditions the engine can recover from (a unit with no
//! geography link, a zero-total distribution, a log term that had to be clamped) are recorded
//! as [`Diagnostic`] events and tallied in [`DiagnosticCounts`], and the numeric results are
//! returned alongside them.

use core::fmt;

/// Aggregation level in the unit → county → region hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Level {
    Unit,
    County,
    Region,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Unit => write!(f, "unit"),
            Level::County => write!(f, "county"),
            Level::Region => write!(f, "region"),
        }
    }
}

/// What made an aggregate inconsistent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InconsistencyKind {
    /// A category count is larger than the unit's own reported group total.
    ReportedTotalExceeded { count: f64, reported_total: f64 },
    /// The region has no mass in a category the unit reports (`p_yj = 0`, `p_yj_ni > 0`).
    ZeroReference { p_local: f64 },
    /// The unit carries no weight in the region but owns part of a category
    /// (`p_ni = 0`, `p_ni_yj > 0`).
    ZeroUnitWeight { p_unit_share_of_category: f64 },
}

/// A single recoverable data-quality event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Diagnostic {
    /// The unit has no usable region link; a fallback region was synthesized.
    MissingGeography {
        unit_id: String,
        fallback_county: String,
        fallback_region: String,
    },
    /// A fallback id was already taken by a crosswalk county or region, so the synthetic node
    /// was given `assigned` instead of `requested`.
    SyntheticIdCollision {
        level: Level,
        requested: String,
        assigned: String,
    },
    /// Unit and region aggregates disagree. The offending log term was clamped to 0.
    InconsistentAggregate {
        category_group: String,
        unit_id: String,
        region_id: String,
        category: String,
        kind: InconsistencyKind,
    },
    /// A unit or region whose group total is zero. Its probabilities and divergences are 0.
    DegenerateDistribution {
        level: Level,
        id: String,
        category_group: String,
    },
    /// The factored joint divergence differs from the reduced form beyond tolerance.
    FactoredMismatch {
        category_group: String,
        unit_id: String,
        reduced: f64,
        factored: f64,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingGeography {
                unit_id,
                fallback_region,
                ..
            } => write!(
                f,
                "unit {unit_id} has no region link; using singleton region {fallback_region}"
            ),
            Diagnostic::SyntheticIdCollision {
                level,
                requested,
                assigned,
            } => write!(
                f,
                "fallback {level} id {requested} is already in the crosswalk; renamed to {assigned}"
            ),
            Diagnostic::InconsistentAggregate {
                category_group,
                unit_id,
                region_id,
                category,
                kind,
            } => match kind {
                InconsistencyKind::ReportedTotalExceeded {
                    count,
                    reported_total,
                } => write!(
                    f,
                    "{category_group}/{unit_id}: category {category} count {count} exceeds reported total {reported_total}"
                ),
                InconsistencyKind::ZeroReference { p_local } => write!(
                    f,
                    "{category_group}/{unit_id}: category {category} has local share {p_local} but zero share in region {region_id}"
                ),
                InconsistencyKind::ZeroUnitWeight {
                    p_unit_share_of_category,
                } => write!(
                    f,
                    "{category_group}/{unit_id}: holds {p_unit_share_of_category} of {category} in region {region_id} with zero unit weight"
                ),
            },
            Diagnostic::DegenerateDistribution {
                level,
                id,
                category_group,
            } => write!(f, "{category_group}: {level} {id} has a zero group total"),
            Diagnostic::FactoredMismatch {
                category_group,
                unit_id,
                reduced,
                factored,
            } => write!(
                f,
                "{category_group}/{unit_id}: factored joint divergence {factored} != reduced {reduced}"
            ),
        }
    }
}

/// Event tallies. `clamped_log_terms` and `non_finite_terms` count numeric events that do
/// not each get their own [`Diagnostic`] entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnosticCounts {
    pub missing_geography: usize,
    pub synthetic_id_collision: usize,
    pub inconsistent_aggregate: usize,
    pub degenerate_distribution: usize,
    pub factored_mismatch: usize,
    /// Log terms forced to 0 because the reference probability was zero.
    pub clamped_log_terms: usize,
    /// Log terms that came out NaN or infinite and were replaced with 0.
    pub non_finite_terms: usize,
}

impl DiagnosticCounts {
    fn merge(&mut self, other: &DiagnosticCounts) {
        self.missing_geography += other.missing_geography;
        self.synthetic_id_collision += other.synthetic_id_collision;
        self.inconsistent_aggregate += other.inconsistent_aggregate;
        self.degenerate_distribution += other.degenerate_distribution;
        self.factored_mismatch += other.factored_mismatch;
        self.clamped_log_terms += other.clamped_log_terms;
        self.non_finite_terms += other.non_finite_terms;
    }
}

/// Collector for a run's diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostics {
    pub events: Vec<Diagnostic>,
    pub counts: DiagnosticCounts,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event and bump its counter.
    pub fn push(&mut self, event: Diagnostic) {
        match &event {
            Diagnostic::MissingGeography { .. } => self.counts.missing_geography += 1,
            Diagnostic::SyntheticIdCollision { .. } => self.counts.synthetic_id_collision += 1,
            Diagnostic::InconsistentAggregate { .. } => self.counts.inconsistent_aggregate += 1,
            Diagnostic::DegenerateDistribution { .. } => {
                self.counts.degenerate_distribution += 1;
            }
            Diagnostic::FactoredMismatch { .. } => self.counts.factored_mismatch += 1,
        }
        self.events.push(event);
    }

    pub(crate) fn note_clamped(&mut self) {
        self.counts.clamped_log_terms += 1;
    }

    pub(crate) fn note_non_finite(&mut self) {
        self.counts.non_finite_terms += 1;
    }

    /// Append another collector's events, preserving their order.
    pub fn merge(&mut self, other: Diagnostics) {
        self.counts.merge(&other.counts);
        self.events.extend(other.events);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.counts == DiagnosticCounts::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.events.iter()
    }
}
