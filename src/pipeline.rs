//! Batch entry point: one immutable input snapshot in, every table out.
//!
//! Stages, each completing before the next starts:
//!
//! 1. validate the [`CountTable`] (and, with a taxonomy, its categories);
//! 2. resolve every unit's place in the geography;
//! 3. aggregate every category group;
//! 4. fan out per group (probability → divergence → MI), then per joint pair.
//!
//! Stage 4 work items are independent. With [`EngineConfig::threads`] above 1 they are split
//! across scoped threads; each worker owns its outputs and diagnostics, and results are merged
//! in group order, so the output does not depend on the thread count.

use std::num::NonZeroUsize;
use std::thread;

use crate::aggregate::{aggregate, check_reported_totals, GroupTotals};
use crate::diagnostics::Diagnostics;
use crate::divergence::{CategoryDivergence, DivergenceEngine, DivergenceEntry, DivergenceTable};
use crate::geography::{GeographyIndex, ResolvedGeography};
use crate::joint::{
    JointCountTable, JointDivergenceEngine, JointDivergenceEntry, JointDivergenceTable,
    JointRegionSummary,
};
use crate::mutual_info::{mutual_information, RegionMutualInformation};
use crate::probability::ProbabilityModel;
use crate::table::CountTable;
use crate::taxonomy::CategoryTaxonomy;
use crate::{Result, SegregationError};

/// Run configuration. Nothing is read from the environment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Worker threads for the per-group fan-out.
    pub threads: NonZeroUsize,
    /// Slack allowed when comparing a category count with a reported group total.
    pub consistency_tolerance: f64,
    /// When set, records must use its groups and canonical categories, and each group's
    /// declared categories are listed even where no unit reports them.
    pub taxonomy: Option<CategoryTaxonomy>,
    /// When set, every joint divergence is recomputed in factored form and compared.
    pub verify_tolerance: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: NonZeroUsize::MIN,
            consistency_tolerance: 1e-9,
            taxonomy: None,
            verify_tolerance: None,
        }
    }
}

impl EngineConfig {
    /// Default configuration using the machine's available parallelism.
    #[must_use]
    pub fn parallel() -> Self {
        let threads = thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
        Self {
            threads,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = NonZeroUsize::new(threads).unwrap_or(NonZeroUsize::MIN);
        self
    }

    #[must_use]
    pub fn with_taxonomy(mut self, taxonomy: CategoryTaxonomy) -> Self {
        self.taxonomy = Some(taxonomy);
        self
    }

    #[must_use]
    pub fn with_verification(mut self, tol: f64) -> Self {
        self.verify_tolerance = Some(tol);
        self
    }

    /// # Errors
    ///
    /// [`SegregationError::Invalid`] for a negative or non-finite tolerance.
    pub fn validate(&self) -> Result<()> {
        if !self.consistency_tolerance.is_finite() || self.consistency_tolerance < 0.0 {
            return Err(SegregationError::Invalid(
                "consistency_tolerance must be finite and non-negative",
            ));
        }
        if let Some(tol) = self.verify_tolerance {
            if !tol.is_finite() || tol <= 0.0 {
                return Err(SegregationError::Invalid(
                    "verify_tolerance must be finite and positive",
                ));
            }
        }
        Ok(())
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunOutput {
    /// Grouped by category group, then sorted by unit id.
    pub divergence: Vec<DivergenceEntry<String>>,
    /// Grouped by category group, then sorted by (region, category).
    pub category_divergence: Vec<CategoryDivergence<String>>,
    /// One row per (group, region); every region appears for every group.
    pub mutual_information: Vec<RegionMutualInformation>,
    /// Joint tables in input order, each sorted by unit id.
    pub joint: Vec<JointDivergenceEntry>,
    pub joint_regions: Vec<JointRegionSummary>,
    pub diagnostics: Diagnostics,
}

impl RunOutput {
    #[must_use]
    pub fn region_mi(
        &self,
        category_group: &str,
        region_id: &str,
    ) -> Option<&RegionMutualInformation> {
        self.mutual_information
            .iter()
            .find(|m| m.category_group == category_group && m.region_id == region_id)
    }

    #[must_use]
    pub fn unit_divergence(
        &self,
        category_group: &str,
        unit_id: &str,
    ) -> Option<&DivergenceEntry<String>> {
        self.divergence
            .iter()
            .find(|e| e.category_group == category_group && e.unit_id == unit_id)
    }
}

/// [`run_with_config`] with [`EngineConfig::default`].
///
/// # Errors
///
/// See [`run_with_config`].
pub fn run(table: &CountTable, geography: &GeographyIndex) -> Result<RunOutput> {
    run_with_config(table, geography, &EngineConfig::default())
}

/// Run every stage over one input snapshot.
///
/// # Errors
///
/// - [`SegregationError::Invalid`] for a bad configuration or joint pair.
/// - [`SegregationError::SchemaViolation`] for the first record that breaks the input
///   contract.
///
/// Data-quality problems below that bar are returned in [`RunOutput::diagnostics`].
///
/// # Examples
///
/// ```rust
/// use dkl_segregation::{run_with_config, CountRecord, CountTable, EngineConfig, GeographyIndex};
///
/// // No crosswalk at all: every unit falls back to a singleton region.
/// let table = CountTable::new(vec![
///     CountRecord::new("u1", "race", "x", 3.0),
///     CountRecord::new("u1", "race", "y", 1.0),
/// ]);
/// let out = run_with_config(&table, &GeographyIndex::new(), &EngineConfig::default()).unwrap();
/// assert_eq!(out.diagnostics.counts.missing_geography, 1);
/// assert_eq!(out.mutual_information[0].mutual_information, 0.0);
/// ```
pub fn run_with_config(
    table: &CountTable,
    geography: &GeographyIndex,
    config: &EngineConfig,
) -> Result<RunOutput> {
    config.validate()?;
    table.validate()?;
    if let Some(taxonomy) = &config.taxonomy {
        taxonomy.validate_table(table)?;
    }

    let mut diagnostics = Diagnostics::new();
    let geo = geography.resolve(table.unit_ids(), &mut diagnostics);

    let totals = aggregate(table, &geo, config.taxonomy.as_ref())?;
    check_reported_totals(
        &totals,
        &table.reported_totals,
        &geo,
        config.consistency_tolerance,
        &mut diagnostics,
    );

    let mut out = RunOutput::default();

    let groups: Vec<&GroupTotals<String>> = totals.values().collect();
    for stage in fan_out(&groups, config.threads, |t| group_stage(t, &geo)) {
        out.divergence.extend(stage.divergence.entries);
        out.category_divergence.extend(stage.divergence.categories);
        out.mutual_information.extend(stage.mutual_information);
        diagnostics.merge(stage.diagnostics);
    }

    let joint_tables: Vec<&JointCountTable> = table.joint.iter().collect();
    for stage in fan_out(&joint_tables, config.threads, |j| {
        joint_stage(j, &geo, config.verify_tolerance)
    }) {
        let (joint, diags) = stage?;
        out.joint.extend(joint.entries);
        out.joint_regions.extend(joint.regions);
        diagnostics.merge(diags);
    }

    out.diagnostics = diagnostics;
    Ok(out)
}

struct GroupStage {
    divergence: DivergenceTable<String>,
    mutual_information: Vec<RegionMutualInformation>,
    diagnostics: Diagnostics,
}

fn group_stage(totals: &GroupTotals<String>, geo: &ResolvedGeography) -> GroupStage {
    let mut diagnostics = Diagnostics::new();
    let probs = ProbabilityModel::derive(totals, geo, &mut diagnostics);
    let divergence = DivergenceEngine::divergence(&probs, &mut diagnostics);
    let mutual_information = mutual_information(&divergence, totals, geo);
    GroupStage {
        divergence,
        mutual_information,
        diagnostics,
    }
}

fn joint_stage(
    table: &JointCountTable,
    geo: &ResolvedGeography,
    verify_tolerance: Option<f64>,
) -> Result<(JointDivergenceTable, Diagnostics)> {
    let mut diagnostics = Diagnostics::new();
    let mut engine = JointDivergenceEngine::new(geo);
    if let Some(tol) = verify_tolerance {
        engine = engine.with_verification(tol);
    }
    let joint = engine.divergence(table, &mut diagnostics)?;
    Ok((joint, diagnostics))
}

/// Map `f` over `items` on up to `threads` scoped workers, preserving item order.
fn fan_out<T, R, F>(items: &[T], threads: NonZeroUsize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let threads = threads.get().min(items.len());
    if threads <= 1 {
        return items.iter().map(&f).collect();
    }
    let chunk = items.len().div_ceil(threads);
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .map(|c| s.spawn(move || c.iter().map(f).collect::<Vec<R>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(part) => part,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
