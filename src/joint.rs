//! Joint divergence over two category groups and its interaction residual.
//!
//! For a pair of groups \(A \times B\) (e.g. race × income), each unit's joint divergence is
//! computed in reduced form:
//!
//! \[
//! D^{AB}_i = \sum_{j,k} p_{jk|i} \log_2 \frac{p_{jk|i}}{p_{jk}}
//! \]
//!
//! and compared with the one-way divergences of the marginals:
//! \(\mathrm{residual}_i = D^{AB}_i - D^A_i - D^B_i\). The residual is signed: negative when the
//! two dimensions overlap (sub-additive), positive when they interact (super-additive).
//!
//! The marginals are summed from the cross-tab itself, so they describe exactly the same
//! population as the joint cells.
//!
//! [`factored_joint_divergence`] evaluates the four-factor expansion
//!
//! \[
//! \log_2 \frac{p_{j|i}}{p_j} + \log_2 \frac{p_{k|i}}{p_k} + \log_2 \frac{p_j p_k}{p_{jk}}
//! + \log_2 \frac{p_{jk|i}}{p_{j|i} p_{k|i}}
//! \]
//!
//! term by term. It is algebraically equal to the reduced form and is only used to verify it.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::{Aggregator, GroupTotals};
use crate::diagnostics::{Diagnostic, Diagnostics, Level};
use crate::divergence::{CompensatedSum, DivergenceEngine, DivergenceTable};
use crate::geography::ResolvedGeography;
use crate::mutual_info::weighted_mean;
use crate::probability::{ProbabilityModel, UnitDistribution};
use crate::table::{check_cell, violation};
use crate::{Result, SegregationError, ViolationReason};

/// An ordered pair of category groups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupPair {
    pub a: String,
    pub b: String,
}

impl GroupPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }

    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            a: self.b.clone(),
            b: self.a.clone(),
        }
    }
}

impl fmt::Display for GroupPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} × {}", self.a, self.b)
    }
}

/// A cell of the cross-tab: category `a` of the first group and `b` of the second.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointCategory {
    pub a: String,
    pub b: String,
}

impl JointCategory {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }
}

impl fmt::Display for JointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} × {}", self.a, self.b)
    }
}

/// One cross-tabulated count.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointCountRecord {
    pub unit_id: String,
    pub category_a: String,
    pub category_b: String,
    pub count: f64,
    pub margin_of_error: Option<f64>,
}

impl JointCountRecord {
    pub fn new(
        unit_id: impl Into<String>,
        category_a: impl Into<String>,
        category_b: impl Into<String>,
        count: f64,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            category_a: category_a.into(),
            category_b: category_b.into(),
            count,
            margin_of_error: None,
        }
    }

    #[must_use]
    pub fn with_margin_of_error(mut self, moe: f64) -> Self {
        self.margin_of_error = Some(moe);
        self
    }
}

/// Cross-tabulated counts for one pair of groups.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointCountTable {
    pub pair: GroupPair,
    pub records: Vec<JointCountRecord>,
}

impl JointCountTable {
    #[must_use]
    pub fn new(pair: GroupPair, records: Vec<JointCountRecord>) -> Self {
        Self { pair, records }
    }

    /// The same counts with the two groups exchanged.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            pair: self.pair.swapped(),
            records: self
                .records
                .iter()
                .map(|r| JointCountRecord {
                    unit_id: r.unit_id.clone(),
                    category_a: r.category_b.clone(),
                    category_b: r.category_a.clone(),
                    count: r.count,
                    margin_of_error: r.margin_of_error,
                })
                .collect(),
        }
    }

    /// # Errors
    ///
    /// [`SegregationError::Invalid`] if both sides name the same group; otherwise a schema
    /// violation for empty identifiers, bad counts, or a repeated (unit, a, b) key.
    pub fn validate(&self) -> Result<()> {
        if self.pair.a.is_empty() || self.pair.b.is_empty() {
            return Err(SegregationError::Invalid("joint pair names an empty category group"));
        }
        if self.pair.a == self.pair.b {
            return Err(SegregationError::Invalid(
                "joint pair names the same category group twice",
            ));
        }
        let group = self.pair.to_string();
        let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();
        for (index, r) in self.records.iter().enumerate() {
            let category = format!("{} × {}", r.category_a, r.category_b);
            if r.category_a.is_empty() || r.category_b.is_empty() {
                return Err(violation(
                    index,
                    &r.unit_id,
                    &group,
                    &category,
                    ViolationReason::EmptyIdentifier,
                ));
            }
            check_cell(index, &r.unit_id, &group, &category, r.count)?;
            if !seen.insert((
                r.unit_id.as_str(),
                r.category_a.as_str(),
                r.category_b.as_str(),
            )) {
                return Err(violation(
                    index,
                    &r.unit_id,
                    &group,
                    &category,
                    ViolationReason::DuplicateKey,
                ));
            }
        }
        Ok(())
    }
}

/// Joint divergence of one unit and its decomposition.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointDivergenceEntry {
    pub unit_id: String,
    pub region_id: String,
    pub group_pair: GroupPair,
    pub dkl_joint: f64,
    pub dkl_marginal_a: f64,
    pub dkl_marginal_b: f64,
    /// `dkl_joint - dkl_marginal_a - dkl_marginal_b`. Signed.
    pub residual: f64,
}

/// Population-weighted means of [`JointDivergenceEntry`] fields over one region.
///
/// `dkl_joint` here is the joint mutual information \(I(\text{unit}; A \times B)\).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointRegionSummary {
    pub region_id: String,
    pub group_pair: GroupPair,
    pub dkl_joint: f64,
    pub dkl_marginal_a: f64,
    pub dkl_marginal_b: f64,
    pub residual: f64,
    pub units: usize,
    pub population: f64,
}

/// Everything the joint engine produces for one pair.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointDivergenceTable {
    pub group_pair: GroupPair,
    /// Sorted by unit id.
    pub entries: Vec<JointDivergenceEntry>,
    /// Sorted by region id.
    pub regions: Vec<JointRegionSummary>,
}

impl JointDivergenceTable {
    #[must_use]
    pub fn entry(&self, unit_id: &str) -> Option<&JointDivergenceEntry> {
        self.entries
            .binary_search_by(|e| e.unit_id.as_str().cmp(unit_id))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// `log2(num / den)`, or 0 when either side is non-positive or the result is not finite.
fn log2_factor(num: f64, den: f64) -> f64 {
    if num <= 0.0 || den <= 0.0 {
        return 0.0;
    }
    let v = (num / den).ln() / logp::LN_2;
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Joint divergence of one unit via the four-factor expansion.
///
/// `a` and `b` must be the same unit's marginal distributions. Each factor is clamped on its own.
#[must_use]
pub fn factored_joint_divergence(
    joint: &UnitDistribution<JointCategory>,
    a: &UnitDistribution<String>,
    b: &UnitDistribution<String>,
) -> f64 {
    let a_by: BTreeMap<&str, (f64, f64)> = a
        .entries
        .iter()
        .map(|e| (e.category.as_str(), (e.p_local, e.p_ref)))
        .collect();
    let b_by: BTreeMap<&str, (f64, f64)> = b
        .entries
        .iter()
        .map(|e| (e.category.as_str(), (e.p_local, e.p_ref)))
        .collect();

    let mut sum = CompensatedSum::default();
    for e in &joint.entries {
        let p_jk_i = e.p_local;
        if p_jk_i <= 0.0 {
            continue;
        }
        let (p_j_i, p_j) = a_by.get(e.category.a.as_str()).copied().unwrap_or((0.0, 0.0));
        let (p_k_i, p_k) = b_by.get(e.category.b.as_str()).copied().unwrap_or((0.0, 0.0));
        let log = log2_factor(p_j_i, p_j)
            + log2_factor(p_k_i, p_k)
            + log2_factor(p_j * p_k, e.p_ref)
            + log2_factor(p_jk_i, p_j_i * p_k_i);
        sum.add(p_jk_i * log);
    }
    sum.value()
}

/// Computes [`JointDivergenceTable`]s against one resolved geography.
#[derive(Debug, Clone, Copy)]
pub struct JointDivergenceEngine<'g> {
    geo: &'g ResolvedGeography,
    verify_tolerance: Option<f64>,
}

impl<'g> JointDivergenceEngine<'g> {
    #[must_use]
    pub fn new(geo: &'g ResolvedGeography) -> Self {
        Self {
            geo,
            verify_tolerance: None,
        }
    }

    /// Also evaluate the factored form per unit and report disagreements beyond `tol`.
    #[must_use]
    pub fn with_verification(mut self, tol: f64) -> Self {
        self.verify_tolerance = Some(tol);
        self
    }

    /// # Errors
    ///
    /// Whatever [`JointCountTable::validate`] rejects, and [`SegregationError::Invalid`] for a
    /// unit outside the geography.
    pub fn divergence(
        &self,
        table: &JointCountTable,
        diags: &mut Diagnostics,
    ) -> Result<JointDivergenceTable> {
        table.validate()?;
        let pair = &table.pair;
        let label = pair.to_string();

        let mut cells: Vec<(String, JointCategory, f64)> = table
            .records
            .iter()
            .map(|r| {
                (
                    r.unit_id.clone(),
                    JointCategory::new(r.category_a.as_str(), r.category_b.as_str()),
                    r.count,
                )
            })
            .collect();
        cells.sort_by(|x, y| {
            x.0.cmp(&y.0)
                .then_with(|| x.1.cmp(&y.1))
                .then_with(|| x.2.total_cmp(&y.2))
        });
        let cells_a: Vec<(String, String, f64)> = cells
            .iter()
            .map(|(u, k, c)| (u.clone(), k.a.clone(), *c))
            .collect();
        let cells_b: Vec<(String, String, f64)> = cells
            .iter()
            .map(|(u, k, c)| (u.clone(), k.b.clone(), *c))
            .collect();

        let aggregator = Aggregator::new(self.geo);
        let joint_totals = aggregator.aggregate_cells(&label, &[], cells)?;
        let a_totals = aggregator.aggregate_cells(&pair.a, &[], cells_a)?;
        let b_totals = aggregator.aggregate_cells(&pair.b, &[], cells_b)?;

        let joint_probs = ProbabilityModel::derive(&joint_totals, self.geo, diags);
        let joint_div = DivergenceEngine::divergence(&joint_probs, diags);

        // Marginals are sums of the joint cells: their zero totals are exactly the joint ones,
        // already reported under the pair label. Their events would repeat the one-way groups'.
        let mut marginal_diags = Diagnostics::new();
        let a_probs = ProbabilityModel::derive(&a_totals, self.geo, &mut marginal_diags);
        let b_probs = ProbabilityModel::derive(&b_totals, self.geo, &mut marginal_diags);
        let a_div = DivergenceEngine::divergence(&a_probs, &mut marginal_diags);
        let b_div = DivergenceEngine::divergence(&b_probs, &mut marginal_diags);

        let entries = self.entries(pair, &joint_div, &a_div, &b_div);

        if let Some(tol) = self.verify_tolerance {
            for (joint, (a, b)) in joint_probs
                .units
                .iter()
                .zip(a_probs.units.iter().zip(&b_probs.units))
            {
                let factored = factored_joint_divergence(joint, a, b);
                let reduced = joint_div.entry(&joint.unit_id).map_or(0.0, |e| e.dkl_unit);
                if (factored - reduced).abs() > tol {
                    diags.push(Diagnostic::FactoredMismatch {
                        category_group: label.clone(),
                        unit_id: joint.unit_id.clone(),
                        reduced,
                        factored,
                    });
                }
            }
        }

        let regions = self.summarize(pair, &entries, &joint_totals);
        Ok(JointDivergenceTable {
            group_pair: pair.clone(),
            entries,
            regions,
        })
    }

    fn entries(
        &self,
        pair: &GroupPair,
        joint: &DivergenceTable<JointCategory>,
        a: &DivergenceTable<String>,
        b: &DivergenceTable<String>,
    ) -> Vec<JointDivergenceEntry> {
        joint
            .entries
            .iter()
            .map(|e| {
                let dkl_marginal_a = a.entry(&e.unit_id).map_or(0.0, |m| m.dkl_unit);
                let dkl_marginal_b = b.entry(&e.unit_id).map_or(0.0, |m| m.dkl_unit);
                JointDivergenceEntry {
                    unit_id: e.unit_id.clone(),
                    region_id: e.region_id.clone(),
                    group_pair: pair.clone(),
                    dkl_joint: e.dkl_unit,
                    dkl_marginal_a,
                    dkl_marginal_b,
                    residual: e.dkl_unit - dkl_marginal_a - dkl_marginal_b,
                }
            })
            .collect()
    }

    fn summarize(
        &self,
        pair: &GroupPair,
        entries: &[JointDivergenceEntry],
        totals: &GroupTotals<JointCategory>,
    ) -> Vec<JointRegionSummary> {
        let by_unit: BTreeMap<&str, &JointDivergenceEntry> =
            entries.iter().map(|e| (e.unit_id.as_str(), e)).collect();

        self.geo
            .regions()
            .map(|region| {
                let id = region.region_id.as_str();
                let population = totals.get(Level::Region, id, None);
                let members: Vec<(f64, &JointDivergenceEntry)> = self
                    .geo
                    .units_in_region(id)
                    .iter()
                    .filter_map(|u| by_unit.get(u.as_str()).map(|e| (u, *e)))
                    .map(|(u, e)| {
                        let w = if population > 0.0 {
                            totals.get(Level::Unit, u, None) / population
                        } else {
                            0.0
                        };
                        (w, e)
                    })
                    .collect();
                let mean = |f: fn(&JointDivergenceEntry) -> f64| {
                    weighted_mean(members.iter().map(|(w, e)| (*w, f(e))))
                };
                JointRegionSummary {
                    region_id: region.region_id.clone(),
                    group_pair: pair.clone(),
                    dkl_joint: mean(|e| e.dkl_joint),
                    dkl_marginal_a: mean(|e| e.dkl_marginal_a),
                    dkl_marginal_b: mean(|e| e.dkl_marginal_b),
                    residual: mean(|e| e.residual),
                    units: members.len(),
                    population,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geography::{GeographyIndex, GeographyLink};
    use proptest::prelude::*;

    fn resolve(table: &JointCountTable, links: Vec<GeographyLink>) -> ResolvedGeography {
        let units: BTreeSet<&str> = table.records.iter().map(|r| r.unit_id.as_str()).collect();
        GeographyIndex::from_links(links)
            .unwrap()
            .resolve(units, &mut Diagnostics::new())
    }

    fn race_income(records: Vec<JointCountRecord>) -> JointCountTable {
        JointCountTable::new(GroupPair::new("race", "income"), records)
    }

    fn two_units() -> Vec<GeographyLink> {
        vec![GeographyLink::new("A", "c", "R"), GeographyLink::new("B", "c", "R")]
    }

    #[test]
    fn perfectly_aligned_dimensions_are_sub_additive() {
        // race and income carry the same information: residual = 1 - 1 - 1.
        let table = race_income(vec![
            JointCountRecord::new("A", "x", "low", 10.0),
            JointCountRecord::new("B", "y", "high", 10.0),
        ]);
        let geo = resolve(&table, two_units());
        let mut d = Diagnostics::new();
        let out = JointDivergenceEngine::new(&geo)
            .with_verification(1e-9)
            .divergence(&table, &mut d)
            .unwrap();
        assert_eq!(d.counts.factored_mismatch, 0);
        let a = out.entry("A").unwrap();
        assert!((a.dkl_joint - 1.0).abs() < 1e-12);
        assert!((a.dkl_marginal_a - 1.0).abs() < 1e-12);
        assert!((a.dkl_marginal_b - 1.0).abs() < 1e-12);
        assert!((a.residual + 1.0).abs() < 1e-12);
        assert_eq!(a.group_pair.to_string(), "race × income");

        assert_eq!(out.regions.len(), 1);
        let r = &out.regions[0];
        assert_eq!(r.units, 2);
        assert_eq!(r.population, 20.0);
        assert!((r.dkl_joint - 1.0).abs() < 1e-12);
        assert!((r.residual + 1.0).abs() < 1e-12);
    }

    #[test]
    fn same_group_twice_is_invalid() {
        let table = JointCountTable::new(GroupPair::new("race", "race"), vec![]);
        assert!(matches!(table.validate(), Err(SegregationError::Invalid(_))));
    }

    #[test]
    fn duplicate_cross_tab_cell_is_rejected() {
        let table = race_income(vec![
            JointCountRecord::new("A", "x", "low", 1.0),
            JointCountRecord::new("A", "x", "low", 2.0),
        ]);
        match table.validate() {
            Err(SegregationError::SchemaViolation(v)) => {
                assert_eq!(v.index, 1);
                assert_eq!(v.reason, ViolationReason::DuplicateKey);
                assert_eq!(v.category_group, "race × income");
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn negative_joint_count_is_rejected() {
        let table = race_income(vec![JointCountRecord::new("A", "x", "low", -3.0)]);
        assert!(matches!(
            table.validate(),
            Err(SegregationError::SchemaViolation(_))
        ));
    }

    #[test]
    fn zero_cells_do_not_break_factored_form() {
        let table = race_income(vec![
            JointCountRecord::new("A", "x", "low", 5.0),
            JointCountRecord::new("A", "x", "high", 0.0),
            JointCountRecord::new("A", "y", "high", 3.0),
            JointCountRecord::new("B", "y", "low", 4.0),
            JointCountRecord::new("B", "x", "high", 2.0),
        ]);
        let geo = resolve(&table, two_units());
        let mut d = Diagnostics::new();
        let out = JointDivergenceEngine::new(&geo)
            .with_verification(1e-9)
            .divergence(&table, &mut d)
            .unwrap();
        assert_eq!(d.counts.factored_mismatch, 0);
        assert_eq!(d.counts.clamped_log_terms, 0);
        for e in &out.entries {
            assert!(e.dkl_joint.is_finite());
            assert!(e.residual.is_finite());
        }
    }

    #[test]
    fn zero_total_unit_is_reported_under_the_pair_only() {
        let table = race_income(vec![
            JointCountRecord::new("A", "x", "low", 5.0),
            JointCountRecord::new("B", "y", "high", 0.0),
        ]);
        let geo = resolve(&table, two_units());
        let mut d = Diagnostics::new();
        JointDivergenceEngine::new(&geo).divergence(&table, &mut d).unwrap();
        assert_eq!(d.counts.degenerate_distribution, 1);
        match &d.events[..] {
            [Diagnostic::DegenerateDistribution {
                level: Level::Unit,
                id,
                category_group,
            }] => {
                assert_eq!(id, "B");
                assert_eq!(category_group, "race × income");
            }
            other => panic!("unexpected diagnostics {other:?}"),
        }
    }

    fn grid(counts: &[f64]) -> JointCountTable {
        // 3 units x (2 race x 2 income)
        let races = ["x", "y"];
        let incomes = ["low", "high"];
        let records = counts
            .iter()
            .enumerate()
            .map(|(i, c)| {
                JointCountRecord::new(
                    format!("u{}", i / 4),
                    races[(i / 2) % 2],
                    incomes[i % 2],
                    *c,
                )
            })
            .collect();
        race_income(records)
    }

    fn grid_links() -> Vec<GeographyLink> {
        vec![
            GeographyLink::new("u0", "c1", "R"),
            GeographyLink::new("u1", "c1", "R"),
            GeographyLink::new("u2", "c2", "R"),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn swapping_groups_keeps_joint_and_residual(
            counts in prop::collection::vec(0.0f64..1e4, 12),
        ) {
            let table = grid(&counts);
            let geo = resolve(&table, grid_links());
            let mut d = Diagnostics::new();
            let engine = JointDivergenceEngine::new(&geo);
            let ab = engine.divergence(&table, &mut d).unwrap();
            let ba = engine.divergence(&table.swapped(), &mut d).unwrap();
            for (x, y) in ab.entries.iter().zip(&ba.entries) {
                prop_assert_eq!(&x.unit_id, &y.unit_id);
                prop_assert!((x.dkl_joint - y.dkl_joint).abs() < 1e-12);
                prop_assert!((x.residual - y.residual).abs() < 1e-12);
                prop_assert!((x.dkl_marginal_a - y.dkl_marginal_b).abs() < 1e-12);
            }
        }

        #[test]
        fn reduced_and_factored_forms_agree_on_positive_counts(
            counts in prop::collection::vec(1.0f64..1e4, 12),
        ) {
            let table = grid(&counts);
            let geo = resolve(&table, grid_links());
            let mut d = Diagnostics::new();
            let out = JointDivergenceEngine::new(&geo)
                .with_verification(1e-10)
                .divergence(&table, &mut d)
                .unwrap();
            prop_assert_eq!(d.counts.factored_mismatch, 0);
            for e in &out.entries {
                // Chain rule: the joint divergence dominates either marginal.
                prop_assert!(e.dkl_joint >= e.dkl_marginal_a - 1e-12);
                prop_assert!(e.dkl_joint >= e.dkl_marginal_b - 1e-12);
                prop_assert_eq!(e.residual, e.dkl_joint - e.dkl_marginal_a - e.dkl_marginal_b);
            }
        }
    }
}
