//! One-way KL divergence, in bits.
//!
//! Two directions are computed from one [`ProbabilityTable`]:
//!
//! \[
//! D_i = \sum_j p_{y_j|n_i} \log_2 \frac{p_{y_j|n_i}}{p_{y_j}}
//! \qquad
//! D_j = \sum_{i \in R} p_{n_i|y_j} \log_2 \frac{p_{n_i|y_j}}{p_{n_i}}
//! \]
//!
//! Zero handling:
//! - a zero numerator makes the term 0 (\(0 \log 0 = 0\));
//! - a zero reference under a positive numerator clamps the log to 0, bumps
//!   [`DiagnosticCounts::clamped_log_terms`](crate::DiagnosticCounts) and records an
//!   [`InconsistencyKind`] naming the cell;
//! - a term that is still non-finite is replaced by 0 before it is summed.
//!
//! Terms are summed with Neumaier compensation, categories in sorted order and units in id
//! order.

use std::collections::BTreeMap;

use crate::diagnostics::{Diagnostic, Diagnostics, InconsistencyKind};
use crate::probability::ProbabilityTable;
use crate::CategoryKey;

/// Neumaier compensated accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompensatedSum {
    sum: f64,
    c: f64,
}

impl CompensatedSum {
    pub(crate) fn add(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.c += (self.sum - t) + x;
        } else {
            self.c += (x - t) + self.sum;
        }
        self.sum = t;
    }

    pub(crate) fn value(&self) -> f64 {
        self.sum + self.c
    }
}

impl FromIterator<f64> for CompensatedSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut s = Self::default();
        for x in iter {
            s.add(x);
        }
        s
    }
}

/// Outcome of evaluating one `p · log2(p / q)` term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum KlTerm {
    /// Finite contribution, possibly 0 because `p = 0`.
    Value(f64),
    /// `q = 0` under `p > 0`; contributes 0.
    Clamped,
    /// NaN or infinite; contributes 0.
    NonFinite,
}

impl KlTerm {
    pub(crate) fn eval(p: f64, q: f64) -> Self {
        if p <= 0.0 {
            return KlTerm::Value(0.0);
        }
        if q <= 0.0 {
            return KlTerm::Clamped;
        }
        let t = p * (p / q).ln() / logp::LN_2;
        if t.is_finite() {
            KlTerm::Value(t)
        } else {
            KlTerm::NonFinite
        }
    }

    /// The sanitized contribution.
    pub(crate) fn value(self) -> f64 {
        match self {
            KlTerm::Value(t) => t,
            KlTerm::Clamped | KlTerm::NonFinite => 0.0,
        }
    }
}

/// One category's contribution to a unit, in both directions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DivergenceTerm<K> {
    pub category: K,
    /// `p_yj_ni · log2(p_yj_ni / p_yj)`, a summand of `dkl_unit`.
    pub unit_term: f64,
    /// `p_ni_yj · log2(p_ni_yj / p_ni)`, a summand of the region's `dkl_category`.
    pub category_term: f64,
}

/// Divergence of one unit from its region.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DivergenceEntry<K> {
    pub unit_id: String,
    pub region_id: String,
    pub category_group: String,
    /// Bits. Non-negative up to rounding.
    pub dkl_unit: f64,
    pub terms: Vec<DivergenceTerm<K>>,
}

/// Divergence of one category's spatial distribution from the units' weights.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CategoryDivergence<K> {
    pub region_id: String,
    pub category_group: String,
    pub category: K,
    pub dkl_category: f64,
}

/// Both directions for one category group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DivergenceTable<K> {
    pub category_group: String,
    /// Sorted by unit id.
    pub entries: Vec<DivergenceEntry<K>>,
    /// Sorted by (region id, category).
    pub categories: Vec<CategoryDivergence<K>>,
}

impl<K> DivergenceTable<K> {
    #[must_use]
    pub fn entry(&self, unit_id: &str) -> Option<&DivergenceEntry<K>> {
        self.entries
            .binary_search_by(|e| e.unit_id.as_str().cmp(unit_id))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Category divergences of one region, in category order.
    pub fn region_categories<'a>(
        &'a self,
        region_id: &'a str,
    ) -> impl Iterator<Item = &'a CategoryDivergence<K>> + 'a {
        self.categories
            .iter()
            .filter(move |c| c.region_id == region_id)
    }
}

/// Computes [`DivergenceTable`]s. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct DivergenceEngine;

impl DivergenceEngine {
    /// Evaluate every unit and every (region, category) of one group.
    pub fn divergence<K: CategoryKey>(
        probs: &ProbabilityTable<K>,
        diags: &mut Diagnostics,
    ) -> DivergenceTable<K> {
        let group = probs.category_group.as_str();
        let mut entries = Vec::with_capacity(probs.units.len());
        let mut by_category: BTreeMap<(String, K), CompensatedSum> = BTreeMap::new();

        for unit in &probs.units {
            let mut dkl = CompensatedSum::default();
            let mut terms = Vec::with_capacity(unit.entries.len());
            for e in &unit.entries {
                let unit_term = KlTerm::eval(e.p_local, e.p_ref);
                let category_term = KlTerm::eval(e.p_unit_share_of_category, e.p_unit_in_region);

                let mut note = |term: KlTerm, kind: InconsistencyKind| match term {
                    KlTerm::Clamped => {
                        diags.note_clamped();
                        diags.push(Diagnostic::InconsistentAggregate {
                            category_group: group.to_string(),
                            unit_id: unit.unit_id.clone(),
                            region_id: unit.region_id.clone(),
                            category: e.category.to_string(),
                            kind,
                        });
                    }
                    KlTerm::NonFinite => diags.note_non_finite(),
                    KlTerm::Value(_) => {}
                };
                note(unit_term, InconsistencyKind::ZeroReference { p_local: e.p_local });
                note(
                    category_term,
                    InconsistencyKind::ZeroUnitWeight {
                        p_unit_share_of_category: e.p_unit_share_of_category,
                    },
                );

                let (unit_term, category_term) = (unit_term.value(), category_term.value());
                dkl.add(unit_term);
                by_category
                    .entry((unit.region_id.clone(), e.category.clone()))
                    .or_default()
                    .add(category_term);
                terms.push(DivergenceTerm {
                    category: e.category.clone(),
                    unit_term,
                    category_term,
                });
            }
            entries.push(DivergenceEntry {
                unit_id: unit.unit_id.clone(),
                region_id: unit.region_id.clone(),
                category_group: group.to_string(),
                dkl_unit: dkl.value(),
                terms,
            });
        }

        let categories = by_category
            .into_iter()
            .map(|((region_id, category), s)| CategoryDivergence {
                region_id,
                category_group: group.to_string(),
                category,
                dkl_category: s.value(),
            })
            .collect();

        DivergenceTable {
            category_group: group.to_string(),
            entries,
            categories,
        }
    }
}
