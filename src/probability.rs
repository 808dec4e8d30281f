//! Local and reference distributions derived from aggregate totals.
//!
//! For a fixed group, unit \(i\) in region \(R\) and category \(j\):
//!
//! ```text
//! p_ni    = unit_total(i)   / region_total(R)     weight of the unit in its region
//! p_yj    = region_count(R,j) / region_total(R)   reference marginal
//! p_yj_ni = unit_count(i,j) / unit_total(i)       local conditional
//! p_ni_yj = unit_count(i,j) / region_count(R,j)   unit's share of category j
//! ```
//!
//! A zero denominator yields 0 rather than NaN; zero-total units and regions are reported as
//! [`Diagnostic::DegenerateDistribution`].

use crate::aggregate::GroupTotals;
use crate::diagnostics::{Diagnostic, Diagnostics, Level};
use crate::geography::ResolvedGeography;
use crate::{CategoryKey, Result};

/// The four probabilities of one (unit, category) cell.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbabilityEntry<K> {
    pub category: K,
    /// `p_yj_ni`: share of the category within the unit.
    pub p_local: f64,
    /// `p_yj`: share of the category within the region.
    pub p_ref: f64,
    /// `p_ni`: the unit's share of the region's group total.
    pub p_unit_in_region: f64,
    /// `p_ni_yj`: the unit's share of the region's count in this category.
    pub p_unit_share_of_category: f64,
}

/// All entries of one unit, in category order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitDistribution<K> {
    pub unit_id: String,
    pub region_id: String,
    pub unit_total: f64,
    pub region_total: f64,
    pub entries: Vec<ProbabilityEntry<K>>,
}

impl<K> UnitDistribution<K> {
    /// `p_ni`, identical across this unit's entries.
    #[must_use]
    pub fn weight(&self) -> f64 {
        ratio(self.unit_total, self.region_total)
    }

    /// A zero-total unit has an all-zero local distribution by convention.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.unit_total <= 0.0
    }
}

/// Probability entries for one category group, sorted by unit id.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbabilityTable<K> {
    pub category_group: String,
    pub units: Vec<UnitDistribution<K>>,
}

impl<K> ProbabilityTable<K> {
    #[must_use]
    pub fn unit(&self, unit_id: &str) -> Option<&UnitDistribution<K>> {
        self.units
            .binary_search_by(|u| u.unit_id.as_str().cmp(unit_id))
            .ok()
            .map(|i| &self.units[i])
    }

    /// Check that every non-degenerate local distribution lies on the simplex.
    ///
    /// # Errors
    ///
    /// Propagates the first [`logp::Error`] from `logp::validate_simplex`.
    pub fn check_local_simplices(&self, tol: f64) -> Result<()> {
        for unit in self.units.iter().filter(|u| !u.is_degenerate()) {
            let p: Vec<f64> = unit.entries.iter().map(|e| e.p_local).collect();
            logp::validate_simplex(&p, tol)?;
        }
        Ok(())
    }
}

#[inline]
fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Derives [`ProbabilityTable`]s. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbabilityModel;

impl ProbabilityModel {
    /// Derive every unit's entries for one group.
    ///
    /// Each unit gets one entry per category of the group, including categories it has no
    /// count in.
    pub fn derive<K: CategoryKey>(
        totals: &GroupTotals<K>,
        geo: &ResolvedGeography,
        diags: &mut Diagnostics,
    ) -> ProbabilityTable<K> {
        for (region_id, node) in &totals.regions {
            if node.total <= 0.0 {
                diags.push(Diagnostic::DegenerateDistribution {
                    level: Level::Region,
                    id: region_id.clone(),
                    category_group: totals.category_group.clone(),
                });
            }
        }

        let mut units = Vec::with_capacity(totals.units.len());
        for (unit_id, node) in &totals.units {
            let Some(placement) = geo.placement(unit_id) else {
                continue;
            };
            let region = totals.regions.get(&placement.region_id);
            let region_total = region.map_or(0.0, |r| r.total);

            if node.total <= 0.0 {
                diags.push(Diagnostic::DegenerateDistribution {
                    level: Level::Unit,
                    id: unit_id.clone(),
                    category_group: totals.category_group.clone(),
                });
            }

            let p_ni = ratio(node.total, region_total);
            let entries = totals
                .categories
                .iter()
                .map(|k| {
                    let unit_count = node.count(k);
                    let region_count = region.map_or(0.0, |r| r.count(k));
                    ProbabilityEntry {
                        category: k.clone(),
                        p_local: ratio(unit_count, node.total),
                        p_ref: ratio(region_count, region_total),
                        p_unit_in_region: p_ni,
                        p_unit_share_of_category: ratio(unit_count, region_count),
                    }
                })
                .collect();

            units.push(UnitDistribution {
                unit_id: unit_id.clone(),
                region_id: placement.region_id.clone(),
                unit_total: node.total,
                region_total,
                entries,
            });
        }

        ProbabilityTable {
            category_group: totals.category_group.clone(),
            units,
        }
    }
}
