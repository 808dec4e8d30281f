//! Roll counts up the geography tree.
//!
//! For one category group, [`GroupTotals`] holds, at each [`Level`], the count per category and
//! the group total (`⟂`). Totals are summed from the category map after accumulation, so
//! `total(id) = Σ_category count(id, category)` holds exactly.
//!
//! Summation order is canonical: cells are sorted by (unit, category, count) before they are
//! accumulated, counties sum their units in unit-id order, and regions sum their counties in
//! county-id order. Permuting the input therefore produces bit-identical totals.

use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::{Diagnostic, Diagnostics, InconsistencyKind, Level};
use crate::geography::ResolvedGeography;
use crate::table::{CountTable, ReportedTotal};
use crate::taxonomy::CategoryTaxonomy;
use crate::{CategoryKey, Result, SegregationError};

/// Counts per category at one node of the hierarchy, plus their sum.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LevelCounts<K: Ord> {
    pub by_category: BTreeMap<K, f64>,
    pub total: f64,
}

impl<K: Ord> Default for LevelCounts<K> {
    fn default() -> Self {
        Self {
            by_category: BTreeMap::new(),
            total: 0.0,
        }
    }
}

impl<K: CategoryKey> LevelCounts<K> {
    /// Count in `category`; categories never observed count as 0.
    #[must_use]
    pub fn count(&self, category: &K) -> f64 {
        self.by_category.get(category).copied().unwrap_or(0.0)
    }

    /// Share of the group total held by `category`, or 0 when the total is 0.
    #[must_use]
    pub fn share(&self, category: &K) -> f64 {
        if self.total > 0.0 {
            self.count(category) / self.total
        } else {
            0.0
        }
    }

    fn add(&mut self, category: &K, count: f64) {
        match self.by_category.get_mut(category) {
            Some(c) => *c += count,
            None => {
                self.by_category.insert(category.clone(), count);
            }
        }
    }

    fn add_all(&mut self, other: &LevelCounts<K>) {
        for (k, &c) in &other.by_category {
            self.add(k, c);
        }
    }

    fn seal(&mut self) {
        self.total = self.by_category.values().sum();
    }
}

/// All aggregate totals of one category group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupTotals<K: Ord> {
    pub category_group: String,
    /// Declared and observed categories, sorted.
    pub categories: Vec<K>,
    pub units: BTreeMap<String, LevelCounts<K>>,
    pub counties: BTreeMap<String, LevelCounts<K>>,
    pub regions: BTreeMap<String, LevelCounts<K>>,
}

impl<K: CategoryKey> GroupTotals<K> {
    #[must_use]
    pub fn level(&self, level: Level) -> &BTreeMap<String, LevelCounts<K>> {
        match level {
            Level::Unit => &self.units,
            Level::County => &self.counties,
            Level::Region => &self.regions,
        }
    }

    /// The aggregate keyed by `(level, id, category | ⟂)`: `None` asks for the group total.
    /// Absent keys read as 0.
    #[must_use]
    pub fn get(&self, level: Level, id: &str, category: Option<&K>) -> f64 {
        match (self.level(level).get(id), category) {
            (Some(node), Some(k)) => node.count(k),
            (Some(node), None) => node.total,
            (None, _) => 0.0,
        }
    }

    /// Share of `category` in the node's group total (0 for a zero total).
    #[must_use]
    pub fn share(&self, level: Level, id: &str, category: &K) -> f64 {
        self.level(level)
            .get(id)
            .map(|node| node.share(category))
            .unwrap_or(0.0)
    }
}

/// Builds [`GroupTotals`] against one resolved geography.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator<'g> {
    geo: &'g ResolvedGeography,
}

impl<'g> Aggregator<'g> {
    #[must_use]
    pub fn new(geo: &'g ResolvedGeography) -> Self {
        Self { geo }
    }

    /// Aggregate `(unit_id, category, count)` cells of one group.
    ///
    /// Every unit of the geography gets a (possibly empty) entry, as does every county and
    /// region. Repeated cells for the same key are summed.
    ///
    /// # Errors
    ///
    /// Returns [`SegregationError::Invalid`] if a cell names a unit the geography never placed.
    pub fn aggregate_cells<K, I>(
        &self,
        category_group: &str,
        declared: &[K],
        cells: I,
    ) -> Result<GroupTotals<K>>
    where
        K: CategoryKey,
        I: IntoIterator<Item = (String, K, f64)>,
    {
        let mut cells: Vec<(String, K, f64)> = cells.into_iter().collect();
        cells.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.total_cmp(&b.2))
        });

        let mut categories: BTreeSet<K> = declared.iter().cloned().collect();
        let mut units: BTreeMap<String, LevelCounts<K>> = self
            .geo
            .units()
            .map(|(u, _)| (u.to_string(), LevelCounts::default()))
            .collect();

        for (unit, category, count) in cells {
            let node = units.get_mut(&unit).ok_or(SegregationError::Invalid(
                "count cell for a unit outside the resolved geography",
            ))?;
            node.add(&category, count);
            categories.insert(category);
        }

        let mut counties: BTreeMap<String, LevelCounts<K>> = self
            .geo
            .counties()
            .map(|(c, _)| (c.to_string(), LevelCounts::default()))
            .collect();
        for (unit, node) in &mut units {
            node.seal();
            if let Some(p) = self.geo.placement(unit) {
                if let Some(county) = counties.get_mut(&p.county_id) {
                    county.add_all(node);
                }
            }
        }

        let mut regions: BTreeMap<String, LevelCounts<K>> = self
            .geo
            .regions()
            .map(|r| (r.region_id.clone(), LevelCounts::default()))
            .collect();
        for (county_id, region_id) in self.geo.counties() {
            let Some(county) = counties.get_mut(county_id) else {
                continue;
            };
            county.seal();
            if let Some(region) = regions.get_mut(region_id) {
                region.add_all(county);
            }
        }
        for region in regions.values_mut() {
            region.seal();
        }

        Ok(GroupTotals {
            category_group: category_group.to_string(),
            categories: categories.into_iter().collect(),
            units,
            counties,
            regions,
        })
    }
}

/// Aggregate every category group of `table`'s one-way records.
///
/// With a taxonomy, each group's category set also lists the taxonomy's declared categories,
/// observed or not. Without one it is whatever the records contain.
///
/// # Errors
///
/// Returns [`SegregationError::Invalid`] if `geo` was not resolved from this table's units.
pub fn aggregate(
    table: &CountTable,
    geo: &ResolvedGeography,
    taxonomy: Option<&CategoryTaxonomy>,
) -> Result<BTreeMap<String, GroupTotals<String>>> {
    let aggregator = Aggregator::new(geo);
    let mut out = BTreeMap::new();
    for group in table.category_groups() {
        let declared = taxonomy.map_or(&[][..], |t| t.declared_categories(group));
        let cells = table
            .group_records(group)
            .map(|r| (r.unit_id.clone(), r.category.clone(), r.count));
        out.insert(
            group.to_string(),
            aggregator.aggregate_cells(group, declared, cells)?,
        );
    }
    Ok(out)
}

/// Flag categories whose count exceeds the unit's own reported group total.
///
/// The run continues either way; this only records
/// [`InconsistencyKind::ReportedTotalExceeded`] events.
pub fn check_reported_totals(
    totals: &BTreeMap<String, GroupTotals<String>>,
    reported: &[ReportedTotal],
    geo: &ResolvedGeography,
    tolerance: f64,
    diags: &mut Diagnostics,
) {
    let mut sorted: Vec<&ReportedTotal> = reported.iter().collect();
    sorted.sort_by(|a, b| {
        a.category_group
            .cmp(&b.category_group)
            .then_with(|| a.unit_id.cmp(&b.unit_id))
    });
    for rt in sorted {
        let Some(group) = totals.get(&rt.category_group) else {
            continue;
        };
        let Some(node) = group.units.get(&rt.unit_id) else {
            continue;
        };
        let region_id = geo
            .placement(&rt.unit_id)
            .map(|p| p.region_id.clone())
            .unwrap_or_default();
        for (category, &count) in &node.by_category {
            if count > rt.total + tolerance {
                diags.push(Diagnostic::InconsistentAggregate {
                    category_group: rt.category_group.clone(),
                    unit_id: rt.unit_id.clone(),
                    region_id: region_id.clone(),
                    category: category.clone(),
                    kind: InconsistencyKind::ReportedTotalExceeded {
                        count,
                        reported_total: rt.total,
                    },
                });
            }
        }
    }
}
