//! Region-level mutual information between unit and category.
//!
//! \[
//! \mathrm{MI}(R) = \frac{\sum_{i \in R} p_{n_i} D_i}{\sum_{i \in R} p_{n_i}}
//! \]
//!
//! The denominator is 1 whenever the region has population; it guards the zero-population case,
//! where MI is 0. The category-weighted estimator \(\sum_j p_{y_j} D_j\) is reported next to it.

use crate::aggregate::GroupTotals;
use crate::diagnostics::Level;
use crate::divergence::{CompensatedSum, DivergenceTable};
use crate::geography::ResolvedGeography;
use crate::CategoryKey;

/// MI of one region for one category group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionMutualInformation {
    pub region_id: String,
    pub region_title: String,
    pub region_type: String,
    pub category_group: String,
    /// Bits; \(\sum_i p_{n_i} D_i\).
    pub mutual_information: f64,
    /// Bits; \(\sum_j p_{y_j} D_j\).
    pub mutual_information_by_category: f64,
    /// Number of units in the region.
    pub units: usize,
    /// Region total for the group.
    pub population: f64,
}

/// \(\sum w x / \sum w\), or 0 when the weights sum to 0.
pub(crate) fn weighted_mean<I>(pairs: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut num = CompensatedSum::default();
    let mut den = CompensatedSum::default();
    for (w, x) in pairs {
        num.add(w * x);
        den.add(w);
    }
    let den = den.value();
    if den > 0.0 {
        num.value() / den
    } else {
        0.0
    }
}

/// One row per region of `geo`, sorted by region id.
///
/// Every region appears, including regions with no population for this group (MI = 0).
pub fn mutual_information<K: CategoryKey>(
    divergence: &DivergenceTable<K>,
    totals: &GroupTotals<K>,
    geo: &ResolvedGeography,
) -> Vec<RegionMutualInformation> {
    geo.regions()
        .map(|region| {
            let id = region.region_id.as_str();
            let population = totals.get(Level::Region, id, None);
            let units = geo.units_in_region(id);

            let mutual_information = weighted_mean(units.iter().map(|u| {
                let w = if population > 0.0 {
                    totals.get(Level::Unit, u, None) / population
                } else {
                    0.0
                };
                let d = divergence.entry(u).map_or(0.0, |e| e.dkl_unit);
                (w, d)
            }));

            let mutual_information_by_category = divergence
                .region_categories(id)
                .map(|c| totals.share(Level::Region, id, &c.category) * c.dkl_category)
                .collect::<CompensatedSum>()
                .value();

            RegionMutualInformation {
                region_id: region.region_id.clone(),
                region_title: region.title.clone(),
                region_type: region.region_type.clone(),
                category_group: totals.category_group.clone(),
                mutual_information,
                mutual_information_by_category,
                units: units.len(),
                population,
            }
        })
        .collect()
}
