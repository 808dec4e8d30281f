//! Unit → county → region crosswalk, and its per-run resolution.
//!
//! The crosswalk is built elsewhere; this module only looks it up. Units without a region are
//! not an error: a link with no region promotes the unit's county to a region of its own, and a
//! unit with no link at all becomes a singleton region containing just itself. Both fallbacks
//! are reported as [`Diagnostic::MissingGeography`]. Synthetic ids live apart from crosswalk ids,
//! so a fallback never merges into a real county or region.

use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::{Diagnostic, Diagnostics, Level};
use crate::table::violation;
use crate::{Result, ViolationReason};

/// `region_type` given to regions synthesized by the fallback.
pub const SINGLETON_REGION_TYPE: &str = "singleton";

/// One crosswalk row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeographyLink {
    pub unit_id: String,
    pub county_id: String,
    /// `None` when the county belongs to no region (e.g. a non-metro county).
    pub region_id: Option<String>,
    pub region_title: String,
    /// e.g. "Metropolitan Statistical Area".
    pub region_type: String,
}

impl GeographyLink {
    /// A link whose region title defaults to the region id.
    pub fn new(
        unit_id: impl Into<String>,
        county_id: impl Into<String>,
        region_id: impl Into<String>,
    ) -> Self {
        let region_id = region_id.into();
        Self {
            unit_id: unit_id.into(),
            county_id: county_id.into(),
            region_title: region_id.clone(),
            region_id: Some(region_id),
            region_type: String::new(),
        }
    }

    pub fn without_region(unit_id: impl Into<String>, county_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            county_id: county_id.into(),
            region_id: None,
            region_title: String::new(),
            region_type: String::new(),
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.region_title = title.into();
        self
    }

    #[must_use]
    pub fn with_region_type(mut self, region_type: impl Into<String>) -> Self {
        self.region_type = region_type.into();
        self
    }
}

/// Immutable lookup from unit id to its crosswalk row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeographyIndex {
    links: BTreeMap<String, GeographyLink>,
}

impl GeographyIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from crosswalk rows.
    ///
    /// # Errors
    ///
    /// Returns a schema violation (category group `"geography"`) when a unit id appears twice,
    /// an id is empty, or a county is assigned to two different regions. The hierarchy must be
    /// a tree.
    pub fn from_links<I>(links: I) -> Result<Self>
    where
        I: IntoIterator<Item = GeographyLink>,
    {
        let mut out = BTreeMap::new();
        let mut county_region: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (index, link) in links.into_iter().enumerate() {
            if link.unit_id.is_empty() || link.county_id.is_empty() {
                return Err(violation(
                    index,
                    &link.unit_id,
                    "geography",
                    &link.county_id,
                    ViolationReason::EmptyIdentifier,
                ));
            }
            match county_region.get(&link.county_id) {
                Some(region) if *region != link.region_id => {
                    return Err(violation(
                        index,
                        &link.unit_id,
                        "geography",
                        &link.county_id,
                        ViolationReason::DuplicateKey,
                    ));
                }
                Some(_) => {}
                None => {
                    county_region.insert(link.county_id.clone(), link.region_id.clone());
                }
            }
            if out.contains_key(&link.unit_id) {
                return Err(violation(
                    index,
                    &link.unit_id,
                    "geography",
                    &link.county_id,
                    ViolationReason::DuplicateKey,
                ));
            }
            out.insert(link.unit_id.clone(), link);
        }
        Ok(Self { links: out })
    }

    #[must_use]
    pub fn get(&self, unit_id: &str) -> Option<&GeographyLink> {
        self.links.get(unit_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Place every unit of a run, applying the fallbacks for unlinked units.
    ///
    /// Units are placed in id order. Synthetic counties and regions never share an id with a
    /// crosswalk county or region: a fallback id that is already taken gets a `#n` suffix and a
    /// [`Diagnostic::SyntheticIdCollision`] is recorded.
    pub fn resolve<'a, I>(&self, units: I, diags: &mut Diagnostics) -> ResolvedGeography
    where
        I: IntoIterator<Item = &'a str>,
    {
        let units: BTreeSet<&str> = units.into_iter().collect();
        let mut ids = SyntheticIds::new(self.links.values());
        let mut resolved = ResolvedGeography::default();
        for unit in units {
            let (placement, info) = match self.links.get(unit) {
                Some(GeographyLink {
                    county_id,
                    region_id: Some(region_id),
                    region_title,
                    region_type,
                    ..
                }) => (
                    Placement {
                        county_id: county_id.clone(),
                        region_id: region_id.clone(),
                    },
                    RegionInfo {
                        region_id: region_id.clone(),
                        title: region_title.clone(),
                        region_type: region_type.clone(),
                        synthetic: false,
                    },
                ),
                Some(GeographyLink {
                    county_id,
                    region_id: None,
                    ..
                }) => {
                    let region_id = ids.promoted_region(county_id, diags);
                    diags.push(Diagnostic::MissingGeography {
                        unit_id: unit.to_string(),
                        fallback_county: county_id.clone(),
                        fallback_region: region_id.clone(),
                    });
                    (
                        Placement {
                            county_id: county_id.clone(),
                            region_id: region_id.clone(),
                        },
                        RegionInfo::singleton(region_id, county_id),
                    )
                }
                None => {
                    let id = ids.singleton(unit, diags);
                    diags.push(Diagnostic::MissingGeography {
                        unit_id: unit.to_string(),
                        fallback_county: id.clone(),
                        fallback_region: id.clone(),
                    });
                    (
                        Placement {
                            county_id: id.clone(),
                            region_id: id.clone(),
                        },
                        RegionInfo::singleton(id, unit),
                    )
                }
            };
            resolved
                .region_units
                .entry(placement.region_id.clone())
                .or_default()
                .push(unit.to_string());
            resolved
                .counties
                .entry(placement.county_id.clone())
                .or_insert_with(|| placement.region_id.clone());
            resolved.regions.entry(info.region_id.clone()).or_insert(info);
            resolved.placements.insert(unit.to_string(), placement);
        }
        resolved
    }
}

/// Id allocation for fallback nodes, disjoint from every crosswalk county and region id.
struct SyntheticIds {
    counties: BTreeSet<String>,
    regions: BTreeSet<String>,
    /// regionless county → the region id it was promoted to
    promoted: BTreeMap<String, String>,
    reported: BTreeSet<String>,
}

impl SyntheticIds {
    fn new<'a>(links: impl Iterator<Item = &'a GeographyLink>) -> Self {
        let mut counties = BTreeSet::new();
        let mut regions = BTreeSet::new();
        let mut regionless = BTreeSet::new();
        for link in links {
            counties.insert(link.county_id.clone());
            match &link.region_id {
                Some(region) => {
                    regions.insert(region.clone());
                }
                None => {
                    regionless.insert(link.county_id.clone());
                }
            }
        }
        // Promotions depend only on the crosswalk, never on which units a run contains.
        let mut promoted = BTreeMap::new();
        for county in regionless {
            let region = fresh(&county, |id| regions.contains(id));
            regions.insert(region.clone());
            promoted.insert(county, region);
        }
        Self {
            counties,
            regions,
            promoted,
            reported: BTreeSet::new(),
        }
    }

    fn promoted_region(&mut self, county_id: &str, diags: &mut Diagnostics) -> String {
        let region = self
            .promoted
            .get(county_id)
            .cloned()
            .unwrap_or_else(|| county_id.to_string());
        if region != county_id && self.reported.insert(region.clone()) {
            diags.push(Diagnostic::SyntheticIdCollision {
                level: Level::Region,
                requested: county_id.to_string(),
                assigned: region.clone(),
            });
        }
        region
    }

    /// County and region id for a unit with no link; both are the same string.
    fn singleton(&mut self, unit_id: &str, diags: &mut Diagnostics) -> String {
        let id = fresh(unit_id, |id| self.counties.contains(id) || self.regions.contains(id));
        if id != unit_id {
            let level = if self.counties.contains(unit_id) {
                Level::County
            } else {
                Level::Region
            };
            diags.push(Diagnostic::SyntheticIdCollision {
                level,
                requested: unit_id.to_string(),
                assigned: id.clone(),
            });
        }
        self.counties.insert(id.clone());
        self.regions.insert(id.clone());
        id
    }
}

/// `base`, or the first `base#n` (n = 1, 2, ...) that is not taken.
fn fresh(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1usize..)
        .map(|n| format!("{base}#{n}"))
        .find(|id| !taken(id))
        .unwrap_or_else(|| base.to_string())
}

/// Where a unit sits in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Placement {
    pub county_id: String,
    pub region_id: String,
}

/// Region metadata carried through to the MI table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionInfo {
    pub region_id: String,
    pub title: String,
    pub region_type: String,
    /// Produced by the missing-geography fallback.
    pub synthetic: bool,
}

impl RegionInfo {
    /// A synthetic region titled after the node it stands in for.
    fn singleton(region_id: String, title: &str) -> Self {
        Self {
            region_id,
            title: title.to_string(),
            region_type: SINGLETON_REGION_TYPE.to_string(),
            synthetic: true,
        }
    }
}

/// The geography snapshot of one run: every unit placed, every region described.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedGeography {
    placements: BTreeMap<String, Placement>,
    regions: BTreeMap<String, RegionInfo>,
    /// county id → region id
    counties: BTreeMap<String, String>,
    /// region id → sorted unit ids
    region_units: BTreeMap<String, Vec<String>>,
}

impl ResolvedGeography {
    #[must_use]
    pub fn placement(&self, unit_id: &str) -> Option<&Placement> {
        self.placements.get(unit_id)
    }

    /// Placed units, sorted by id.
    pub fn units(&self) -> impl Iterator<Item = (&str, &Placement)> {
        self.placements.iter().map(|(u, p)| (u.as_str(), p))
    }

    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.placements.len()
    }

    #[must_use]
    pub fn region(&self, region_id: &str) -> Option<&RegionInfo> {
        self.regions.get(region_id)
    }

    /// Regions, sorted by id.
    pub fn regions(&self) -> impl Iterator<Item = &RegionInfo> {
        self.regions.values()
    }

    /// Counties with their region, sorted by county id.
    pub fn counties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.counties
            .iter()
            .map(|(c, r)| (c.as_str(), r.as_str()))
    }

    #[must_use]
    pub fn units_in_region(&self, region_id: &str) -> &[String] {
        self.region_units
            .get(region_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> GeographyIndex {
        GeographyIndex::from_links([
            GeographyLink::new("u1", "c1", "r1")
                .with_title("Metro One")
                .with_region_type("Metropolitan Statistical Area"),
            GeographyLink::new("u2", "c1", "r1"),
            GeographyLink::new("u3", "c2", "r1"),
            GeographyLink::without_region("u4", "c9"),
            GeographyLink::without_region("u5", "c9"),
        ])
        .unwrap()
    }

    #[test]
    fn linked_units_keep_their_region() {
        let mut d = Diagnostics::new();
        let g = index().resolve(["u3", "u1", "u2"], &mut d);
        assert!(d.is_empty());
        assert_eq!(g.units_in_region("r1"), ["u1", "u2", "u3"]);
        assert_eq!(g.region("r1").unwrap().title, "Metro One");
        assert_eq!(g.counties().collect::<Vec<_>>(), vec![("c1", "r1"), ("c2", "r1")]);
    }

    #[test]
    fn unlinked_unit_becomes_singleton_region() {
        let mut d = Diagnostics::new();
        let g = index().resolve(["u1", "stray"], &mut d);
        assert_eq!(d.counts.missing_geography, 1);
        let p = g.placement("stray").unwrap();
        assert_eq!(p.region_id, "stray");
        assert_eq!(p.county_id, "stray");
        let info = g.region("stray").unwrap();
        assert!(info.synthetic);
        assert_eq!(info.region_type, SINGLETON_REGION_TYPE);
        assert_eq!(g.units_in_region("stray"), ["stray"]);
    }

    #[test]
    fn regionless_county_acts_as_region() {
        let mut d = Diagnostics::new();
        let g = index().resolve(["u4", "u5"], &mut d);
        assert_eq!(d.counts.missing_geography, 2);
        assert_eq!(g.units_in_region("c9"), ["u4", "u5"]);
        assert!(g.region("c9").unwrap().synthetic);
    }

    #[test]
    fn unlinked_unit_named_like_a_county_gets_its_own_id() {
        let mut d = Diagnostics::new();
        let g = index().resolve(["u1", "c1"], &mut d);
        let p = g.placement("c1").unwrap();
        assert_eq!(p.county_id, "c1#1");
        assert_eq!(p.region_id, "c1#1");
        assert_eq!(g.units_in_region("r1"), ["u1"]);
        assert_eq!(g.units_in_region("c1#1"), ["c1"]);
        assert_eq!(g.region("c1#1").unwrap().title, "c1");
        assert_eq!(g.counties().collect::<Vec<_>>(), vec![("c1", "r1"), ("c1#1", "c1#1")]);
        assert_eq!(d.counts.synthetic_id_collision, 1);
        assert!(d.iter().any(|e| matches!(
            e,
            Diagnostic::SyntheticIdCollision { level: Level::County, requested, assigned }
                if requested == "c1" && assigned == "c1#1"
        )));
    }

    #[test]
    fn regionless_county_named_like_a_region_stays_separate() {
        let index = GeographyIndex::from_links([
            GeographyLink::new("a", "c1", "R"),
            GeographyLink::without_region("b", "R"),
            GeographyLink::without_region("c", "R"),
        ])
        .unwrap();
        let mut d = Diagnostics::new();
        let g = index.resolve(["a", "b", "c"], &mut d);
        assert_eq!(g.units_in_region("R"), ["a"]);
        assert_eq!(g.units_in_region("R#1"), ["b", "c"]);
        assert!(!g.region("R").unwrap().synthetic);
        assert!(g.region("R#1").unwrap().synthetic);
        assert_eq!(g.counties().collect::<Vec<_>>(), vec![("R", "R#1"), ("c1", "R")]);
        // One rename, reported once, however many units use it.
        assert_eq!(d.counts.synthetic_id_collision, 1);
        assert_eq!(d.counts.missing_geography, 2);
    }

    #[test]
    fn renamed_ids_do_not_depend_on_the_run() {
        let index = GeographyIndex::from_links([
            GeographyLink::new("a", "c1", "R"),
            GeographyLink::without_region("b", "R"),
        ])
        .unwrap();
        let alone = index.resolve(["b"], &mut Diagnostics::new());
        let both = index.resolve(["b", "a"], &mut Diagnostics::new());
        assert_eq!(alone.placement("b"), both.placement("b"));
    }

    #[test]
    fn county_in_two_regions_is_rejected() {
        let r = GeographyIndex::from_links([
            GeographyLink::new("u1", "c1", "r1"),
            GeographyLink::new("u2", "c1", "r2"),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn duplicate_unit_is_rejected() {
        let r = GeographyIndex::from_links([
            GeographyLink::new("u1", "c1", "r1"),
            GeographyLink::new("u1", "c1", "r1"),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn repeated_units_resolve_once() {
        let mut d = Diagnostics::new();
        let g = index().resolve(["x", "x"], &mut d);
        assert_eq!(g.unit_count(), 1);
        assert_eq!(d.counts.missing_geography, 1);
    }
}
