//! Declarative mapping from raw source labels to canonical categories.
//!
//! Census tables mix leaf categories with totals and overlapping subtotals, and some sources
//! split a category by sex. A [`GroupTaxonomy`] states, per raw label, whether the row is the
//! group total, an aggregate to ignore, or a signed contribution to one or more canonical
//! categories. [`CategoryTaxonomy::apply`] turns raw records into a [`CountTable`] whose
//! categories are exactly the canonical ones.

use std::collections::{BTreeMap, BTreeSet};

use crate::table::{check_cell, violation, CountRecord, CountTable, ReportedTotal};
use crate::{Result, ViolationReason};

/// What to do with one raw label.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RawRule {
    /// The group total. Kept as a [`ReportedTotal`] for consistency checks.
    Total,
    /// An aggregate overlapping the leaves; ignored.
    Drop,
    /// Add `sign · count` to each named canonical category.
    Combine(Vec<(String, f64)>),
}

impl RawRule {
    /// Contribute the whole count to one canonical category.
    pub fn to(canonical: impl Into<String>) -> Self {
        RawRule::Combine(vec![(canonical.into(), 1.0)])
    }
}

/// Canonical categories of one group and the rules that feed them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupTaxonomy {
    pub name: String,
    /// Human-readable group label, e.g. "Household Income".
    pub label: String,
    /// Canonical categories in presentation order.
    pub categories: Vec<String>,
    pub rules: BTreeMap<String, RawRule>,
}

impl GroupTaxonomy {
    pub fn new<I, S>(name: impl Into<String>, label: impl Into<String>, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            label: label.into(),
            categories: categories.into_iter().map(Into::into).collect(),
            rules: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn rule(mut self, raw: impl Into<String>, rule: RawRule) -> Self {
        self.rules.insert(raw.into(), rule);
        self
    }

    #[must_use]
    pub fn total(self, raw: impl Into<String>) -> Self {
        self.rule(raw, RawRule::Total)
    }

    #[must_use]
    pub fn ignore(self, raw: impl Into<String>) -> Self {
        self.rule(raw, RawRule::Drop)
    }

    /// Build a group from `(code, label)` rows where `code` maps to `label` one-to-one.
    fn coded<C: AsRef<str>>(name: &str, label: &str, total: &str, rows: &[(C, &str)]) -> Self {
        let mut g = Self::new(name, label, rows.iter().map(|(_, l)| *l)).total(total);
        for (code, l) in rows {
            g = g.rule(code.as_ref(), RawRule::to(*l));
        }
        g
    }

    #[must_use]
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    /// The rule for a raw label. A label without a rule that is itself canonical maps to
    /// itself.
    fn resolve(&self, raw: &str) -> Option<RawRule> {
        match self.rules.get(raw) {
            Some(rule) => Some(rule.clone()),
            None if self.has_category(raw) => Some(RawRule::to(raw)),
            None => None,
        }
    }
}

/// A set of [`GroupTaxonomy`]s keyed by group name.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CategoryTaxonomy {
    pub groups: BTreeMap<String, GroupTaxonomy>,
}

#[derive(Debug)]
struct Cell {
    first_index: usize,
    count: f64,
    margin_of_error: Option<f64>,
    contributions: usize,
    identity: bool,
}

impl CategoryTaxonomy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_group(mut self, group: GroupTaxonomy) -> Self {
        self.groups.insert(group.name.clone(), group);
        self
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&GroupTaxonomy> {
        self.groups.get(name)
    }

    /// Canonical categories of `name`, or an empty slice for an unknown group.
    #[must_use]
    pub fn declared_categories(&self, name: &str) -> &[String] {
        self.groups
            .get(name)
            .map(|g| g.categories.as_slice())
            .unwrap_or(&[])
    }

    /// Map raw records (category = raw source label) to canonical records.
    ///
    /// Output records are sorted by (unit, group, category). A margin of error survives only
    /// when a canonical cell is fed by exactly one raw row with sign +1.
    ///
    /// # Errors
    ///
    /// A schema violation naming the raw record for an unknown group or label, a rule pointing
    /// at an undeclared category, a negative or non-finite raw count, a repeated raw key, or a
    /// canonical count that nets out negative.
    pub fn apply(&self, raw: &[CountRecord]) -> Result<CountTable> {
        let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();
        let mut cells: BTreeMap<(String, String, String), Cell> = BTreeMap::new();
        let mut reported = Vec::new();

        for (index, r) in raw.iter().enumerate() {
            check_cell(index, &r.unit_id, &r.category_group, &r.category, r.count)?;
            if !seen.insert((
                r.unit_id.as_str(),
                r.category_group.as_str(),
                r.category.as_str(),
            )) {
                return Err(violation(
                    index,
                    &r.unit_id,
                    &r.category_group,
                    &r.category,
                    ViolationReason::DuplicateKey,
                ));
            }
            let Some(group) = self.groups.get(&r.category_group) else {
                return Err(violation(
                    index,
                    &r.unit_id,
                    &r.category_group,
                    &r.category,
                    ViolationReason::UnknownCategoryGroup,
                ));
            };
            let unknown = || {
                violation(
                    index,
                    &r.unit_id,
                    &r.category_group,
                    &r.category,
                    ViolationReason::UnknownCategory,
                )
            };
            match group.resolve(&r.category).ok_or_else(unknown)? {
                RawRule::Total => reported.push(ReportedTotal {
                    unit_id: r.unit_id.clone(),
                    category_group: r.category_group.clone(),
                    total: r.count,
                }),
                RawRule::Drop => {}
                RawRule::Combine(parts) => {
                    for (canonical, sign) in parts {
                        if !group.has_category(&canonical) {
                            return Err(unknown());
                        }
                        let identity = sign == 1.0;
                        let cell = cells
                            .entry((
                                r.unit_id.clone(),
                                r.category_group.clone(),
                                canonical,
                            ))
                            .or_insert(Cell {
                                first_index: index,
                                count: 0.0,
                                margin_of_error: r.margin_of_error,
                                contributions: 0,
                                identity,
                            });
                        cell.count += sign * r.count;
                        cell.contributions += 1;
                        cell.identity &= identity;
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(cells.len());
        for ((unit_id, category_group, category), cell) in cells {
            if cell.count < 0.0 {
                return Err(violation(
                    cell.first_index,
                    &unit_id,
                    &category_group,
                    &category,
                    ViolationReason::NegativeCombinedCount(cell.count),
                ));
            }
            let margin_of_error = if cell.contributions == 1 && cell.identity {
                cell.margin_of_error
            } else {
                None
            };
            records.push(CountRecord {
                unit_id,
                category_group,
                category,
                count: cell.count,
                margin_of_error,
            });
        }
        reported.sort_by(|a, b| {
            a.unit_id
                .cmp(&b.unit_id)
                .then_with(|| a.category_group.cmp(&b.category_group))
        });

        Ok(CountTable::new(records).with_reported_totals(reported))
    }

    /// Check that already-canonical records only use declared groups and categories.
    ///
    /// # Errors
    ///
    /// [`ViolationReason::UnknownCategoryGroup`] or [`ViolationReason::UnknownCategory`] for
    /// the first offending record.
    pub fn validate_table(&self, table: &CountTable) -> Result<()> {
        for (index, r) in table.records.iter().enumerate() {
            let reason = match self.groups.get(&r.category_group) {
                None => ViolationReason::UnknownCategoryGroup,
                Some(g) if !g.has_category(&r.category) => ViolationReason::UnknownCategory,
                Some(_) => continue,
            };
            return Err(violation(
                index,
                &r.unit_id,
                &r.category_group,
                &r.category,
                reason,
            ));
        }
        for (index, t) in table.reported_totals.iter().enumerate() {
            if !self.groups.contains_key(&t.category_group) {
                return Err(violation(
                    index,
                    &t.unit_id,
                    &t.category_group,
                    "total",
                    ViolationReason::UnknownCategoryGroup,
                ));
            }
        }
        Ok(())
    }

    /// ACS 5-year detail tables B03002, B19001, B15003 and B23025 (stable 2009-2023).
    #[must_use]
    pub fn acs5() -> Self {
        let mut race = GroupTaxonomy::coded("race", "Race/Ethnicity", "B03002_001", ACS_RACE)
            .ignore("B03002_002");
        for n in [10, 11].into_iter().chain(13..=21) {
            race = race.ignore(format!("B03002_{n:03}"));
        }
        let income = GroupTaxonomy::coded(
            "income",
            "Household Income",
            "B19001_001",
            &acs_rows("B19001", 2, INCOME),
        );
        let educ = GroupTaxonomy::coded(
            "educ",
            "Education attainment",
            "B15003_001",
            &acs_rows("B15003", 2, ACS_EDUC),
        );
        let empl = GroupTaxonomy::coded("empl", "Employment", "B23025_001", ACS_EMPL)
            .ignore("B23025_002")
            .ignore("B23025_003");
        Self::new()
            .with_group(race)
            .with_group(income)
            .with_group(educ)
            .with_group(empl)
    }

    /// 2000 Decennial: SF1 P003/P004 race, SF3 P052 income, P037 education and P043
    /// employment. P037 and P043 report men and women separately; both rows feed one category.
    #[must_use]
    pub fn decennial_2000() -> Self {
        let race = GroupTaxonomy::coded("race", "Race/Ethnicity", "P003001", SF1_2000_RACE)
            .ignore("P004001");
        let income = GroupTaxonomy::coded(
            "income",
            "Household Income",
            "P052001",
            &sf_rows("P052", 2, INCOME),
        );

        let labels = SF3_2000_EDUC.iter().copied();
        let mut educ = GroupTaxonomy::new("educ", "Education attainment", labels)
            .total("P037001")
            .ignore("P037002");
        for (i, label) in SF3_2000_EDUC.iter().enumerate() {
            let male = format!("P037{:03}", 3 + i);
            let female = format!("P037{:03}", 3 + SF3_2000_EDUC.len() + i);
            educ = educ
                .rule(male, RawRule::to(*label))
                .rule(female, RawRule::to(*label));
        }

        let mut empl = GroupTaxonomy::new("empl", "Employment", EMPL.iter().copied())
            .total("P043001")
            .ignore("P043002")
            .ignore("P043007");
        for (i, label) in EMPL.iter().enumerate() {
            empl = empl
                .rule(format!("P043{:03}", 3 + i), RawRule::to(*label))
                .rule(format!("P043{:03}", 8 + i), RawRule::to(*label));
        }

        Self::new()
            .with_group(race)
            .with_group(income)
            .with_group(educ)
            .with_group(empl)
    }

    /// 2010 Decennial SF1 P003/P004, race only. The P003 codes sit one lower than in 2000 and
    /// Hispanic origin moved to P004003.
    #[must_use]
    pub fn decennial_2010() -> Self {
        let race = GroupTaxonomy::coded("race", "Race/Ethnicity", "P003001", SF1_2010_RACE)
            .ignore("P004001")
            .ignore("P004002");
        Self::new().with_group(race)
    }

    /// The 2010 block-group income extract, one `hincNNN` column per bracket. It carries no
    /// total column; the group total is the bracket sum.
    #[must_use]
    pub fn hinc_2010() -> Self {
        let mut income = GroupTaxonomy::new("income", "Household Income", INCOME.iter().copied());
        for (code, label) in HINC_CODES.iter().zip(INCOME) {
            income = income.rule(format!("hinc{code}"), RawRule::to(*label));
        }
        Self::new().with_group(income)
    }
}

fn acs_rows<'a>(table: &str, first: usize, labels: &[&'a str]) -> Vec<(String, &'a str)> {
    labels
        .iter()
        .enumerate()
        .map(|(i, l)| (format!("{table}_{:03}", first + i), *l))
        .collect()
}

fn sf_rows<'a>(table: &str, first: usize, labels: &[&'a str]) -> Vec<(String, &'a str)> {
    labels
        .iter()
        .enumerate()
        .map(|(i, l)| (format!("{table}{:03}", first + i), *l))
        .collect()
}

const ACS_RACE: &[(&str, &str)] = &[
    ("B03002_003", "White alone"),
    ("B03002_004", "Black or African American alone"),
    ("B03002_005", "American Indian and Alaska Native alone"),
    ("B03002_006", "Asian alone"),
    ("B03002_007", "Native Hawaiian and Other Pacific Islander alone"),
    ("B03002_008", "Some other race alone"),
    ("B03002_009", "Two or more races"),
    ("B03002_012", "Hispanic or Latino (any race)"),
];

const SF1_2000_RACE: &[(&str, &str)] = &[
    ("P003003", "White alone"),
    ("P003004", "Black or African American alone"),
    ("P003005", "American Indian and Alaska Native alone"),
    ("P003006", "Asian alone"),
    ("P003007", "Native Hawaiian and Other Pacific Islander alone"),
    ("P003008", "Some other race alone"),
    ("P003009", "Two or more races"),
    ("P004002", "Hispanic or Latino (any race)"),
];

const SF1_2010_RACE: &[(&str, &str)] = &[
    ("P003002", "White alone"),
    ("P003003", "Black or African American alone"),
    ("P003004", "American Indian and Alaska Native alone"),
    ("P003005", "Asian alone"),
    ("P003006", "Native Hawaiian and Other Pacific Islander alone"),
    ("P003007", "Some other race alone"),
    ("P003008", "Two or more races"),
    ("P004003", "Hispanic or Latino (any race)"),
];

/// B19001, P052 and the 2010 `hinc` extract share their 16 bracket labels.
const INCOME: &[&str] = &[
    "Less than $10,000",
    "$10,000 to $14,999",
    "$15,000 to $19,999",
    "$20,000 to $24,999",
    "$25,000 to $29,999",
    "$30,000 to $34,999",
    "$35,000 to $39,999",
    "$40,000 to $44,999",
    "$45,000 to $49,999",
    "$50,000 to $59,999",
    "$60,000 to $74,999",
    "$75,000 to $99,999",
    "$100,000 to $124,999",
    "$125,000 to $149,999",
    "$150,000 to $199,999",
    "$200,000 or more",
];

/// Lower bracket bound in thousands, as used in the `hinc` column names.
const HINC_CODES: &[&str] = &[
    "000", "010", "015", "020", "025", "030", "035", "040", "045", "050", "060", "075", "100",
    "125", "150", "200",
];

const ACS_EDUC: &[&str] = &[
    "No schooling completed",
    "Nursery school",
    "Kindergarten",
    "1st grade",
    "2nd grade",
    "3rd grade",
    "4th grade",
    "5th grade",
    "6th grade",
    "7th grade",
    "8th grade",
    "9th grade",
    "10th grade",
    "11th grade",
    "12th grade, no diploma",
    "Regular high school diploma",
    "GED or alternative credential",
    "Some college, less than 1 year",
    "Some college, 1 or more years, no degree",
    "Associate's degree",
    "Bachelor's degree",
    "Master's degree",
    "Professional school degree",
    "Doctorate degree",
];

const ACS_EMPL: &[(&str, &str)] = &[
    ("B23025_004", "Employed"),
    ("B23025_005", "Unemployed"),
    ("B23025_006", "Armed Forces"),
    ("B23025_007", "Not in labor force"),
];

const SF3_2000_EDUC: &[&str] = &[
    "No schooling completed",
    "Nursery to 4th grade",
    "5th and 6th grade",
    "7th and 8th grade",
    "9th grade",
    "10th grade",
    "11th grade",
    "12th grade, no diploma",
    "High school graduate (includes equivalency)",
    "Some college, less than 1 year",
    "Some college, 1 or more years, no degree",
    "Associate degree",
    "Bachelor's degree",
    "Master's degree",
    "Professional school degree",
    "Doctorate degree",
];

const EMPL: &[&str] = &["Employed", "Unemployed", "Armed Forces", "Not in labor force"];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegregationError;

    fn reason(e: SegregationError) -> ViolationReason {
        match e {
            SegregationError::SchemaViolation(v) => v.reason,
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn acs5_maps_every_published_code() {
        let tax = CategoryTaxonomy::acs5();
        let mut raw = Vec::new();
        for n in 1..=21 {
            raw.push(CountRecord::new("bg", "race", format!("B03002_{n:03}"), 1.0));
        }
        for n in 1..=17 {
            raw.push(CountRecord::new("bg", "income", format!("B19001_{n:03}"), 1.0));
        }
        for n in 1..=25 {
            raw.push(CountRecord::new("bg", "educ", format!("B15003_{n:03}"), 1.0));
        }
        for n in 1..=7 {
            raw.push(CountRecord::new("bg", "empl", format!("B23025_{n:03}"), 1.0));
        }
        let table = tax.apply(&raw).unwrap();
        assert_eq!(table.group_records("race").count(), 8);
        assert_eq!(table.group_records("income").count(), 16);
        assert_eq!(table.group_records("educ").count(), 24);
        assert_eq!(table.group_records("empl").count(), 4);
        assert_eq!(table.reported_totals.len(), 4);
        tax.validate_table(&table).unwrap();
    }

    #[test]
    fn decennial_2010_maps_every_published_code() {
        let tax = CategoryTaxonomy::decennial_2010();
        let mut raw = Vec::new();
        for n in 1..=8 {
            raw.push(CountRecord::new("bg", "race", format!("P003{n:03}"), 1.0));
        }
        for n in 1..=3 {
            raw.push(CountRecord::new("bg", "race", format!("P004{n:03}"), 2.0));
        }
        let table = tax.apply(&raw).unwrap();
        assert_eq!(table.group_records("race").count(), 8);
        assert_eq!(table.reported_totals.len(), 1);
        let white = table
            .group_records("race")
            .find(|r| r.category == "White alone")
            .unwrap();
        assert_eq!(white.count, 1.0);
        let hispanic = table
            .group_records("race")
            .find(|r| r.category == "Hispanic or Latino (any race)")
            .unwrap();
        assert_eq!(hispanic.count, 2.0);
        tax.validate_table(&table).unwrap();
        // 2000 has no P003002 category row; 2010 has no P003009.
        assert!(tax.apply(&[CountRecord::new("bg", "race", "P003009", 1.0)]).is_err());
    }

    #[test]
    fn hinc_2010_maps_every_bracket_column() {
        let tax = CategoryTaxonomy::hinc_2010();
        let raw: Vec<CountRecord> = HINC_CODES
            .iter()
            .enumerate()
            .map(|(i, code)| CountRecord::new("bg", "income", format!("hinc{code}"), i as f64))
            .collect();
        let table = tax.apply(&raw).unwrap();
        assert_eq!(table.group_records("income").count(), 16);
        assert!(table.reported_totals.is_empty());
        let top = table
            .group_records("income")
            .find(|r| r.category == "$200,000 or more")
            .unwrap();
        assert_eq!(top.count, 15.0);
        let bottom = table
            .group_records("income")
            .find(|r| r.category == "Less than $10,000")
            .unwrap();
        assert_eq!(bottom.count, 0.0);
        tax.validate_table(&table).unwrap();
        assert_eq!(
            tax.declared_categories("income"),
            CategoryTaxonomy::acs5().declared_categories("income")
        );
    }

    #[test]
    fn decennial_2000_sums_male_and_female_rows() {
        let tax = CategoryTaxonomy::decennial_2000();
        let raw = vec![
            CountRecord::new("bg", "educ", "P037001", 30.0),
            CountRecord::new("bg", "educ", "P037015", 10.0),
            CountRecord::new("bg", "educ", "P037031", 12.0),
            CountRecord::new("bg", "empl", "P043003", 4.0),
            CountRecord::new("bg", "empl", "P043008", 5.0).with_margin_of_error(2.0),
            CountRecord::new("bg", "empl", "P043006", 1.0).with_margin_of_error(1.5),
        ];
        let table = tax.apply(&raw).unwrap();
        let bachelors = table
            .records
            .iter()
            .find(|r| r.category == "Bachelor's degree")
            .unwrap();
        assert_eq!(bachelors.count, 22.0);
        let employed = table.records.iter().find(|r| r.category == "Employed").unwrap();
        assert_eq!(employed.count, 9.0);
        assert_eq!(employed.margin_of_error, None);
        let nilf = table
            .records
            .iter()
            .find(|r| r.category == "Not in labor force")
            .unwrap();
        assert_eq!(nilf.margin_of_error, Some(1.5));
        assert_eq!(table.reported_totals[0].total, 30.0);
    }

    #[test]
    fn signed_rules_subtract() {
        let tax = CategoryTaxonomy::new().with_group(
            GroupTaxonomy::new("empl", "Employment", ["Employed", "Unemployed"])
                .rule("labor_force", RawRule::Combine(vec![("Unemployed".into(), 1.0)]))
                .rule(
                    "employed",
                    RawRule::Combine(vec![("Employed".into(), 1.0), ("Unemployed".into(), -1.0)]),
                ),
        );
        let table = tax
            .apply(&[
                CountRecord::new("u", "empl", "labor_force", 100.0),
                CountRecord::new("u", "empl", "employed", 93.0),
            ])
            .unwrap();
        let counts: Vec<(&str, f64)> = table
            .records
            .iter()
            .map(|r| (r.category.as_str(), r.count))
            .collect();
        assert_eq!(counts, vec![("Employed", 93.0), ("Unemployed", 7.0)]);

        let err = tax
            .apply(&[
                CountRecord::new("u", "empl", "labor_force", 10.0),
                CountRecord::new("u", "empl", "employed", 93.0),
            ])
            .unwrap_err();
        assert!(matches!(reason(err), ViolationReason::NegativeCombinedCount(c) if c == -83.0));
    }

    #[test]
    fn unknown_group_and_label_are_rejected() {
        let tax = CategoryTaxonomy::acs5();
        let e = tax
            .apply(&[CountRecord::new("bg", "tenure", "B25003_002", 1.0)])
            .unwrap_err();
        assert_eq!(reason(e), ViolationReason::UnknownCategoryGroup);
        let e = tax
            .apply(&[CountRecord::new("bg", "race", "B03002_099", 1.0)])
            .unwrap_err();
        assert_eq!(reason(e), ViolationReason::UnknownCategory);
    }

    #[test]
    fn canonical_labels_map_to_themselves() {
        let tax = CategoryTaxonomy::acs5();
        let table = tax
            .apply(&[CountRecord::new("bg", "race", "Asian alone", 3.0).with_margin_of_error(1.0)])
            .unwrap();
        assert_eq!(table.records[0].category, "Asian alone");
        assert_eq!(table.records[0].margin_of_error, Some(1.0));
    }

    #[test]
    fn validate_table_flags_undeclared_category() {
        let tax = CategoryTaxonomy::acs5();
        let table = CountTable::new(vec![CountRecord::new("bg", "race", "Martian", 1.0)]);
        assert_eq!(
            reason(tax.validate_table(&table).unwrap_err()),
            ViolationReason::UnknownCategory
        );
        assert_eq!(tax.declared_categories("empl").len(), 4);
        assert!(tax.declared_categories("tenure").is_empty());
    }
}
