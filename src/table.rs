//! Long-format count records: the engine's input snapshot.

use std::collections::{BTreeMap, BTreeSet};

use crate::joint::JointCountTable;
use crate::{Result, SchemaViolation, ViolationReason};

/// One count for a (unit, category group, category) cell.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CountRecord {
    pub unit_id: String,
    pub category_group: String,
    pub category: String,
    pub count: f64,
    /// Survey margin of error, carried through untouched.
    pub margin_of_error: Option<f64>,
}

impl CountRecord {
    pub fn new(
        unit_id: impl Into<String>,
        category_group: impl Into<String>,
        category: impl Into<String>,
        count: f64,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            category_group: category_group.into(),
            category: category.into(),
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

/// A group total reported by the source itself (e.g. ACS `B19001_001`).
///
/// Reported totals never enter the category set; they only back consistency checks.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReportedTotal {
    pub unit_id: String,
    pub category_group: String,
    pub total: f64,
}

/// The full input snapshot for a run.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CountTable {
    pub records: Vec<CountRecord>,
    pub reported_totals: Vec<ReportedTotal>,
    /// Cross-tabulated counts for two-dimensional (joint) divergence.
    pub joint: Vec<JointCountTable>,
}

impl CountTable {
    #[must_use]
    pub fn new(records: Vec<CountRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_reported_totals(mut self, totals: Vec<ReportedTotal>) -> Self {
        self.reported_totals = totals;
        self
    }

    #[must_use]
    pub fn with_joint(mut self, joint: JointCountTable) -> Self {
        self.joint.push(joint);
        self
    }

    /// Category groups present in the one-way records, sorted.
    #[must_use]
    pub fn category_groups(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .map(|r| r.category_group.as_str())
            .collect()
    }

    /// Every unit named anywhere in the snapshot, sorted.
    #[must_use]
    pub fn unit_ids(&self) -> BTreeSet<&str> {
        let mut units: BTreeSet<&str> = self.records.iter().map(|r| r.unit_id.as_str()).collect();
        units.extend(self.reported_totals.iter().map(|t| t.unit_id.as_str()));
        for j in &self.joint {
            units.extend(j.records.iter().map(|r| r.unit_id.as_str()));
        }
        units
    }

    /// Records of one category group, in input order.
    pub fn group_records<'a>(
        &'a self,
        category_group: &'a str,
    ) -> impl Iterator<Item = &'a CountRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.category_group == category_group)
    }

    /// Reject the snapshot at the first record that breaks the input contract.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SegregationError::SchemaViolation`] naming the record for empty
    /// identifiers, negative or non-finite counts, and duplicate keys (in the records, the
    /// reported totals, or any joint table).
    pub fn validate(&self) -> Result<()> {
        let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();
        for (index, r) in self.records.iter().enumerate() {
            check_cell(
                index,
                &r.unit_id,
                &r.category_group,
                &r.category,
                r.count,
            )?;
            if !seen.insert((r.unit_id.as_str(), r.category_group.as_str(), r.category.as_str())) {
                return Err(violation(
                    index,
                    &r.unit_id,
                    &r.category_group,
                    &r.category,
                    ViolationReason::DuplicateKey,
                ));
            }
        }

        let mut totals: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for (index, t) in self.reported_totals.iter().enumerate() {
            check_cell(index, &t.unit_id, &t.category_group, "total", t.total)?;
            if totals
                .insert((t.unit_id.as_str(), t.category_group.as_str()), index)
                .is_some()
            {
                return Err(violation(
                    index,
                    &t.unit_id,
                    &t.category_group,
                    "total",
                    ViolationReason::DuplicateKey,
                ));
            }
        }

        for j in &self.joint {
            j.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn violation(
    index: usize,
    unit_id: &str,
    category_group: &str,
    category: &str,
    reason: ViolationReason,
) -> crate::SegregationError {
    SchemaViolation {
        index,
        unit_id: unit_id.to_string(),
        category_group: category_group.to_string(),
        category: category.to_string(),
        reason,
    }
    .into()
}

/// Shared per-cell checks: identifiers present, count finite and non-negative.
pub(crate) fn check_cell(
    index: usize,
    unit_id: &str,
    category_group: &str,
    category: &str,
    count: f64,
) -> Result<()> {
    if unit_id.is_empty() || category_group.is_empty() || category.is_empty() {
        return Err(violation(
            index,
            unit_id,
            category_group,
            category,
            ViolationReason::EmptyIdentifier,
        ));
    }
    if !count.is_finite() {
        return Err(violation(
            index,
            unit_id,
            category_group,
            category,
            ViolationReason::NonFiniteCount(count),
        ));
    }
    if count < 0.0 {
        return Err(violation(
            index,
            unit_id,
            category_group,
            category,
            ViolationReason::NegativeCount(count),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegregationError;

    fn schema_reason(e: SegregationError) -> (usize, ViolationReason) {
        match e {
            SegregationError::SchemaViolation(v) => (v.index, v.reason),
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn negative_count_is_rejected_with_record_index() {
        let t = CountTable::new(vec![
            CountRecord::new("u1", "race", "White alone", 10.0),
            CountRecord::new("u1", "race", "Asian alone", -1.0),
        ]);
        let (idx, reason) = schema_reason(t.validate().unwrap_err());
        assert_eq!(idx, 1);
        assert_eq!(reason, ViolationReason::NegativeCount(-1.0));
    }

    #[test]
    fn nan_and_duplicates_are_rejected() {
        let t = CountTable::new(vec![CountRecord::new("u1", "race", "x", f64::NAN)]);
        let (_, reason) = schema_reason(t.validate().unwrap_err());
        assert!(matches!(reason, ViolationReason::NonFiniteCount(_)));

        let t = CountTable::new(vec![
            CountRecord::new("u1", "race", "x", 1.0),
            CountRecord::new("u1", "race", "x", 2.0),
        ]);
        let (idx, reason) = schema_reason(t.validate().unwrap_err());
        assert_eq!(idx, 1);
        assert_eq!(reason, ViolationReason::DuplicateKey);
    }

    #[test]
    fn same_category_in_different_groups_is_fine() {
        let t = CountTable::new(vec![
            CountRecord::new("u1", "race", "other", 1.0),
            CountRecord::new("u1", "income", "other", 2.0),
        ]);
        assert!(t.validate().is_ok());
        assert_eq!(
            t.category_groups().into_iter().collect::<Vec<_>>(),
            vec!["income", "race"]
        );
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let t = CountTable::new(vec![CountRecord::new("", "race", "x", 1.0)]);
        let (_, reason) = schema_reason(t.validate().unwrap_err());
        assert_eq!(reason, ViolationReason::EmptyIdentifier);
    }

    #[test]
    fn unit_ids_include_reported_totals() {
        let t = CountTable::new(vec![CountRecord::new("u1", "race", "x", 1.0)])
            .with_reported_totals(vec![ReportedTotal {
                unit_id: "u2".into(),
                category_group: "race".into(),
                total: 0.0,
            }]);
        assert_eq!(t.unit_ids().into_iter().collect::<Vec<_>>(), vec!["u1", "u2"]);
    }
}
