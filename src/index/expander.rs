//! Rule-based layout expansion.
//!
//! Pure function from a [`RuleBasedIndex`] to the set of dimension/measure
//! combinations it makes legal. Id allocation is not done here; see
//! [`IndexPlan::materialize`](super::IndexPlan::materialize).

use super::rule::{AggregationGroup, RuleBasedIndex, RuleError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One concrete layout produced by a rule, before id allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSpec {
    /// Dimensions in rule column order.
    pub dimensions: Vec<u32>,
    /// Measures in rule column order.
    pub measures: Vec<u32>,
    /// Whether this is the base layout (all dimensions and measures).
    pub base: bool,
}

impl LayoutSpec {
    /// Dimensions followed by measures.
    pub fn col_order(&self) -> Vec<u32> {
        self.dimensions
            .iter()
            .chain(self.measures.iter())
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandOptions {
    pub base_layout: bool,
    pub max_combinations: usize,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            base_layout: true,
            max_combinations: 4096,
        }
    }
}

impl From<&crate::config::LayoutSettings> for ExpandOptions {
    fn from(settings: &crate::config::LayoutSettings) -> Self {
        Self {
            base_layout: settings.base_layout_enabled,
            max_combinations: settings.max_combinations,
        }
    }
}

/// Expand `rule` into its layout set.
///
/// The rule is validated first; a malformed rule yields no output.
/// Identical dimension sets produced by several groups are emitted once, with
/// the union of the groups' measures.
pub fn expand(rule: &RuleBasedIndex, options: ExpandOptions) -> Result<Vec<LayoutSpec>, RuleError> {
    rule.validate(options.max_combinations)?;

    let dim_rank = rank(&rule.dimensions);
    let measure_rank = rank(&rule.measures);

    // dims -> measures, in first-produced order
    let mut order: Vec<BTreeSet<u32>> = Vec::new();
    let mut merged: BTreeMap<BTreeSet<u32>, BTreeSet<u32>> = BTreeMap::new();

    for group in &rule.aggregation_groups {
        let measures: BTreeSet<u32> = group
            .measures
            .as_ref()
            .unwrap_or(&rule.measures)
            .iter()
            .copied()
            .collect();
        for dims in group_combinations(group) {
            match merged.get_mut(&dims) {
                Some(existing) => existing.extend(measures.iter().copied()),
                None => {
                    order.push(dims.clone());
                    merged.insert(dims, measures.clone());
                }
            }
        }
    }

    let mut specs: Vec<LayoutSpec> = order
        .into_iter()
        .map(|dims| {
            let measures = merged.remove(&dims).unwrap_or_default();
            LayoutSpec {
                dimensions: sorted_by_rank(dims, &dim_rank),
                measures: sorted_by_rank(measures, &measure_rank),
                base: false,
            }
        })
        .collect();

    if options.base_layout && !(rule.dimensions.is_empty() && rule.measures.is_empty()) {
        let base = LayoutSpec {
            dimensions: rule.dimensions.clone(),
            measures: rule.measures.clone(),
            base: true,
        };
        match specs
            .iter_mut()
            .find(|s| s.dimensions == base.dimensions && s.measures == base.measures)
        {
            Some(existing) => existing.base = true,
            None => specs.push(base),
        }
    }

    Ok(specs)
}

/// Dimension sets legal under one group, deduplicated, mandatory dims
/// included, `dim_cap` applied.
pub fn group_combinations(group: &AggregationGroup) -> Vec<BTreeSet<u32>> {
    let rule = &group.select_rule;

    // every cell offers a list of alternatives; a combination picks one each
    let mut cells: Vec<Vec<Vec<u32>>> = Vec::new();
    for chain in &rule.hierarchy_dims {
        cells.push((0..=chain.len()).map(|n| chain[..n].to_vec()).collect());
    }
    for joint in &rule.joint_dims {
        cells.push(vec![Vec::new(), joint.clone()]);
    }
    for dim in group.loose_dims() {
        cells.push(vec![Vec::new(), vec![dim]]);
    }

    let mut combinations: Vec<BTreeSet<u32>> = vec![rule.mandatory_dims.iter().copied().collect()];
    for cell in &cells {
        combinations = combinations
            .iter()
            .flat_map(|base| {
                cell.iter().map(move |choice| {
                    let mut next = base.clone();
                    next.extend(choice.iter().copied());
                    next
                })
            })
            .collect();
    }

    let mut seen = BTreeSet::new();
    combinations
        .into_iter()
        .filter(|dims| group.dim_cap.map_or(true, |cap| dims.len() <= cap))
        .filter(|dims| seen.insert(dims.clone()))
        .collect()
}

fn rank(ids: &[u32]) -> BTreeMap<u32, usize> {
    ids.iter().enumerate().map(|(i, id)| (*id, i)).collect()
}

fn sorted_by_rank(ids: BTreeSet<u32>, rank: &BTreeMap<u32, usize>) -> Vec<u32> {
    let mut ids: Vec<u32> = ids.into_iter().collect();
    ids.sort_by_key(|id| (rank.get(id).copied().unwrap_or(usize::MAX), *id));
    ids
}
