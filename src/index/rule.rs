//! Aggregation-group rules.
//!
//! A [`RuleBasedIndex`] names the dimensions and measures the rule may use and
//! a list of [`AggregationGroup`]s. Each group narrows the legal dimension
//! combinations through its [`SelectRule`]:
//!
//! ```text
//!   includes = [A, B, C, D, E, F]
//!   hierarchy  [A, B]      -> {} {A} {A,B}
//!   joint      [C, D]      -> {} {C,D}
//!   mandatory  [E]         -> unioned into every combination
//!   loose      F           -> {} {F}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("aggregation group {group}: dimension {dim} is not in includes")]
    NotInIncludes { group: usize, dim: u32 },

    #[error("aggregation group {group}: dimension {dim} is used by more than one select rule")]
    OverlappingRule { group: usize, dim: u32 },

    #[error("aggregation group {group}: joint {joint} needs at least two dimensions")]
    JointTooSmall { group: usize, joint: usize },

    #[error("aggregation group {group}: dimension {dim} is not a rule dimension")]
    UnknownDimension { group: usize, dim: u32 },

    #[error("aggregation group {group}: measure {measure} is not a rule measure")]
    UnknownMeasure { group: usize, measure: u32 },

    #[error("aggregation group {group}: dimension {dim} is included twice")]
    DuplicateInclude { group: usize, dim: u32 },

    #[error("aggregation group {group}: dim_cap must be positive")]
    ZeroDimCap { group: usize },

    #[error("aggregation group {group} expands to {count} combinations, limit is {limit}")]
    TooManyCombinations {
        group: usize,
        count: u128,
        limit: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectRule {
    #[serde(default)]
    pub hierarchy_dims: Vec<Vec<u32>>,
    #[serde(default)]
    pub mandatory_dims: Vec<u32>,
    #[serde(default)]
    pub joint_dims: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationGroup {
    pub includes: Vec<u32>,
    /// Measures for this group; `None` means every rule measure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measures: Option<Vec<u32>>,
    #[serde(default)]
    pub select_rule: SelectRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim_cap: Option<usize>,
}

impl AggregationGroup {
    pub fn new(includes: impl IntoIterator<Item = u32>) -> Self {
        Self {
            includes: includes.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_hierarchy(mut self, chain: impl IntoIterator<Item = u32>) -> Self {
        self.select_rule
            .hierarchy_dims
            .push(chain.into_iter().collect());
        self
    }

    pub fn with_joint(mut self, joint: impl IntoIterator<Item = u32>) -> Self {
        self.select_rule.joint_dims.push(joint.into_iter().collect());
        self
    }

    pub fn with_mandatory(mut self, dims: impl IntoIterator<Item = u32>) -> Self {
        self.select_rule.mandatory_dims.extend(dims);
        self
    }

    pub fn with_dim_cap(mut self, cap: usize) -> Self {
        self.dim_cap = Some(cap);
        self
    }

    pub fn with_measures(mut self, measures: impl IntoIterator<Item = u32>) -> Self {
        self.measures = Some(measures.into_iter().collect());
        self
    }

    /// Dims of `includes` not claimed by a hierarchy, joint or mandatory rule.
    pub fn loose_dims(&self) -> Vec<u32> {
        let claimed: BTreeSet<u32> = self
            .select_rule
            .hierarchy_dims
            .iter()
            .chain(self.select_rule.joint_dims.iter())
            .flatten()
            .chain(self.select_rule.mandatory_dims.iter())
            .copied()
            .collect();
        self.includes
            .iter()
            .copied()
            .filter(|d| !claimed.contains(d))
            .collect()
    }

    /// Number of raw cell combinations before mandatory union and cap.
    pub fn combination_count(&self) -> u128 {
        let hierarchies = self
            .select_rule
            .hierarchy_dims
            .iter()
            .fold(1u128, |acc, chain| acc.saturating_mul(chain.len() as u128 + 1));
        let joints = 1u128
            .checked_shl(self.select_rule.joint_dims.len() as u32)
            .unwrap_or(u128::MAX);
        let loose = 1u128
            .checked_shl(self.loose_dims().len() as u32)
            .unwrap_or(u128::MAX);
        hierarchies.saturating_mul(joints).saturating_mul(loose)
    }

    fn validate(
        &self,
        group: usize,
        dimensions: &BTreeSet<u32>,
        measures: &BTreeSet<u32>,
        max_combinations: usize,
    ) -> Result<(), RuleError> {
        let mut includes = BTreeSet::new();
        for &dim in &self.includes {
            if !includes.insert(dim) {
                return Err(RuleError::DuplicateInclude { group, dim });
            }
            if !dimensions.contains(&dim) {
                return Err(RuleError::UnknownDimension { group, dim });
            }
        }

        let mut claimed = BTreeSet::new();
        let rule = &self.select_rule;
        for (index, joint) in rule.joint_dims.iter().enumerate() {
            if joint.len() < 2 {
                return Err(RuleError::JointTooSmall {
                    group,
                    joint: index,
                });
            }
        }
        let all_ruled = rule
            .hierarchy_dims
            .iter()
            .chain(rule.joint_dims.iter())
            .flatten()
            .chain(rule.mandatory_dims.iter());
        for &dim in all_ruled {
            if !includes.contains(&dim) {
                return Err(RuleError::NotInIncludes { group, dim });
            }
            if !claimed.insert(dim) {
                return Err(RuleError::OverlappingRule { group, dim });
            }
        }

        if let Some(group_measures) = &self.measures {
            if let Some(&measure) = group_measures.iter().find(|m| !measures.contains(m)) {
                return Err(RuleError::UnknownMeasure { group, measure });
            }
        }
        if self.dim_cap == Some(0) {
            return Err(RuleError::ZeroDimCap { group });
        }

        let count = self.combination_count();
        if count > max_combinations as u128 {
            return Err(RuleError::TooManyCombinations {
                group,
                count,
                limit: max_combinations,
            });
        }
        Ok(())
    }
}

/// Declarative generator of rule-derived layouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleBasedIndex {
    /// Rule dimensions in column order.
    pub dimensions: Vec<u32>,
    /// Rule measures in column order.
    pub measures: Vec<u32>,
    #[serde(default)]
    pub aggregation_groups: Vec<AggregationGroup>,
}

impl RuleBasedIndex {
    pub fn new(dimensions: impl IntoIterator<Item = u32>, measures: impl IntoIterator<Item = u32>) -> Self {
        Self {
            dimensions: dimensions.into_iter().collect(),
            measures: measures.into_iter().collect(),
            aggregation_groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: AggregationGroup) -> Self {
        self.aggregation_groups.push(group);
        self
    }

    pub fn validate(&self, max_combinations: usize) -> Result<(), RuleError> {
        let dimensions: BTreeSet<u32> = self.dimensions.iter().copied().collect();
        let measures: BTreeSet<u32> = self.measures.iter().copied().collect();
        for (index, group) in self.aggregation_groups.iter().enumerate() {
            group.validate(index, &dimensions, &measures, max_combinations)?;
        }
        Ok(())
    }

    /// Every id the rule mentions.
    pub fn referenced_ids(&self) -> BTreeSet<u32> {
        self.dimensions
            .iter()
            .chain(self.measures.iter())
            .copied()
            .collect()
    }

    /// Copy of the rule with every dimension and measure in `removed` taken out
    /// of dimensions, measures, includes and select rules.
    ///
    /// A hierarchy chain is truncated at its first removed dimension so the
    /// remaining prefix keeps its meaning. Joints that fall below two
    /// dimensions dissolve into loose dimensions.
    pub fn pruned(&self, removed: &BTreeSet<u32>) -> Self {
        let keep = |id: &u32| !removed.contains(id);
        let groups = self
            .aggregation_groups
            .iter()
            .map(|group| {
                let hierarchy_dims = group
                    .select_rule
                    .hierarchy_dims
                    .iter()
                    .map(|chain| chain.iter().copied().take_while(keep).collect::<Vec<_>>())
                    .filter(|chain| !chain.is_empty())
                    .collect::<Vec<_>>();
                // dims cut off below a removed hierarchy level leave the group
                let orphaned: BTreeSet<u32> = group
                    .select_rule
                    .hierarchy_dims
                    .iter()
                    .flat_map(|chain| chain.iter().copied().skip_while(keep))
                    .collect();
                let joint_dims = group
                    .select_rule
                    .joint_dims
                    .iter()
                    .map(|joint| joint.iter().copied().filter(keep).collect::<Vec<_>>())
                    .filter(|joint| joint.len() >= 2)
                    .collect();
                AggregationGroup {
                    includes: group
                        .includes
                        .iter()
                        .copied()
                        .filter(|d| keep(d) && !orphaned.contains(d))
                        .collect(),
                    measures: group
                        .measures
                        .as_ref()
                        .map(|m| m.iter().copied().filter(keep).collect()),
                    select_rule: SelectRule {
                        hierarchy_dims,
                        mandatory_dims: group
                            .select_rule
                            .mandatory_dims
                            .iter()
                            .copied()
                            .filter(keep)
                            .collect(),
                        joint_dims,
                    },
                    dim_cap: group.dim_cap,
                }
            })
            .filter(|group| !group.includes.is_empty())
            .collect();

        Self {
            dimensions: self.dimensions.iter().copied().filter(keep).collect(),
            measures: self.measures.iter().copied().filter(keep).collect(),
            aggregation_groups: groups,
        }
    }

    /// Copy of the rule with ids substituted through `renumbered`.
    pub fn remapped(&self, renumbered: &BTreeMap<u32, u32>) -> Self {
        let map = |id: &u32| *renumbered.get(id).unwrap_or(id);
        let map_all = |ids: &[u32]| ids.iter().map(map).collect::<Vec<_>>();
        Self {
            dimensions: map_all(&self.dimensions),
            measures: map_all(&self.measures),
            aggregation_groups: self
                .aggregation_groups
                .iter()
                .map(|group| AggregationGroup {
                    includes: map_all(&group.includes),
                    measures: group.measures.as_deref().map(map_all),
                    select_rule: SelectRule {
                        hierarchy_dims: group
                            .select_rule
                            .hierarchy_dims
                            .iter()
                            .map(|c| map_all(c))
                            .collect(),
                        mandatory_dims: map_all(&group.select_rule.mandatory_dims),
                        joint_dims: group
                            .select_rule
                            .joint_dims
                            .iter()
                            .map(|j| map_all(j))
                            .collect(),
                    },
                    dim_cap: group.dim_cap,
                })
                .collect(),
        }
    }
}
