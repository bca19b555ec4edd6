//! Index plans: the physical materialization plan of a model.
//!
//! ```text
//!  IndexPlan
//!  ├── rule_based_index ──expand──▶ [LayoutSpec]
//!  ├── indexes
//!  │   ├── IndexEntity 0          (aggregation, dims + measures)
//!  │   │   ├── LayoutEntity 1
//!  │   │   └── LayoutEntity 2
//!  │   ├── IndexEntity 10000
//!  │   └── IndexEntity 20000000000 (table index, dims only)
//!  └── to_be_deleted  (layouts the rule must not bring back)
//! ```
//!
//! Index ids step by [`INDEX_ID_STEP`]; a layout id is its index id plus a
//! per-index offset. Neither counter is ever rewound, so a retired layout id
//! is never handed out again.

pub mod expander;
pub mod rule;

pub use expander::{expand, group_combinations, ExpandOptions, LayoutSpec};
pub use rule::{AggregationGroup, RuleBasedIndex, RuleError, SelectRule};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type LayoutId = u64;

pub const INDEX_ID_STEP: u64 = 10_000;
/// First id of the table-index space; aggregation indexes stay below it.
pub const TABLE_INDEX_START_ID: u64 = 20_000_000_000;
pub const DEFAULT_STORAGE_TYPE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntity {
    pub id: LayoutId,
    /// Dimension ids followed by measure ids.
    pub col_order: Vec<u32>,
    /// Produced by the rule.
    #[serde(default)]
    pub auto: bool,
    /// Requested by a user.
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub base: bool,
    #[serde(default = "default_storage_type")]
    pub storage_type: u32,
}

fn default_storage_type() -> u32 {
    DEFAULT_STORAGE_TYPE
}

impl LayoutEntity {
    pub fn contains_any(&self, ids: &BTreeSet<u32>) -> bool {
        self.col_order.iter().any(|c| ids.contains(c))
    }

    pub fn is_table_index(&self) -> bool {
        self.id >= TABLE_INDEX_START_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntity {
    pub id: u64,
    pub dimensions: Vec<u32>,
    #[serde(default)]
    pub measures: Vec<u32>,
    pub layouts: Vec<LayoutEntity>,
    pub next_layout_offset: u64,
}

impl IndexEntity {
    fn new(id: u64, dimensions: Vec<u32>, measures: Vec<u32>) -> Self {
        Self {
            id,
            dimensions,
            measures,
            layouts: Vec::new(),
            next_layout_offset: 1,
        }
    }

    pub fn is_table_index(&self) -> bool {
        self.id >= TABLE_INDEX_START_ID
    }

    fn same_columns(&self, dimensions: &[u32], measures: &[u32]) -> bool {
        let set = |ids: &[u32]| ids.iter().copied().collect::<BTreeSet<u32>>();
        set(&self.dimensions) == set(dimensions) && set(&self.measures) == set(measures)
    }

    fn push_layout(&mut self, col_order: Vec<u32>) -> &mut LayoutEntity {
        let id = self.id + self.next_layout_offset;
        self.next_layout_offset += 1;
        self.layouts.push(LayoutEntity {
            id,
            col_order,
            auto: false,
            manual: false,
            base: false,
            storage_type: DEFAULT_STORAGE_TYPE,
        });
        let last = self.layouts.len() - 1;
        &mut self.layouts[last]
    }
}

/// Layout changes produced by one materialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDiff {
    pub to_remove: BTreeSet<LayoutId>,
    pub to_add: BTreeSet<LayoutId>,
    pub to_refresh: BTreeSet<LayoutId>,
}

impl LayoutDiff {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty() && self.to_refresh.is_empty()
    }
}

/// Column-level changes a materialization must account for.
#[derive(Debug, Clone, Copy)]
pub struct ColumnChanges<'a> {
    /// Dimension and measure ids that no longer exist.
    pub tombed: &'a BTreeSet<u32>,
    /// Ids whose data type changed; layouts holding them need a refresh.
    pub type_changed: &'a BTreeSet<u32>,
    /// Old id to new id for columns re-created under a new id.
    pub renumbered: &'a BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPlan {
    /// Same as the owning model's id.
    pub id: String,
    pub project: String,
    #[serde(default)]
    pub mvcc: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_based_index: Option<RuleBasedIndex>,
    #[serde(default)]
    pub indexes: Vec<IndexEntity>,
    pub next_aggregation_index_id: u64,
    pub next_table_index_id: u64,
    /// Blacklisted layouts by id, with the column order the rule must not
    /// bring back.
    #[serde(default)]
    pub to_be_deleted: BTreeMap<LayoutId, Vec<u32>>,
}

impl IndexPlan {
    pub fn new(model_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            id: model_id.into(),
            project: project.into(),
            mvcc: 0,
            rule_based_index: None,
            indexes: Vec::new(),
            next_aggregation_index_id: 0,
            next_table_index_id: TABLE_INDEX_START_ID,
            to_be_deleted: BTreeMap::new(),
        }
    }

    pub fn layouts(&self) -> impl Iterator<Item = &LayoutEntity> {
        self.indexes.iter().flat_map(|i| i.layouts.iter())
    }

    pub fn layout(&self, id: LayoutId) -> Option<&LayoutEntity> {
        self.layouts().find(|l| l.id == id)
    }

    pub fn layout_ids(&self) -> BTreeSet<LayoutId> {
        self.layouts().map(|l| l.id).collect()
    }

    /// Layouts whose column order contains `column`.
    pub fn layouts_containing(&self, column: u32) -> BTreeSet<LayoutId> {
        self.layouts()
            .filter(|l| l.col_order.contains(&column))
            .map(|l| l.id)
            .collect()
    }

    fn layout_mut(&mut self, col_order: &[u32], table_index: bool) -> Option<&mut LayoutEntity> {
        self.indexes
            .iter_mut()
            .filter(|i| i.is_table_index() == table_index)
            .flat_map(|i| i.layouts.iter_mut())
            .find(|l| l.col_order == col_order)
    }

    fn allocate_aggregation(&mut self, dimensions: &[u32], measures: &[u32]) -> &mut LayoutEntity {
        let col_order: Vec<u32> = dimensions.iter().chain(measures.iter()).copied().collect();
        let position = match self
            .indexes
            .iter()
            .position(|i| !i.is_table_index() && i.same_columns(dimensions, measures))
        {
            Some(position) => position,
            None => {
                let id = self.next_aggregation_index_id;
                self.next_aggregation_index_id += INDEX_ID_STEP;
                self.indexes
                    .push(IndexEntity::new(id, dimensions.to_vec(), measures.to_vec()));
                self.indexes.len() - 1
            }
        };
        self.indexes[position].push_layout(col_order)
    }

    fn allocate_table_index(&mut self, col_order: Vec<u32>) -> &mut LayoutEntity {
        let id = self.next_table_index_id;
        self.next_table_index_id += INDEX_ID_STEP;
        self.indexes.push(IndexEntity::new(id, col_order.clone(), Vec::new()));
        let last = self.indexes.len() - 1;
        self.indexes[last].push_layout(col_order)
    }

    /// Add a manual table index over `col_order`, reusing an identical one.
    pub fn add_table_index(&mut self, col_order: Vec<u32>) -> LayoutId {
        if let Some(existing) = self.layout_mut(&col_order, true) {
            existing.manual = true;
            return existing.id;
        }
        let layout = self.allocate_table_index(col_order);
        layout.manual = true;
        layout.id
    }

    /// Add a manual aggregation layout; an existing identical layout is
    /// flagged manual instead.
    pub fn add_manual_layout(&mut self, dimensions: &[u32], measures: &[u32]) -> LayoutId {
        let col_order: Vec<u32> = dimensions.iter().chain(measures.iter()).copied().collect();
        self.to_be_deleted.retain(|_, order| *order != col_order);
        if let Some(existing) = self.layout_mut(&col_order, false) {
            existing.manual = true;
            return existing.id;
        }
        let layout = self.allocate_aggregation(dimensions, measures);
        layout.manual = true;
        layout.id
    }

    /// Drop layouts from the plan. Returns the ids actually removed.
    pub fn remove_layouts(&mut self, ids: &BTreeSet<LayoutId>) -> BTreeSet<LayoutId> {
        let mut removed = BTreeSet::new();
        for index in &mut self.indexes {
            index.layouts.retain(|l| {
                let hit = ids.contains(&l.id);
                if hit {
                    removed.insert(l.id);
                }
                !hit
            });
        }
        self.indexes.retain(|i| !i.layouts.is_empty());
        removed
    }

    /// Remove layouts and remember their column orders so the rule does not
    /// recreate them.
    pub fn blacklist(&mut self, ids: &BTreeSet<LayoutId>) -> BTreeSet<LayoutId> {
        let entries: Vec<(LayoutId, Vec<u32>)> = self
            .layouts()
            .filter(|l| ids.contains(&l.id))
            .map(|l| (l.id, l.col_order.clone()))
            .collect();
        self.to_be_deleted.extend(entries);
        self.remove_layouts(ids)
    }

    /// Reconcile the plan's layouts with `specs`, the current expansion of the
    /// rule.
    ///
    /// - layouts referencing a tombed id are removed; manual ones whose tombed
    ///   ids were all renumbered are re-created over the new ids
    /// - rule layouts the rule no longer produces are removed, unless manual
    /// - specs with no matching layout get fresh ids, unless blacklisted
    /// - surviving layouts holding a type-changed id are refreshed
    /// - blacklist entries referencing a tombed id are forgotten
    pub fn materialize(&mut self, specs: &[LayoutSpec], changes: ColumnChanges<'_>) -> LayoutDiff {
        let mut diff = LayoutDiff::default();
        let mut carried: Vec<(Vec<u32>, bool, usize)> = Vec::new();

        self.to_be_deleted
            .retain(|_, order| !order.iter().any(|c| changes.tombed.contains(c)));

        for index in &mut self.indexes {
            let dimension_count = index.dimensions.len();
            index.layouts.retain(|layout| {
                if !layout.contains_any(changes.tombed) {
                    return true;
                }
                diff.to_remove.insert(layout.id);
                let all_renumbered = layout
                    .col_order
                    .iter()
                    .filter(|c| changes.tombed.contains(c))
                    .all(|c| changes.renumbered.contains_key(c));
                if layout.manual && all_renumbered {
                    let order = layout
                        .col_order
                        .iter()
                        .map(|c| *changes.renumbered.get(c).unwrap_or(c))
                        .collect();
                    carried.push((order, layout.is_table_index(), dimension_count));
                }
                false
            });
        }

        let produced: BTreeSet<Vec<u32>> = specs.iter().map(LayoutSpec::col_order).collect();
        for index in &mut self.indexes {
            index.layouts.retain_mut(|layout| {
                if !layout.auto || produced.contains(&layout.col_order) {
                    return true;
                }
                if layout.manual {
                    layout.auto = false;
                    layout.base = false;
                    return true;
                }
                diff.to_remove.insert(layout.id);
                false
            });
        }

        let blacklisted: BTreeSet<Vec<u32>> = self.to_be_deleted.values().cloned().collect();
        for spec in specs {
            let col_order = spec.col_order();
            if let Some(existing) = self.layout_mut(&col_order, false) {
                existing.auto = true;
                existing.base = spec.base;
                continue;
            }
            if blacklisted.contains(&col_order) {
                continue;
            }
            let layout = self.allocate_aggregation(&spec.dimensions, &spec.measures);
            layout.auto = true;
            layout.base = spec.base;
            diff.to_add.insert(layout.id);
        }

        for (col_order, table_index, dimension_count) in carried {
            if let Some(existing) = self.layout_mut(&col_order, table_index) {
                existing.manual = true;
                continue;
            }
            let layout = if table_index {
                self.allocate_table_index(col_order)
            } else {
                let (dimensions, measures) = col_order.split_at(dimension_count.min(col_order.len()));
                let (dimensions, measures) = (dimensions.to_vec(), measures.to_vec());
                self.allocate_aggregation(&dimensions, &measures)
            };
            layout.manual = true;
            diff.to_add.insert(layout.id);
        }

        for index in &mut self.indexes {
            // base flag lives on at most one layout
            for layout in &mut index.layouts {
                if layout.base && !specs.iter().any(|s| s.base && s.col_order() == layout.col_order) {
                    layout.base = false;
                }
            }
        }

        diff.to_refresh = self
            .layouts()
            .filter(|l| l.contains_any(changes.type_changed) && !diff.to_add.contains(&l.id))
            .map(|l| l.id)
            .collect();

        self.indexes.retain(|i| !i.layouts.is_empty());
        diff
    }
}
