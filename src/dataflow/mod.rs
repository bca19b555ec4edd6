//! Dataflows: the built data of a model, as a list of segments.

pub mod status;

pub use status::{dataflow_status, fused_status, segment_status, DataflowDisplayStatus, SegmentDisplayStatus};

use crate::index::LayoutId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealizationStatus {
    #[default]
    Online,
    Offline,
    Broken,
}

/// Half-open time range `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentRange {
    pub start: i64,
    pub end: i64,
}

impl SegmentRange {
    pub const FULL: SegmentRange = SegmentRange {
        start: 0,
        end: i64::MAX,
    };

    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &SegmentRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Covers `other` and is strictly larger.
    pub fn strictly_covers(&self, other: &SegmentRange) -> bool {
        self.start <= other.start && other.end <= self.end && self != other
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    #[default]
    New,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    New,
    Ready,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPartition {
    pub partition_id: u64,
    pub status: PartitionStatus,
}

/// Built data of one layout within a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLayout {
    pub rows: u64,
    pub byte_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub range: SegmentRange,
    #[serde(default)]
    pub status: SegmentStatus,
    #[serde(default)]
    pub snapshot_ready: bool,
    #[serde(default)]
    pub dict_ready: bool,
    #[serde(default)]
    pub flat_table_ready: bool,
    #[serde(default)]
    pub fact_view_ready: bool,
    #[serde(default)]
    pub layouts: BTreeMap<LayoutId, DataLayout>,
    #[serde(default)]
    pub multi_partitions: Vec<SegmentPartition>,
}

impl Segment {
    pub fn new(range: SegmentRange) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            range,
            status: SegmentStatus::New,
            snapshot_ready: false,
            dict_ready: false,
            flat_table_ready: false,
            fact_view_ready: false,
            layouts: BTreeMap::new(),
            multi_partitions: Vec::new(),
        }
    }

    /// A segment over the whole time line, waiting to be built.
    pub fn pending_full_range() -> Self {
        Self::new(SegmentRange::FULL)
    }

    /// A built segment with every readiness flag set.
    pub fn ready(range: SegmentRange) -> Self {
        Self {
            status: SegmentStatus::Ready,
            snapshot_ready: true,
            dict_ready: true,
            flat_table_ready: true,
            fact_view_ready: true,
            ..Self::new(range)
        }
    }

    pub fn with_layout(mut self, layout: LayoutId, rows: u64) -> Self {
        self.layouts.insert(
            layout,
            DataLayout {
                rows,
                byte_size: rows * 64,
            },
        );
        self
    }

    pub fn data_ready(&self) -> bool {
        self.snapshot_ready && self.dict_ready && self.flat_table_ready && self.fact_view_ready
    }

    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataflow {
    /// Same as the owning model's id.
    pub id: String,
    pub project: String,
    #[serde(default)]
    pub mvcc: u64,
    #[serde(default)]
    pub status: RealizationStatus,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Dataflow {
    pub fn new(model_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            id: model_id.into(),
            project: project.into(),
            mvcc: 0,
            status: RealizationStatus::Online,
            segments: Vec::new(),
        }
    }

    pub fn has_segments(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn clear_segments(&mut self) {
        self.segments.clear();
    }

    /// Drop built data of `layouts` from every segment.
    pub fn purge_layouts(&mut self, layouts: &BTreeSet<LayoutId>) {
        for segment in &mut self.segments {
            segment.layouts.retain(|id, _| !layouts.contains(id));
        }
    }

    /// Layouts with rows in at least one complete segment.
    pub fn available_layouts(&self) -> BTreeSet<LayoutId> {
        self.segments
            .iter()
            .filter(|s| s.is_complete())
            .flat_map(|s| s.layouts.iter())
            .filter(|(_, data)| data.rows > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Two complete segments that overlap without one being a refresh or a
    /// merge of the other.
    pub fn overlapping_segments(&self) -> Option<(&Segment, &Segment)> {
        let complete: Vec<&Segment> = self.segments.iter().filter(|s| s.is_complete()).collect();
        for (i, a) in complete.iter().enumerate() {
            for b in &complete[i + 1..] {
                let legal = a.range == b.range
                    || a.range.strictly_covers(&b.range)
                    || b.range.strictly_covers(&a.range);
                if a.range.overlaps(&b.range) && !legal {
                    return Some((a, b));
                }
            }
        }
        None
    }
}
