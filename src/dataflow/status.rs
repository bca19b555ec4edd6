//! User-facing status of segments and dataflows.
//!
//! Pure projections of stored state; nothing here mutates.

use super::{Dataflow, PartitionStatus, RealizationStatus, Segment};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentDisplayStatus {
    Loading,
    Refreshing,
    Merging,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataflowDisplayStatus {
    Online,
    Offline,
    Warning,
    Broken,
}

/// Status of `segment` among the segments of its dataflow.
///
/// Of two segments over the same range, the earlier one in `siblings` is the
/// one being replaced and keeps serving until the swap.
pub fn segment_status(segment: &Segment, siblings: &[Segment]) -> SegmentDisplayStatus {
    if !segment.data_ready() {
        return SegmentDisplayStatus::Loading;
    }
    let others = || siblings.iter().filter(|s| s.id != segment.id);
    let refreshing_partition = segment
        .multi_partitions
        .iter()
        .any(|p| p.status == PartitionStatus::Refresh);
    let replaces_older = siblings
        .iter()
        .take_while(|s| s.id != segment.id)
        .any(|s| s.range == segment.range);
    if refreshing_partition || replaces_older {
        return SegmentDisplayStatus::Refreshing;
    }
    if others().any(|s| segment.range.strictly_covers(&s.range)) {
        return SegmentDisplayStatus::Merging;
    }
    SegmentDisplayStatus::Online
}

pub fn dataflow_status(dataflow: &Dataflow) -> DataflowDisplayStatus {
    match dataflow.status {
        RealizationStatus::Broken => DataflowDisplayStatus::Broken,
        RealizationStatus::Offline => DataflowDisplayStatus::Offline,
        RealizationStatus::Online if dataflow.available_layouts().is_empty() => {
            DataflowDisplayStatus::Warning
        }
        RealizationStatus::Online => DataflowDisplayStatus::Online,
    }
}

/// Status of a fused batch + streaming model.
pub fn fused_status(batch: &Dataflow, streaming: &Dataflow) -> DataflowDisplayStatus {
    use DataflowDisplayStatus::*;
    match (dataflow_status(batch), dataflow_status(streaming)) {
        (Broken, _) | (_, Broken) => Broken,
        (Online, Offline) | (Offline, Online) => Warning,
        (Offline, Offline) | (Warning, Offline) | (Offline, Warning) => Offline,
        (Warning, Warning) => Warning,
        (Online, Online) | (Online, Warning) | (Warning, Online) => Online,
    }
}
