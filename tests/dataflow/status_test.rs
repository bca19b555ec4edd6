// tests/dataflow/status_test.rs
use cubesync::config::Settings;
use cubesync::dataflow::{
    dataflow_status, fused_status, segment_status, Dataflow, DataflowDisplayStatus,
    PartitionStatus, RealizationStatus, Segment, SegmentDisplayStatus, SegmentPartition,
    SegmentRange,
};
use cubesync::events::ChannelEventSink;
use cubesync::model::BrokenReason;
use cubesync::store::MetadataStoreExt;
use cubesync::test_utils::{hierarchy_rule, init_test_logging, sales_model, sales_store, PROJECT};
use std::sync::Arc;

fn online(layout_rows: u64) -> Dataflow {
    let mut dataflow = Dataflow::new("m", PROJECT);
    dataflow
        .segments
        .push(Segment::ready(SegmentRange::new(0, 100)).with_layout(1, layout_rows));
    dataflow
}

fn with_status(status: RealizationStatus) -> Dataflow {
    Dataflow {
        status,
        ..online(10)
    }
}

#[test]
fn test_segment_lifecycle() {
    let january = Segment::ready(SegmentRange::new(0, 31));
    let mut pending = Segment::new(SegmentRange::new(31, 59));
    assert_eq!(segment_status(&pending, &[]), SegmentDisplayStatus::Loading);
    pending.snapshot_ready = true;
    pending.dict_ready = true;
    pending.flat_table_ready = true;
    assert_eq!(segment_status(&pending, &[]), SegmentDisplayStatus::Loading);
    pending.fact_view_ready = true;

    let siblings = vec![january.clone(), pending.clone()];
    assert_eq!(segment_status(&january, &siblings), SegmentDisplayStatus::Online);
    assert_eq!(segment_status(&pending, &siblings), SegmentDisplayStatus::Online);
}

#[test]
fn test_refresh_and_merge_are_derived_from_siblings() {
    let january = Segment::ready(SegmentRange::new(0, 31));
    let february = Segment::ready(SegmentRange::new(31, 59));
    let refresh = Segment::ready(SegmentRange::new(0, 31));
    let merged = Segment::ready(SegmentRange::new(0, 59));
    let siblings = vec![january.clone(), february.clone(), refresh.clone(), merged.clone()];

    assert_eq!(segment_status(&refresh, &siblings), SegmentDisplayStatus::Refreshing);
    // the segment being replaced keeps serving
    assert_eq!(segment_status(&january, &siblings), SegmentDisplayStatus::Online);
    assert_eq!(segment_status(&merged, &siblings), SegmentDisplayStatus::Merging);
    assert_eq!(segment_status(&february, &siblings), SegmentDisplayStatus::Online);
}

#[test]
fn test_refreshing_partition_marks_segment() {
    let mut segment = Segment::ready(SegmentRange::new(0, 31));
    segment.multi_partitions = vec![
        SegmentPartition {
            partition_id: 1,
            status: PartitionStatus::Ready,
        },
        SegmentPartition {
            partition_id: 2,
            status: PartitionStatus::Refresh,
        },
    ];
    assert_eq!(segment_status(&segment, &[]), SegmentDisplayStatus::Refreshing);
}

#[test]
fn test_dataflow_status() {
    assert_eq!(dataflow_status(&online(10)), DataflowDisplayStatus::Online);
    // online but nothing queryable
    assert_eq!(dataflow_status(&online(0)), DataflowDisplayStatus::Warning);
    assert_eq!(
        dataflow_status(&Dataflow::new("m", PROJECT)),
        DataflowDisplayStatus::Warning
    );
    assert_eq!(
        dataflow_status(&with_status(RealizationStatus::Offline)),
        DataflowDisplayStatus::Offline
    );
    assert_eq!(
        dataflow_status(&with_status(RealizationStatus::Broken)),
        DataflowDisplayStatus::Broken
    );
}

#[test]
fn test_fused_status() {
    let broken = with_status(RealizationStatus::Broken);
    let offline = with_status(RealizationStatus::Offline);
    let warning = online(0);
    let healthy = online(10);

    let cases = [
        (&broken, &healthy, DataflowDisplayStatus::Broken),
        (&healthy, &broken, DataflowDisplayStatus::Broken),
        (&healthy, &offline, DataflowDisplayStatus::Warning),
        (&offline, &healthy, DataflowDisplayStatus::Warning),
        (&offline, &offline, DataflowDisplayStatus::Offline),
        (&warning, &offline, DataflowDisplayStatus::Offline),
        (&warning, &warning, DataflowDisplayStatus::Warning),
        (&healthy, &warning, DataflowDisplayStatus::Online),
        (&healthy, &healthy, DataflowDisplayStatus::Online),
    ];
    for (batch, streaming, expected) in cases {
        assert_eq!(
            fused_status(batch, streaming),
            expected,
            "batch {:?} streaming {:?}",
            batch.status,
            streaming.status
        );
    }
}

#[test]
fn test_overlapping_segments_break_model() {
    init_test_logging();
    let (events, mut published) = ChannelEventSink::new();
    let (store, manager) = sales_store(Settings::default());
    let manager = manager.with_events(Arc::new(events));
    let id = manager
        .create_model(&sales_model("sales"), Some(hierarchy_rule()))
        .unwrap()
        .model
        .id;

    store
        .update::<Dataflow>(PROJECT, &id, 3, |mut dataflow| {
            dataflow.segments.push(Segment::ready(SegmentRange::new(0, 31)));
            dataflow.segments.push(Segment::ready(SegmentRange::new(0, 59)));
            // still being built, so not counted
            dataflow.segments.push(Segment::new(SegmentRange::new(40, 90)));
            Ok(dataflow)
        })
        .unwrap();
    assert!(!manager.verify_segments(PROJECT, &id).unwrap());

    store
        .update::<Dataflow>(PROJECT, &id, 3, |mut dataflow| {
            dataflow.segments.push(Segment::ready(SegmentRange::new(40, 90)));
            Ok(dataflow)
        })
        .unwrap();
    assert!(manager.verify_segments(PROJECT, &id).unwrap());

    let model = manager.get_model(PROJECT, &id).unwrap();
    assert_eq!(model.reason(), BrokenReason::SegmentOverlap);
    let dataflow = manager.get_dataflow(PROJECT, &id).unwrap();
    assert_eq!(dataflow_status(&dataflow), DataflowDisplayStatus::Broken);
    assert!(dataflow.segments.is_empty());
    assert_eq!(published.try_recv().unwrap().reason, BrokenReason::SegmentOverlap);

    // already broken: nothing more to do
    assert!(!manager.verify_segments(PROJECT, &id).unwrap());
    assert!(published.try_recv().is_err());
}
