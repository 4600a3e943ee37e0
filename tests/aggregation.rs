use flowq::fields::{FieldId, SortDir};
use flowq::storage::FlowRecord;
use flowq::testing::*;
use std::net::IpAddr;
use tempfile::tempdir;

fn talkers() -> Vec<FlowRecord> {
    let mut flows = Vec::new();
    for i in 0..50u64 {
        let host = format!("10.0.0.{}", i % 5 + 1);
        flows.push(flow(&host, "192.0.2.1", 100 + i * 7));
    }
    flows
}

/// Aggregating with two workers over a split input must equal aggregating
/// with one worker over the union.
#[test]
fn distribution_does_not_change_aggregates() -> anyhow::Result<()> {
    let flows = talkers();
    let (left, right) = flows.split_at(flows.len() / 2);

    let split_dir = tempdir()?;
    write_capture(split_dir.path(), "w0/cap.000", left)?;
    write_capture(split_dir.path(), "w1/cap.000", right)?;
    let p0 = format!("%0:{}/w0", split_dir.path().display());
    let p1 = format!("%1:{}/w1", split_dir.path().display());
    let split_task = TaskBuilder::aggr(&[&p0, &p1], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .build();
    let split = run_local_query(&split_task, 2)?;

    let union_dir = tempdir()?;
    write_capture(union_dir.path(), "cap.000", &flows)?;
    let pattern = union_dir.path().to_string_lossy().into_owned();
    let union_task = TaskBuilder::aggr(&[&pattern], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .build();
    let union = run_local_query(&union_task, 1)?;

    let layout = split_task.layout()?;
    assert_eq!(split.records.len(), 5);
    assert_eq!(
        column_addr(&layout, &split.records, FieldId::SrcAddr),
        column_addr(&layout, &union.records, FieldId::SrcAddr)
    );
    assert_eq!(
        column_u64(&layout, &split.records, FieldId::Bytes),
        column_u64(&layout, &union.records, FieldId::Bytes)
    );
    assert_eq!(
        column_u64(&layout, &split.records, FieldId::Packets),
        column_u64(&layout, &union.records, FieldId::Packets)
    );
    Ok(())
}

#[test]
fn aggregation_collapses_keys_and_sums() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let records = vec![
        flow("10.0.0.1", "192.0.2.1", 100),
        flow("10.0.0.1", "192.0.2.2", 50),
        flow("10.0.0.2", "192.0.2.1", 75),
    ];
    write_capture(dir.path(), "cap.000", &records)?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::aggr(&[&pattern], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .no_tput()
        .build();
    let result = run_local_query(&task, 1)?;
    let layout = task.layout()?;

    let addrs = column_addr(&layout, &result.records, FieldId::SrcAddr);
    let bytes = column_u64(&layout, &result.records, FieldId::Bytes);
    let expect: Vec<IpAddr> = vec!["10.0.0.1".parse()?, "10.0.0.2".parse()?];
    assert_eq!(addrs, expect);
    assert_eq!(bytes, vec![150, 75]);
    Ok(())
}

/// The canonical statistics quintet exercises the fast aggregation path;
/// results must match the generic path bit for bit.
#[test]
fn canonical_output_set_aggregates_like_any_other() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let records = vec![
        FlowBuilder::new("10.0.0.1", "192.0.2.1").window(1000, 2000).volume(3, 300).build(),
        FlowBuilder::new("10.0.0.1", "192.0.2.2").window(500, 2500).volume(2, 100).build(),
    ];
    write_capture(dir.path(), "cap.000", &records)?;
    let pattern = dir.path().to_string_lossy().into_owned();

    let canonical = TaskBuilder::aggr(&[&pattern], &[FieldId::SrcAddr])
        .output(&[
            FieldId::First,
            FieldId::Last,
            FieldId::Packets,
            FieldId::Bytes,
            FieldId::Flows,
        ])
        .build();
    let result = run_local_query(&canonical, 1)?;
    let layout = canonical.layout()?;

    assert_eq!(result.records.len(), 1);
    assert_eq!(column_u64(&layout, &result.records, FieldId::First), vec![500]);
    assert_eq!(column_u64(&layout, &result.records, FieldId::Last), vec![2500]);
    assert_eq!(column_u64(&layout, &result.records, FieldId::Packets), vec![5]);
    assert_eq!(column_u64(&layout, &result.records, FieldId::Bytes), vec![400]);
    assert_eq!(column_u64(&layout, &result.records, FieldId::Flows), vec![2]);
    Ok(())
}

#[test]
fn meta_mode_reads_no_records() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let records = vec![
        FlowBuilder::new("10.0.0.1", "192.0.2.1").proto(6).volume(10, 1000).build(),
        FlowBuilder::new("10.0.0.2", "192.0.2.1").proto(17).volume(5, 500).build(),
    ];
    write_capture(dir.path(), "cap.000", &records)?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::meta(&[&pattern]).build();
    let result = run_local_query(&task, 1)?;

    assert!(result.records.is_empty());
    // nothing was filtered, so the processed summary stays zero
    assert_eq!(result.processed.flows, 0);
    assert_eq!(result.metadata, fixtures::meta_of(&records));
    assert_eq!(result.metadata.packets_tcp, 10);
    assert_eq!(result.metadata.packets_udp, 5);
    Ok(())
}

#[test]
fn netmask_key_alignment_groups_subnets() -> anyhow::Result<()> {
    use flowq::fields::FieldSpec;

    let dir = tempdir()?;
    let records = vec![
        flow("10.0.1.10", "192.0.2.1", 100),
        flow("10.0.1.200", "192.0.2.1", 50),
        flow("10.0.2.10", "192.0.2.1", 25),
    ];
    write_capture(dir.path(), "cap.000", &records)?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let mut task = TaskBuilder::aggr(&[&pattern], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .build();
    task.aggr_keys = vec![FieldSpec { align: Some(24), ..FieldSpec::key(FieldId::SrcAddr) }];

    let result = run_local_query(&task, 1)?;
    let layout = task.layout()?;
    assert_eq!(
        column_addr(&layout, &result.records, FieldId::SrcAddr),
        vec!["10.0.1.0".parse::<IpAddr>()?, "10.0.2.0".parse::<IpAddr>()?]
    );
    assert_eq!(column_u64(&layout, &result.records, FieldId::Bytes), vec![150, 25]);
    Ok(())
}
