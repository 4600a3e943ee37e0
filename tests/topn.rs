use flowq::fields::{FieldId, SortDir};
use flowq::storage::FlowRecord;
use flowq::testing::*;
use std::net::IpAddr;
use tempfile::tempdir;

fn host_flows(volumes: &[(&str, u64)]) -> Vec<FlowRecord> {
    volumes.iter().map(|(host, bytes)| flow(host, "192.0.2.1", *bytes)).collect()
}

/// The worked three-round example: worker 1 holds A:100 B:40 C:30 D:20,
/// worker 2 holds A:50 B:80 D:70 E:10; top 2 by bytes must come out as
/// A=150, B=120.
#[test]
fn three_round_top_n_is_exact() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(
        dir.path(),
        "w0/cap.000",
        &host_flows(&[("10.0.0.1", 100), ("10.0.0.2", 40), ("10.0.0.3", 30), ("10.0.0.4", 20)]),
    )?;
    write_capture(
        dir.path(),
        "w1/cap.000",
        &host_flows(&[("10.0.0.1", 50), ("10.0.0.2", 80), ("10.0.0.4", 70), ("10.0.0.5", 10)]),
    )?;

    let p0 = format!("%0:{}/w0", dir.path().display());
    let p1 = format!("%1:{}/w1", dir.path().display());
    let task = TaskBuilder::aggr(&[&p0, &p1], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .limit(2)
        .build();
    assert!(task.tput_applicable());

    let result = run_local_query(&task, 2)?;
    let layout = task.layout()?;
    assert_eq!(
        column_addr(&layout, &result.records, FieldId::SrcAddr),
        vec!["10.0.0.1".parse::<IpAddr>()?, "10.0.0.2".parse::<IpAddr>()?]
    );
    assert_eq!(column_u64(&layout, &result.records, FieldId::Bytes), vec![150, 120]);
    Ok(())
}

/// The three-round protocol must agree with a full merge on every input.
#[test]
fn top_n_matches_full_merge() -> anyhow::Result<()> {
    let dir = tempdir()?;
    for worker in 0..3u64 {
        let flows: Vec<_> = (0..40u64)
            .map(|i| {
                let host = format!("10.0.{worker}.{}", i % 13 + 1);
                flow(&host, "192.0.2.1", i * 37 + worker * 11)
            })
            .collect();
        write_capture(dir.path(), &format!("w{worker}/cap.000"), &flows)?;
    }
    let patterns: Vec<String> = (0..3)
        .map(|w| format!("%{w}:{}/w{w}", dir.path().display()))
        .collect();
    let pattern_refs: Vec<&str> = patterns.iter().map(String::as_str).collect();

    let with_tput = TaskBuilder::aggr(&pattern_refs, &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .limit(5)
        .build();
    let without_tput = TaskBuilder::aggr(&pattern_refs, &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .limit(5)
        .no_tput()
        .build();
    assert!(with_tput.tput_applicable());
    assert!(!without_tput.tput_applicable());

    let fast = run_local_query(&with_tput, 3)?;
    let full = run_local_query(&without_tput, 3)?;

    let layout = with_tput.layout()?;
    assert_eq!(fast.records.len(), 5);
    assert_eq!(
        column_addr(&layout, &fast.records, FieldId::SrcAddr),
        column_addr(&layout, &full.records, FieldId::SrcAddr)
    );
    assert_eq!(
        column_u64(&layout, &fast.records, FieldId::Bytes),
        column_u64(&layout, &full.records, FieldId::Bytes)
    );
    Ok(())
}

/// An ascending ranking cannot use the threshold bound; the query must
/// still answer exactly through the full merge.
#[test]
fn ascending_statistics_fall_back_to_full_merge() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(
        dir.path(),
        "w0/cap.000",
        &host_flows(&[("10.0.0.1", 100), ("10.0.0.2", 40)]),
    )?;
    write_capture(
        dir.path(),
        "w1/cap.000",
        &host_flows(&[("10.0.0.1", 50), ("10.0.0.3", 10)]),
    )?;

    let p0 = format!("%0:{}/w0", dir.path().display());
    let p1 = format!("%1:{}/w1", dir.path().display());
    let task = TaskBuilder::aggr(&[&p0, &p1], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Asc)
        .limit(2)
        .build();
    assert!(!task.tput_applicable());

    let result = run_local_query(&task, 2)?;
    let layout = task.layout()?;
    assert_eq!(column_u64(&layout, &result.records, FieldId::Bytes), vec![10, 40]);
    Ok(())
}

/// Limits larger than the key population return everything, top-n or not.
#[test]
fn limit_above_population_returns_all_keys() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(
        dir.path(),
        "cap.000",
        &host_flows(&[("10.0.0.1", 100), ("10.0.0.2", 40), ("10.0.0.3", 10)]),
    )?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::aggr(&[&pattern], &[FieldId::SrcAddr])
        .order_by(FieldId::Bytes, SortDir::Desc)
        .limit(50)
        .build();
    let result = run_local_query(&task, 1)?;
    let layout = task.layout()?;
    assert_eq!(column_u64(&layout, &result.records, FieldId::Bytes), vec![100, 40, 10]);
    Ok(())
}
