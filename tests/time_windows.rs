use flowq::fields::FieldId;
use flowq::testing::*;
use tempfile::tempdir;

// 2024-01-01T00:00:00Z
const BEGIN: i64 = 1_704_067_200;

/// A time range selects exactly the rotation boundaries inside it, laid
/// out in the canonical %Y/%m/%d tree; a boundary whose file is missing is
/// a warning, not an error.
#[test]
fn time_range_selects_rotation_files() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(
        dir.path(),
        "2024/01/01/nfcapd.20240101000000",
        &[flow("10.0.0.1", "192.0.2.1", 100)],
    )?;
    write_capture(
        dir.path(),
        "2024/01/01/nfcapd.20240101000500",
        &[flow("10.0.0.2", "192.0.2.1", 200)],
    )?;
    // the 00:10 boundary file is deliberately absent

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::list(&[&pattern])
        .time_range(BEGIN, BEGIN + 900)
        .build();
    let result = run_local_query(&task, 1)?;
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.metadata.flows, 2);
    Ok(())
}

/// A zero-length range is the point query: exactly one file per pattern.
#[test]
fn zero_length_range_reads_the_point_file() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(
        dir.path(),
        "2024/01/01/nfcapd.20240101000000",
        &[flow("10.0.0.1", "192.0.2.1", 100)],
    )?;
    write_capture(
        dir.path(),
        "2024/01/01/nfcapd.20240101000500",
        &[flow("10.0.0.2", "192.0.2.1", 200)],
    )?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::list(&[&pattern]).time_range(BEGIN, BEGIN).build();
    let result = run_local_query(&task, 1)?;

    let layout = task.layout()?;
    assert_eq!(column_u64(&layout, &result.records, FieldId::Bytes), vec![100]);
    Ok(())
}

/// Gzip captures are read transparently, sidecar lookup included.
#[cfg(feature = "compression-gzip")]
#[test]
fn gzip_captures_work_end_to_end() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(dir.path(), "cap.000.gz", &[flow("10.0.0.1", "192.0.2.1", 100)])?;
    write_capture(dir.path(), "cap.001", &[flow("10.0.0.2", "192.0.2.1", 200)])?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::list(&[&pattern]).build();
    let result = run_local_query(&task, 1)?;
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.metadata.bytes, 300);
    Ok(())
}
