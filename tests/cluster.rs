use flowq::cluster::{assemble, join};
use flowq::coordinator::{run_query, CoordinatorConfig};
use flowq::error::QueryError;
use flowq::testing::*;
use flowq::transport::Message;
use std::net::TcpListener;
use std::time::Duration;
use tempfile::tempdir;

fn short_config() -> CoordinatorConfig {
    CoordinatorConfig { timeout: Duration::from_secs(10), ..CoordinatorConfig::default() }
}

/// Scenario: one worker reports a failure mid-query. The coordinator
/// aborts collectively, emits no output, and the healthy worker winds
/// down instead of hanging.
#[test]
fn worker_failure_aborts_the_query() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(dir.path(), "w0/cap.000", &[flow("10.0.0.1", "192.0.2.1", 100)])?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let healthy = std::thread::spawn(move || {
        let session = join(addr)?;
        flowq::worker::run(session, 1)
    });
    let failing = std::thread::spawn(move || {
        let session = join(addr).expect("join");
        match session.data.recv().expect("task broadcast") {
            Message::Task(_) => {}
            other => panic!("expected task, got {other:?}"),
        }
        session
            .data
            .send(&Message::Failure("simulated disk failure".into()))
            .expect("failure sentinel");
    });

    let cluster = assemble(&listener, 2)?;
    let p0 = format!("%0:{}/w0", dir.path().display());
    let p1 = format!("%1:{}/w0", dir.path().display());
    let task = TaskBuilder::list(&[&p0, &p1]).build();

    let err = run_query(cluster, &task, &short_config()).unwrap_err();
    assert!(matches!(err, QueryError::Transport(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 1);

    // both workers exit within the test's lifetime; the healthy one may
    // report the abort or finish cleanly depending on timing
    failing.join().unwrap();
    let _ = healthy.join().unwrap();
    Ok(())
}

/// A filter that does not compile fails on the coordinator before any
/// broadcast, with the argument-class exit code.
#[test]
fn bad_filter_fails_before_broadcast() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_capture(dir.path(), "cap.000", &[flow("10.0.0.1", "192.0.2.1", 100)])?;

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::list(&[&pattern]).filter("src ip not-an-address").build();
    let err = run_local_query(&task, 1).unwrap_err();
    assert!(matches!(err, QueryError::Filter(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 2);
    Ok(())
}

/// Progress events flow on their own channel; a json progress run leaves
/// NDJSON snapshots behind without disturbing the records.
#[test]
fn json_progress_snapshots() -> anyhow::Result<()> {
    use flowq::cluster::spawn_local;
    use flowq::progress::{ProgressDest, ProgressKind};

    let dir = tempdir()?;
    for file in 0..4 {
        write_capture(
            dir.path(),
            &format!("cap.{file:03}"),
            &[flow("10.0.0.1", "192.0.2.1", 100 + file)],
        )?;
    }
    let progress_path = dir.path().join("progress.ndjson");

    let pattern = dir.path().to_string_lossy().into_owned();
    let task = TaskBuilder::list(&[&pattern]).build();
    let (cluster, handles) = spawn_local(1, 2)?;
    let config = CoordinatorConfig {
        timeout: Duration::from_secs(10),
        progress: ProgressKind::Json,
        progress_dest: ProgressDest::File(progress_path.clone()),
    };
    let result = run_query(cluster, &task, &config)?;
    for handle in handles {
        handle.join().unwrap()?;
    }
    assert_eq!(result.records.len(), 4);

    let body = std::fs::read_to_string(&progress_path)?;
    let last: serde_json::Value = serde_json::from_str(body.lines().last().unwrap())?;
    assert_eq!(last["files_done"], 4);
    assert_eq!(last["files_total"], 4);
    Ok(())
}
