//! Test scaffolding: flow-file fixtures and an in-process cluster.
//!
//! Integration tests build capture trees in temp directories with
//! [`fixtures`], describe queries with the fluent [`TaskBuilder`], and run
//! them through [`run_local_query`], which spins up a real loopback
//! cluster - worker threads, TCP connections, the full protocol - so a
//! test exercises exactly the code path a production run takes.

pub mod fixtures;

use crate::cluster::spawn_local;
use crate::coordinator::{run_query, CoordinatorConfig, QueryResult};
use crate::error::Result;
use crate::fields::{FieldId, FieldSpec, SortDir};
use crate::progress::{ProgressDest, ProgressKind};
use crate::record::RecordLayout;
use crate::task::{SortSpec, TaskSpec, WorkingMode};
use std::time::Duration;

pub use fixtures::{flow, write_capture, FlowBuilder};

/// Run `task` on an in-process loopback cluster of `workers` workers.
///
/// Worker errors after a failed query are expected (the abort path) and
/// are folded into the query result; a worker failure after a
/// *successful* query is a harness bug and panics.
pub fn run_local_query(task: &TaskSpec, workers: usize) -> Result<QueryResult> {
    let (cluster, handles) = spawn_local(workers, 2)?;
    let config = CoordinatorConfig {
        timeout: Duration::from_secs(20),
        progress: ProgressKind::None,
        progress_dest: ProgressDest::Stderr,
    };
    let result = run_query(cluster, task, &config);
    for handle in handles {
        let outcome = handle.join().expect("worker thread must not panic");
        if result.is_ok() {
            outcome.expect("worker failed although the query succeeded");
        }
    }
    result
}

/// Fluent [`TaskSpec`] construction for tests.
#[derive(Clone, Debug)]
pub struct TaskBuilder {
    task: TaskSpec,
}

impl TaskBuilder {
    #[must_use]
    pub fn list<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            task: TaskSpec {
                mode: WorkingMode::List,
                aggr_keys: Vec::new(),
                sort: None,
                output: vec![
                    FieldSpec::new(FieldId::SrcAddr),
                    FieldSpec::new(FieldId::DstAddr),
                    FieldSpec::new(FieldId::Packets),
                    FieldSpec::new(FieldId::Bytes),
                ],
                filter: None,
                limit: 0,
                time_range: None,
                patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
                use_tput: true,
                use_bfindex: true,
                rotation_interval: 300,
                file_prefix: "nfcapd".into(),
            },
        }
    }

    #[must_use]
    pub fn sort<S: AsRef<str>>(patterns: &[S], field: FieldId, dir: SortDir) -> Self {
        let mut b = Self::list(patterns);
        b.task.mode = WorkingMode::Sort;
        b.task.sort = Some(SortSpec { field: FieldSpec::new(field), dir });
        b
    }

    #[must_use]
    pub fn aggr<S: AsRef<str>>(patterns: &[S], keys: &[FieldId]) -> Self {
        let mut b = Self::list(patterns);
        b.task.mode = WorkingMode::Aggr;
        b.task.aggr_keys = keys.iter().copied().map(FieldSpec::key).collect();
        b.task.output = vec![FieldSpec::new(FieldId::Packets), FieldSpec::new(FieldId::Bytes)];
        b
    }

    #[must_use]
    pub fn meta<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut b = Self::list(patterns);
        b.task.mode = WorkingMode::Meta;
        b.task.output = Vec::new();
        b
    }

    #[must_use]
    pub fn filter(mut self, expr: &str) -> Self {
        self.task.filter = Some(expr.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.task.limit = limit;
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: FieldId, dir: SortDir) -> Self {
        self.task.sort = Some(SortSpec { field: FieldSpec::new(field), dir });
        self
    }

    #[must_use]
    pub fn time_range(mut self, begin: i64, end: i64) -> Self {
        self.task.time_range = Some((begin, end));
        self
    }

    #[must_use]
    pub fn output(mut self, fields: &[FieldId]) -> Self {
        self.task.output = fields.iter().copied().map(FieldSpec::new).collect();
        self
    }

    #[must_use]
    pub fn no_tput(mut self) -> Self {
        self.task.use_tput = false;
        self
    }

    #[must_use]
    pub fn no_bfindex(mut self) -> Self {
        self.task.use_bfindex = false;
        self
    }

    #[must_use]
    pub fn build(self) -> TaskSpec {
        self.task
    }
}

/// Decode one numeric column out of result records.
#[must_use]
pub fn column_u64(layout: &RecordLayout, records: &[Vec<u8>], field: FieldId) -> Vec<u64> {
    let slot = layout
        .slot_of(field)
        .unwrap_or_else(|| panic!("field {field} is not in the layout"));
    records.iter().map(|rec| layout.read_num(slot, rec)).collect()
}

/// Decode one address column out of result records.
#[must_use]
pub fn column_addr(
    layout: &RecordLayout,
    records: &[Vec<u8>],
    field: FieldId,
) -> Vec<std::net::IpAddr> {
    let slot = layout
        .slot_of(field)
        .unwrap_or_else(|| panic!("field {field} is not in the layout"));
    records
        .iter()
        .map(|rec| match layout.value(slot, rec) {
            crate::record::Value::Addr(a) => a,
            other => panic!("field {field} decoded to {other:?}, not an address"),
        })
        .collect()
}
