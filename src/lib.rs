//! # flowq
//!
//! A **distributed query engine** for NetFlow-style capture archives: one
//! coordinator, any number of workers, analytical answers (listing,
//! sorting, aggregation, Top-N statistics) over rotated flow files spread
//! across a cluster.
//!
//! ## Key Features
//!
//! - **Four working modes** - raw listing, globally sorted listing, keyed
//!   aggregation, and metadata-only summaries
//! - **Exact distributed Top-N** - a three-round threshold protocol ships a
//!   fraction of the data a full merge would, with identical results
//! - **Bloom-index pruning** - per-file address sidecars let workers skip
//!   whole files for equality filters without opening them
//! - **Double-buffered streaming** - records flow coordinator-ward through
//!   paired send buffers with natural backpressure; progress travels on its
//!   own channel and can never reorder data
//! - **Path patterns** - rank pinning, hostname substitution, strftime
//!   expansion over the queried time range, globs, and recursive
//!   directory walks
//! - **One binary, three roles** - `--listen`, `--connect`, or a loopback
//!   cluster spawned in-process for single-machine runs
//!
//! ## Quick Start
//!
//! ```no_run
//! use flowq::cluster;
//! use flowq::coordinator::{run_query, CoordinatorConfig};
//! use flowq::fields::{FieldId, FieldSpec, SortDir};
//! use flowq::task::{SortSpec, TaskSpec, WorkingMode};
//! # fn main() -> flowq::Result<()> {
//!
//! // top 10 source addresses by traffic volume, over four local workers
//! let task = TaskSpec {
//!     mode: WorkingMode::Aggr,
//!     aggr_keys: vec![FieldSpec::key(FieldId::SrcAddr)],
//!     sort: Some(SortSpec { field: FieldSpec::new(FieldId::Bytes), dir: SortDir::Desc }),
//!     output: vec![FieldSpec::new(FieldId::Packets), FieldSpec::new(FieldId::Bytes)],
//!     filter: Some("proto tcp".into()),
//!     limit: 10,
//!     time_range: None,
//!     patterns: vec!["/var/flows".into()],
//!     use_tput: true,
//!     use_bfindex: true,
//!     rotation_interval: 300,
//!     file_prefix: "nfcapd".into(),
//! };
//!
//! let (cluster, workers) = cluster::spawn_local(4, 0)?;
//! let result = run_query(cluster, &task, &CoordinatorConfig::default())?;
//! for handle in workers {
//!     let _ = handle.join();
//! }
//! println!("{} result records", result.records.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! A query is one broadcast and one merge:
//!
//! 1. The coordinator validates the [`task::TaskSpec`] and broadcasts it.
//! 2. Every worker resolves its local [`paths`], optionally [`prune`]s with
//!    Bloom sidecars, and funnels filter-accepted records into its
//!    [`memory`] on a rayon pool.
//! 3. Workers stream partial results back through the double-buffered
//!    [`transport`]; the [`coordinator`] merges them with the strategy the
//!    working mode demands and applies the global limit.
//! 4. The [`progress`] subsystem renders per-file completion events from a
//!    dedicated channel while the merge runs.
//!
//! Aggregated Top-N queries replace the full pull of step 3 with the
//! three-round protocol in [`tput`]. A worker failure anywhere fails the
//! query: the coordinator broadcasts an abort and returns no partial
//! output.
//!
//! ## Module Overview
//!
//! - [`task`] - the broadcast task descriptor and time alignment
//! - [`fields`], [`record`] - field metadata and the uniform record layout
//! - [`filter`] - the predicate language, compiled on every participant
//! - [`storage`] - flow-file format, metadata summaries, Bloom sidecars
//! - [`paths`] - pattern resolution against the local filesystem
//! - [`prune`] - index-based file pruning
//! - [`memory`] - aggregation hash table and list memory
//! - [`transport`] - framed connections, batch buffers, readers
//! - [`cluster`] - bootstrap of the fixed worker membership
//! - [`worker`], [`coordinator`] - the two sides of the protocol
//! - [`tput`] - Top-N threshold math
//! - [`progress`] - progress collection and rendering
//! - [`output`] - pretty/CSV rendering of merged results
//! - [`cli`] - the command line of the binary
//! - [`testing`] - fixtures and an in-process cluster harness

pub mod cli;
pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod fields;
pub mod filter;
pub mod memory;
pub mod output;
pub mod paths;
pub mod progress;
pub mod prune;
pub mod record;
pub mod storage;
pub mod task;
pub mod testing;
pub mod tput;
pub mod transport;
pub mod worker;

pub use coordinator::{run_query, CoordinatorConfig, QueryResult};
pub use error::{QueryError, Result};
pub use fields::{AggrFunc, FieldId, FieldSpec, SortDir};
pub use filter::Filter;
pub use record::RecordLayout;
pub use task::{SortSpec, TaskSpec, WorkingMode};
