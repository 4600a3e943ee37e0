//! The immutable task descriptor broadcast to every worker.
//!
//! A [`TaskSpec`] is built once on the coordinator from the command line,
//! validated, and broadcast verbatim; workers never reinterpret options. Time
//! boundaries are aligned to the rotation interval before broadcast, and the
//! configured time zone is already folded into the epoch values, so all path
//! formatting downstream is plain UTC.

use crate::error::{QueryError, Result};
use crate::fields::{AggrFunc, FieldId, FieldSpec, SortDir};
use crate::record::RecordLayout;
use serde::{Deserialize, Serialize};

/// What the query computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingMode {
    /// Raw records in arrival order.
    List,
    /// Raw records in global sort order.
    Sort,
    /// Aggregated records, optionally sorted and limited.
    Aggr,
    /// File metadata summaries only; no record is read.
    Meta,
}

/// The single sort key of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: FieldSpec,
    pub dir: SortDir,
}

/// Everything a worker needs to execute its share of one query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub mode: WorkingMode,
    /// Aggregation keys; empty outside `Aggr` mode.
    pub aggr_keys: Vec<FieldSpec>,
    pub sort: Option<SortSpec>,
    /// Output columns, in rendering order.
    pub output: Vec<FieldSpec>,
    /// Uncompiled filter expression; compiled on every participant.
    pub filter: Option<String>,
    /// Global record limit; 0 means unlimited.
    pub limit: u64,
    /// `[begin, end)` in UTC epoch seconds, aligned to the rotation
    /// interval. `None` means "no time range" (directories are walked).
    pub time_range: Option<(i64, i64)>,
    pub patterns: Vec<String>,
    pub use_tput: bool,
    pub use_bfindex: bool,
    /// Rotation interval in seconds (length of one capture file).
    pub rotation_interval: u32,
    /// File-name prefix of rotated captures, e.g. `nfcapd`.
    pub file_prefix: String,
}

/// Largest multiple of `interval` that is <= `t`.
#[must_use]
pub fn align_begin(t: i64, interval: i64) -> i64 {
    t.div_euclid(interval) * interval
}

/// Smallest multiple of `interval` that is >= `t`.
#[must_use]
pub fn align_end(t: i64, interval: i64) -> i64 {
    align_begin(t + interval - 1, interval)
}

impl TaskSpec {
    /// Check the cross-field invariants that CLI parsing cannot express.
    pub fn validate(&self) -> Result<()> {
        fn claim(seen: &mut Vec<FieldId>, spec: &FieldSpec, what: &str) -> Result<()> {
            if seen.contains(&spec.id) {
                return Err(QueryError::Argument(format!(
                    "field `{}` given more than once ({what})",
                    spec.id
                )));
            }
            seen.push(spec.id);
            Ok(())
        }

        let mut seen = Vec::new();
        for k in &self.aggr_keys {
            claim(&mut seen, k, "aggregation key")?;
        }
        if let Some(sort) = &self.sort {
            // the sort key may coincide with one aggregation key
            if !seen.contains(&sort.field.id) {
                claim(&mut seen, &sort.field, "sort key")?;
            }
        }
        for o in &self.output {
            if !seen.contains(&o.id) {
                claim(&mut seen, o, "output field")?;
            }
        }

        match self.mode {
            WorkingMode::Aggr => {
                if self.aggr_keys.is_empty() {
                    return Err(QueryError::Argument(
                        "aggregation mode without aggregation keys".into(),
                    ));
                }
            }
            WorkingMode::Sort => {
                if self.sort.is_none() {
                    return Err(QueryError::Argument("sort mode without a sort key".into()));
                }
                if !self.aggr_keys.is_empty() {
                    return Err(QueryError::Argument(
                        "aggregation keys are only valid in aggregation mode".into(),
                    ));
                }
            }
            WorkingMode::List | WorkingMode::Meta => {
                if !self.aggr_keys.is_empty() {
                    return Err(QueryError::Argument(
                        "aggregation keys are only valid in aggregation mode".into(),
                    ));
                }
            }
        }

        if let Some((begin, end)) = self.time_range {
            if begin > end {
                return Err(QueryError::Argument("time range ends before it begins".into()));
            }
        }
        if self.rotation_interval == 0 {
            return Err(QueryError::Argument("rotation interval must be positive".into()));
        }
        Ok(())
    }

    /// Record layout of this query. `Meta` mode carries no records and has
    /// no layout.
    pub fn layout(&self) -> Result<RecordLayout> {
        debug_assert!(self.mode != WorkingMode::Meta);
        RecordLayout::build(&self.aggr_keys, self.sort.map(|s| s.field), &self.output)
    }

    /// Whether the three-round Top-N protocol applies: aggregation with a
    /// limit, sorted descending on a SUM-aggregated traffic counter. The
    /// threshold bound needs partial sums to under-approximate totals, which
    /// an ascending ranking does not give.
    #[must_use]
    pub fn tput_applicable(&self) -> bool {
        self.use_tput
            && self.mode == WorkingMode::Aggr
            && self.limit > 0
            && self.sort.is_some_and(|s| {
                s.field.id.is_traffic_counter()
                    && s.field.aggr == AggrFunc::Sum
                    && s.dir == SortDir::Desc
            })
    }

    /// Sort direction, defaulting to descending for Top-N style statistics.
    #[must_use]
    pub fn sort_dir(&self) -> SortDir {
        self.sort.map_or(SortDir::Desc, |s| s.dir)
    }
}
