//! Command line of the `flowq` binary.
//!
//! One binary, three roles: plain invocations run coordinator and workers
//! in one process over loopback, `--listen` waits for a cluster, and
//! `--connect` joins one as a worker. Query options are parsed here into
//! the [`TaskSpec`] that the coordinator broadcasts; whatever a worker got
//! on its own command line is ignored in favor of the broadcast.

use crate::error::{QueryError, Result};
use crate::fields::{AggrFunc, FieldId, FieldSpec, SortDir};
use crate::output::{OutputFormat, OutputItems};
use crate::task::{align_begin, align_end, SortSpec, TaskSpec, WorkingMode};
use chrono::{FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "flowq",
    version,
    about = "Distributed analytics over rotated flow-capture files",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Flow files, capture directories, or patterns (`%N:` pins to a
    /// worker rank, `%h` expands to the local hostname, strftime
    /// directives expand over the time range).
    #[arg(value_name = "PATTERN")]
    pub patterns: Vec<String>,

    /// Aggregate by these comma-separated key fields (e.g. `srcip,dstport`).
    #[arg(short = 'a', long, value_name = "FIELDS")]
    pub aggregation: Option<String>,

    /// Record filter expression (e.g. `src net 10.0.0.0/8 and proto tcp`).
    #[arg(short = 'f', long, value_name = "EXPR")]
    pub filter: Option<String>,

    /// Global record limit; 0 means unlimited.
    #[arg(short = 'l', long, value_name = "N")]
    pub limit: Option<u64>,

    /// Sort key, `FIELD[#asc|#desc]` (descending when omitted).
    #[arg(short = 'o', long, value_name = "FIELD[#DIR]")]
    pub order: Option<String>,

    /// Statistic shorthand: `FIELDS[#SORT]` is aggregation by FIELDS,
    /// ordered by SORT (default `bytes`), limit 10 unless `-l` says
    /// otherwise.
    #[arg(short = 's', long, value_name = "FIELDS[#SORT]", conflicts_with = "aggregation")]
    pub statistic: Option<String>,

    /// Query exactly one rotation interval.
    #[arg(short = 't', long, value_name = "TIME", conflicts_with = "time_range")]
    pub time_point: Option<String>,

    /// Query a time range, `BEGIN[#END]`; END defaults to now.
    #[arg(short = 'T', long, value_name = "BEGIN[#END]")]
    pub time_range: Option<String>,

    /// Read file metadata summaries only, never a record.
    #[arg(short = 'M', long)]
    pub metadata_only: bool,

    /// Verbosity: 0 quiet, 1 warnings, 2 info, 3 debug, 4 trace.
    #[arg(short = 'v', long, default_value_t = 1)]
    pub verbosity: u8,

    /// Output columns (comma-separated fields) instead of the defaults.
    #[arg(long, value_name = "FIELDS")]
    pub output_fields: Option<String>,

    #[arg(long, value_enum, default_value_t)]
    pub output_format: OutputFormat,

    #[arg(long, value_enum, default_value_t)]
    pub output_items: OutputItems,

    /// Progress display: none, total, perslave, or json.
    #[arg(long, value_name = "TYPE", default_value = "none")]
    pub progress_bar_type: String,

    /// Progress destination: stderr, stdout, or a file path.
    #[arg(long, value_name = "DEST", default_value = "stderr")]
    pub progress_bar_dest: String,

    /// Processing threads per worker (default: CPU count).
    #[arg(long, value_name = "N")]
    pub num_threads: Option<usize>,

    /// Workers to spawn in single-machine mode.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub num_workers: usize,

    /// Zone of command-line times: `system`, `unset` (UTC), or a fixed
    /// offset such as `+01:00`.
    #[arg(long, value_name = "TZ")]
    pub time_zone: Option<String>,

    /// Disable the three-round Top-N protocol.
    #[arg(long)]
    pub no_tput: bool,

    /// Disable Bloom-index file pruning.
    #[arg(long)]
    pub no_bfindex: bool,

    /// Rotation interval of the capture files, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub rotation_interval: u32,

    /// File-name prefix of rotated captures.
    #[arg(long, value_name = "NAME", default_value = "nfcapd")]
    pub file_prefix: String,

    /// Receive timeout in seconds; expiry fails the query.
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub timeout: u64,

    /// Coordinator role: listen on ADDR for `--workers` workers.
    #[arg(long, value_name = "ADDR", requires = "workers", conflicts_with = "connect")]
    pub listen: Option<String>,

    /// Cluster size expected by `--listen`.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Worker role: join the coordinator at ADDR.
    #[arg(long, value_name = "ADDR")]
    pub connect: Option<String>,
}

/// How this process participates in the cluster.
#[derive(Debug)]
pub enum Role {
    Worker { coordinator: String },
    Coordinator { listen: String, workers: usize },
    Local { workers: usize },
}

impl Cli {
    #[must_use]
    pub fn role(&self) -> Role {
        if let Some(coordinator) = self.connect.clone() {
            Role::Worker { coordinator }
        } else if let Some(listen) = self.listen.clone() {
            Role::Coordinator { listen, workers: self.workers.unwrap_or(1) }
        } else {
            Role::Local { workers: self.num_workers.max(1) }
        }
    }

    /// Build the task descriptor this invocation describes.
    pub fn build_task(&self) -> Result<TaskSpec> {
        if self.patterns.is_empty() {
            return Err(QueryError::Argument("no path patterns given".into()));
        }

        // -s is sugar for aggregation + order + limit 10
        let (aggregation, order, mut limit) = if let Some(stat) = &self.statistic {
            let (fields, sort) = match stat.split_once('#') {
                Some((f, s)) => (f.to_string(), s.to_string()),
                None => (stat.clone(), "bytes".to_string()),
            };
            (Some(fields), Some(sort), self.limit.unwrap_or(10))
        } else {
            (self.aggregation.clone(), self.order.clone(), self.limit.unwrap_or(0))
        };

        let mode = if self.metadata_only {
            limit = 0;
            WorkingMode::Meta
        } else if aggregation.is_some() {
            WorkingMode::Aggr
        } else if order.is_some() {
            WorkingMode::Sort
        } else {
            WorkingMode::List
        };

        let aggr_keys: Vec<FieldSpec> = aggregation
            .as_deref()
            .map(parse_field_list)
            .transpose()?
            .unwrap_or_default()
            .into_iter()
            .map(FieldSpec::as_key)
            .collect();

        let sort = order
            .as_deref()
            .map(|spec| parse_sort(spec, &aggr_keys))
            .transpose()?;

        let output = match (&self.output_fields, mode) {
            (_, WorkingMode::Meta) => Vec::new(),
            (Some(fields), _) => parse_field_list(fields)?,
            (None, WorkingMode::Aggr) => default_aggr_output(),
            (None, WorkingMode::List | WorkingMode::Sort) => default_list_output(),
        };

        let tz = parse_time_zone(self.time_zone.as_deref())?;
        let interval = i64::from(self.rotation_interval);
        let time_range = if let Some(point) = &self.time_point {
            let t = align_begin(parse_time(point, &tz)?, interval);
            Some((t, t))
        } else if let Some(range) = &self.time_range {
            let (begin, end) = match range.split_once('#') {
                Some((b, e)) => (parse_time(b, &tz)?, parse_time(e, &tz)?),
                None => (parse_time(range, &tz)?, Utc::now().timestamp()),
            };
            Some((align_begin(begin, interval), align_end(end, interval)))
        } else {
            None
        };

        let task = TaskSpec {
            mode,
            aggr_keys,
            sort,
            output,
            filter: self.filter.clone(),
            limit,
            time_range,
            patterns: self.patterns.clone(),
            use_tput: !self.no_tput,
            use_bfindex: !self.no_bfindex,
            rotation_interval: self.rotation_interval,
            file_prefix: self.file_prefix.clone(),
        };
        task.validate()?;
        Ok(task)
    }
}

fn parse_field_list(list: &str) -> Result<Vec<FieldSpec>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FieldSpec::parse)
        .collect()
}

fn parse_sort(spec: &str, aggr_keys: &[FieldSpec]) -> Result<SortSpec> {
    let (field, dir) = match spec.split_once('#') {
        Some((f, d)) => (f, SortDir::parse(d)?),
        None => (spec, SortDir::Desc),
    };
    let mut field = FieldSpec::parse(field)?;
    // sorting on an aggregation key orders by the key itself
    if aggr_keys.iter().any(|k| k.id == field.id) {
        field.aggr = AggrFunc::Key;
    }
    Ok(SortSpec { field, dir })
}

fn default_aggr_output() -> Vec<FieldSpec> {
    [FieldId::First, FieldId::Last, FieldId::Packets, FieldId::Bytes, FieldId::Flows]
        .into_iter()
        .map(FieldSpec::new)
        .collect()
}

fn default_list_output() -> Vec<FieldSpec> {
    [
        FieldId::First,
        FieldId::Last,
        FieldId::SrcAddr,
        FieldId::DstAddr,
        FieldId::SrcPort,
        FieldId::DstPort,
        FieldId::Proto,
        FieldId::Packets,
        FieldId::Bytes,
    ]
    .into_iter()
    .map(FieldSpec::new)
    .collect()
}

enum TimeZoneChoice {
    Utc,
    System,
    Offset(FixedOffset),
}

fn parse_time_zone(tz: Option<&str>) -> Result<TimeZoneChoice> {
    match tz {
        None | Some("unset") | Some("utc") | Some("UTC") => Ok(TimeZoneChoice::Utc),
        Some("system") => Ok(TimeZoneChoice::System),
        Some(offset) => offset
            .parse::<FixedOffset>()
            .map(TimeZoneChoice::Offset)
            .map_err(|_| {
                QueryError::Argument(format!(
                    "unknown time zone `{offset}` (expected system, unset, or a +HH:MM offset)"
                ))
            }),
    }
}

/// Accepted formats: `YYYY-MM-DD[ HH:MM[:SS]]` (also with a `T`
/// separator). The result is a UTC epoch; path formatting downstream is
/// UTC-only.
fn parse_time(s: &str, tz: &TimeZoneChoice) -> Result<i64> {
    let naive = parse_naive(s.trim())
        .ok_or_else(|| QueryError::Argument(format!("cannot parse time `{s}`")))?;
    let ambiguous = |zone: &str| {
        QueryError::Argument(format!("time `{s}` is ambiguous or skipped in {zone}"))
    };
    let utc = match tz {
        TimeZoneChoice::Utc => Utc.from_utc_datetime(&naive),
        TimeZoneChoice::System => Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| ambiguous("the system zone"))?
            .with_timezone(&Utc),
        TimeZoneChoice::Offset(offset) => offset
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| ambiguous("the given offset"))?
            .with_timezone(&Utc),
    };
    Ok(utc.timestamp())
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    const WITH_TIME: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in WITH_TIME {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("flowq").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn plain_invocation_is_list_mode() {
        let task = parse(&["/flows"]).build_task().unwrap();
        assert_eq!(task.mode, WorkingMode::List);
        assert_eq!(task.limit, 0);
        assert!(task.sort.is_none());
        assert!(task.use_tput && task.use_bfindex);
    }

    #[test]
    fn statistic_sugar() {
        let task = parse(&["-s", "srcip", "/flows"]).build_task().unwrap();
        assert_eq!(task.mode, WorkingMode::Aggr);
        assert_eq!(task.aggr_keys.len(), 1);
        assert_eq!(task.aggr_keys[0].id, FieldId::SrcAddr);
        assert_eq!(task.limit, 10);
        let sort = task.sort.unwrap();
        assert_eq!(sort.field.id, FieldId::Bytes);
        assert_eq!(sort.dir, SortDir::Desc);
        assert!(task.tput_applicable());

        let task = parse(&["-s", "srcip#packets", "-l", "5", "/flows"]).build_task().unwrap();
        assert_eq!(task.sort.unwrap().field.id, FieldId::Packets);
        assert_eq!(task.limit, 5);
    }

    #[test]
    fn order_flag_selects_sort_mode() {
        let task = parse(&["-o", "bytes#asc", "/flows"]).build_task().unwrap();
        assert_eq!(task.mode, WorkingMode::Sort);
        assert_eq!(task.sort.unwrap().dir, SortDir::Asc);
    }

    #[test]
    fn time_point_aligns_to_a_zero_length_range() {
        let task = parse(&["-t", "2024-01-01 00:03", "/flows"]).build_task().unwrap();
        let (begin, end) = task.time_range.unwrap();
        assert_eq!(begin, end);
        assert_eq!(begin % 300, 0);
        assert_eq!(begin, 1_704_067_200);
    }

    #[test]
    fn time_range_aligns_outward() {
        let task = parse(&["-T", "2024-01-01 00:03#2024-01-01 00:07", "/flows"])
            .build_task()
            .unwrap();
        let (begin, end) = task.time_range.unwrap();
        assert_eq!(begin, 1_704_067_200);
        assert_eq!(end, 1_704_067_200 + 600);
    }

    #[test]
    fn fixed_offset_zone_shifts_to_utc() {
        let task = parse(&[
            "--time-zone",
            "+01:00",
            "-t",
            "2024-01-01 01:00",
            "/flows",
        ])
        .build_task()
        .unwrap();
        assert_eq!(task.time_range.unwrap().0, 1_704_067_200);
    }

    #[test]
    fn bad_arguments_are_argument_errors() {
        assert!(matches!(
            parse(&["-s", "nonsense", "/flows"]).build_task(),
            Err(QueryError::Argument(_))
        ));
        assert!(matches!(
            parse(&["-t", "yesterday", "/flows"]).build_task(),
            Err(QueryError::Argument(_))
        ));
        assert!(matches!(parse(&["-a", ""]).build_task(), Err(QueryError::Argument(_))));
    }

    #[test]
    fn roles() {
        assert!(matches!(parse(&["/flows"]).role(), Role::Local { workers: 1 }));
        assert!(matches!(
            parse(&["--num-workers", "4", "/flows"]).role(),
            Role::Local { workers: 4 }
        ));
        assert!(matches!(
            parse(&["--connect", "coord:9000"]).role(),
            Role::Worker { .. }
        ));
        assert!(matches!(
            parse(&["--listen", "0.0.0.0:9000", "--workers", "8", "/flows"]).role(),
            Role::Coordinator { workers: 8, .. }
        ));
    }
}
