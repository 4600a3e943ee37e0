//! Rendering of merged query results.
//!
//! Columns follow the record layout (keys first, then the remaining
//! requested fields). Two formats: an aligned pretty table and CSV. The
//! summary block under the table reports the processed counters and, in
//! metadata mode, the full per-protocol breakdown.

use crate::error::Result;
use crate::record::{RecordLayout, Value};
use crate::storage::{FileMeta, ProcessedSummary};
use crate::task::{TaskSpec, WorkingMode};
use chrono::DateTime;
use std::io::Write;

/// Output format of the records table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Pretty,
    Csv,
}

/// Which parts of the result to print.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputItems {
    Records,
    Summary,
    #[default]
    All,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Csv => "csv",
        })
    }
}

impl std::fmt::Display for OutputItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Records => "records",
            Self::Summary => "summary",
            Self::All => "all",
        })
    }
}

fn format_value(v: &Value) -> String {
    match v {
        Value::Time(ms) => DateTime::from_timestamp_millis(*ms as i64)
            .map_or_else(|| ms.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        Value::Addr(a) => a.to_string(),
        Value::Num(n) => n.to_string(),
    }
}

/// Render the records of a non-meta query.
pub fn render_records(
    out: &mut impl Write,
    layout: &RecordLayout,
    records: &[Vec<u8>],
    format: OutputFormat,
) -> Result<()> {
    let headers: Vec<&str> = layout.slots().iter().map(|s| s.spec.id.name()).collect();
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|rec| {
            layout
                .slots()
                .iter()
                .map(|slot| format_value(&layout.value(slot, rec)))
                .collect()
        })
        .collect();

    match format {
        OutputFormat::Csv => {
            let csv_err = |e: csv::Error| std::io::Error::other(e.to_string());
            let mut w = csv::Writer::from_writer(out);
            w.write_record(&headers).map_err(csv_err)?;
            for row in &rows {
                w.write_record(row).map_err(csv_err)?;
            }
            w.flush()?;
        }
        OutputFormat::Pretty => {
            let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
            for row in &rows {
                for (w, cell) in widths.iter_mut().zip(row) {
                    *w = (*w).max(cell.len());
                }
            }
            let line = |out: &mut dyn Write, cells: &[String]| -> std::io::Result<()> {
                let mut first = true;
                for (cell, w) in cells.iter().zip(&widths) {
                    if !first {
                        write!(out, "  ")?;
                    }
                    write!(out, "{cell:>w$}")?;
                    first = false;
                }
                writeln!(out)
            };
            line(out, &headers.iter().map(|s| (*s).to_string()).collect::<Vec<_>>())?;
            for row in &rows {
                line(out, row)?;
            }
        }
    }
    Ok(())
}

/// Render the trailing summary (or the whole output in meta mode).
pub fn render_summary(
    out: &mut impl Write,
    task: &TaskSpec,
    processed: &ProcessedSummary,
    metadata: &FileMeta,
) -> Result<()> {
    if task.mode == WorkingMode::Meta {
        writeln!(out, "metadata summary:")?;
        let rows = [
            ("total", metadata.flows, metadata.packets, metadata.bytes),
            ("tcp", metadata.flows_tcp, metadata.packets_tcp, metadata.bytes_tcp),
            ("udp", metadata.flows_udp, metadata.packets_udp, metadata.bytes_udp),
            ("icmp", metadata.flows_icmp, metadata.packets_icmp, metadata.bytes_icmp),
            ("other", metadata.flows_other, metadata.packets_other, metadata.bytes_other),
        ];
        writeln!(out, "{:>8}  {:>14}  {:>14}  {:>14}", "proto", "flows", "packets", "bytes")?;
        for (name, flows, packets, bytes) in rows {
            writeln!(out, "{name:>8}  {flows:>14}  {packets:>14}  {bytes:>14}")?;
        }
    } else {
        writeln!(
            out,
            "processed {} flows, {} packets, {} bytes",
            processed.flows, processed.packets, processed.bytes
        )?;
    }
    Ok(())
}
