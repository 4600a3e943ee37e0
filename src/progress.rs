//! Progress reporting across the cluster.
//!
//! Workers post one event per completed file on their dedicated progress
//! connection; the coordinator folds the events into a per-worker table and
//! renders it in one of four styles. Progress shares no channel with record
//! data, so a stalled render can never reorder or delay the merge.

use crate::error::{QueryError, Result};
use crate::transport::{Endpoint, Message};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Snapshot of one worker's file loop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub worker: u32,
    pub files_done: u32,
    pub files_total: u32,
}

/// Rendering style of the progress display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressKind {
    None,
    #[default]
    Total,
    PerWorker,
    Json,
}

impl ProgressKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "total" => Ok(Self::Total),
            "perslave" => Ok(Self::PerWorker),
            "json" => Ok(Self::Json),
            other => Err(QueryError::Argument(format!(
                "unknown progress bar type `{other}`"
            ))),
        }
    }
}

/// Where progress output goes.
#[derive(Clone, Debug, Default)]
pub enum ProgressDest {
    #[default]
    Stderr,
    Stdout,
    File(PathBuf),
}

impl ProgressDest {
    pub fn parse(s: &str) -> Self {
        match s {
            "stderr" => Self::Stderr,
            "stdout" => Self::Stdout,
            path => Self::File(PathBuf::from(path)),
        }
    }

    fn open(&self) -> Result<Box<dyn Write + Send>> {
        Ok(match self {
            Self::Stderr => Box::new(std::io::stderr()),
            Self::Stdout => Box::new(std::io::stdout()),
            Self::File(path) => Box::new(std::fs::File::create(path)?),
        })
    }
}

const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// Coordinator-side state and renderer.
pub struct ProgressCollector {
    kind: ProgressKind,
    out: Box<dyn Write + Send>,
    workers: Vec<(u32, u32)>,
    started: Instant,
    last_render: Option<Instant>,
    lines_drawn: usize,
}

impl ProgressCollector {
    pub fn new(kind: ProgressKind, dest: &ProgressDest, workers: usize) -> Result<Self> {
        Ok(Self {
            kind,
            out: dest.open()?,
            workers: vec![(0, 0); workers],
            started: Instant::now(),
            last_render: None,
            lines_drawn: 0,
        })
    }

    /// Fold one event in and redraw, rate-limited to roughly 10 Hz.
    pub fn update(&mut self, ev: ProgressEvent) {
        if let Some(slot) = self.workers.get_mut(ev.worker as usize) {
            *slot = (ev.files_done, ev.files_total);
        }
        if self.kind == ProgressKind::None {
            return;
        }
        let due = self
            .last_render
            .is_none_or(|t| t.elapsed() >= RENDER_INTERVAL);
        if due {
            self.render(false);
            self.last_render = Some(Instant::now());
        }
    }

    /// Final unconditional render, leaving the cursor on a fresh line.
    pub fn finish(&mut self) {
        if self.kind == ProgressKind::None {
            return;
        }
        self.render(true);
        if matches!(self.kind, ProgressKind::Total | ProgressKind::PerWorker) {
            let _ = writeln!(self.out);
        }
        let _ = self.out.flush();
    }

    fn render(&mut self, last: bool) {
        let (done, total) = self
            .workers
            .iter()
            .fold((0u64, 0u64), |(d, t), (wd, wt)| (d + u64::from(*wd), t + u64::from(*wt)));
        match self.kind {
            ProgressKind::None => {}
            ProgressKind::Total => {
                let _ = write!(self.out, "\rprocessed {done}/{total} files");
                let _ = self.out.flush();
            }
            ProgressKind::PerWorker => {
                if self.lines_drawn > 0 {
                    // move back over the previous block
                    let _ = write!(self.out, "\x1b[{}A", self.lines_drawn);
                }
                for (rank, (wd, wt)) in self.workers.iter().enumerate() {
                    let _ = writeln!(self.out, "\x1b[2Kworker {rank}: {wd}/{wt} files");
                }
                self.lines_drawn = self.workers.len();
                let _ = self.out.flush();
            }
            ProgressKind::Json => {
                let snapshot = json!({
                    "elapsed_ms": self.started.elapsed().as_millis() as u64,
                    "files_done": done,
                    "files_total": total,
                    "finished": last,
                    "workers": self
                        .workers
                        .iter()
                        .enumerate()
                        .map(|(rank, (wd, wt))| {
                            json!({ "rank": rank, "files_done": wd, "files_total": wt })
                        })
                        .collect::<Vec<_>>(),
                });
                let _ = writeln!(self.out, "{snapshot}");
                let _ = self.out.flush();
            }
        }
    }

    /// Consume events from `rx` on a dedicated thread until all senders are
    /// gone, then render the final state.
    #[must_use]
    pub fn spawn(mut self, rx: crossbeam_channel::Receiver<ProgressEvent>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while let Ok(ev) = rx.recv() {
                self.update(ev);
            }
            self.finish();
        })
    }
}

/// Worker-side reporter, shared by the processing threads.
pub struct ProgressReporter {
    endpoint: Mutex<Endpoint>,
    rank: u32,
    files_total: u32,
    files_done: AtomicU32,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(endpoint: Endpoint, rank: u32, files_total: u32) -> Self {
        Self { endpoint: Mutex::new(endpoint), rank, files_total, files_done: AtomicU32::new(0) }
            .into_initialized()
    }

    fn into_initialized(self) -> Self {
        // announce the total up front so the coordinator can size the bar
        let _ = self.endpoint.lock().map(|ep| {
            ep.send(&Message::Progress(ProgressEvent {
                worker: self.rank,
                files_done: 0,
                files_total: self.files_total,
            }))
        });
        self
    }

    /// Post the completion of one file. Progress failures never fail the
    /// query; the event is simply lost.
    pub fn file_done(&self) {
        let done = self.files_done.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(ep) = self.endpoint.lock() {
            let _ = ep.send(&Message::Progress(ProgressEvent {
                worker: self.rank,
                files_done: done,
                files_total: self.files_total,
            }));
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("rank", &self.rank)
            .field("files_total", &self.files_total)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!(ProgressKind::parse("none").unwrap(), ProgressKind::None);
        assert_eq!(ProgressKind::parse("perslave").unwrap(), ProgressKind::PerWorker);
        assert!(ProgressKind::parse("fancy").is_err());
    }

    #[test]
    fn dest_parsing() {
        assert!(matches!(ProgressDest::parse("stderr"), ProgressDest::Stderr));
        assert!(matches!(ProgressDest::parse("stdout"), ProgressDest::Stdout));
        assert!(matches!(ProgressDest::parse("/tmp/p.json"), ProgressDest::File(_)));
    }

    #[test]
    fn json_renderer_emits_ndjson_snapshots() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("progress.ndjson");
        let mut c = ProgressCollector::new(
            ProgressKind::Json,
            &ProgressDest::File(path.clone()),
            2,
        )?;
        c.update(ProgressEvent { worker: 0, files_done: 1, files_total: 4 });
        c.update(ProgressEvent { worker: 1, files_done: 2, files_total: 4 });
        c.finish();
        drop(c);

        let body = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = body.lines().collect();
        assert!(!lines.is_empty());
        let last: serde_json::Value = serde_json::from_str(lines.last().unwrap())?;
        assert_eq!(last["files_total"], 8);
        assert_eq!(last["finished"], true);
        assert_eq!(last["workers"].as_array().unwrap().len(), 2);
        Ok(())
    }
}
