//! Worker controller: one query from task receipt to the final summary.
//!
//! The lifecycle is resolve → prune → process → stream. File processing
//! fans out over a rayon pool with one memory shard per fold, merged by the
//! associative memory merge at the end; per-file problems are warnings and
//! the file is skipped. Streaming then follows the working mode: list and
//! sort stream the local memory (honoring a coordinator `Stop`), plain
//! aggregation streams every entry, and Top-N aggregation walks the three
//! protocol rounds, deduplicating against what earlier rounds already
//! shipped. Any fatal error is surfaced to the coordinator as a `Failure`
//! sentinel before the worker gives up.

use crate::cluster::WorkerSession;
use crate::error::{QueryError, Result};
use crate::filter::Filter;
use crate::memory::{AggrMemory, ListMemory, LocalMemory};
use crate::paths::resolve_patterns;
use crate::progress::ProgressReporter;
use crate::prune::IndexPruner;
use crate::record::RecordLayout;
use crate::storage::{FileMeta, FlowReader, ProcessedSummary};
use crate::task::{TaskSpec, WorkingMode};
use crate::transport::{BatchSender, Endpoint, Message};
use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run the worker side of one query, then return.
pub fn run(session: WorkerSession, num_threads: usize) -> Result<()> {
    let task = match session.data.recv()? {
        Message::Task(task) => task,
        Message::Abort => return Ok(()),
        other => {
            return Err(QueryError::Protocol(format!(
                "expected task broadcast, got {other:?}"
            )));
        }
    };
    info!(rank = session.rank, mode = ?task.mode, "task received");

    let data = session.data.try_clone()?;
    match execute(session, &task, num_threads) {
        Ok(()) => Ok(()),
        Err(e) => {
            // the failure sentinel is best effort; the connection may be
            // the thing that broke
            let _ = data.send(&Message::Failure(e.to_string()));
            Err(e)
        }
    }
}

/// Coordinator messages observed by the worker, decoupled from socket
/// reads so the processing loop can poll an abort flag instead of a
/// socket.
struct Control {
    rx: Receiver<Message>,
    aborted: Arc<AtomicBool>,
}

impl Control {
    fn spawn(endpoint: Endpoint) -> Self {
        let (tx, rx) = unbounded();
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);
        std::thread::spawn(move || {
            while let Ok(msg) = endpoint.recv() {
                if matches!(msg, Message::Abort) {
                    flag.store(true, Ordering::Relaxed);
                }
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });
        Self { rx, aborted }
    }

    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Non-blocking look at the next coordinator message.
    fn poll(&self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(QueryError::Transport("coordinator connection lost".into()))
            }
        }
    }

    /// Blocking wait for the next round message.
    fn wait(&self) -> Result<Message> {
        self.rx
            .recv()
            .map_err(|_| QueryError::Transport("coordinator connection lost".into()))
    }
}

struct Shard {
    memory: Option<LocalMemory>,
    processed: ProcessedSummary,
    metadata: FileMeta,
    skipped_files: u64,
}

impl Shard {
    fn new(task: &TaskSpec, layout: Option<&Arc<RecordLayout>>) -> Self {
        let memory = layout.map(|layout| match task.mode {
            WorkingMode::Aggr => LocalMemory::Aggr(AggrMemory::new(Arc::clone(layout))),
            WorkingMode::List | WorkingMode::Sort => {
                LocalMemory::List(ListMemory::new(Arc::clone(layout)))
            }
            WorkingMode::Meta => unreachable!("meta mode has no record memory"),
        });
        Self {
            memory,
            processed: ProcessedSummary::default(),
            metadata: FileMeta::default(),
            skipped_files: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        if let (Some(mine), Some(theirs)) = (self.memory.as_mut(), other.memory) {
            mine.merge(theirs);
        }
        self.processed.merge(&other.processed);
        self.metadata.merge(&other.metadata);
        self.skipped_files += other.skipped_files;
        self
    }
}

fn execute(session: WorkerSession, task: &TaskSpec, num_threads: usize) -> Result<()> {
    let rank = session.rank;
    let filter = task
        .filter
        .as_deref()
        .map(Filter::compile)
        .transpose()?;
    let layout = match task.mode {
        WorkingMode::Meta => None,
        _ => Some(Arc::new(task.layout()?)),
    };

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("localhost"));
    let mut files = resolve_patterns(task, rank, &hostname);
    debug!(rank, files = files.len(), "paths resolved");

    if task.use_bfindex {
        if let Some(pruner) = filter.as_ref().and_then(|f| IndexPruner::build(f.expr())) {
            let before = files.len();
            files.retain(|f| pruner.keep_file(f));
            debug!(rank, pruned = before - files.len(), "index pruning done");
        }
    }

    let control = Control::spawn(session.data.try_clone()?);
    let reporter = ProgressReporter::new(session.progress, rank, files.len() as u32);

    let shard = process_files(
        &files,
        task,
        filter.as_ref(),
        layout.as_ref(),
        &reporter,
        &control,
        num_threads,
    );
    if shard.skipped_files > 0 {
        warn!(rank, skipped = shard.skipped_files, "files skipped due to read errors");
    }
    if control.aborted() {
        info!(rank, "query aborted, dropping partial results");
        return Ok(());
    }

    stream_results(session.data, task, layout.as_ref(), shard, &control)
}

fn process_files(
    files: &[PathBuf],
    task: &TaskSpec,
    filter: Option<&Filter>,
    layout: Option<&Arc<RecordLayout>>,
    reporter: &ProgressReporter,
    control: &Control,
    num_threads: usize,
) -> Shard {
    // at most one thread per file, bounded by the configured parallelism
    let threads = if num_threads == 0 { num_cpus::get() } else { num_threads };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.clamp(1, files.len().max(1)))
        .build();
    let run = || {
        files
            .par_iter()
            .fold(
                || Shard::new(task, layout),
                |mut shard, path| {
                    if control.aborted() {
                        return shard;
                    }
                    match process_file(path, task, filter, &mut shard) {
                        Ok(()) => reporter.file_done(),
                        Err(e) => {
                            shard.skipped_files += 1;
                            warn!(path = %path.display(), error = %e, "file skipped");
                        }
                    }
                    shard
                },
            )
            .reduce(|| Shard::new(task, layout), Shard::merge)
    };
    match pool {
        Ok(pool) => pool.install(run),
        Err(e) => {
            warn!(error = %e, "thread pool unavailable, processing on the caller");
            run()
        }
    }
}

fn process_file(
    path: &PathBuf,
    task: &TaskSpec,
    filter: Option<&Filter>,
    shard: &mut Shard,
) -> Result<()> {
    let mut reader = FlowReader::open(path)?;
    shard.metadata.merge(reader.meta());
    if task.mode == WorkingMode::Meta {
        return Ok(());
    }
    let memory = shard.memory.as_mut().expect("record modes carry a memory");
    while let Some(rec) = reader.next_record()? {
        if filter.is_none_or(|f| f.matches(&rec)) {
            shard.processed.add_record(&rec);
            memory.insert_flow(&rec);
        }
    }
    Ok(())
}

fn stream_results(
    data: Endpoint,
    task: &TaskSpec,
    layout: Option<&Arc<RecordLayout>>,
    shard: Shard,
    control: &Control,
) -> Result<()> {
    let stats = Message::Stats { processed: shard.processed, metadata: shard.metadata };
    match (task.mode, shard.memory) {
        (WorkingMode::Meta, _) => data.send(&stats),
        (WorkingMode::List, Some(LocalMemory::List(memory))) => {
            let records: Vec<&[u8]> = memory.records().iter().map(Vec::as_slice).collect();
            stream(data, layout.unwrap(), &records, control, vec![Message::Eos, stats])?;
            Ok(())
        }
        (WorkingMode::Sort, Some(LocalMemory::List(mut memory))) => {
            memory.sort(task.sort_dir());
            let records: Vec<&[u8]> = memory.records().iter().map(Vec::as_slice).collect();
            stream(data, layout.unwrap(), &records, control, vec![Message::Eos, stats])?;
            Ok(())
        }
        (WorkingMode::Aggr, Some(LocalMemory::Aggr(memory))) => {
            if task.tput_applicable() {
                run_tput_rounds(data, task, layout.unwrap(), &memory, control, stats)
            } else {
                stream(
                    data,
                    layout.unwrap(),
                    &memory.records(),
                    control,
                    vec![Message::Eos, stats],
                )?;
                Ok(())
            }
        }
        _ => Err(QueryError::Protocol("working mode and memory disagree".into())),
    }
}

/// Send `records` as batches, watching for an early `Stop`. Returns the
/// endpoint for further rounds.
fn stream(
    data: Endpoint,
    layout: &RecordLayout,
    records: &[&[u8]],
    control: &Control,
    tail: Vec<Message>,
) -> Result<Endpoint> {
    let mut sender = BatchSender::start(data, layout.size());
    for rec in records {
        match control.poll()? {
            Some(Message::Stop) => {
                debug!("stop received, truncating stream");
                break;
            }
            Some(Message::Abort) => {
                return Err(QueryError::Protocol("aborted by coordinator".into()));
            }
            _ => {}
        }
        sender.push(rec)?;
    }
    sender.finish(tail)
}

fn run_tput_rounds(
    data: Endpoint,
    task: &TaskSpec,
    layout: &Arc<RecordLayout>,
    memory: &AggrMemory,
    control: &Control,
    stats: Message,
) -> Result<()> {
    let dir = task.sort_dir();
    let mut sent: HashSet<Vec<u8>> = HashSet::new();

    // round 1: local top L
    let top = memory.top_n(task.limit as usize, dir);
    for rec in &top {
        sent.insert(layout.key_bytes(rec).to_vec());
    }
    let data = stream(data, layout, &top, control, vec![Message::Eos])?;

    // round 2: everything at or above the broadcast threshold, minus what
    // round 1 already shipped
    let threshold = match control.wait()? {
        Message::TputThreshold(t) => t,
        Message::Abort => return Err(QueryError::Protocol("aborted by coordinator".into())),
        other => {
            return Err(QueryError::Protocol(format!(
                "expected round-2 threshold, got {other:?}"
            )));
        }
    };
    let pulled: Vec<&[u8]> = memory
        .records_meeting(threshold, dir)
        .into_iter()
        .filter(|rec| !sent.contains(layout.key_bytes(rec)))
        .collect();
    for rec in &pulled {
        sent.insert(layout.key_bytes(rec).to_vec());
    }
    let data = stream(data, layout, &pulled, control, vec![Message::Eos])?;

    // round 3: exact values for the candidate keys we have not shipped yet
    let keys = match control.wait()? {
        Message::TputKeys(keys) => keys,
        Message::Abort => return Err(QueryError::Protocol("aborted by coordinator".into())),
        other => {
            return Err(QueryError::Protocol(format!(
                "expected round-3 key set, got {other:?}"
            )));
        }
    };
    let topped: Vec<&[u8]> = keys
        .iter()
        .filter(|key| !sent.contains(key.as_slice()))
        .filter_map(|key| memory.get(key))
        .collect();
    stream(data, layout, &topped, control, vec![Message::Eos, stats])?;
    Ok(())
}
