//! Coordinator: broadcast, strategy selection, merge.
//!
//! After the task broadcast every worker owns its share of the data; the
//! coordinator's job is to fold the partial streams back together with the
//! strategy the working mode demands:
//!
//! - **LIST** drains streams in arrival order and stops the cluster early
//!   once the global limit is reached,
//! - **SORT** runs a k-way merge over the per-worker streams, which arrive
//!   already sorted, so one peeked record per worker suffices,
//! - **AGGR** re-aggregates everything into a global memory, optionally
//!   running the three Top-N rounds instead of a full pull,
//! - **META** only collects the per-worker summaries.
//!
//! Per-worker receive threads (two frames of lookahead each, matching the
//! double send buffers on the worker side) feed the single merge loop. Any
//! worker failure aborts the whole query: the coordinator broadcasts
//! `Abort`, drops partial output and surfaces the error.

use crate::cluster::Cluster;
use crate::error::{QueryError, Result};
use crate::filter::Filter;
use crate::memory::AggrMemory;
use crate::progress::{ProgressCollector, ProgressDest, ProgressKind};
use crate::storage::{FileMeta, ProcessedSummary};
use crate::task::{TaskSpec, WorkingMode};
use crate::transport::{spawn_reader, Endpoint, Message};
use crate::tput;
use crossbeam_channel::{unbounded, Receiver, Select};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Coordinator-side knobs that are not part of the task itself.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Per-message receive timeout; expiry counts as a worker failure.
    pub timeout: Duration,
    pub progress: ProgressKind,
    pub progress_dest: ProgressDest,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            progress: ProgressKind::None,
            progress_dest: ProgressDest::Stderr,
        }
    }
}

/// The merged answer of one query.
#[derive(Debug)]
pub struct QueryResult {
    /// Final records, ordered and truncated to the limit. Empty in meta
    /// mode.
    pub records: Vec<Vec<u8>>,
    pub processed: ProcessedSummary,
    pub metadata: FileMeta,
}

struct WorkerChan {
    rank: u32,
    data: Endpoint,
    rx: Receiver<Result<Message>>,
    timeout: Duration,
}

impl WorkerChan {
    fn recv(&self) -> Result<Message> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(msg) => check(self.rank, msg),
            Err(_) => Err(QueryError::Transport(format!(
                "worker {} stopped responding",
                self.rank
            ))),
        }
    }
}

/// Unwrap one received frame, folding worker failures into errors.
fn check(rank: u32, msg: Result<Message>) -> Result<Message> {
    match msg? {
        Message::Failure(reason) => Err(QueryError::Transport(format!(
            "worker {rank} failed: {reason}"
        ))),
        msg => Ok(msg),
    }
}

/// Run one query over an assembled cluster.
///
/// Argument-class errors surface before anything is broadcast; later
/// failures trigger a collective abort and no partial output is returned.
pub fn run_query(
    cluster: Cluster,
    task: &TaskSpec,
    config: &CoordinatorConfig,
) -> Result<QueryResult> {
    task.validate()?;
    if let Some(expr) = task.filter.as_deref() {
        // fail on bad filters here, before the broadcast, not on W workers
        Filter::compile(expr)?;
    }

    let workers = cluster.size();
    let collector = ProgressCollector::new(config.progress, &config.progress_dest, workers)?;
    let (progress_tx, progress_rx) = unbounded();
    let collector_handle = collector.spawn(progress_rx);

    let mut chans = Vec::with_capacity(workers);
    for link in cluster.workers {
        let tx = progress_tx.clone();
        let progress = link.progress;
        std::thread::spawn(move || {
            while let Ok(Message::Progress(ev)) = progress.recv() {
                if tx.send(ev).is_err() {
                    break;
                }
            }
        });
        let reader = spawn_reader(link.data.try_clone()?);
        chans.push(WorkerChan {
            rank: link.rank,
            data: link.data,
            rx: reader,
            timeout: config.timeout,
        });
    }
    drop(progress_tx);

    for chan in &chans {
        chan.data.send(&Message::Task(task.clone()))?;
    }
    info!(workers, mode = ?task.mode, "task broadcast");

    let result = merge(&chans, task);
    if result.is_err() {
        for chan in &chans {
            let _ = chan.data.send(&Message::Abort);
        }
    }
    // progress forwarders end when the workers close their sockets
    drop(chans);
    let _ = collector_handle.join();
    result
}

fn merge(chans: &[WorkerChan], task: &TaskSpec) -> Result<QueryResult> {
    let records = match task.mode {
        WorkingMode::Meta => Vec::new(),
        WorkingMode::List => run_list(chans, task)?,
        WorkingMode::Sort => run_sort(chans, task)?,
        WorkingMode::Aggr => {
            if task.tput_applicable() {
                run_tput(chans, task)?
            } else {
                run_aggr(chans, task)?
            }
        }
    };

    let mut processed = ProcessedSummary::default();
    let mut metadata = FileMeta::default();
    for chan in chans.iter() {
        match chan.recv()? {
            Message::Stats { processed: p, metadata: m } => {
                processed.merge(&p);
                metadata.merge(&m);
            }
            other => {
                return Err(QueryError::Protocol(format!(
                    "expected summary from worker {}, got {other:?}",
                    chan.rank
                )));
            }
        }
    }
    Ok(QueryResult { records, processed, metadata })
}

/// Receive one full round from every worker: batches are handed to `sink`
/// in per-worker order until each stream posts its `Eos`.
fn gather_round(
    chans: &[WorkerChan],
    mut sink: impl FnMut(usize, Vec<u8>) -> Result<()>,
) -> Result<()> {
    let mut open: Vec<bool> = vec![true; chans.len()];
    let mut remaining = chans.len();
    while remaining > 0 {
        let mut sel = Select::new();
        let mut index_map = Vec::with_capacity(remaining);
        for (i, chan) in chans.iter().enumerate() {
            if open[i] {
                index_map.push(i);
                sel.recv(&chan.rx);
            }
        }
        let op = sel
            .select_timeout(chans[index_map[0]].timeout)
            .map_err(|_| QueryError::Transport("workers stopped responding".into()))?;
        let i = index_map[op.index()];
        let msg = op
            .recv(&chans[i].rx)
            .map_err(|_| QueryError::Transport(format!("worker {} hung up", chans[i].rank)))?;
        match check(chans[i].rank, msg)? {
            Message::Data(batch) => sink(i, batch)?,
            Message::Eos => {
                open[i] = false;
                remaining -= 1;
            }
            other => {
                return Err(QueryError::Protocol(format!(
                    "unexpected {other:?} from worker {} mid-stream",
                    chans[i].rank
                )));
            }
        }
    }
    Ok(())
}

fn run_list(chans: &[WorkerChan], task: &TaskSpec) -> Result<Vec<Vec<u8>>> {
    let layout = Arc::new(task.layout()?);
    let limit = task.limit as usize;
    let mut records: Vec<Vec<u8>> = Vec::new();
    let mut stopped = false;

    // split borrows: the sink needs `records`, the stop hint needs `chans`
    let stop_targets: Vec<&Endpoint> = chans.iter().map(|c| &c.data).collect();
    gather_round(chans, |_, batch| {
        for rec in layout.split_batch(&batch)? {
            if limit == 0 || records.len() < limit {
                records.push(rec.to_vec());
            }
        }
        if limit > 0 && records.len() >= limit && !stopped {
            debug!(limit, "limit reached, stopping the cluster");
            for ep in &stop_targets {
                let _ = ep.send(&Message::Stop);
            }
            stopped = true;
        }
        Ok(())
    })?;
    Ok(records)
}

fn run_aggr(chans: &[WorkerChan], task: &TaskSpec) -> Result<Vec<Vec<u8>>> {
    let layout = Arc::new(task.layout()?);
    let mut memory = AggrMemory::new(Arc::clone(&layout));
    gather_round(chans, |_, batch| {
        for rec in layout.split_batch(&batch)? {
            memory.insert_record(rec);
        }
        Ok(())
    })?;

    let sorted: Vec<Vec<u8>> = if task.sort.is_some() {
        memory.sorted_records(task.sort_dir()).into_iter().map(<[u8]>::to_vec).collect()
    } else {
        memory.records().into_iter().map(<[u8]>::to_vec).collect()
    };
    Ok(apply_limit(sorted, task.limit))
}

fn run_tput(chans: &[WorkerChan], task: &TaskSpec) -> Result<Vec<Vec<u8>>> {
    let layout = Arc::new(task.layout()?);
    let workers = chans.len();
    let mut memory = AggrMemory::new(Arc::clone(&layout));
    let absorb = |memory: &mut AggrMemory, chans: &[WorkerChan]| -> Result<()> {
        gather_round(chans, |_, batch| {
            for rec in layout.split_batch(&batch)? {
                memory.insert_record(rec);
            }
            Ok(())
        })
    };

    // round 1: local tops, then derive the pull threshold
    absorb(&mut memory, chans)?;
    let threshold = tput::pull_threshold(&memory, task.limit, workers);
    debug!(threshold, "top-n round 1 merged");
    for chan in chans.iter() {
        chan.data.send(&Message::TputThreshold(threshold))?;
    }

    // round 2: threshold pull; the candidate set is now a superset of the
    // true top L
    absorb(&mut memory, chans)?;
    let candidates = tput::candidate_keys(&memory, task.limit);
    debug!(candidates = candidates.len(), "top-n round 2 merged");
    for chan in chans.iter() {
        chan.data.send(&Message::TputKeys(candidates.clone()))?;
    }

    // round 3: exact top-up
    absorb(&mut memory, chans)?;
    let sorted: Vec<Vec<u8>> = memory
        .sorted_records(task.sort_dir())
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();
    Ok(apply_limit(sorted, task.limit))
}

/// Streaming cursor over one worker's sorted stream.
struct SortCursor {
    batch: Vec<u8>,
    offset: usize,
    done: bool,
}

impl SortCursor {
    fn next(&mut self, chan: &WorkerChan, record_size: usize) -> Result<Option<Vec<u8>>> {
        loop {
            if self.offset + record_size <= self.batch.len() {
                let rec = self.batch[self.offset..self.offset + record_size].to_vec();
                self.offset += record_size;
                return Ok(Some(rec));
            }
            if self.done {
                return Ok(None);
            }
            match chan.recv()? {
                Message::Data(batch) => {
                    if batch.len() % record_size != 0 {
                        return Err(QueryError::Protocol(format!(
                            "ragged batch from worker {}",
                            chan.rank
                        )));
                    }
                    self.batch = batch;
                    self.offset = 0;
                }
                Message::Eos => self.done = true,
                other => {
                    return Err(QueryError::Protocol(format!(
                        "unexpected {other:?} from worker {} mid-stream",
                        chan.rank
                    )));
                }
            }
        }
    }

    /// Discard the rest of the stream up to its `Eos`.
    fn drain(&mut self, chan: &WorkerChan, record_size: usize) -> Result<()> {
        while self.next(chan, record_size)?.is_some() {
            self.batch.clear();
            self.offset = 0;
        }
        Ok(())
    }
}

fn run_sort(chans: &[WorkerChan], task: &TaskSpec) -> Result<Vec<Vec<u8>>> {
    let layout = Arc::new(task.layout()?);
    let record_size = layout.size();
    let dir = task.sort_dir();
    let limit = task.limit as usize;

    let rank_of = |buf: &[u8]| match dir {
        crate::fields::SortDir::Desc => layout.sort_value(buf),
        crate::fields::SortDir::Asc => u128::MAX - layout.sort_value(buf),
    };

    let mut cursors: Vec<SortCursor> = chans
        .iter()
        .map(|_| SortCursor { batch: Vec::new(), offset: 0, done: false })
        .collect();

    // each stream is internally sorted, so one peeked record per worker is
    // enough for an exact global merge
    let mut heap: BinaryHeap<(u128, Reverse<usize>, Vec<u8>)> = BinaryHeap::new();
    for (i, cursor) in cursors.iter_mut().enumerate() {
        if let Some(rec) = cursor.next(&chans[i], record_size)? {
            heap.push((rank_of(&rec), Reverse(i), rec));
        }
    }

    let mut records = Vec::new();
    while let Some((_, Reverse(i), rec)) = heap.pop() {
        records.push(rec);
        if limit > 0 && records.len() >= limit {
            break;
        }
        if let Some(next) = cursors[i].next(&chans[i], record_size)? {
            heap.push((rank_of(&next), Reverse(i), next));
        }
    }

    if limit > 0 && records.len() >= limit {
        for chan in chans.iter() {
            let _ = chan.data.send(&Message::Stop);
        }
        for (i, cursor) in cursors.iter_mut().enumerate() {
            cursor.drain(&chans[i], record_size)?;
        }
    }
    Ok(records)
}

fn apply_limit(mut records: Vec<Vec<u8>>, limit: u64) -> Vec<Vec<u8>> {
    if limit > 0 {
        records.truncate(limit as usize);
    }
    records
}
