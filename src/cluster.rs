//! Cluster bootstrap.
//!
//! Membership is fixed before the first query byte moves: the coordinator
//! listens until the expected number of workers has joined, each worker
//! contributing one data connection and one progress connection. Ranks are
//! handed out in data-join order. The same machinery serves real clusters
//! (`--listen`/`--connect`) and the single-machine mode, which spawns its
//! workers as in-process threads against a loopback listener.

use crate::error::{QueryError, Result};
use crate::transport::{Endpoint, Message};
use std::net::{TcpListener, ToSocketAddrs};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Coordinator-side handle of one worker.
#[derive(Debug)]
pub struct WorkerLink {
    pub rank: u32,
    pub data: Endpoint,
    pub progress: Endpoint,
}

/// The fully assembled cluster, ready for a query broadcast.
#[derive(Debug)]
pub struct Cluster {
    pub workers: Vec<WorkerLink>,
}

impl Cluster {
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

/// Worker-side view of the cluster after joining.
#[derive(Debug)]
pub struct WorkerSession {
    pub rank: u32,
    pub workers: u32,
    pub data: Endpoint,
    pub progress: Endpoint,
}

/// Accept connections on `listener` until `workers` workers have joined
/// with both their connections.
pub fn assemble(listener: &TcpListener, workers: usize) -> Result<Cluster> {
    let mut data: Vec<Option<Endpoint>> = (0..workers).map(|_| None).collect();
    let mut progress: Vec<Option<Endpoint>> = (0..workers).map(|_| None).collect();
    let mut joined = 0usize;
    let mut complete = 0usize;

    while complete < workers {
        let (stream, peer) = listener
            .accept()
            .map_err(|e| QueryError::Transport(format!("accept: {e}")))?;
        let ep = Endpoint::from_stream(stream);
        match ep.recv()? {
            Message::JoinData => {
                if joined == workers {
                    return Err(QueryError::Protocol(format!(
                        "unexpected extra worker from {peer}"
                    )));
                }
                let rank = joined as u32;
                ep.send(&Message::Assign { rank, workers: workers as u32 })?;
                debug!(rank, %peer, "worker data connection up");
                data[joined] = Some(ep);
                joined += 1;
            }
            Message::JoinProgress { rank } => {
                let slot = progress
                    .get_mut(rank as usize)
                    .ok_or_else(|| QueryError::Protocol(format!("join with bad rank {rank}")))?;
                if slot.is_some() {
                    return Err(QueryError::Protocol(format!(
                        "duplicate progress connection for rank {rank}"
                    )));
                }
                debug!(rank, %peer, "worker progress connection up");
                *slot = Some(ep);
                complete += 1;
            }
            other => {
                return Err(QueryError::Protocol(format!(
                    "unexpected join message {other:?} from {peer}"
                )));
            }
        }
    }

    info!(workers, "cluster assembled");
    let links = data
        .into_iter()
        .zip(progress)
        .enumerate()
        .map(|(rank, (d, p))| WorkerLink {
            rank: rank as u32,
            data: d.expect("all data connections joined"),
            progress: p.expect("all progress connections joined"),
        })
        .collect();
    Ok(Cluster { workers: links })
}

/// Bind and assemble in one step (the `--listen` role).
pub fn listen(addr: impl ToSocketAddrs, workers: usize) -> Result<Cluster> {
    let listener =
        TcpListener::bind(addr).map_err(|e| QueryError::Transport(format!("bind: {e}")))?;
    assemble(&listener, workers)
}

/// Join a coordinator (the `--connect` role).
pub fn join(addr: impl ToSocketAddrs + Copy) -> Result<WorkerSession> {
    let data = Endpoint::connect(addr)?;
    data.send(&Message::JoinData)?;
    let (rank, workers) = match data.recv()? {
        Message::Assign { rank, workers } => (rank, workers),
        other => {
            return Err(QueryError::Protocol(format!(
                "expected rank assignment, got {other:?}"
            )));
        }
    };
    let progress = Endpoint::connect(addr)?;
    progress.send(&Message::JoinProgress { rank })?;
    debug!(rank, workers, "joined cluster");
    Ok(WorkerSession { rank, workers, data, progress })
}

/// Spawn `workers` in-process worker threads against a loopback listener
/// and assemble the cluster. Single-worker runs still cross the full
/// coordinator protocol this way.
pub fn spawn_local(
    workers: usize,
    num_threads: usize,
) -> Result<(Cluster, Vec<JoinHandle<Result<()>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| QueryError::Transport(format!("bind loopback: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| QueryError::Transport(format!("local addr: {e}")))?;

    let handles: Vec<JoinHandle<Result<()>>> = (0..workers)
        .map(|_| {
            std::thread::spawn(move || {
                let session = join(addr)?;
                crate::worker::run(session, num_threads)
            })
        })
        .collect();

    let cluster = assemble(&listener, workers)?;
    Ok((cluster, handles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_join_order() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let joiners: Vec<_> = (0..3)
            .map(|_| std::thread::spawn(move || join(addr).unwrap()))
            .collect();
        let cluster = assemble(&listener, 3)?;
        assert_eq!(cluster.size(), 3);

        let mut ranks: Vec<u32> = joiners
            .into_iter()
            .map(|h| h.join().unwrap())
            .map(|s| {
                assert_eq!(s.workers, 3);
                s.rank
            })
            .collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2]);
        Ok(())
    }
}
