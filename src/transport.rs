//! Framed record transport between workers and the coordinator.
//!
//! Every connection carries length-prefixed postcard frames of [`Message`].
//! A worker holds two connections: the *data* socket (duplex: task and round
//! control downstream, record batches and summaries upstream) and the
//! *progress* socket (progress events upstream only), so progress reporting
//! can never reorder or stall the record stream.
//!
//! Record batches are staged through [`BatchSender`]: a dedicated socket
//! thread transmits one buffer while the producer fills the other, and the
//! producer blocks exactly when both buffers are in flight. The receiving
//! side gets the mirror image from [`spawn_reader`], whose bounded channel
//! holds two frames per worker. Within one connection frames arrive in send
//! order; nothing is promised across connections.

use crate::error::{QueryError, Result};
use crate::progress::ProgressEvent;
use crate::storage::{FileMeta, ProcessedSummary};
use crate::task::TaskSpec;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::Duration;

/// Payload capacity of one record batch.
pub const BATCH_CAPACITY: usize = 1 << 20;

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME: usize = 64 << 20;

/// Everything that travels between the coordinator and a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// First frame of a worker's data connection.
    JoinData,
    /// First frame of a worker's progress connection.
    JoinProgress { rank: u32 },
    /// Coordinator → worker: membership of the freshly joined worker.
    Assign { rank: u32, workers: u32 },
    /// Coordinator → worker: the query to run.
    Task(TaskSpec),
    /// Worker → coordinator: a batch of concatenated record buffers.
    Data(Vec<u8>),
    /// Worker → coordinator: end of the current record stream.
    Eos,
    /// Worker → coordinator: final per-worker summaries, after the last
    /// `Eos` of the query.
    Stats { processed: ProcessedSummary, metadata: FileMeta },
    /// Worker → coordinator on the progress socket.
    Progress(ProgressEvent),
    /// Coordinator → worker: Top-N round 2, pull everything meeting the
    /// threshold.
    TputThreshold(u64),
    /// Coordinator → worker: Top-N round 3, report exact values for these
    /// keys.
    TputKeys(Vec<Vec<u8>>),
    /// Coordinator → worker: the global limit is satisfied, wind down.
    Stop,
    /// Either direction: the query failed elsewhere, drop everything.
    Abort,
    /// Worker → coordinator: this worker failed; the message is the
    /// diagnostic.
    Failure(String),
}

/// One framed connection. Send and receive go through `&self`, but frames
/// interleave unless exactly one thread writes at a time; the worker hands
/// the write side to its [`BatchSender`] for the duration of a stream.
#[derive(Debug)]
pub struct Endpoint {
    stream: TcpStream,
}

impl Endpoint {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| QueryError::Transport(format!("connect: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| QueryError::Transport(format!("set_nodelay: {e}")))?;
        Ok(Self { stream })
    }

    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self { stream }
    }

    /// A second handle onto the same connection, for split read/write
    /// ownership across threads.
    pub fn try_clone(&self) -> Result<Self> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| QueryError::Transport(format!("clone stream: {e}")))?;
        Ok(Self { stream })
    }

    /// Bound the time `recv` may block; `None` waits forever.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|e| QueryError::Transport(format!("set timeout: {e}")))
    }

    pub fn send(&self, msg: &Message) -> Result<()> {
        let body = postcard::to_allocvec(msg)
            .map_err(|e| QueryError::Transport(format!("encode: {e}")))?;
        let len = u32::try_from(body.len())
            .map_err(|_| QueryError::Transport("frame over 4 GiB".into()))?;
        let mut stream = &self.stream;
        stream
            .write_all(&len.to_le_bytes())
            .and_then(|()| stream.write_all(&body))
            .map_err(|e| QueryError::Transport(format!("send: {e}")))
    }

    pub fn recv(&self) -> Result<Message> {
        let mut stream = &self.stream;
        let mut len = [0u8; 4];
        stream
            .read_exact(&mut len)
            .map_err(|e| QueryError::Transport(format!("recv: {e}")))?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_FRAME {
            return Err(QueryError::Protocol(format!("oversized frame of {len} bytes")));
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .map_err(|e| QueryError::Transport(format!("recv: {e}")))?;
        postcard::from_bytes(&body).map_err(|e| QueryError::Transport(format!("decode: {e}")))
    }
}

enum SendItem {
    Batch(Vec<u8>),
    /// Trailing messages flushed behind the last batch, in order.
    Tail(Vec<Message>),
}

/// Double-buffered batch writer for one record stream.
///
/// Two buffers circulate between the producer and the socket thread. The
/// producer fills one while the other is on the wire; [`push`](Self::push)
/// blocks only when both are in flight, which is the transport's natural
/// backpressure toward slow coordinators.
pub struct BatchSender {
    record_size: usize,
    current: Vec<u8>,
    free_rx: Receiver<Vec<u8>>,
    filled_tx: Sender<SendItem>,
    io: JoinHandle<Result<Endpoint>>,
}

impl BatchSender {
    /// Take over the write side of `endpoint` for one stream.
    #[must_use]
    pub fn start(endpoint: Endpoint, record_size: usize) -> Self {
        let (free_tx, free_rx) = bounded::<Vec<u8>>(2);
        let (filled_tx, filled_rx) = bounded::<SendItem>(2);
        // one buffer in the producer's hands, one in the pool
        let current = Vec::with_capacity(BATCH_CAPACITY);
        free_tx
            .send(Vec::with_capacity(BATCH_CAPACITY))
            .expect("pool channel is empty");

        let io = std::thread::spawn(move || -> Result<Endpoint> {
            while let Ok(item) = filled_rx.recv() {
                match item {
                    SendItem::Batch(buf) => {
                        let msg = Message::Data(buf);
                        endpoint.send(&msg)?;
                        let Message::Data(mut recycled) = msg else { unreachable!() };
                        recycled.clear();
                        // producer may already be gone on early stop
                        let _ = free_tx.send(recycled);
                    }
                    SendItem::Tail(msgs) => {
                        for msg in &msgs {
                            endpoint.send(msg)?;
                        }
                    }
                }
            }
            Ok(endpoint)
        });

        Self { record_size, current, free_rx, filled_tx, io }
    }

    /// Append one record, flushing the buffer when full.
    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        debug_assert_eq!(record.len(), self.record_size);
        if self.current.len() + self.record_size > BATCH_CAPACITY {
            self.flush()?;
        }
        self.current.extend_from_slice(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        // blocks here iff both buffers are in flight
        let next = self
            .free_rx
            .recv()
            .map_err(|_| QueryError::Transport("send thread gone".into()))?;
        let full = std::mem::replace(&mut self.current, next);
        self.filled_tx
            .send(SendItem::Batch(full))
            .map_err(|_| QueryError::Transport("send thread gone".into()))?;
        Ok(())
    }

    /// Flush the partial batch, append `tail` messages (an `Eos`, usually
    /// followed by `Stats`), and give the endpoint back.
    pub fn finish(mut self, tail: Vec<Message>) -> Result<Endpoint> {
        self.flush()?;
        self.filled_tx
            .send(SendItem::Tail(tail))
            .map_err(|_| QueryError::Transport("send thread gone".into()))?;
        drop(self.filled_tx);
        self.io
            .join()
            .map_err(|_| QueryError::Transport("send thread panicked".into()))?
    }
}

/// Forward frames of `endpoint` into a bounded channel two frames deep,
/// the receive-side pair of buffers. The thread ends at the first error or
/// when the channel's consumer goes away.
#[must_use]
pub fn spawn_reader(endpoint: Endpoint) -> Receiver<Result<Message>> {
    let (tx, rx) = bounded::<Result<Message>>(2);
    std::thread::spawn(move || {
        loop {
            let msg = endpoint.recv();
            let failed = msg.is_err();
            if tx.send(msg).is_err() || failed {
                break;
            }
        }
    });
    rx
}
