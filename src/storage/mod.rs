//! Flow-capture file storage.
//!
//! A flow file is a stream of postcard-encoded [`FlowRecord`]s behind a small
//! header: the magic `FQF1`, a length-prefixed [`FileMeta`] block with the
//! per-protocol counters, then one length-prefixed record after another until
//! end of file. The metadata block lets metadata-only queries answer without
//! scanning a single record.
//!
//! Files ending in `.gz` are read and written through a gzip codec (feature
//! `compression-gzip`), detected by extension the same way the sidecar lookup
//! works: the codec wraps the whole byte stream, magic included.

pub mod bloom;

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// File magic of the flow-capture format.
pub const FILE_MAGIC: &[u8; 4] = b"FQF1";

/// One flow record as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Start of the flow, milliseconds since the epoch.
    pub first: u64,
    /// End of the flow, milliseconds since the epoch.
    pub last: u64,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub tcp_flags: u8,
    pub tos: u8,
    pub packets: u64,
    pub bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
    /// Number of original flows this record stands for (1 unless the
    /// exporter pre-aggregated).
    pub flows: u64,
    pub src_as: u32,
    pub dst_as: u32,
    pub in_if: u32,
    pub out_if: u32,
}

impl Default for FlowRecord {
    fn default() -> Self {
        Self {
            first: 0,
            last: 0,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            proto: 0,
            tcp_flags: 0,
            tos: 0,
            packets: 0,
            bytes: 0,
            out_packets: 0,
            out_bytes: 0,
            flows: 1,
            src_as: 0,
            dst_as: 0,
            in_if: 0,
            out_if: 0,
        }
    }
}

/// Protocol buckets of the per-file counters.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_ICMP6: u8 = 58;

/// Per-file metadata summary: flows/packets/bytes split by protocol, plus
/// the totals. Read without scanning records; summed across files and
/// workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub flows: u64,
    pub flows_tcp: u64,
    pub flows_udp: u64,
    pub flows_icmp: u64,
    pub flows_other: u64,
    pub packets: u64,
    pub packets_tcp: u64,
    pub packets_udp: u64,
    pub packets_icmp: u64,
    pub packets_other: u64,
    pub bytes: u64,
    pub bytes_tcp: u64,
    pub bytes_udp: u64,
    pub bytes_icmp: u64,
    pub bytes_other: u64,
}

impl FileMeta {
    /// Account one record into the summary.
    pub fn add_record(&mut self, rec: &FlowRecord) {
        self.flows += rec.flows;
        self.packets += rec.packets;
        self.bytes += rec.bytes;
        match rec.proto {
            PROTO_TCP => {
                self.flows_tcp += rec.flows;
                self.packets_tcp += rec.packets;
                self.bytes_tcp += rec.bytes;
            }
            PROTO_UDP => {
                self.flows_udp += rec.flows;
                self.packets_udp += rec.packets;
                self.bytes_udp += rec.bytes;
            }
            PROTO_ICMP | PROTO_ICMP6 => {
                self.flows_icmp += rec.flows;
                self.packets_icmp += rec.packets;
                self.bytes_icmp += rec.bytes;
            }
            _ => {
                self.flows_other += rec.flows;
                self.packets_other += rec.packets;
                self.bytes_other += rec.bytes;
            }
        }
    }

    /// Sum another summary into this one.
    pub fn merge(&mut self, other: &Self) {
        self.flows += other.flows;
        self.flows_tcp += other.flows_tcp;
        self.flows_udp += other.flows_udp;
        self.flows_icmp += other.flows_icmp;
        self.flows_other += other.flows_other;
        self.packets += other.packets;
        self.packets_tcp += other.packets_tcp;
        self.packets_udp += other.packets_udp;
        self.packets_icmp += other.packets_icmp;
        self.packets_other += other.packets_other;
        self.bytes += other.bytes;
        self.bytes_tcp += other.bytes_tcp;
        self.bytes_udp += other.bytes_udp;
        self.bytes_icmp += other.bytes_icmp;
        self.bytes_other += other.bytes_other;
    }
}

/// Counters over records accepted by the filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedSummary {
    pub flows: u64,
    pub packets: u64,
    pub bytes: u64,
}

impl ProcessedSummary {
    pub fn add_record(&mut self, rec: &FlowRecord) {
        self.flows += rec.flows;
        self.packets += rec.packets;
        self.bytes += rec.bytes;
    }

    pub fn merge(&mut self, other: &Self) {
        self.flows += other.flows;
        self.packets += other.packets;
        self.bytes += other.bytes;
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let f = File::open(path)?;
    #[cfg(feature = "compression-gzip")]
    if path.extension().is_some_and(|e| e == "gz") {
        return Ok(Box::new(flate2::read::GzDecoder::new(f)));
    }
    Ok(Box::new(f))
}

fn open_writer(path: &Path) -> Result<Box<dyn Write>> {
    let f = File::create(path)?;
    #[cfg(feature = "compression-gzip")]
    if path.extension().is_some_and(|e| e == "gz") {
        return Ok(Box::new(flate2::write::GzEncoder::new(
            f,
            flate2::Compression::default(),
        )));
    }
    Ok(Box::new(f))
}

fn read_block(r: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_block(w: &mut impl Write, block: &[u8]) -> Result<()> {
    let len = u32::try_from(block.len())
        .map_err(|_| QueryError::Protocol("record block over 4 GiB".into()))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(block)?;
    Ok(())
}

/// Sequential reader over one flow file.
pub struct FlowReader {
    inner: BufReader<Box<dyn Read>>,
    meta: FileMeta,
}

impl FlowReader {
    /// Open a flow file and parse its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut inner = BufReader::new(open_reader(path)?);
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        if &magic != FILE_MAGIC {
            return Err(QueryError::Path {
                path: path.to_path_buf(),
                reason: "not a flow-capture file (bad magic)".into(),
            });
        }
        let block = read_block(&mut inner)?.ok_or_else(|| QueryError::Path {
            path: path.to_path_buf(),
            reason: "truncated header".into(),
        })?;
        let meta: FileMeta = postcard::from_bytes(&block)?;
        Ok(Self { inner, meta })
    }

    #[must_use]
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// Next record, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<FlowRecord>> {
        match read_block(&mut self.inner)? {
            Some(block) => Ok(Some(postcard::from_bytes(&block)?)),
            None => Ok(None),
        }
    }
}

/// Buffering writer for flow files, used by fixtures and the capture tools.
///
/// Records are held in memory until [`finish`](Self::finish) so the metadata
/// summary can be written ahead of them.
pub struct FlowWriter {
    path: std::path::PathBuf,
    records: Vec<FlowRecord>,
}

impl FlowWriter {
    #[must_use]
    pub fn create(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), records: Vec::new() }
    }

    pub fn push(&mut self, rec: FlowRecord) {
        self.records.push(rec);
    }

    /// Write header and records; returns the computed metadata summary.
    pub fn finish(self) -> Result<FileMeta> {
        let mut meta = FileMeta::default();
        for rec in &self.records {
            meta.add_record(rec);
        }
        let mut w = BufWriter::new(open_writer(&self.path)?);
        w.write_all(FILE_MAGIC)?;
        write_block(&mut w, &postcard::to_allocvec(&meta)?)?;
        for rec in &self.records {
            write_block(&mut w, &postcard::to_allocvec(rec)?)?;
        }
        w.flush()?;
        Ok(meta)
    }
}

/// Convenience wrapper: write `records` to `path` in one call.
pub fn write_flow_file(path: impl AsRef<Path>, records: &[FlowRecord]) -> Result<FileMeta> {
    let mut w = FlowWriter::create(path);
    for rec in records {
        w.push(rec.clone());
    }
    w.finish()
}
