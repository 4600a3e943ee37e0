//! Flow-record and capture-file fixtures.

use crate::error::Result;
use crate::storage::bloom::BloomIndex;
use crate::storage::{write_flow_file, FileMeta, FlowRecord};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// A flow between two addresses with the given volume; everything else at
/// its default.
#[must_use]
pub fn flow(src: &str, dst: &str, bytes: u64) -> FlowRecord {
    FlowRecord {
        src_addr: src.parse().expect("fixture address"),
        dst_addr: dst.parse().expect("fixture address"),
        packets: bytes.div_ceil(1000).max(1),
        bytes,
        ..FlowRecord::default()
    }
}

/// Fluent construction of single records.
#[derive(Clone, Debug)]
pub struct FlowBuilder {
    rec: FlowRecord,
}

impl FlowBuilder {
    #[must_use]
    pub fn new(src: &str, dst: &str) -> Self {
        Self { rec: flow(src, dst, 1000) }
    }

    #[must_use]
    pub fn ports(mut self, src: u16, dst: u16) -> Self {
        self.rec.src_port = src;
        self.rec.dst_port = dst;
        self
    }

    #[must_use]
    pub fn proto(mut self, proto: u8) -> Self {
        self.rec.proto = proto;
        self
    }

    #[must_use]
    pub fn tcp_flags(mut self, flags: u8) -> Self {
        self.rec.tcp_flags = flags;
        self
    }

    #[must_use]
    pub fn window(mut self, first_ms: u64, last_ms: u64) -> Self {
        self.rec.first = first_ms;
        self.rec.last = last_ms;
        self
    }

    #[must_use]
    pub fn volume(mut self, packets: u64, bytes: u64) -> Self {
        self.rec.packets = packets;
        self.rec.bytes = bytes;
        self
    }

    #[must_use]
    pub fn build(self) -> FlowRecord {
        self.rec
    }
}

/// Write `records` as capture file `name` under `dir`, along with its
/// Bloom sidecar indexing every address in the file.
pub fn write_capture(dir: &Path, name: &str, records: &[FlowRecord]) -> Result<PathBuf> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_flow_file(&path, records)?;

    let addrs: Vec<IpAddr> = records
        .iter()
        .flat_map(|r| [r.src_addr, r.dst_addr])
        .collect();
    let mut index = BloomIndex::with_capacity(addrs.len().max(8), 0.01);
    for addr in &addrs {
        index.insert(addr);
    }
    index.save_for(&path)?;
    Ok(path)
}

/// Expected metadata summary of a record set, for assertions.
#[must_use]
pub fn meta_of(records: &[FlowRecord]) -> FileMeta {
    let mut meta = FileMeta::default();
    for rec in records {
        meta.add_record(rec);
    }
    meta
}
