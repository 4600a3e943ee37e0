//! Query record buffers and their layout.
//!
//! Once a task is fixed, every record that moves through the engine (worker
//! memory, wire batches, coordinator merge) is an opaque byte buffer of one
//! uniform size. [`RecordLayout`] assigns each requested field a byte slot,
//! with all aggregation-key slots packed first so the hash key of an entry is
//! simply the leading `key_len` bytes of its buffer. Values are stored
//! little-endian; addresses occupy 16 bytes in v4-mapped form so IPv4 and
//! IPv6 traffic coexist in one query.

use crate::error::{QueryError, Result};
use crate::fields::{AggrFunc, FieldId, FieldKind, FieldSpec};
use crate::storage::bloom::addr16;
use crate::storage::FlowRecord;
use std::net::{IpAddr, Ipv6Addr};

/// One field slot inside a record buffer.
#[derive(Clone, Copy, Debug)]
pub struct Slot {
    pub spec: FieldSpec,
    pub offset: usize,
}

impl Slot {
    #[must_use]
    pub fn size(&self) -> usize {
        self.spec.id.kind().size()
    }
}

/// A decoded field value, for rendering and comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    /// Milliseconds since the epoch.
    Time(u64),
    Addr(IpAddr),
    Num(u64),
}

/// Byte layout of the records of one query.
#[derive(Clone, Debug)]
pub struct RecordLayout {
    slots: Vec<Slot>,
    key_slots: usize,
    key_len: usize,
    size: usize,
    sort_slot: Option<usize>,
}

impl RecordLayout {
    /// Build the layout: aggregation keys first, then the sort field and the
    /// output fields that are not already placed. Duplicate ids collapse
    /// into the first occurrence.
    pub fn build(
        keys: &[FieldSpec],
        sort: Option<FieldSpec>,
        output: &[FieldSpec],
    ) -> Result<Self> {
        fn place(slots: &mut Vec<Slot>, offset: &mut usize, spec: FieldSpec) {
            if slots.iter().any(|s| s.spec.id == spec.id) {
                return;
            }
            slots.push(Slot { spec, offset: *offset });
            *offset += spec.id.kind().size();
        }

        let mut slots: Vec<Slot> = Vec::new();
        let mut offset = 0usize;
        for k in keys {
            place(&mut slots, &mut offset, *k);
        }
        let key_slots = slots.len();
        let key_len = offset;

        if let Some(s) = sort {
            place(&mut slots, &mut offset, s);
        }
        for o in output {
            place(&mut slots, &mut offset, *o);
        }
        if slots.is_empty() {
            return Err(QueryError::Argument("no fields requested".into()));
        }

        let sort_slot = sort.and_then(|s| slots.iter().position(|sl| sl.spec.id == s.id));
        Ok(Self { slots, key_slots, key_len, size: offset, sort_slot })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    #[must_use]
    pub fn slot_of(&self, id: FieldId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.spec.id == id)
    }

    /// The leading key bytes of a record buffer.
    #[must_use]
    pub fn key_bytes<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[..self.key_len]
    }

    /// Split a batch of concatenated records into individual buffers.
    pub fn split_batch<'a>(&self, batch: &'a [u8]) -> Result<impl Iterator<Item = &'a [u8]>> {
        if batch.len() % self.size != 0 {
            return Err(QueryError::Protocol(format!(
                "batch of {} bytes is not a multiple of the record size {}",
                batch.len(),
                self.size
            )));
        }
        Ok(batch.chunks_exact(self.size))
    }

    /// Encode one storage record into `out`, applying per-slot alignment.
    pub fn encode(&self, rec: &FlowRecord, out: &mut Vec<u8>) {
        out.reserve(self.size);
        for slot in &self.slots {
            let id = slot.spec.id;
            match id.kind() {
                FieldKind::Addr => {
                    let addr = align_addr(field_addr(rec, id), slot.spec.align);
                    out.extend_from_slice(&addr16(&addr));
                }
                FieldKind::Time => {
                    let mut ms = field_num(rec, id);
                    if let Some(gran) = slot.spec.align {
                        let step = u64::from(gran) * 1000;
                        ms -= ms % step;
                    }
                    out.extend_from_slice(&ms.to_le_bytes());
                }
                FieldKind::U64 => out.extend_from_slice(&field_num(rec, id).to_le_bytes()),
                FieldKind::U32 => {
                    out.extend_from_slice(&(field_num(rec, id) as u32).to_le_bytes());
                }
                FieldKind::U16 => {
                    out.extend_from_slice(&(field_num(rec, id) as u16).to_le_bytes());
                }
                FieldKind::U8 => out.push(field_num(rec, id) as u8),
            }
        }
    }

    /// Numeric value of a slot (everything except addresses).
    #[must_use]
    pub fn read_num(&self, slot: &Slot, buf: &[u8]) -> u64 {
        let at = slot.offset;
        match slot.spec.id.kind() {
            FieldKind::Time | FieldKind::U64 => {
                u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
            }
            FieldKind::U32 => u64::from(u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())),
            FieldKind::U16 => u64::from(u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())),
            FieldKind::U8 => u64::from(buf[at]),
            FieldKind::Addr => unreachable!("address slot read as number"),
        }
    }

    fn write_num(&self, slot: &Slot, buf: &mut [u8], v: u64) {
        let at = slot.offset;
        match slot.spec.id.kind() {
            FieldKind::Time | FieldKind::U64 => buf[at..at + 8].copy_from_slice(&v.to_le_bytes()),
            FieldKind::U32 => buf[at..at + 4].copy_from_slice(&(v as u32).to_le_bytes()),
            FieldKind::U16 => buf[at..at + 2].copy_from_slice(&(v as u16).to_le_bytes()),
            FieldKind::U8 => buf[at] = v as u8,
            FieldKind::Addr => unreachable!("address slot written as number"),
        }
    }

    /// Decode one slot for rendering.
    #[must_use]
    pub fn value(&self, slot: &Slot, buf: &[u8]) -> Value {
        match slot.spec.id.kind() {
            FieldKind::Addr => {
                let octets: [u8; 16] = buf[slot.offset..slot.offset + 16].try_into().unwrap();
                let v6 = Ipv6Addr::from(octets);
                let addr = v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4);
                Value::Addr(addr)
            }
            FieldKind::Time => Value::Time(self.read_num(slot, buf)),
            _ => Value::Num(self.read_num(slot, buf)),
        }
    }

    /// Combine `rec` into the accumulated entry `acc` (same key). Key slots
    /// are untouched; `Key` on a non-key slot keeps the first seen value.
    pub fn merge_record(&self, acc: &mut [u8], rec: &[u8]) {
        for slot in &self.slots[self.key_slots..] {
            match slot.spec.aggr {
                AggrFunc::Key => {}
                AggrFunc::Min => {
                    let v = self.read_num(slot, rec).min(self.read_num(slot, acc));
                    self.write_num(slot, acc, v);
                }
                AggrFunc::Max => {
                    let v = self.read_num(slot, rec).max(self.read_num(slot, acc));
                    self.write_num(slot, acc, v);
                }
                AggrFunc::Sum => {
                    let v = self.read_num(slot, acc).saturating_add(self.read_num(slot, rec));
                    self.write_num(slot, acc, v);
                }
                AggrFunc::Or => {
                    let v = self.read_num(slot, acc) | self.read_num(slot, rec);
                    self.write_num(slot, acc, v);
                }
            }
        }
    }

    /// Sort-key value of a record, widened to `u128` so addresses and
    /// counters compare through the same code path.
    #[must_use]
    pub fn sort_value(&self, buf: &[u8]) -> u128 {
        let Some(i) = self.sort_slot else { return 0 };
        let slot = &self.slots[i];
        match slot.spec.id.kind() {
            FieldKind::Addr => {
                let octets: [u8; 16] = buf[slot.offset..slot.offset + 16].try_into().unwrap();
                u128::from_be_bytes(octets)
            }
            _ => u128::from(self.read_num(slot, buf)),
        }
    }

    /// Overwrite the sort slot with `v` (used when re-aggregating partial
    /// sums). Only meaningful for numeric sort keys.
    pub fn set_sort_value(&self, buf: &mut [u8], v: u64) {
        if let Some(i) = self.sort_slot {
            let slot = self.slots[i];
            self.write_num(&slot, buf, v);
        }
    }

    #[must_use]
    pub fn has_sort_key(&self) -> bool {
        self.sort_slot.is_some()
    }

    /// The sort slot, if a sort key was declared.
    #[must_use]
    pub fn sort_slot(&self) -> Option<&Slot> {
        self.sort_slot.map(|i| &self.slots[i])
    }
}

fn align_addr(addr: IpAddr, prefix: Option<u32>) -> IpAddr {
    let Some(len) = prefix else { return addr };
    match addr {
        IpAddr::V4(a) => {
            let len = len.min(32);
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            IpAddr::V4((u32::from(a) & mask).into())
        }
        IpAddr::V6(a) => {
            let len = len.min(128);
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            IpAddr::V6((u128::from(a) & mask).into())
        }
    }
}

fn field_addr(rec: &FlowRecord, id: FieldId) -> IpAddr {
    match id {
        FieldId::SrcAddr => rec.src_addr,
        FieldId::DstAddr => rec.dst_addr,
        _ => unreachable!("{id} is not an address field"),
    }
}

fn field_num(rec: &FlowRecord, id: FieldId) -> u64 {
    match id {
        FieldId::First => rec.first,
        FieldId::Last => rec.last,
        FieldId::SrcPort => u64::from(rec.src_port),
        FieldId::DstPort => u64::from(rec.dst_port),
        FieldId::Proto => u64::from(rec.proto),
        FieldId::TcpFlags => u64::from(rec.tcp_flags),
        FieldId::Tos => u64::from(rec.tos),
        FieldId::Packets => rec.packets,
        FieldId::Bytes => rec.bytes,
        FieldId::OutPackets => rec.out_packets,
        FieldId::OutBytes => rec.out_bytes,
        FieldId::Flows => rec.flows,
        FieldId::SrcAs => u64::from(rec.src_as),
        FieldId::DstAs => u64::from(rec.dst_as),
        FieldId::InIf => u64::from(rec.in_if),
        FieldId::OutIf => u64::from(rec.out_if),
        FieldId::SrcAddr | FieldId::DstAddr => unreachable!("{id} is not numeric"),
    }
}
