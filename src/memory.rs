//! Local record memory of one query participant.
//!
//! Workers funnel every filter-accepted record into either an
//! [`AggrMemory`] (hash table keyed by the aggregation-key bytes) or a
//! [`ListMemory`] (append-only sequence, sorted lazily when the mode asks
//! for it). The coordinator reuses [`AggrMemory`] as its global merge
//! memory; merging two memories is associative, so per-thread memories on a
//! worker and per-worker partials on the coordinator combine to the same
//! result as a single sequential pass.
//!
//! Output ordering is stable: entries with equal sort-key values keep their
//! insertion order, which makes distributed runs reproducible given the
//! same per-worker input order.

use crate::fields::{AggrFunc, FieldId, SortDir};
use crate::record::RecordLayout;
use crate::storage::FlowRecord;
use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

/// Slot offsets of the canonical statistics quintet. When the non-key
/// fields are exactly `first MIN, last MAX, packets SUM, bytes SUM,
/// flows SUM`, aggregation skips the generic per-slot dispatch.
#[derive(Clone, Copy, Debug)]
struct FastSlots {
    first: usize,
    last: usize,
    packets: usize,
    bytes: usize,
    flows: usize,
}

fn fast_slots(layout: &RecordLayout) -> Option<FastSlots> {
    let non_key: Vec<_> = layout
        .slots()
        .iter()
        .filter(|s| s.spec.aggr != AggrFunc::Key)
        .collect();
    if non_key.len() != 5 {
        return None;
    }
    let mut fast = FastSlots { first: 0, last: 0, packets: 0, bytes: 0, flows: 0 };
    for s in non_key {
        match (s.spec.id, s.spec.aggr) {
            (FieldId::First, AggrFunc::Min) => fast.first = s.offset,
            (FieldId::Last, AggrFunc::Max) => fast.last = s.offset,
            (FieldId::Packets, AggrFunc::Sum) => fast.packets = s.offset,
            (FieldId::Bytes, AggrFunc::Sum) => fast.bytes = s.offset,
            (FieldId::Flows, AggrFunc::Sum) => fast.flows = s.offset,
            _ => return None,
        }
    }
    Some(fast)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn write_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Rank used for Top-N selection: higher rank = earlier in the output,
/// regardless of sort direction.
fn rank(value: u128, dir: SortDir) -> u128 {
    match dir {
        SortDir::Desc => value,
        SortDir::Asc => u128::MAX - value,
    }
}

/// Hash-table memory for aggregation mode.
#[derive(Clone)]
pub struct AggrMemory {
    layout: Arc<RecordLayout>,
    entries: HashMap<Box<[u8]>, (u64, Vec<u8>)>,
    next_seq: u64,
    fast: Option<FastSlots>,
}

impl AggrMemory {
    #[must_use]
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        let fast = fast_slots(&layout);
        Self { layout, entries: HashMap::new(), next_seq: 0, fast }
    }

    #[must_use]
    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the canonical-statistics fast path is active.
    #[must_use]
    pub fn fast_path(&self) -> bool {
        self.fast.is_some()
    }

    pub fn insert_flow(&mut self, rec: &FlowRecord) {
        let mut buf = Vec::with_capacity(self.layout.size());
        self.layout.encode(rec, &mut buf);
        self.insert_record(&buf);
    }

    /// Merge one encoded record into the table.
    pub fn insert_record(&mut self, buf: &[u8]) {
        debug_assert_eq!(buf.len(), self.layout.size());
        let key = self.layout.key_bytes(buf);
        match self.entries.entry(key.into()) {
            Entry::Occupied(mut e) => {
                let acc = &mut e.get_mut().1;
                if let Some(fast) = self.fast {
                    let first = read_u64(acc, fast.first).min(read_u64(buf, fast.first));
                    write_u64(acc, fast.first, first);
                    let last = read_u64(acc, fast.last).max(read_u64(buf, fast.last));
                    write_u64(acc, fast.last, last);
                    let packets = read_u64(acc, fast.packets).saturating_add(read_u64(buf, fast.packets));
                    write_u64(acc, fast.packets, packets);
                    let bytes = read_u64(acc, fast.bytes).saturating_add(read_u64(buf, fast.bytes));
                    write_u64(acc, fast.bytes, bytes);
                    let flows = read_u64(acc, fast.flows).saturating_add(read_u64(buf, fast.flows));
                    write_u64(acc, fast.flows, flows);
                } else {
                    self.layout.merge_record(acc, buf);
                }
            }
            Entry::Vacant(e) => {
                e.insert((self.next_seq, buf.to_vec()));
                self.next_seq += 1;
            }
        }
    }

    /// Fold another memory in. Associative with `insert_record`.
    pub fn merge(&mut self, other: Self) {
        let mut entries: Vec<_> = other.entries.into_values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        for (_, buf) in entries {
            self.insert_record(&buf);
        }
    }

    /// All entries in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<&[u8]> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, buf)| buf.as_slice()).collect()
    }

    /// Entries sorted on the sort key, stable within equal values.
    #[must_use]
    pub fn sorted_records(&self, dir: SortDir) -> Vec<&[u8]> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|(seq, buf)| (Reverse(rank(self.layout.sort_value(buf), dir)), *seq));
        entries.into_iter().map(|(_, buf)| buf.as_slice()).collect()
    }

    /// The `n` best entries by the sort key. A bounded min-heap keeps
    /// memory at `O(n)` even over very large tables.
    #[must_use]
    pub fn top_n(&self, n: usize, dir: SortDir) -> Vec<&[u8]> {
        if n == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<Reverse<(u128, Reverse<u64>, &Vec<u8>)>> =
            BinaryHeap::with_capacity(n + 1);
        for (seq, buf) in self.entries.values() {
            let r = rank(self.layout.sort_value(buf), dir);
            heap.push(Reverse((r, Reverse(*seq), buf)));
            if heap.len() > n {
                heap.pop(); // drop the currently worst entry
            }
        }
        let mut out: Vec<_> = heap.into_iter().map(|Reverse(t)| t).collect();
        out.sort_by_key(|&(r, Reverse(seq), _)| (Reverse(r), seq));
        out.into_iter().map(|(_, _, buf)| buf.as_slice()).collect()
    }

    /// Entries whose sort-key value meets the Top-N threshold: `>= t` when
    /// descending, `<= t` when ascending.
    #[must_use]
    pub fn records_meeting(&self, t: u64, dir: SortDir) -> Vec<&[u8]> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|(_, buf)| {
                let v = self.layout.sort_value(buf) as u64;
                match dir {
                    SortDir::Desc => v >= t,
                    SortDir::Asc => v <= t,
                }
            })
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, buf)| buf.as_slice()).collect()
    }

    /// The entry for an exact key, if this participant has seen it.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|(_, buf)| buf.as_slice())
    }
}

/// Append-only memory for list and sort modes.
#[derive(Clone)]
pub struct ListMemory {
    layout: Arc<RecordLayout>,
    records: Vec<Vec<u8>>,
}

impl ListMemory {
    #[must_use]
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        Self { layout, records: Vec::new() }
    }

    #[must_use]
    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn insert_flow(&mut self, rec: &FlowRecord) {
        let mut buf = Vec::with_capacity(self.layout.size());
        self.layout.encode(rec, &mut buf);
        self.records.push(buf);
    }

    pub fn merge(&mut self, mut other: Self) {
        self.records.append(&mut other.records);
    }

    /// Records in arrival order.
    #[must_use]
    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }

    /// Sort in place on the sort key; stable, so equal keys keep arrival
    /// order.
    pub fn sort(&mut self, dir: SortDir) {
        let layout = Arc::clone(&self.layout);
        self.records
            .sort_by_key(|buf| Reverse(rank(layout.sort_value(buf), dir)));
    }
}

/// Memory of one worker, chosen by working mode.
pub enum LocalMemory {
    Aggr(AggrMemory),
    List(ListMemory),
}

impl LocalMemory {
    pub fn insert_flow(&mut self, rec: &FlowRecord) {
        match self {
            Self::Aggr(m) => m.insert_flow(rec),
            Self::List(m) => m.insert_flow(rec),
        }
    }

    pub fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Aggr(a), Self::Aggr(b)) => a.merge(b),
            (Self::List(a), Self::List(b)) => a.merge(b),
            _ => unreachable!("memories of one query share a mode"),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Aggr(m) => m.len(),
            Self::List(m) => m.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSpec;

    fn aggr_layout() -> Arc<RecordLayout> {
        Arc::new(
            RecordLayout::build(
                &[FieldSpec::key(FieldId::SrcAddr)],
                Some(FieldSpec::new(FieldId::Bytes)),
                &[FieldSpec::new(FieldId::Packets), FieldSpec::new(FieldId::Bytes)],
            )
            .unwrap(),
        )
    }

    fn flow(src: &str, packets: u64, bytes: u64) -> FlowRecord {
        FlowRecord {
            src_addr: src.parse().unwrap(),
            packets,
            bytes,
            ..FlowRecord::default()
        }
    }

    fn bytes_of(m: &AggrMemory, buf: &[u8]) -> u64 {
        let slot = m.layout().slot_of(FieldId::Bytes).unwrap();
        m.layout().read_num(slot, buf)
    }

    #[test]
    fn distinct_keys_make_distinct_entries() {
        let mut m = AggrMemory::new(aggr_layout());
        m.insert_flow(&flow("10.0.0.1", 1, 100));
        m.insert_flow(&flow("10.0.0.2", 1, 50));
        m.insert_flow(&flow("10.0.0.1", 2, 200));
        assert_eq!(m.len(), 2);

        let top = m.top_n(1, SortDir::Desc);
        assert_eq!(bytes_of(&m, top[0]), 300);
    }

    #[test]
    fn merge_is_associative() {
        let layout = aggr_layout();
        let flows = [
            flow("10.0.0.1", 1, 100),
            flow("10.0.0.2", 1, 50),
            flow("10.0.0.1", 1, 25),
            flow("10.0.0.3", 1, 75),
        ];

        // one pass
        let mut all = AggrMemory::new(Arc::clone(&layout));
        for f in &flows {
            all.insert_flow(f);
        }

        // split across two memories, then merge
        let mut a = AggrMemory::new(Arc::clone(&layout));
        let mut b = AggrMemory::new(Arc::clone(&layout));
        a.insert_flow(&flows[0]);
        a.insert_flow(&flows[1]);
        b.insert_flow(&flows[2]);
        b.insert_flow(&flows[3]);
        a.merge(b);

        assert_eq!(a.len(), all.len());
        for buf in all.records() {
            let key = all.layout().key_bytes(buf);
            assert_eq!(a.get(key), Some(buf));
        }
    }

    #[test]
    fn top_n_matches_full_sort() {
        let mut m = AggrMemory::new(aggr_layout());
        for i in 0..100u32 {
            m.insert_flow(&flow(&format!("10.0.{}.{}", i / 256, i % 256), 1, u64::from(i * 7 % 50)));
        }
        for dir in [SortDir::Desc, SortDir::Asc] {
            let sorted = m.sorted_records(dir);
            let top = m.top_n(10, dir);
            assert_eq!(top, sorted[..10].to_vec());
        }
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut m = AggrMemory::new(aggr_layout());
        m.insert_flow(&flow("10.0.0.1", 1, 100));
        m.insert_flow(&flow("10.0.0.2", 1, 100));
        m.insert_flow(&flow("10.0.0.3", 1, 100));
        let sorted = m.sorted_records(SortDir::Desc);
        let keys: Vec<&[u8]> = sorted.iter().map(|b| m.layout().key_bytes(b)).collect();
        let expected: Vec<Vec<u8>> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
            .iter()
            .map(|s| {
                crate::storage::bloom::addr16(&s.parse().unwrap()).to_vec()
            })
            .collect();
        assert_eq!(keys, expected.iter().map(Vec::as_slice).collect::<Vec<_>>());
    }

    #[test]
    fn threshold_selection() {
        let mut m = AggrMemory::new(aggr_layout());
        m.insert_flow(&flow("10.0.0.1", 1, 100));
        m.insert_flow(&flow("10.0.0.2", 1, 40));
        m.insert_flow(&flow("10.0.0.3", 1, 70));
        assert_eq!(m.records_meeting(50, SortDir::Desc).len(), 2);
        assert_eq!(m.records_meeting(50, SortDir::Asc).len(), 1);
    }

    #[test]
    fn fast_path_equals_generic_path() {
        // canonical quintet triggers the fast path
        let canonical = Arc::new(
            RecordLayout::build(
                &[FieldSpec::key(FieldId::SrcAddr)],
                None,
                &[
                    FieldSpec::new(FieldId::First),
                    FieldSpec::new(FieldId::Last),
                    FieldSpec::new(FieldId::Packets),
                    FieldSpec::new(FieldId::Bytes),
                    FieldSpec::new(FieldId::Flows),
                ],
            )
            .unwrap(),
        );
        let mut fast = AggrMemory::new(Arc::clone(&canonical));
        assert!(fast.fast_path());

        // the same fields plus a port column falls back to the generic path
        let generic_layout = Arc::new(
            RecordLayout::build(
                &[FieldSpec::key(FieldId::SrcAddr)],
                None,
                &[
                    FieldSpec::new(FieldId::First),
                    FieldSpec::new(FieldId::Last),
                    FieldSpec::new(FieldId::Packets),
                    FieldSpec::new(FieldId::Bytes),
                    FieldSpec::new(FieldId::Flows),
                    FieldSpec::new(FieldId::SrcPort),
                ],
            )
            .unwrap(),
        );
        let mut generic = AggrMemory::new(generic_layout);
        assert!(!generic.fast_path());

        let flows = [
            FlowRecord { first: 100, last: 200, packets: 3, bytes: 300, ..flow("10.0.0.1", 0, 0) },
            FlowRecord { first: 50, last: 300, packets: 2, bytes: 100, ..flow("10.0.0.1", 0, 0) },
        ];
        for f in &flows {
            fast.insert_flow(f);
            generic.insert_flow(f);
        }
        let fbuf = fast.records()[0];
        let fl = fast.layout();
        assert_eq!(fl.read_num(fl.slot_of(FieldId::First).unwrap(), fbuf), 50);
        assert_eq!(fl.read_num(fl.slot_of(FieldId::Last).unwrap(), fbuf), 300);
        assert_eq!(fl.read_num(fl.slot_of(FieldId::Packets).unwrap(), fbuf), 5);
        assert_eq!(fl.read_num(fl.slot_of(FieldId::Bytes).unwrap(), fbuf), 400);

        let gbuf = generic.records()[0];
        let gl = generic.layout();
        assert_eq!(gl.read_num(gl.slot_of(FieldId::First).unwrap(), gbuf), 50);
        assert_eq!(gl.read_num(gl.slot_of(FieldId::Bytes).unwrap(), gbuf), 400);
    }

    #[test]
    fn list_memory_sorts_stably() {
        let layout = Arc::new(
            RecordLayout::build(
                &[],
                Some(FieldSpec::new(FieldId::Bytes)),
                &[FieldSpec::new(FieldId::SrcPort), FieldSpec::new(FieldId::Bytes)],
            )
            .unwrap(),
        );
        let mut m = ListMemory::new(Arc::clone(&layout));
        for (port, bytes) in [(1u16, 50u64), (2, 100), (3, 50), (4, 200)] {
            m.insert_flow(&FlowRecord {
                src_port: port,
                bytes,
                ..FlowRecord::default()
            });
        }
        m.sort(SortDir::Desc);
        let ports: Vec<u64> = m
            .records()
            .iter()
            .map(|b| layout.read_num(layout.slot_of(FieldId::SrcPort).unwrap(), b))
            .collect();
        assert_eq!(ports, vec![4, 2, 1, 3]);
    }
}
