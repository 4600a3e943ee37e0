//! Threshold math of the three-round distributed Top-N protocol.
//!
//! Round 1 collects each worker's local top L entries. Summing them per key
//! gives partial totals; with `τ₁` the L-th largest partial total and `W`
//! responding workers, `τ = τ₁ / W` is a safe pull threshold for round 2:
//! any key whose true total reaches `τ₁` must contribute at least `τ` on
//! some worker, and a key invisible after round 2 therefore has a total
//! below `W·τ ≤ τ₁`, which cannot displace the L-th candidate. Round 3 tops
//! the candidate set up to exact values.
//!
//! The argument leans on partial sums being *lower* bounds of totals, which
//! holds for SUM-aggregated counters ranked descending; hence the
//! eligibility predicate on the sort key.

use crate::fields::SortDir;
use crate::memory::AggrMemory;

/// Round-2 pull threshold from the aggregated round-1 entries.
#[must_use]
pub fn pull_threshold(round1: &AggrMemory, limit: u64, workers: usize) -> u64 {
    let top = round1.top_n(limit as usize, SortDir::Desc);
    let tau1 = top
        .last()
        .map_or(0, |buf| round1.layout().sort_value(buf) as u64);
    tau1 / workers.max(1) as u64
}

/// Candidate key set after round 2: the keys currently holding the top L
/// partial totals.
#[must_use]
pub fn candidate_keys(round2: &AggrMemory, limit: u64) -> Vec<Vec<u8>> {
    round2
        .top_n(limit as usize, SortDir::Desc)
        .into_iter()
        .map(|buf| round2.layout().key_bytes(buf).to_vec())
        .collect()
}
