//! Bloom-index file pruning.
//!
//! From the compiled filter we derive a reduced IP-predicate tree that keeps
//! only AND/OR structure over *exact* address equality tests; everything the
//! index cannot answer is discarded bottom-up:
//!
//! - AND/OR with both children discarded → discard the node,
//! - AND/OR with one child discarded → the surviving child stands in,
//! - AND/OR whose children hold the identical address → the left child
//!   (this collapses the `ip X` shorthand, which parses as
//!   `src ip X or dst ip X`).
//!
//! A masked address (`net` term) or more than [`MAX_INDEXED_ADDRS`] distinct
//! addresses disables pruning for the whole query. Sidecar problems at
//! evaluation time keep the file: the index may only ever skip work, never
//! records.

use crate::filter::FilterExpr;
use crate::storage::bloom::BloomIndex;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

/// Above this many distinct addresses the tree evaluation is unlikely to
/// pay for the sidecar reads; indexing is disabled.
pub const MAX_INDEXED_ADDRS: usize = 20;

/// Reduced predicate over the address sets of candidate files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpTree {
    And(Box<IpTree>, Box<IpTree>),
    Or(Box<IpTree>, Box<IpTree>),
    Addr(IpAddr),
}

impl IpTree {
    fn eval(&self, idx: &BloomIndex) -> bool {
        match self {
            Self::And(l, r) => l.eval(idx) && r.eval(idx),
            Self::Or(l, r) => l.eval(idx) || r.eval(idx),
            Self::Addr(a) => idx.contains(a),
        }
    }

    fn collect_addrs(&self, out: &mut Vec<IpAddr>) {
        match self {
            Self::And(l, r) | Self::Or(l, r) => {
                l.collect_addrs(out);
                r.collect_addrs(out);
            }
            Self::Addr(a) => {
                if !out.contains(a) {
                    out.push(*a);
                }
            }
        }
    }
}

enum Reduced {
    Tree(IpTree),
    /// Subtree the index cannot answer; the parent keeps its sibling.
    Discarded,
    /// A masked address was seen; indexing is off for this query.
    Disable,
}

fn reduce(e: &FilterExpr) -> Reduced {
    match e {
        FilterExpr::Addr { addr, prefix, .. } => {
            if *prefix == FilterExpr::full_prefix(addr) {
                Reduced::Tree(IpTree::Addr(*addr))
            } else {
                Reduced::Disable
            }
        }
        FilterExpr::And(l, r) | FilterExpr::Or(l, r) => {
            let is_and = matches!(e, FilterExpr::And(..));
            match (reduce(l), reduce(r)) {
                (Reduced::Disable, _) | (_, Reduced::Disable) => Reduced::Disable,
                (Reduced::Discarded, Reduced::Discarded) => Reduced::Discarded,
                (Reduced::Tree(t), Reduced::Discarded)
                | (Reduced::Discarded, Reduced::Tree(t)) => Reduced::Tree(t),
                (Reduced::Tree(lt), Reduced::Tree(rt)) => {
                    if let (IpTree::Addr(a), IpTree::Addr(b)) = (&lt, &rt) {
                        if a == b {
                            return Reduced::Tree(lt);
                        }
                    }
                    let node = if is_and {
                        IpTree::And(Box::new(lt), Box::new(rt))
                    } else {
                        IpTree::Or(Box::new(lt), Box::new(rt))
                    };
                    Reduced::Tree(node)
                }
            }
        }
        // NOT and every non-address comparison are outside what a
        // membership index can answer
        FilterExpr::Not(_)
        | FilterExpr::Port { .. }
        | FilterExpr::Proto(_)
        | FilterExpr::Num { .. } => Reduced::Discarded,
    }
}

/// Per-query pruning state, built once from the compiled filter.
#[derive(Clone, Debug)]
pub struct IndexPruner {
    tree: IpTree,
}

impl IndexPruner {
    /// Build the pruner, or `None` when the filter gives the index nothing
    /// to work with (no exact-address leaves, a masked address, or too many
    /// addresses).
    #[must_use]
    pub fn build(filter: &FilterExpr) -> Option<Self> {
        let tree = match reduce(filter) {
            Reduced::Tree(t) => t,
            Reduced::Discarded => {
                debug!("filter holds no exact address test, indexing idle");
                return None;
            }
            Reduced::Disable => {
                debug!("filter uses a subnet mask, indexing disabled");
                return None;
            }
        };
        let mut addrs = Vec::new();
        tree.collect_addrs(&mut addrs);
        if addrs.len() > MAX_INDEXED_ADDRS {
            debug!(count = addrs.len(), "too many addresses, indexing disabled");
            return None;
        }
        Some(Self { tree })
    }

    /// The reduced predicate tree.
    #[must_use]
    pub fn tree(&self) -> &IpTree {
        &self.tree
    }

    /// Whether `data_path` has to be processed. Missing or malformed
    /// sidecars keep the file.
    #[must_use]
    pub fn keep_file(&self, data_path: &Path) -> bool {
        let idx = match BloomIndex::load_for(data_path) {
            Ok(idx) => idx,
            Err(e) => {
                warn!(path = %data_path.display(), error = %e, "sidecar unusable, file kept");
                return true;
            }
        };
        let keep = self.tree.eval(&idx);
        if !keep {
            debug!(path = %data_path.display(), "file pruned by index");
        }
        keep
    }
}
