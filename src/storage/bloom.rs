//! Bloom-filter sidecar index of IP addresses.
//!
//! Next to a data file `DIR/name` an optional sidecar `DIR/bfi.name` records
//! every source and destination address that occurs in the file. The index
//! can prove an address absent (no false negatives), which lets the worker
//! skip whole files for equality filters without opening them. Sidecars are
//! ignored when directories are listed.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// File-name prefix of index sidecars.
pub const SIDECAR_PREFIX: &str = "bfi.";

/// File magic of the sidecar format.
pub const INDEX_MAGIC: &[u8; 4] = b"FQBF";

/// Sidecar path for a data file: same directory, `bfi.`-prefixed name.
#[must_use]
pub fn sidecar_path(data: &Path) -> PathBuf {
    let name = data
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    data.with_file_name(format!("{SIDECAR_PREFIX}{name}"))
}

/// Whether a directory entry name is an index sidecar.
#[must_use]
pub fn is_sidecar_name(name: &str) -> bool {
    name.starts_with(SIDECAR_PREFIX)
}

/// Addresses are hashed in their 16-byte form, IPv4 as v4-mapped IPv6.
#[must_use]
pub fn addr16(addr: &IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}

fn fnv1a64(data: &[u8], seed: u64) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325_u64 ^ seed;
    for &b in data {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// In-memory Bloom index. Read-only after load; safe to share across the
/// processing threads of a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomIndex {
    nbits: u64,
    hashes: u32,
    items: u64,
    bits: Vec<u8>,
}

impl BloomIndex {
    /// Size the filter for `items` addresses at false-positive rate `fpp`.
    #[must_use]
    pub fn with_capacity(items: usize, fpp: f64) -> Self {
        let n = items.max(1) as f64;
        let p = fpp.clamp(1e-9, 0.5);
        let m = (-(n * p.ln()) / (2f64.ln() * 2f64.ln())).ceil().max(64.0) as u64;
        let k = ((m as f64 / n) * 2f64.ln()).round().clamp(1.0, 16.0) as u32;
        Self { nbits: m, hashes: k, items: 0, bits: vec![0u8; m.div_ceil(8) as usize] }
    }

    fn bit_positions<'a>(&'a self, addr: &IpAddr) -> impl Iterator<Item = u64> + 'a {
        let octets = addr16(addr);
        let h1 = fnv1a64(&octets, 0);
        let h2 = fnv1a64(&octets, h1) | 1;
        (0..u64::from(self.hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.nbits)
    }

    pub fn insert(&mut self, addr: &IpAddr) {
        let positions: Vec<u64> = self.bit_positions(addr).collect();
        for pos in positions {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
        self.items += 1;
    }

    #[must_use]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.bit_positions(addr)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }

    /// All of `addrs` may be present (AND branch of a predicate tree).
    #[must_use]
    pub fn contains_all<'a>(&self, addrs: impl IntoIterator<Item = &'a IpAddr>) -> bool {
        addrs.into_iter().all(|a| self.contains(a))
    }

    /// At least one of `addrs` may be present (OR branch).
    #[must_use]
    pub fn contains_any<'a>(&self, addrs: impl IntoIterator<Item = &'a IpAddr>) -> bool {
        addrs.into_iter().any(|a| self.contains(a))
    }

    #[must_use]
    pub fn items(&self) -> u64 {
        self.items
    }

    /// Write the sidecar for `data_path`.
    pub fn save_for(&self, data_path: &Path) -> Result<PathBuf> {
        let path = sidecar_path(data_path);
        let mut f = std::fs::File::create(&path)?;
        f.write_all(INDEX_MAGIC)?;
        f.write_all(&postcard::to_allocvec(self)?)?;
        Ok(path)
    }

    /// Load the sidecar of `data_path`. `Index` errors mean "process the
    /// file without pruning", never "skip the file".
    pub fn load_for(data_path: &Path) -> Result<Self> {
        let path = sidecar_path(data_path);
        let mut f = std::fs::File::open(&path)
            .map_err(|e| QueryError::Index(format!("{}: {e}", path.display())))?;
        let mut magic = [0u8; 4];
        f.read_exact(&mut magic)
            .map_err(|e| QueryError::Index(format!("{}: {e}", path.display())))?;
        if &magic != INDEX_MAGIC {
            return Err(QueryError::Index(format!("{}: bad magic", path.display())));
        }
        let mut body = Vec::new();
        f.read_to_end(&mut body)
            .map_err(|e| QueryError::Index(format!("{}: {e}", path.display())))?;
        let idx: Self = postcard::from_bytes(&body)
            .map_err(|e| QueryError::Index(format!("{}: {e}", path.display())))?;
        if idx.nbits == 0 || idx.bits.len() as u64 != idx.nbits.div_ceil(8) {
            return Err(QueryError::Index(format!("{}: inconsistent header", path.display())));
        }
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn no_false_negatives() {
        let mut idx = BloomIndex::with_capacity(1000, 0.01);
        let addrs: Vec<IpAddr> = (0..1000u32)
            .map(|i| IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)))
            .collect();
        for a in &addrs {
            idx.insert(a);
        }
        for a in &addrs {
            assert!(idx.contains(a), "{a} must be reported present");
        }
    }

    #[test]
    fn absent_addresses_mostly_rejected() {
        let mut idx = BloomIndex::with_capacity(1000, 0.01);
        for i in 0..1000u32 {
            idx.insert(&IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)));
        }
        let false_positives = (0..1000u32)
            .map(|i| IpAddr::V4(Ipv4Addr::from(0xc0a8_0000 + i)))
            .filter(|a| idx.contains(a))
            .count();
        // 1% nominal; allow generous slack
        assert!(false_positives < 100, "false positive rate too high: {false_positives}/1000");
    }

    #[test]
    fn sidecar_naming() {
        let p = sidecar_path(Path::new("/flows/2024/01/01/nfcapd.202401010000"));
        assert_eq!(p, Path::new("/flows/2024/01/01/bfi.nfcapd.202401010000"));
        assert!(is_sidecar_name("bfi.nfcapd.202401010000"));
        assert!(!is_sidecar_name("nfcapd.202401010000"));
    }

    #[test]
    fn sidecar_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("cap.000");
        let mut idx = BloomIndex::with_capacity(10, 0.01);
        idx.insert(&v4("10.0.0.1"));
        idx.insert(&v4("2001:db8::1"));
        idx.save_for(&data)?;

        let loaded = BloomIndex::load_for(&data)?;
        assert!(loaded.contains(&v4("10.0.0.1")));
        assert!(loaded.contains(&v4("2001:db8::1")));
        Ok(())
    }

    #[test]
    fn missing_sidecar_is_index_error() {
        let err = BloomIndex::load_for(Path::new("/nonexistent/cap.000")).unwrap_err();
        assert!(matches!(err, QueryError::Index(_)));
    }
}
