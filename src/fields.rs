//! Flow record field descriptors.
//!
//! A query names fields in three places: aggregation keys, the optional sort
//! key, and the output columns. Each field has a fixed wire size, a default
//! aggregation function, and an optional alignment (a netmask for address
//! fields, a granularity in seconds for time fields). [`FieldSpec`] bundles a
//! [`FieldId`] with its alignment and the aggregation function that applies
//! to it in the current query.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a flow record field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldId {
    First,
    Last,
    SrcAddr,
    DstAddr,
    SrcPort,
    DstPort,
    Proto,
    TcpFlags,
    Tos,
    Packets,
    Bytes,
    OutPackets,
    OutBytes,
    Flows,
    SrcAs,
    DstAs,
    InIf,
    OutIf,
}

/// Wire representation of a field value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Millisecond timestamp, 8 bytes.
    Time,
    /// IPv4/IPv6 address in a 16-byte slot.
    Addr,
    /// 64-bit counter.
    U64,
    /// 32-bit number (AS, interface index).
    U32,
    /// 16-bit number (port).
    U16,
    /// 8-bit number (protocol, TCP flags, ToS).
    U8,
}

impl FieldKind {
    /// Size of one value of this kind in a record buffer.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Addr => 16,
            Self::Time | Self::U64 => 8,
            Self::U32 => 4,
            Self::U16 => 2,
            Self::U8 => 1,
        }
    }

    /// Whether values of this kind order and combine as integers.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Addr)
    }
}

/// How a non-key field combines when records collapse under aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggrFunc {
    /// Identity; the field is (part of) the aggregation key.
    Key,
    Min,
    Max,
    Sum,
    /// Bitwise OR, used for TCP flags.
    Or,
}

/// Sort direction of the single sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(QueryError::Argument(format!(
                "unknown sort direction `{other}` (expected asc or desc)"
            ))),
        }
    }
}

impl FieldId {
    /// All fields, in canonical output order.
    pub const ALL: [Self; 18] = [
        Self::First,
        Self::Last,
        Self::SrcAddr,
        Self::DstAddr,
        Self::SrcPort,
        Self::DstPort,
        Self::Proto,
        Self::TcpFlags,
        Self::Tos,
        Self::Packets,
        Self::Bytes,
        Self::OutPackets,
        Self::OutBytes,
        Self::Flows,
        Self::SrcAs,
        Self::DstAs,
        Self::InIf,
        Self::OutIf,
    ];

    /// Canonical name used in output headers and CLI parsing.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::SrcAddr => "srcip",
            Self::DstAddr => "dstip",
            Self::SrcPort => "srcport",
            Self::DstPort => "dstport",
            Self::Proto => "proto",
            Self::TcpFlags => "flags",
            Self::Tos => "tos",
            Self::Packets => "packets",
            Self::Bytes => "bytes",
            Self::OutPackets => "outpackets",
            Self::OutBytes => "outbytes",
            Self::Flows => "flows",
            Self::SrcAs => "srcas",
            Self::DstAs => "dstas",
            Self::InIf => "inif",
            Self::OutIf => "outif",
        }
    }

    /// Parse a field name or one of its accepted aliases.
    pub fn parse(name: &str) -> Result<Self> {
        let id = match name.to_ascii_lowercase().as_str() {
            "first" | "tstart" => Self::First,
            "last" | "tend" => Self::Last,
            "srcip" | "srcaddr" | "sa" => Self::SrcAddr,
            "dstip" | "dstaddr" | "da" => Self::DstAddr,
            "srcport" | "sp" => Self::SrcPort,
            "dstport" | "dp" => Self::DstPort,
            "proto" | "protocol" => Self::Proto,
            "flags" | "tcpflags" => Self::TcpFlags,
            "tos" => Self::Tos,
            "packets" | "pkts" => Self::Packets,
            "bytes" | "octets" => Self::Bytes,
            "outpackets" | "opkts" => Self::OutPackets,
            "outbytes" | "obytes" => Self::OutBytes,
            "flows" | "aggrflows" => Self::Flows,
            "srcas" => Self::SrcAs,
            "dstas" => Self::DstAs,
            "inif" | "input" => Self::InIf,
            "outif" | "output" => Self::OutIf,
            other => {
                return Err(QueryError::Argument(format!("unknown field `{other}`")));
            }
        };
        Ok(id)
    }

    #[must_use]
    pub const fn kind(self) -> FieldKind {
        match self {
            Self::First | Self::Last => FieldKind::Time,
            Self::SrcAddr | Self::DstAddr => FieldKind::Addr,
            Self::Packets | Self::Bytes | Self::OutPackets | Self::OutBytes | Self::Flows => {
                FieldKind::U64
            }
            Self::SrcAs | Self::DstAs | Self::InIf | Self::OutIf => FieldKind::U32,
            Self::SrcPort | Self::DstPort => FieldKind::U16,
            Self::Proto | Self::TcpFlags | Self::Tos => FieldKind::U8,
        }
    }

    /// Aggregation function applied when the field is not a key.
    #[must_use]
    pub const fn default_aggr(self) -> AggrFunc {
        match self {
            Self::First => AggrFunc::Min,
            Self::Last => AggrFunc::Max,
            Self::Packets | Self::Bytes | Self::OutPackets | Self::OutBytes | Self::Flows => {
                AggrFunc::Sum
            }
            Self::TcpFlags => AggrFunc::Or,
            _ => AggrFunc::Key,
        }
    }

    /// SUM-aggregated traffic-volume counters. Only these qualify a sort key
    /// for the three-round Top-N protocol.
    #[must_use]
    pub const fn is_traffic_counter(self) -> bool {
        matches!(
            self,
            Self::Packets | Self::Bytes | Self::OutPackets | Self::OutBytes | Self::Flows
        )
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A field as used by one query: identifier, aggregation function, and
/// optional alignment.
///
/// Alignment means a netmask prefix length for address fields (`srcip/24`)
/// and a granularity in seconds for time fields (`first/3600`). Other kinds
/// reject alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub id: FieldId,
    pub aggr: AggrFunc,
    pub align: Option<u32>,
}

impl FieldSpec {
    #[must_use]
    pub fn new(id: FieldId) -> Self {
        Self { id, aggr: id.default_aggr(), align: None }
    }

    #[must_use]
    pub fn key(id: FieldId) -> Self {
        Self { id, aggr: AggrFunc::Key, align: None }
    }

    /// Parse `name[/align]`, e.g. `srcip/24` or `first/300`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (name, align) = match spec.split_once('/') {
            Some((name, align)) => {
                let n: u32 = align.parse().map_err(|_| {
                    QueryError::Argument(format!("bad alignment `{align}` in `{spec}`"))
                })?;
                (name, Some(n))
            }
            None => (spec, None),
        };
        let id = FieldId::parse(name)?;
        if let Some(n) = align {
            match id.kind() {
                FieldKind::Addr => {
                    if n > 128 {
                        return Err(QueryError::Argument(format!(
                            "netmask /{n} out of range for `{name}`"
                        )));
                    }
                }
                FieldKind::Time => {
                    if n == 0 {
                        return Err(QueryError::Argument(format!(
                            "zero granularity for `{name}`"
                        )));
                    }
                }
                _ => {
                    return Err(QueryError::Argument(format!(
                        "field `{name}` does not take an alignment"
                    )));
                }
            }
        }
        Ok(Self { id, aggr: id.default_aggr(), align })
    }

    #[must_use]
    pub fn as_key(mut self) -> Self {
        self.aggr = AggrFunc::Key;
        self
    }
}
