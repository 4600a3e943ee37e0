//! Flow filter expressions.
//!
//! A small nfdump-flavored predicate language, compiled on every participant
//! from the expression string carried in the task descriptor:
//!
//! ```text
//! src ip 10.0.0.1 and dst port 443
//! ip 1.2.3.4                      # src ip 1.2.3.4 or dst ip 1.2.3.4
//! src net 10.0.0.0/8 and proto tcp
//! bytes > 1000 or not packets < 10
//! ```
//!
//! Keywords are case-insensitive; `and` binds tighter than `or`; `not` and
//! parentheses work as expected. The directionless shorthands `ip`, `net`
//! and `port` expand to an `or` over the src/dst variants at parse time, so
//! later passes (notably the index pruner) only see directed leaves.

use crate::error::{QueryError, Result};
use crate::storage::FlowRecord;
use std::net::IpAddr;

/// Which address/port of the record a leaf tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Src,
    Dst,
}

/// Numeric record properties usable in comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumField {
    Bytes,
    Packets,
    /// Flow duration in milliseconds.
    Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
}

/// Parsed predicate tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    /// Address equality under a prefix mask. `prefix` equals the full
    /// address length for plain `ip` terms.
    Addr { dir: Dir, addr: IpAddr, prefix: u32 },
    Port { dir: Dir, port: u16 },
    Proto(u8),
    Num { field: NumField, op: CmpOp, value: u64 },
}

impl FilterExpr {
    /// Full mask length for the address family of `addr`.
    #[must_use]
    pub fn full_prefix(addr: &IpAddr) -> u32 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

/// A compiled filter, ready to test records.
#[derive(Clone, Debug)]
pub struct Filter {
    expr: FilterExpr,
}

impl Filter {
    /// Compile an expression string. Errors are fatal before the query
    /// starts.
    pub fn compile(expr: &str) -> Result<Self> {
        let tokens = tokenize(expr);
        let mut p = Parser { tokens: &tokens, pos: 0, src: expr };
        let tree = p.parse_or()?;
        if p.pos != p.tokens.len() {
            return Err(QueryError::Filter(format!(
                "trailing input at `{}` in `{expr}`",
                p.tokens[p.pos]
            )));
        }
        Ok(Self { expr: tree })
    }

    /// The predicate tree, for the index pruner.
    #[must_use]
    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    /// Test one record.
    #[must_use]
    pub fn matches(&self, rec: &FlowRecord) -> bool {
        eval(&self.expr, rec)
    }
}

fn eval(e: &FilterExpr, rec: &FlowRecord) -> bool {
    match e {
        FilterExpr::And(l, r) => eval(l, rec) && eval(r, rec),
        FilterExpr::Or(l, r) => eval(l, rec) || eval(r, rec),
        FilterExpr::Not(e) => !eval(e, rec),
        FilterExpr::Addr { dir, addr, prefix } => {
            let probe = match dir {
                Dir::Src => rec.src_addr,
                Dir::Dst => rec.dst_addr,
            };
            addr_matches(&probe, addr, *prefix)
        }
        FilterExpr::Port { dir, port } => {
            let probe = match dir {
                Dir::Src => rec.src_port,
                Dir::Dst => rec.dst_port,
            };
            probe == *port
        }
        FilterExpr::Proto(p) => rec.proto == *p,
        FilterExpr::Num { field, op, value } => {
            let v = match field {
                NumField::Bytes => rec.bytes,
                NumField::Packets => rec.packets,
                NumField::Duration => rec.last.saturating_sub(rec.first),
            };
            match op {
                CmpOp::Lt => v < *value,
                CmpOp::Gt => v > *value,
                CmpOp::Le => v <= *value,
                CmpOp::Ge => v >= *value,
                CmpOp::Eq => v == *value,
            }
        }
    }
}

fn addr_matches(probe: &IpAddr, want: &IpAddr, prefix: u32) -> bool {
    match (probe, want) {
        (IpAddr::V4(p), IpAddr::V4(w)) => {
            let len = prefix.min(32);
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            u32::from(*p) & mask == u32::from(*w) & mask
        }
        (IpAddr::V6(p), IpAddr::V6(w)) => {
            let len = prefix.min(128);
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            u128::from(*p) & mask == u128::from(*w) & mask
        }
        _ => false,
    }
}

fn tokenize(expr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for c in expr.chars() {
        match c {
            '(' | ')' => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
                out.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c.to_ascii_lowercase()),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
    src: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Result<&str> {
        let t = self.tokens.get(self.pos).ok_or_else(|| {
            QueryError::Filter(format!("unexpected end of expression in `{}`", self.src))
        })?;
        self.pos += 1;
        Ok(t)
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = FilterExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut lhs = self.parse_term()?;
        while self.peek() == Some("and") {
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = FilterExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<FilterExpr> {
        match self.peek() {
            Some("not") => {
                self.pos += 1;
                Ok(FilterExpr::Not(Box::new(self.parse_term()?)))
            }
            Some("(") => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next()? {
                    ")" => Ok(inner),
                    t => Err(QueryError::Filter(format!("expected `)`, found `{t}`"))),
                }
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<FilterExpr> {
        let tok = self.next()?.to_string();
        let (dir, kw) = match tok.as_str() {
            "src" | "dst" => {
                let dir = if tok == "src" { Some(Dir::Src) } else { Some(Dir::Dst) };
                (dir, self.next()?.to_string())
            }
            _ => (None, tok),
        };

        match kw.as_str() {
            "ip" | "host" => {
                let addr = self.parse_addr()?;
                let prefix = FilterExpr::full_prefix(&addr);
                Ok(self.directed(dir, |d| FilterExpr::Addr { dir: d, addr, prefix }))
            }
            "net" => {
                let (addr, prefix) = self.parse_net()?;
                Ok(self.directed(dir, |d| FilterExpr::Addr { dir: d, addr, prefix }))
            }
            "port" => {
                let port = self.parse_num::<u16>("port")?;
                Ok(self.directed(dir, |d| FilterExpr::Port { dir: d, port }))
            }
            "proto" => {
                if dir.is_some() {
                    return Err(QueryError::Filter("proto takes no direction".into()));
                }
                let t = self.next()?;
                let p = match t {
                    "tcp" => 6,
                    "udp" => 17,
                    "icmp" => 1,
                    other => other.parse::<u8>().map_err(|_| {
                        QueryError::Filter(format!("unknown protocol `{other}`"))
                    })?,
                };
                Ok(FilterExpr::Proto(p))
            }
            "bytes" | "octets" | "packets" | "pkts" | "duration" => {
                if dir.is_some() {
                    return Err(QueryError::Filter(format!("`{kw}` takes no direction")));
                }
                let field = match kw.as_str() {
                    "bytes" | "octets" => NumField::Bytes,
                    "packets" | "pkts" => NumField::Packets,
                    _ => NumField::Duration,
                };
                let op = match self.next()? {
                    "<" => CmpOp::Lt,
                    ">" => CmpOp::Gt,
                    "<=" => CmpOp::Le,
                    ">=" => CmpOp::Ge,
                    "=" | "==" => CmpOp::Eq,
                    t => {
                        return Err(QueryError::Filter(format!(
                            "expected comparison operator, found `{t}`"
                        )));
                    }
                };
                let value = self.parse_num::<u64>("value")?;
                Ok(FilterExpr::Num { field, op, value })
            }
            other => Err(QueryError::Filter(format!("unknown filter term `{other}`"))),
        }
    }

    /// Apply a direction, or expand the directionless shorthand to
    /// `src … or dst …`.
    fn directed(&self, dir: Option<Dir>, mk: impl Fn(Dir) -> FilterExpr) -> FilterExpr {
        match dir {
            Some(d) => mk(d),
            None => FilterExpr::Or(Box::new(mk(Dir::Src)), Box::new(mk(Dir::Dst))),
        }
    }

    fn parse_addr(&mut self) -> Result<IpAddr> {
        let t = self.next()?;
        t.parse()
            .map_err(|_| QueryError::Filter(format!("bad address `{t}`")))
    }

    fn parse_net(&mut self) -> Result<(IpAddr, u32)> {
        let t = self.next()?.to_string();
        let (addr, len) = t.split_once('/').ok_or_else(|| {
            QueryError::Filter(format!("expected ADDR/LEN, found `{t}`"))
        })?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| QueryError::Filter(format!("bad address `{addr}`")))?;
        let len: u32 = len
            .parse()
            .map_err(|_| QueryError::Filter(format!("bad prefix length `{len}`")))?;
        if len > FilterExpr::full_prefix(&addr) {
            return Err(QueryError::Filter(format!("prefix /{len} too long for `{addr}`")));
        }
        Ok((addr, len))
    }

    fn parse_num<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let t = self.next()?;
        t.parse()
            .map_err(|_| QueryError::Filter(format!("bad {what} `{t}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(src: &str, dst: &str, proto: u8, bytes: u64) -> FlowRecord {
        FlowRecord {
            src_addr: src.parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
            proto,
            bytes,
            ..FlowRecord::default()
        }
    }

    #[test]
    fn directed_and_shorthand_terms() {
        let f = Filter::compile("src ip 10.0.0.1").unwrap();
        assert!(f.matches(&rec("10.0.0.1", "1.1.1.1", 6, 0)));
        assert!(!f.matches(&rec("1.1.1.1", "10.0.0.1", 6, 0)));

        let f = Filter::compile("ip 10.0.0.1").unwrap();
        assert!(f.matches(&rec("10.0.0.1", "1.1.1.1", 6, 0)));
        assert!(f.matches(&rec("1.1.1.1", "10.0.0.1", 6, 0)));
        assert!(!f.matches(&rec("2.2.2.2", "1.1.1.1", 6, 0)));
    }

    #[test]
    fn shorthand_expands_to_or_of_directed_leaves() {
        let f = Filter::compile("ip 1.2.3.4").unwrap();
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(
            *f.expr(),
            FilterExpr::Or(
                Box::new(FilterExpr::Addr { dir: Dir::Src, addr, prefix: 32 }),
                Box::new(FilterExpr::Addr { dir: Dir::Dst, addr, prefix: 32 }),
            )
        );
    }

    #[test]
    fn nets_ports_protocols() {
        let f = Filter::compile("src net 10.0.0.0/8 and proto tcp").unwrap();
        assert!(f.matches(&rec("10.200.3.4", "1.1.1.1", 6, 0)));
        assert!(!f.matches(&rec("11.0.0.1", "1.1.1.1", 6, 0)));
        assert!(!f.matches(&rec("10.200.3.4", "1.1.1.1", 17, 0)));

        let f = Filter::compile("port 53").unwrap();
        let mut r = rec("1.1.1.1", "2.2.2.2", 17, 0);
        r.dst_port = 53;
        assert!(f.matches(&r));
        r.dst_port = 80;
        assert!(!f.matches(&r));
    }

    #[test]
    fn precedence_not_and_or() {
        // and binds tighter than or
        let f = Filter::compile("proto tcp or proto udp and bytes > 100").unwrap();
        assert!(f.matches(&rec("1.1.1.1", "2.2.2.2", 6, 0)));
        assert!(f.matches(&rec("1.1.1.1", "2.2.2.2", 17, 200)));
        assert!(!f.matches(&rec("1.1.1.1", "2.2.2.2", 17, 50)));

        let f = Filter::compile("not (proto tcp or proto udp)").unwrap();
        assert!(f.matches(&rec("1.1.1.1", "2.2.2.2", 1, 0)));
        assert!(!f.matches(&rec("1.1.1.1", "2.2.2.2", 6, 0)));
    }

    #[test]
    fn v6_terms() {
        let f = Filter::compile("dst net 2001:db8::/32").unwrap();
        assert!(f.matches(&rec("::1", "2001:db8::17", 6, 0)));
        assert!(!f.matches(&rec("::1", "2001:db9::17", 6, 0)));
        // family mismatch never matches
        assert!(!f.matches(&rec("::1", "10.0.0.1", 6, 0)));
    }

    #[test]
    fn parse_errors() {
        assert!(Filter::compile("src ip").is_err());
        assert!(Filter::compile("ip 999.0.0.1").is_err());
        assert!(Filter::compile("bytes >").is_err());
        assert!(Filter::compile("src ip 1.2.3.4 extra").is_err());
        assert!(Filter::compile("net 10.0.0.0/40").is_err());
        assert!(Filter::compile("frobnicate 1").is_err());
    }
}
