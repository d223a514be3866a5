//! Reverse links of one attribute: message id -> values it is indexed under.
//!
//! File layout (`<attr>.rev`, LE):
//!   magic[4] = "BIXR" | version[2] | rsv[2] | count[8]
//!   repeat count * { msg[8] n[uvarint] repeat n * { len[uvarint] value[len] } }   (ascending msg)
//!   crc32[4]

use crate::attribute::Value;
use crate::consts::MAGIC_REVERSE;
use crate::errors::{BixError, Result};
use crate::utils::{check_framed, crc32, persist_atomic, uvarint_decode, uvarint_encode, write_header};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reverse {
    links: BTreeMap<u64, BTreeSet<Value>>,
}

impl Reverse {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::decode(&buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (count, mut cur) = check_framed(buf, MAGIC_REVERSE, "reverse")?;
        let mut links = BTreeMap::new();
        let mut last: Option<u64> = None;
        for _ in 0..count {
            if cur.len() < 8 { return Err(BixError::decode("reverse", "truncated message id")); }
            let msg = u64::from_le_bytes(cur[..8].try_into().map_err(|_| BixError::decode("reverse", "message id"))?);
            if last.is_some_and(|l| l >= msg) {
                return Err(BixError::decode("reverse", format!("message {msg} out of order")));
            }
            last = Some(msg);
            let (n, mut rest) = uvarint_decode(&cur[8..]).ok_or_else(|| BixError::decode("reverse", "value count"))?;
            let mut values = BTreeSet::new();
            for _ in 0..n {
                let (len, r) = uvarint_decode(rest).ok_or_else(|| BixError::decode("reverse", "value length"))?;
                let len = len as usize;
                if r.len() < len { return Err(BixError::decode("reverse", "truncated value")); }
                values.insert(Value::decode(&r[..len])?);
                rest = &r[len..];
            }
            links.insert(msg, values);
            cur = rest;
        }
        if !cur.is_empty() {
            return Err(BixError::decode("reverse", "trailing bytes"));
        }
        Ok(Self { links })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, MAGIC_REVERSE, self.links.len() as u64);
        let mut vbuf = Vec::new();
        for (msg, values) in &self.links {
            out.extend_from_slice(&msg.to_le_bytes());
            uvarint_encode(values.len() as u64, &mut out);
            for v in values {
                vbuf.clear();
                v.encode(&mut vbuf);
                uvarint_encode(vbuf.len() as u64, &mut out);
                out.extend_from_slice(&vbuf);
            }
        }
        let c = crc32(&out);
        out.extend_from_slice(&c.to_le_bytes());
        out
    }

    pub fn save(&self, path: &Path, sync: bool) -> Result<()> {
        persist_atomic(path, &self.encode(), sync)
    }

    pub fn values_of(&self, msg: u64) -> Option<&BTreeSet<Value>> {
        self.links.get(&msg)
    }

    pub fn add(&mut self, msg: u64, value: Value) -> bool {
        self.links.entry(msg).or_default().insert(value)
    }

    pub fn remove(&mut self, msg: u64, value: &Value) -> bool {
        let Some(set) = self.links.get_mut(&msg) else { return false };
        let removed = set.remove(value);
        if set.is_empty() { self.links.remove(&msg); }
        removed
    }

    /// Linked messages, ascending.
    pub fn messages(&self) -> impl Iterator<Item = u64> + '_ {
        self.links.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &BTreeSet<Value>)> + '_ {
        self.links.iter().map(|(m, v)| (*m, v))
    }

    pub fn len(&self) -> usize { self.links.len() }

    pub fn is_empty(&self) -> bool { self.links.is_empty() }
}
