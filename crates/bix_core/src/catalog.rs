//! Per-attribute catalog: value -> location of its numbers record.
//!
//! File layout (`<attr>.cat`, LE):
//!   magic[4] = "BIXC" | version[2] | rsv[2] | count[8]
//!   repeat count * { len[uvarint] value[len] offset[8] length[4] }   (ascending by value)
//!   crc32[4] over everything before it

use crate::attribute::{Attribute, Value};
use crate::consts::MAGIC_CATALOG;
use crate::errors::{BixError, Result};
use crate::utils::{check_framed, crc32, persist_atomic, uvarint_decode, uvarint_encode, write_header};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub value: Value,
    pub offset: u64,
    pub length: u32,
}

/// Sorted, immutable catalog of one attribute in one generation.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: Vec<CatalogItem>,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::decode(&buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (count, mut cur) = check_framed(buf, MAGIC_CATALOG, "catalog")?;
        let mut items: Vec<CatalogItem> = Vec::with_capacity(count.min(1 << 20) as usize);
        for i in 0..count {
            let (len, rest) = uvarint_decode(cur).ok_or_else(|| BixError::decode("catalog", format!("item {i}: length")))?;
            let len = len as usize;
            if rest.len() < len + 12 {
                return Err(BixError::decode("catalog", format!("item {i} truncated")));
            }
            let value = Value::decode(&rest[..len])?;
            let offset = u64::from_le_bytes(rest[len..len + 8].try_into().map_err(|_| BixError::decode("catalog", "offset"))?);
            let length = u32::from_le_bytes(rest[len + 8..len + 12].try_into().map_err(|_| BixError::decode("catalog", "length"))?);
            if items.last().is_some_and(|p| p.value >= value) {
                return Err(BixError::decode("catalog", format!("item {i} out of order")));
            }
            items.push(CatalogItem { value, offset, length });
            cur = &rest[len + 12..];
        }
        if !cur.is_empty() {
            return Err(BixError::decode("catalog", "trailing bytes"));
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn lookup(&self, value: &Value) -> Option<&CatalogItem> {
        self.items.binary_search_by(|it| it.value.cmp(value)).ok().map(|i| &self.items[i])
    }

    /// Ascending by value.
    pub fn iter(&self) -> std::slice::Iter<'_, CatalogItem> { self.items.iter() }

    pub fn range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> &[CatalogItem] {
        let lo = match lower {
            Bound::Included(v) => self.items.partition_point(|it| it.value < *v),
            Bound::Excluded(v) => self.items.partition_point(|it| it.value <= *v),
            Bound::Unbounded => 0,
        };
        let hi = match upper {
            Bound::Included(v) => self.items.partition_point(|it| it.value <= *v),
            Bound::Excluded(v) => self.items.partition_point(|it| it.value < *v),
            Bound::Unbounded => self.items.len(),
        };
        if lo >= hi { &[] } else { &self.items[lo..hi] }
    }

    /// String values starting with `prefix`.
    pub fn prefix(&self, prefix: &str) -> &[CatalogItem] {
        let start = Value::Str(prefix.to_string());
        let lo = self.items.partition_point(|it| it.value < start);
        let len = self.items[lo..]
            .iter()
            .take_while(|it| it.value.as_str().is_some_and(|s| s.starts_with(prefix)))
            .count();
        &self.items[lo..lo + len]
    }
}

/// Collects the catalog of the generation being built.
pub struct CatalogBuilder {
    attribute: Attribute,
    items: BTreeMap<Value, (u64, u32)>,
}

impl CatalogBuilder {
    pub fn new(attribute: Attribute) -> Self {
        Self { attribute, items: BTreeMap::new() }
    }

    /// Re-putting the same location is a no-op; a different one is a conflict.
    pub fn put(&mut self, value: Value, offset: u64, length: u32) -> Result<()> {
        match self.items.get(&value) {
            Some(&(o, l)) if (o, l) == (offset, length) => Ok(()),
            Some(_) => Err(BixError::DuplicateValue {
                attribute: self.attribute.to_string(),
                value: value.to_string(),
            }),
            None => {
                self.items.insert(value, (offset, length));
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.items.len() * 24);
        write_header(&mut out, MAGIC_CATALOG, self.items.len() as u64);
        let mut vbuf = Vec::new();
        for (value, (offset, length)) in &self.items {
            vbuf.clear();
            value.encode(&mut vbuf);
            uvarint_encode(vbuf.len() as u64, &mut out);
            out.extend_from_slice(&vbuf);
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&length.to_le_bytes());
        }
        let c = crc32(&out);
        out.extend_from_slice(&c.to_le_bytes());
        out
    }

    pub fn finish(self, path: &Path, sync: bool) -> Result<Catalog> {
        let bytes = self.encode();
        persist_atomic(path, &bytes, sync)?;
        let items = self.items.into_iter()
            .map(|(value, (offset, length))| CatalogItem { value, offset, length })
            .collect();
        Ok(Catalog { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> CatalogBuilder {
        let mut b = CatalogBuilder::new(Attribute::author());
        b.put(Value::from("carol"), 40, 7).unwrap();
        b.put(Value::from("alice"), 0, 9).unwrap();
        b.put(Value::from("alfred"), 9, 6).unwrap();
        b.put(Value::from("bob"), 15, 25).unwrap();
        b.put(Value::from(12), 47, 5).unwrap();
        b
    }

    #[test]
    fn write_then_lookup_and_iterate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("author.cat");
        sample().finish(&path, false).unwrap();
        let cat = Catalog::open(&path).unwrap();
        assert_eq!(cat.len(), 5);
        assert_eq!(cat.lookup(&Value::from("bob")).unwrap().offset, 15);
        assert!(cat.lookup(&Value::from("dave")).is_none());
        let vals: Vec<_> = cat.iter().map(|i| i.value.clone()).collect();
        assert_eq!(vals, vec![
            Value::from(12), Value::from("alfred"), Value::from("alice"), Value::from("bob"), Value::from("carol"),
        ]);
        let al: Vec<_> = cat.prefix("al").iter().map(|i| i.offset).collect();
        assert_eq!(al, vec![9, 0]);
        let r = cat.range(Bound::Included(&Value::from("alice")), Bound::Excluded(&Value::from("carol")));
        assert_eq!(r.len(), 2);
        assert!(cat.range(Bound::Included(&Value::from("z")), Bound::Unbounded).is_empty());
    }

    #[test]
    fn conflicting_put_is_rejected() {
        let mut b = sample();
        b.put(Value::from("bob"), 15, 25).unwrap();
        assert!(matches!(b.put(Value::from("bob"), 99, 25), Err(BixError::DuplicateValue { .. })));
    }

    #[test]
    fn truncated_catalog_is_detected() {
        let bytes = sample().encode();
        assert!(Catalog::decode(&bytes).is_ok());
        assert!(Catalog::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(Catalog::decode(&bytes[..5]).is_err());
    }
}
