//! Postings ("numbers"): sorted, duplicate-free message ids of one attribute value.
//!
//! Record layout (appended to `<attr>.num`, located by a catalog item):
//!   count[uvarint] | deltas[uvarint * count] | crc32(count + deltas)[u32 LE]
//!
//! The first delta is the first id itself; every later delta is > 0.
//! Records are never modified in place; a new generation appends a superseding
//! record, or writes a compacted file holding only the live records.

use crate::consts::CRC_SIZE;
use crate::errors::{BixError, Result};
use crate::utils::{crc32, uvarint_decode, uvarint_encode};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

pub fn encode_sorted_u64(nums: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nums.len() * 2);
    let mut prev = 0u64;
    for &n in nums { let d = n - prev; prev = n; uvarint_encode(d, &mut out); }
    out
}

pub fn decode_sorted_u64(buf: &[u8]) -> Result<Vec<u64>> {
    let mut res = Vec::new();
    let mut prev = 0u64; let mut cur = buf;
    while !cur.is_empty() {
        let (d, rest) = uvarint_decode(cur).ok_or_else(|| BixError::decode("numbers", "truncated varint"))?;
        if !res.is_empty() && d == 0 { return Err(BixError::decode("numbers", "duplicate id")); }
        cur = rest;
        prev = prev.checked_add(d).ok_or_else(|| BixError::decode("numbers", "id overflow"))?;
        res.push(prev);
    }
    Ok(res)
}

/// Sorted union without duplicates.
pub fn merge_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let (mut i, mut j) = (0usize, 0usize);
    let mut out = Vec::with_capacity(a.len()+b.len());
    while i<a.len() || j<b.len() {
        let next = if j==b.len() || (i<a.len() && a[i] < b[j]) { i+=1; a[i-1] }
            else if i==a.len() || b[j] < a[i] { j+=1; b[j-1] }
            else { i+=1; j+=1; a[i-1] };
        if out.last() != Some(&next) { out.push(next); }
    }
    out
}

pub fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let (mut i, mut j) = (0usize, 0usize);
    let mut out = Vec::new();
    while i<a.len() && j<b.len() {
        if a[i]==b[j] { out.push(a[i]); i+=1; j+=1; }
        else if a[i]<b[j] { i+=1; } else { j+=1; }
    }
    out
}

/// `a` without the ids in `b`.
pub fn subtract_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut j = 0usize;
    let mut out = Vec::with_capacity(a.len());
    for &x in a {
        while j<b.len() && b[j]<x { j+=1; }
        if j<b.len() && b[j]==x { continue; }
        out.push(x);
    }
    out
}

/// Frame a strictly increasing id list as a numbers record.
pub fn encode_record(ids: &[u64]) -> Vec<u8> {
    debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
    let mut out = Vec::with_capacity(ids.len() * 2 + 8);
    uvarint_encode(ids.len() as u64, &mut out);
    out.extend_from_slice(&encode_sorted_u64(ids));
    let c = crc32(&out);
    out.extend_from_slice(&c.to_le_bytes());
    out
}

/// Apply adds and removes to an existing posting; returns the new id list and its record.
/// The source block is only read.
pub fn merge(existing: &Numbers, adds: &[u64], removes: &[u64]) -> Result<(Vec<u64>, Vec<u8>)> {
    let cur = existing.to_vec()?;
    let ids = subtract_sorted(&merge_sorted(&cur, adds), removes);
    let rec = encode_record(&ids);
    Ok((ids, rec))
}

enum Blob {
    Empty,
    Mapped(Mmap),
}

impl Blob {
    fn as_slice(&self) -> &[u8] {
        match self { Blob::Empty => &[], Blob::Mapped(m) => &m[..] }
    }
}

/// Read-only view of a `.num` file. Clones share the mapping.
#[derive(Clone)]
pub struct NumbersFile {
    blob: Arc<Blob>,
}

impl NumbersFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path)?;
        let blob = if f.metadata()?.len() == 0 {
            Blob::Empty
        } else {
            // files of a published generation are never modified
            Blob::Mapped(unsafe { Mmap::map(&f)? })
        };
        Ok(Self { blob: Arc::new(blob) })
    }

    pub fn len(&self) -> u64 { self.blob.as_slice().len() as u64 }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn bounds(&self, offset: u64, length: u32) -> Result<(usize, usize)> {
        let len = self.blob.as_slice().len();
        let start = usize::try_from(offset).map_err(|_| BixError::decode("numbers", "offset"))?;
        let end = start.checked_add(length as usize).filter(|&e| e <= len)
            .ok_or_else(|| BixError::decode("numbers", format!("record {offset}+{length} past end {len}")))?;
        Ok((start, end))
    }

    /// Bytes of the record at `offset` as stored; only bounds are checked.
    pub fn raw(&self, offset: u64, length: u32) -> Result<&[u8]> {
        let (start, end) = self.bounds(offset, length)?;
        Ok(&self.blob.as_slice()[start..end])
    }

    /// Validate bounds and crc of the record at `offset` without decoding ids.
    pub fn load(&self, offset: u64, length: u32) -> Result<Numbers> {
        let data = self.blob.as_slice();
        let (start, end) = self.bounds(offset, length)?;
        if (length as usize) < 1 + CRC_SIZE {
            return Err(BixError::decode("numbers", format!("record at {offset} too short")));
        }
        let body = &data[start..end - CRC_SIZE];
        let want = u32::from_le_bytes(data[end - CRC_SIZE..end].try_into().map_err(|_| BixError::decode("numbers", "crc"))?);
        if crc32(body) != want {
            return Err(BixError::decode("numbers", format!("crc mismatch at {offset}")));
        }
        let (count, rest) = uvarint_decode(body).ok_or_else(|| BixError::decode("numbers", "count"))?;
        let payload_start = end - CRC_SIZE - rest.len();
        Ok(Numbers { blob: self.blob.clone(), start: payload_start, end: end - CRC_SIZE, count })
    }
}

/// One posting record; ids are decoded on demand.
#[derive(Clone)]
pub struct Numbers {
    blob: Arc<Blob>,
    start: usize,
    end: usize,
    count: u64,
}

impl Numbers {
    pub fn empty() -> Self {
        Self { blob: Arc::new(Blob::Empty), start: 0, end: 0, count: 0 }
    }

    pub fn len(&self) -> u64 { self.count }

    pub fn is_empty(&self) -> bool { self.count == 0 }

    pub fn iter(&self) -> NumbersIter {
        NumbersIter { blob: self.blob.clone(), pos: self.start, end: self.end, remaining: self.count, prev: None }
    }

    pub fn to_vec(&self) -> Result<Vec<u64>> { self.iter().collect() }

    /// Scans until an id >= `id`.
    pub fn contains(&self, id: u64) -> Result<bool> {
        for n in self.iter() {
            let n = n?;
            if n >= id { return Ok(n == id); }
        }
        Ok(false)
    }
}

/// Lazy decoder; yields one error and stops on a malformed record.
pub struct NumbersIter {
    blob: Arc<Blob>,
    pos: usize,
    end: usize,
    remaining: u64,
    prev: Option<u64>,
}

impl NumbersIter {
    fn fail(&mut self, detail: &str) -> Option<Result<u64>> {
        self.remaining = 0;
        self.pos = self.end;
        Some(Err(BixError::decode("numbers", detail.to_string())))
    }
}

impl Iterator for NumbersIter {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if self.pos != self.end { return self.fail("trailing bytes after last id"); }
            return None;
        }
        let data = &self.blob.as_slice()[self.pos..self.end];
        let Some((d, rest)) = uvarint_decode(data) else { return self.fail("truncated varint"); };
        let id = match self.prev {
            None => d,
            Some(_) if d == 0 => return self.fail("ids not strictly increasing"),
            Some(p) => match p.checked_add(d) { Some(id) => id, None => return self.fail("id overflow") },
        };
        self.pos = self.end - rest.len();
        self.remaining -= 1;
        self.prev = Some(id);
        Some(Ok(id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // a corrupt record may declare more ids than it holds, plus one error
        (0, usize::try_from(self.remaining).ok().and_then(|r| r.checked_add(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(records: &[Vec<u8>]) -> (NamedTempFile, NumbersFile, Vec<(u64, u32)>) {
        let mut f = NamedTempFile::new().unwrap();
        let mut locs = Vec::new();
        let mut off = 0u64;
        for r in records {
            f.write_all(r).unwrap();
            locs.push((off, r.len() as u32));
            off += r.len() as u64;
        }
        f.flush().unwrap();
        let nf = NumbersFile::open(f.path()).unwrap();
        (f, nf, locs)
    }

    #[test]
    fn empty_single_and_large_records() {
        let big: Vec<u64> = (0..10_000).map(|x| x * 3 + (1 << 40)).collect();
        let recs = vec![encode_record(&[]), encode_record(&[42]), encode_record(&big)];
        let (_f, nf, locs) = file_with(&recs);
        assert!(nf.load(locs[0].0, locs[0].1).unwrap().to_vec().unwrap().is_empty());
        assert_eq!(nf.load(locs[1].0, locs[1].1).unwrap().to_vec().unwrap(), vec![42]);
        let n = nf.load(locs[2].0, locs[2].1).unwrap();
        assert_eq!(n.len(), 10_000);
        assert_eq!(n.to_vec().unwrap(), big);
        assert!(n.contains((1 << 40) + 3).unwrap());
        assert!(!n.contains((1 << 40) + 4).unwrap());
    }

    #[test]
    fn truncated_record_is_an_error_not_empty() {
        let rec = encode_record(&[1, 2, 3]);
        let (_f, nf, locs) = file_with(&[rec]);
        assert!(matches!(nf.load(locs[0].0, locs[0].1 - 1), Err(BixError::Decode { .. })));
        assert!(matches!(nf.load(locs[0].0, locs[0].1 + 1), Err(BixError::Decode { .. })));
        assert!(matches!(nf.load(1000, 5), Err(BixError::Decode { .. })));
    }

    #[test]
    fn corrupt_byte_fails_crc() {
        let mut rec = encode_record(&[10, 20, 30]);
        rec[2] ^= 0x01;
        let (_f, nf, locs) = file_with(&[rec]);
        assert!(nf.load(locs[0].0, locs[0].1).is_err());
    }

    #[test]
    fn merge_applies_adds_and_removes() {
        let (_f, nf, locs) = file_with(&[encode_record(&[1, 3, 5])]);
        let cur = nf.load(locs[0].0, locs[0].1).unwrap();
        let (ids, rec) = merge(&cur, &[2, 3, 9], &[5, 7]).unwrap();
        assert_eq!(ids, vec![1, 2, 3, 9]);
        assert_eq!(rec, encode_record(&ids));
        // source block is untouched
        assert_eq!(cur.to_vec().unwrap(), vec![1, 3, 5]);
    }

    #[test]
    fn huge_declared_count_is_an_error() {
        let mut body = Vec::new();
        uvarint_encode(u64::MAX, &mut body);
        uvarint_encode(5, &mut body);
        let c = crc32(&body);
        body.extend_from_slice(&c.to_le_bytes());
        let (_f, nf, locs) = file_with(&[body]);
        let n = nf.load(locs[0].0, locs[0].1).unwrap();
        let mut it = n.iter();
        let _ = it.size_hint();
        assert_eq!(it.next().unwrap().unwrap(), 5);
        assert!(matches!(it.next(), Some(Err(BixError::Decode { .. }))));
        assert!(it.next().is_none());
        assert_eq!(nf.raw(locs[0].0, locs[0].1).unwrap().len(), locs[0].1 as usize);
        assert!(nf.raw(locs[0].0, locs[0].1 + 1).is_err());
    }

    #[test]
    fn set_helpers() {
        assert_eq!(merge_sorted(&[1, 2, 4], &[2, 3, 4, 8]), vec![1, 2, 3, 4, 8]);
        assert_eq!(intersect_sorted(&[1, 2, 4], &[2, 3, 4, 8]), vec![2, 4]);
        assert_eq!(subtract_sorted(&[1, 2, 4], &[2, 3, 4, 8]), vec![1]);
        assert!(decode_sorted_u64(&[0x05, 0x00]).is_err());
    }

    fn sorted_set() -> impl Strategy<Value = Vec<u64>> {
        proptest::collection::btree_set(any::<u64>(), 0..200).prop_map(|s| s.into_iter().collect())
    }

    proptest! {
        #[test]
        fn codec_round_trips(ids in sorted_set()) {
            prop_assert_eq!(decode_sorted_u64(&encode_sorted_u64(&ids)).unwrap(), ids.clone());
            let (_f, nf, locs) = file_with(&[encode_record(&ids)]);
            prop_assert_eq!(nf.load(locs[0].0, locs[0].1).unwrap().to_vec().unwrap(), ids);
        }

        #[test]
        fn merge_is_set_union(a in sorted_set(), b in sorted_set()) {
            let want: Vec<u64> = a.iter().chain(b.iter()).copied()
                .collect::<std::collections::BTreeSet<_>>().into_iter().collect();
            prop_assert_eq!(merge_sorted(&a, &b), want);
        }
    }
}
