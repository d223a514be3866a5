//! Builds the next generation from the current baseline and a batch of facts.
//!
//! Unchanged attributes are hard-linked into the new directory. A changed
//! attribute gets a copy of its previous numbers file with the superseding
//! records appended, a fresh catalog and a fresh reverse file. Once the
//! superseded records outweigh the live ones the numbers file is compacted
//! instead: only live records are copied. Nothing in the previous
//! generation's directory is touched.

use crate::attribute::{Attribute, Value};
use crate::baseline::{attr_file, Baseline};
use crate::catalog::{CatalogBuilder, CatalogItem};
use crate::consts::{generation_dir_name, COMPACT_DEAD_RATIO, EXT_CATALOG, EXT_NUMBERS, EXT_REVERSE, UNIVERSE_FILE};
use crate::errors::Result;
use crate::numbers::{self, encode_record, merge_sorted, subtract_sorted, Numbers};
use crate::reverse::Reverse;
use crate::utils::{fsync_dir, persist_atomic};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub attribute: Attribute,
    pub value: Value,
    pub message: u64,
    pub op: Op,
}

/// Facts applied together as one generation. Later facts on the same
/// (attribute, value, message) override earlier ones.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    facts: Vec<Fact>,
}

impl Batch {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, attribute: Attribute, value: impl Into<Value>, message: u64) -> &mut Self {
        self.facts.push(Fact { attribute, value: value.into(), message, op: Op::Add });
        self
    }

    pub fn remove(&mut self, attribute: Attribute, value: impl Into<Value>, message: u64) -> &mut Self {
        self.facts.push(Fact { attribute, value: value.into(), message, op: Op::Remove });
        self
    }

    /// Mark `message` as a member of the bundle identified by `marker`.
    pub fn bundle(&mut self, message: u64, marker: &str) -> &mut Self {
        self.add(Attribute::bundle(), marker, message)
    }

    pub fn push(&mut self, fact: Fact) -> &mut Self {
        self.facts.push(fact);
        self
    }

    pub fn facts(&self) -> &[Fact] { &self.facts }

    pub fn len(&self) -> usize { self.facts.len() }

    pub fn is_empty(&self) -> bool { self.facts.is_empty() }

    fn grouped(&self) -> BTreeMap<Attribute, BTreeMap<Value, BTreeMap<u64, Op>>> {
        let mut out: BTreeMap<Attribute, BTreeMap<Value, BTreeMap<u64, Op>>> = BTreeMap::new();
        for f in &self.facts {
            out.entry(f.attribute.clone())
                .or_default()
                .entry(f.value.clone())
                .or_default()
                .insert(f.message, f.op);
        }
        out
    }
}

/// Bundle marker shared by all messages of bouts with the same participants.
pub fn bundle_marker<S: AsRef<str>>(participants: &[S]) -> String {
    let mut names: Vec<&str> = participants.iter().map(|p| p.as_ref()).collect();
    names.sort_unstable();
    names.dedup();
    let h = blake3::hash(names.join("\n").as_bytes());
    h.to_hex()[..16].to_string()
}

/// What the builder produced, to be recorded in the manifest.
#[derive(Debug)]
pub struct Built {
    pub number: u64,
    pub dir: PathBuf,
    pub attributes: Vec<Attribute>,
    pub messages: u64,
    pub records_written: usize,
}

/// Removes the half-built directory unless disarmed.
struct PartialDir {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartialDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    if fs::hard_link(from, to).is_err() {
        fs::copy(from, to)?;
    }
    Ok(())
}

/// Write generation `number` under `root` and rename it into place.
/// On error the partial directory is removed and `prev` stays authoritative.
pub fn build_generation(root: &Path, prev: &Baseline, number: u64, batch: &Batch, sync: bool) -> Result<Built> {
    let final_dir = root.join(generation_dir_name(number));
    let mut partial = PartialDir { path: root.join(format!("{}.partial", generation_dir_name(number))), armed: true };
    if partial.path.exists() {
        fs::remove_dir_all(&partial.path)?;
    }
    fs::create_dir_all(&partial.path)?;

    let changes = batch.grouped();
    let mut attributes: BTreeSet<Attribute> = prev.attributes().cloned().collect();
    attributes.extend(changes.keys().cloned());

    let mut new_reverse: BTreeMap<Attribute, Reverse> = BTreeMap::new();
    let mut records_written = 0usize;
    for attribute in &attributes {
        let Some(values) = changes.get(attribute) else {
            let src = prev.dir().map(Path::to_path_buf).unwrap_or_default();
            for ext in [EXT_CATALOG, EXT_NUMBERS, EXT_REVERSE] {
                link_or_copy(&attr_file(&src, attribute, ext), &attr_file(&partial.path, attribute, ext))?;
            }
            continue;
        };
        let (reverse, written) = rewrite_attribute(&partial.path, prev, attribute, values, sync)?;
        records_written += written;
        new_reverse.insert(attribute.clone(), reverse);
    }

    let universe = next_universe(prev, &changes, &new_reverse)?;
    persist_atomic(&partial.path.join(UNIVERSE_FILE), &encode_record(&universe), sync)?;

    if sync { fsync_dir(&partial.path)?; }
    fs::rename(&partial.path, &final_dir)?;
    partial.armed = false;
    if sync { fsync_dir(root)?; }

    tracing::debug!(generation = number, attributes = attributes.len(), records_written, "generation written");
    Ok(Built {
        number,
        dir: final_dir,
        attributes: attributes.into_iter().collect(),
        messages: universe.len() as u64,
        records_written,
    })
}

fn rewrite_attribute(
    dir: &Path,
    prev: &Baseline,
    attribute: &Attribute,
    values: &BTreeMap<Value, BTreeMap<u64, Op>>,
    sync: bool,
) -> Result<(Reverse, usize)> {
    let num_path = attr_file(dir, attribute, EXT_NUMBERS);
    let prev_catalog = prev.catalog(attribute)?;
    let prev_numbers = prev.numbers_file(attribute)?;
    let kept: Vec<&CatalogItem> = match &prev_catalog {
        Some(cat) => cat.iter().filter(|it| !values.contains_key(&it.value)).collect(),
        None => Vec::new(),
    };
    let live: u64 = kept.iter().map(|it| it.length as u64).sum();
    let dead = prev_numbers.as_ref().map_or(0, |f| f.len()).saturating_sub(live);

    let mut catalog = CatalogBuilder::new(attribute.clone());
    let mut num;
    let mut offset;
    match (&prev_numbers, prev.dir()) {
        (Some(src), _) if dead > live.saturating_mul(COMPACT_DEAD_RATIO) => {
            num = OpenOptions::new().write(true).create_new(true).open(&num_path)?;
            offset = 0u64;
            for item in &kept {
                num.write_all(src.raw(item.offset, item.length)?)?;
                catalog.put(item.value.clone(), offset, item.length)?;
                offset += item.length as u64;
            }
            tracing::debug!(attribute = %attribute, live, dead, "numbers file compacted");
        }
        (Some(_), Some(src)) => {
            fs::copy(attr_file(src, attribute, EXT_NUMBERS), &num_path)?;
            num = OpenOptions::new().append(true).open(&num_path)?;
            offset = num.metadata()?.len();
            for item in &kept {
                catalog.put(item.value.clone(), item.offset, item.length)?;
            }
        }
        _ => {
            num = OpenOptions::new().write(true).create_new(true).open(&num_path)?;
            offset = 0;
        }
    }

    let mut reverse = prev.reverse(attribute)?.as_ref().clone();

    let mut written = 0usize;
    for (value, ops) in values {
        let adds: Vec<u64> = ops.iter().filter(|(_, op)| **op == Op::Add).map(|(m, _)| *m).collect();
        let removes: Vec<u64> = ops.iter().filter(|(_, op)| **op == Op::Remove).map(|(m, _)| *m).collect();
        let existing = prev.postings(attribute, value)?.unwrap_or_else(Numbers::empty);
        let (ids, rec) = numbers::merge(&existing, &adds, &removes)?;
        for &m in &adds { reverse.add(m, value.clone()); }
        for &m in &removes { reverse.remove(m, value); }
        if ids.is_empty() {
            continue;
        }
        num.write_all(&rec)?;
        catalog.put(value.clone(), offset, rec.len() as u32)?;
        offset += rec.len() as u64;
        written += 1;
    }
    if sync { num.sync_all()?; }
    drop(num);

    catalog.finish(&attr_file(dir, attribute, EXT_CATALOG), sync)?;
    reverse.save(&attr_file(dir, attribute, EXT_REVERSE), sync)?;
    Ok((reverse, written))
}

fn next_universe(
    prev: &Baseline,
    changes: &BTreeMap<Attribute, BTreeMap<Value, BTreeMap<u64, Op>>>,
    new_reverse: &BTreeMap<Attribute, Reverse>,
) -> Result<Vec<u64>> {
    let mut added = BTreeSet::new();
    let mut maybe_gone = BTreeSet::new();
    for ops in changes.values().flat_map(|vals| vals.values()) {
        for (&m, op) in ops {
            match op {
                Op::Add => { added.insert(m); }
                Op::Remove => { maybe_gone.insert(m); }
            }
        }
    }

    let mut gone = Vec::new();
    let mut unchanged: BTreeMap<&Attribute, Arc<Reverse>> = BTreeMap::new();
    for attribute in prev.attributes().filter(|a| !new_reverse.contains_key(*a)) {
        unchanged.insert(attribute, prev.reverse(attribute)?);
    }
    for &m in maybe_gone.iter().filter(|m| !added.contains(m)) {
        let linked = new_reverse.values().any(|r| r.values_of(m).is_some())
            || unchanged.values().any(|r| r.values_of(m).is_some());
        if !linked { gone.push(m); }
    }

    let base = prev.universe()?.to_vec()?;
    let added: Vec<u64> = added.into_iter().collect();
    Ok(subtract_sorted(&merge_sorted(&base, &added), &gone))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_facts_override_earlier_ones() {
        let mut b = Batch::new();
        b.add(Attribute::author(), "alice", 1)
            .remove(Attribute::author(), "alice", 1)
            .add(Attribute::author(), "alice", 2);
        let g = b.grouped();
        let ops = &g[&Attribute::author()][&Value::from("alice")];
        assert_eq!(ops[&1], Op::Remove);
        assert_eq!(ops[&2], Op::Add);
    }

    #[test]
    fn bundle_marker_ignores_order_and_duplicates() {
        let a = bundle_marker(&["urn:test:bob", "urn:test:alice"]);
        let b = bundle_marker(&["urn:test:alice", "urn:test:bob", "urn:test:alice"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, bundle_marker(&["urn:test:alice"]));
    }
}
