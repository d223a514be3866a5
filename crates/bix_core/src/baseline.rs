//! Immutable snapshot of one index generation.
//!
//! Layout of a generation directory:
//!   <attr>.cat    catalog
//!   <attr>.num    numbers records (append-only across generations)
//!   <attr>.rev    reverse links
//!   universe.num  one record: every message with at least one link
//!
//! Per-attribute tables are opened on first use, so a damaged file only
//! affects queries (and audits) touching that attribute.

use crate::attribute::{Attribute, Value};
use crate::catalog::Catalog;
use crate::consts::{EXT_CATALOG, EXT_NUMBERS, EXT_REVERSE, UNIVERSE_FILE};
use crate::errors::{BixError, Result};
use crate::manifest::GenerationRec;
use crate::numbers::{Numbers, NumbersFile};
use crate::reverse::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub fn attr_file(dir: &Path, attribute: &Attribute, ext: &str) -> PathBuf {
    dir.join(format!("{}.{ext}", attribute.name()))
}

type Cached<T> = OnceLock<std::result::Result<T, String>>;

fn cached<T: Clone>(cell: &Cached<T>, what: &'static str, init: impl FnOnce() -> Result<T>) -> Result<T> {
    cell.get_or_init(|| init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|detail| BixError::decode(what, detail))
}

#[derive(Default)]
struct AttrTables {
    forward: Cached<(Arc<Catalog>, NumbersFile)>,
    reverse: Cached<Arc<Reverse>>,
}

pub struct Baseline {
    generation: u64,
    dir: Option<PathBuf>,
    messages: u64,
    attrs: BTreeMap<Attribute, AttrTables>,
    universe: Cached<Numbers>,
}

impl Baseline {
    /// Generation 0: nothing indexed yet.
    pub fn empty() -> Self {
        Self { generation: 0, dir: None, messages: 0, attrs: BTreeMap::new(), universe: OnceLock::new() }
    }

    pub fn open(root: &Path, rec: &GenerationRec) -> Result<Self> {
        let dir = root.join(&rec.dir);
        if !dir.is_dir() {
            return Err(BixError::InvalidInput(format!("generation directory {} is missing", dir.display())));
        }
        let attrs = rec.attributes.iter().map(|a| (a.clone(), AttrTables::default())).collect();
        Ok(Self { generation: rec.number, dir: Some(dir), messages: rec.messages, attrs, universe: OnceLock::new() })
    }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn dir(&self) -> Option<&Path> { self.dir.as_deref() }

    pub fn message_count(&self) -> u64 { self.messages }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> + '_ { self.attrs.keys() }

    pub fn has_attribute(&self, attribute: &Attribute) -> bool { self.attrs.contains_key(attribute) }

    fn forward(&self, attribute: &Attribute) -> Result<Option<(Arc<Catalog>, NumbersFile)>> {
        let (Some(t), Some(dir)) = (self.attrs.get(attribute), self.dir.as_deref()) else { return Ok(None) };
        cached(&t.forward, "catalog", || {
            let cat = Catalog::open(attr_file(dir, attribute, EXT_CATALOG))?;
            let num = NumbersFile::open(attr_file(dir, attribute, EXT_NUMBERS))?;
            Ok((Arc::new(cat), num))
        })
        .map(Some)
        .map_err(|e| e.on_attribute(attribute.name()))
    }

    /// Catalog of `attribute`; `None` when nothing was ever indexed under it.
    pub fn catalog(&self, attribute: &Attribute) -> Result<Option<Arc<Catalog>>> {
        Ok(self.forward(attribute)?.map(|(c, _)| c))
    }

    pub fn numbers_file(&self, attribute: &Attribute) -> Result<Option<NumbersFile>> {
        Ok(self.forward(attribute)?.map(|(_, n)| n))
    }

    /// Postings of one (attribute, value); `None` if the value is not cataloged.
    pub fn postings(&self, attribute: &Attribute, value: &Value) -> Result<Option<Numbers>> {
        let Some((cat, num)) = self.forward(attribute)? else { return Ok(None) };
        let Some(item) = cat.lookup(value) else { return Ok(None) };
        num.load(item.offset, item.length).map(Some).map_err(|e| e.on_attribute(attribute.name()))
    }

    pub fn reverse(&self, attribute: &Attribute) -> Result<Arc<Reverse>> {
        let (Some(t), Some(dir)) = (self.attrs.get(attribute), self.dir.as_deref()) else {
            return Ok(Arc::new(Reverse::default()));
        };
        cached(&t.reverse, "reverse", || Ok(Arc::new(Reverse::open(attr_file(dir, attribute, EXT_REVERSE))?)))
            .map_err(|e| e.on_attribute(attribute.name()))
    }

    /// Every (attribute, value) the message is indexed under.
    pub fn links_of(&self, msg: u64) -> Result<BTreeSet<(Attribute, Value)>> {
        let mut out = BTreeSet::new();
        for attribute in self.attrs.keys() {
            if let Some(values) = self.reverse(attribute)?.values_of(msg) {
                out.extend(values.iter().map(|v| (attribute.clone(), v.clone())));
            }
        }
        Ok(out)
    }

    /// All known message ids; bounds `not` and custom predicates.
    pub fn universe(&self) -> Result<Numbers> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(Numbers::empty());
        };
        cached(&self.universe, "universe", || {
            let f = NumbersFile::open(dir.join(UNIVERSE_FILE))?;
            let len = u32::try_from(f.len()).map_err(|_| BixError::decode("universe", "file too large"))?;
            f.load(0, len)
        })
    }
}

impl std::fmt::Debug for Baseline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Baseline")
            .field("generation", &self.generation)
            .field("dir", &self.dir)
            .field("attributes", &self.attrs.keys().collect::<Vec<_>>())
            .finish()
    }
}
