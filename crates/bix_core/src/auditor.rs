//! Read-only consistency check of one baseline.
//!
//! Per attribute (in name order) the catalog is walked forward, every posting
//! checked against the reverse links, then the reverse links are walked back
//! against the postings. Nothing aborts the run: unreadable files become
//! `Corrupt` problems and scanning moves on.

use crate::attribute::{Attribute, Value};
use crate::baseline::Baseline;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    /// A posting lists the message but its reverse links do not name the value.
    MissingReverse,
    /// A reverse link names the value but the posting lacks the message.
    MissingPosting,
    /// A catalog, numbers or reverse file cannot be decoded.
    Corrupt,
    /// The universe disagrees with the set of linked messages.
    Universe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub kind: ProblemKind,
    /// `None` for the universe.
    pub attribute: Option<Attribute>,
    pub value: Option<Value>,
    pub message: Option<u64>,
    pub detail: String,
}

impl Problem {
    fn new(kind: ProblemKind, attribute: &Attribute) -> Self {
        Self { kind, attribute: Some(attribute.clone()), value: None, message: None, detail: String::new() }
    }

    fn value(mut self, v: &Value) -> Self {
        self.value = Some(v.clone());
        self
    }

    fn message(mut self, m: u64) -> Self {
        self.message = Some(m);
        self
    }

    fn detail(mut self, d: impl ToString) -> Self {
        self.detail = d.to_string();
        self
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        match &self.attribute {
            Some(a) => write!(f, " {a}")?,
            None => f.write_str(" universe")?,
        }
        if let Some(v) = &self.value { write!(f, "={v}")?; }
        if let Some(m) = self.message { write!(f, " message {m}")?; }
        if !self.detail.is_empty() { write!(f, ": {}", self.detail)?; }
        Ok(())
    }
}

/// Audit every attribute, then the universe.
pub fn audit(baseline: &Baseline) -> Vec<Problem> {
    let started = Instant::now();
    let mut problems = Vec::new();
    for attribute in baseline.attributes() {
        audit_attribute(baseline, attribute, &mut |p| problems.push(p));
    }
    audit_universe(baseline, &mut |p| problems.push(p));
    tracing::info!(
        generation = baseline.generation(),
        problems = problems.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "audit finished"
    );
    problems
}

/// Audit one attribute, handing each problem to `sink` as it is found.
pub fn audit_attribute(baseline: &Baseline, attribute: &Attribute, sink: &mut impl FnMut(Problem)) {
    let started = Instant::now();
    let mut found = 0usize;
    let mut report = |p: Problem| {
        tracing::warn!(problem = %p, "audit problem");
        found += 1;
        sink(p);
    };

    let reverse = match baseline.reverse(attribute) {
        Ok(r) => Some(r),
        Err(e) => {
            report(Problem::new(ProblemKind::Corrupt, attribute).detail(e));
            None
        }
    };
    let mut forward_failed = false;
    let forward = match (baseline.catalog(attribute), baseline.numbers_file(attribute)) {
        (Ok(Some(c)), Ok(Some(n))) => Some((c, n)),
        (Ok(_), Ok(_)) => None,
        (Err(e), _) | (_, Err(e)) => {
            report(Problem::new(ProblemKind::Corrupt, attribute).detail(e));
            forward_failed = true;
            None
        }
    };

    // forward: catalog -> postings -> reverse
    let mut postings: HashMap<Value, Vec<u64>> = HashMap::new();
    let mut unreadable: HashSet<Value> = HashSet::new();
    let values = forward.as_ref().map_or(0, |(c, _)| c.len());
    if let Some((catalog, numbers)) = &forward {
        for item in catalog.iter() {
            let ids = numbers.load(item.offset, item.length).and_then(|n| n.to_vec());
            let ids = match ids {
                Ok(ids) => ids,
                Err(e) => {
                    report(Problem::new(ProblemKind::Corrupt, attribute).value(&item.value).detail(e));
                    unreadable.insert(item.value.clone());
                    continue;
                }
            };
            if let Some(reverse) = &reverse {
                for &m in &ids {
                    if !reverse.values_of(m).is_some_and(|vs| vs.contains(&item.value)) {
                        report(Problem::new(ProblemKind::MissingReverse, attribute).value(&item.value).message(m));
                    }
                }
            }
            postings.insert(item.value.clone(), ids);
        }
    }

    // backward: reverse -> postings
    if let (Some(reverse), false) = (&reverse, forward_failed) {
        for (m, vs) in reverse.iter() {
            for v in vs.iter().filter(|v| !unreadable.contains(*v)) {
                let listed = postings.get(v).is_some_and(|ids| ids.binary_search(&m).is_ok());
                if !listed {
                    report(Problem::new(ProblemKind::MissingPosting, attribute).value(v).message(m));
                }
            }
        }
    }

    tracing::info!(
        attribute = %attribute,
        values,
        problems = found,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "attribute audited"
    );
}

/// Universe against the union of all readable reverse tables.
fn audit_universe(baseline: &Baseline, sink: &mut impl FnMut(Problem)) {
    let mut report = |p: Problem| {
        tracing::warn!(problem = %p, "audit problem");
        sink(p);
    };
    let universe = match baseline.universe().and_then(|u| u.to_vec()) {
        Ok(u) => u,
        Err(e) => {
            report(Problem { kind: ProblemKind::Corrupt, attribute: None, value: None, message: None, detail: e.to_string() });
            return;
        }
    };
    let mut linked = BTreeSet::new();
    for attribute in baseline.attributes() {
        // an unreadable table was already reported and would only add noise here
        let Ok(reverse) = baseline.reverse(attribute) else { return };
        linked.extend(reverse.messages());
    }
    let universe: BTreeSet<u64> = universe.into_iter().collect();
    for &m in linked.difference(&universe) {
        report(Problem { kind: ProblemKind::Universe, attribute: None, value: None, message: Some(m), detail: "linked but not in universe".into() });
    }
    for &m in universe.difference(&linked) {
        report(Problem { kind: ProblemKind::Universe, attribute: None, value: None, message: Some(m), detail: "in universe but not linked".into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::attr_file;
    use crate::consts::EXT_REVERSE;
    use crate::manifest::Manifest;
    use crate::reverse::Reverse;
    use crate::writer::{build_generation, Batch};
    use std::path::Path;
    use tempfile::tempdir;

    fn baseline_of(dir: &Path, batch: &Batch) -> Baseline {
        let built = build_generation(dir, &Baseline::empty(), 1, batch, false).unwrap();
        let mut m = Manifest::default();
        let rec = m.publish(built.number, built.attributes, built.messages).clone();
        Baseline::open(dir, &rec).unwrap()
    }

    fn batch() -> Batch {
        let mut b = Batch::new();
        b.add(Attribute::author(), "alice", 1)
            .add(Attribute::author(), "alice", 2)
            .add(Attribute::author(), "bob", 3)
            .add(Attribute::bout(), 9, 1)
            .add(Attribute::bout(), 9, 2);
        b
    }

    #[test]
    fn fresh_generation_is_clean() {
        let dir = tempdir().unwrap();
        let base = baseline_of(dir.path(), &batch());
        assert!(audit(&base).is_empty());
    }

    #[test]
    fn tampered_reverse_links_are_reported_both_ways() {
        let dir = tempdir().unwrap();
        let gen_dir = dir.path().join("gen-00000001");
        baseline_of(dir.path(), &batch());

        let path = attr_file(&gen_dir, &Attribute::author(), EXT_REVERSE);
        let mut rev = Reverse::open(&path).unwrap();
        rev.remove(2, &Value::from("alice"));
        rev.add(3, Value::from("carol"));
        rev.save(&path, false).unwrap();

        let mut m = Manifest::default();
        let rec = m.publish(1, vec![Attribute::author(), Attribute::bout()], 3).clone();
        let base = Baseline::open(dir.path(), &rec).unwrap();
        let mut problems = Vec::new();
        audit_attribute(&base, &Attribute::author(), &mut |p| problems.push(p));
        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems.iter().any(|p| p.kind == ProblemKind::MissingReverse && p.message == Some(2)));
        assert!(problems.iter().any(|p| p.kind == ProblemKind::MissingPosting
            && p.message == Some(3)
            && p.value == Some(Value::from("carol"))));
        // message 2 still has no author link, but the bout link keeps it in the universe
        assert!(audit(&base).iter().all(|p| p.kind != ProblemKind::Universe));
    }

    #[test]
    fn corrupt_file_does_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let gen_dir = dir.path().join("gen-00000001");
        baseline_of(dir.path(), &batch());
        std::fs::write(attr_file(&gen_dir, &Attribute::author(), EXT_REVERSE), b"garbage").unwrap();

        let mut m = Manifest::default();
        let rec = m.publish(1, vec![Attribute::author(), Attribute::bout()], 3).clone();
        let base = Baseline::open(dir.path(), &rec).unwrap();
        let problems = audit(&base);
        assert!(problems.iter().any(|p| p.kind == ProblemKind::Corrupt
            && p.attribute == Some(Attribute::author())));
        assert!(problems.iter().all(|p| p.attribute != Some(Attribute::bout())));
    }
}
