//! Evaluation of predicates against one baseline.
//!
//! Every node yields an ascending stream of message ids ([`Candidates`]):
//! atoms read postings directly, `and` is a leapfrog intersection, `or` a
//! k-way union, `not` a difference against the universe. Custom predicates
//! and literals are tested per id via the dispatcher.

use super::{Atom, Matcher, Predicate};
use crate::attribute::{Attribute, Value};
use crate::baseline::Baseline;
use crate::config::{ErrorPolicy, IndexConfig};
use crate::consts::{MAX_QUERY_DEPTH, OP_EVALUATE_PREDICATE};
use crate::dispatch::{self, Dispatcher, NoDispatch};
use crate::errors::{BixError, Result};
use crate::numbers::NumbersIter;
use std::collections::{HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    pub error_policy: ErrorPolicy,
    pub custom_default: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self { error_policy: ErrorPolicy::Fail, custom_default: false }
    }
}

impl From<&IndexConfig> for EvalOptions {
    fn from(c: &IndexConfig) -> Self {
        Self { error_policy: c.error_policy, custom_default: c.custom_default }
    }
}

/// A predicate evaluator bound to one baseline. Cheap to clone.
#[derive(Clone)]
pub struct Evaluator {
    baseline: Arc<Baseline>,
    dispatcher: Arc<dyn Dispatcher>,
    options: EvalOptions,
}

impl Evaluator {
    pub fn new(baseline: Arc<Baseline>, dispatcher: Arc<dyn Dispatcher>, options: EvalOptions) -> Self {
        Self { baseline, dispatcher, options }
    }

    /// No dispatcher: custom predicates always resolve to the default.
    pub fn standalone(baseline: Arc<Baseline>) -> Self {
        Self::new(baseline, Arc::new(NoDispatch), EvalOptions::default())
    }

    pub fn baseline(&self) -> &Arc<Baseline> { &self.baseline }

    fn universe(&self) -> Result<Candidates> {
        Ok(Candidates::Postings { iter: self.baseline.universe()?.iter(), attribute: None })
    }

    /// Ascending stream of matching ids.
    pub fn candidates(&self, pred: &Predicate) -> Result<Candidates> {
        match pred {
            Predicate::Atom(atom) => self.atom_candidates(atom),
            Predicate::And(children) if children.is_empty() => self.universe(),
            Predicate::And(children) => {
                let mut streams = children.iter().map(|c| self.candidates(c)).collect::<Result<Vec<_>>>()?;
                if streams.len() == 1 {
                    return Ok(streams.remove(0));
                }
                Ok(Candidates::Intersect(Intersect::new(streams)))
            }
            Predicate::Or(children) => {
                let skip = self.options.error_policy == ErrorPolicy::SkipInUnion;
                let mut streams = Vec::with_capacity(children.len());
                for c in children {
                    match self.candidates(c) {
                        Ok(s) => streams.push(s),
                        Err(e) if skip => tracing::warn!(error = %e, "skipping failed branch of or"),
                        Err(e) => return Err(e),
                    }
                }
                Ok(Candidates::Union(Union::new(streams, skip)))
            }
            Predicate::Not(child) => Ok(Candidates::Difference(Box::new(Difference {
                left: self.universe()?,
                right: self.candidates(child)?,
                head: None,
                right_done: false,
            }))),
            Predicate::Bundled(children) => self.bundled_candidates(children),
            Predicate::Custom { .. } => Ok(Candidates::Filter(Box::new(Filter {
                source: self.universe()?,
                predicate: pred.clone(),
                eval: self.clone(),
                position: 0,
            }))),
            Predicate::Literal(v) if v.is_truthy() => self.universe(),
            Predicate::Literal(_) => Ok(Candidates::Empty),
        }
    }

    fn atom_candidates(&self, atom: &Atom) -> Result<Candidates> {
        let attribute = &atom.attribute;
        if let Matcher::Eq(v) = &atom.matcher {
            return Ok(match self.baseline.postings(attribute, v)? {
                Some(n) => Candidates::Postings { iter: n.iter(), attribute: Some(attribute.clone()) },
                None => Candidates::Empty,
            });
        }
        let (Some(cat), Some(num)) = (self.baseline.catalog(attribute)?, self.baseline.numbers_file(attribute)?) else {
            return Ok(Candidates::Empty);
        };
        let items = match &atom.matcher {
            Matcher::Prefix(p) => cat.prefix(p),
            Matcher::Range { lower, upper } => cat.range(
                lower.as_ref().map_or(Bound::Unbounded, Bound::Included),
                upper.as_ref().map_or(Bound::Unbounded, Bound::Excluded),
            ),
            Matcher::Eq(_) => &[],
        };
        let mut streams = Vec::with_capacity(items.len());
        for item in items {
            let n = num.load(item.offset, item.length).map_err(|e| e.on_attribute(attribute.name()))?;
            streams.push(Candidates::Postings { iter: n.iter(), attribute: Some(attribute.clone()) });
        }
        Ok(Candidates::Union(Union::new(streams, false)))
    }

    fn bundled_candidates(&self, children: &[Predicate]) -> Result<Candidates> {
        if children.is_empty() {
            return Ok(Candidates::Empty);
        }
        let source = self.candidates(&Predicate::And(children.to_vec()))?;
        Ok(Candidates::Bundled(Box::new(Bundled {
            source,
            markers: self.bundle_markers()?,
            seen: HashSet::new(),
        })))
    }

    /// message -> index of its bundle marker in the catalog.
    fn bundle_markers(&self) -> Result<HashMap<u64, usize>> {
        let attribute = Attribute::bundle();
        let mut out = HashMap::new();
        let (Some(cat), Some(num)) = (self.baseline.catalog(&attribute)?, self.baseline.numbers_file(&attribute)?) else {
            return Ok(out);
        };
        for (i, item) in cat.iter().enumerate() {
            let n = num.load(item.offset, item.length).map_err(|e| e.on_attribute(attribute.name()))?;
            for id in n.iter() {
                let id = id.map_err(|e| e.on_attribute(attribute.name()))?;
                // a message carries one marker; keep the first if the writer was given two
                out.entry(id).or_insert(i);
            }
        }
        Ok(out)
    }

    pub fn matches(&self, pred: &Predicate, id: u64) -> Result<bool> {
        match pred {
            Predicate::Atom(atom) => self.atom_matches(atom, id),
            Predicate::And(children) if children.is_empty() => self.baseline.universe()?.contains(id),
            Predicate::And(children) => {
                for c in children {
                    if !self.matches(c, id)? { return Ok(false); }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                let skip = self.options.error_policy == ErrorPolicy::SkipInUnion;
                for c in children {
                    match self.matches(c, id) {
                        Ok(true) => return Ok(true),
                        Ok(false) => {}
                        Err(e) if skip => tracing::warn!(error = %e, "skipping failed branch of or"),
                        Err(e) => return Err(e),
                    }
                }
                Ok(false)
            }
            Predicate::Not(child) => Ok(self.baseline.universe()?.contains(id)? && !self.matches(child, id)?),
            Predicate::Bundled(_) => seek(self.candidates(pred)?, id),
            // same position a scan of the universe would hand the handler
            Predicate::Custom { .. } => match self.scan_position(id)? {
                Some(position) => Ok(self.evaluate(pred, id, position)?.is_truthy()),
                None => Ok(false),
            },
            Predicate::Literal(v) => Ok(v.is_truthy() && self.baseline.universe()?.contains(id)?),
        }
    }

    /// Index of `id` in the universe; `None` when it is not a known message.
    fn scan_position(&self, id: u64) -> Result<Option<u64>> {
        let mut position = 0u64;
        for n in self.baseline.universe()?.iter() {
            let n = n?;
            if n >= id {
                return Ok((n == id).then_some(position));
            }
            position += 1;
        }
        Ok(None)
    }

    fn atom_matches(&self, atom: &Atom, id: u64) -> Result<bool> {
        match &atom.matcher {
            Matcher::Eq(v) => match self.baseline.postings(&atom.attribute, v)? {
                Some(n) => n.contains(id).map_err(|e| e.on_attribute(atom.attribute.name())),
                None => Ok(false),
            },
            _ => seek(self.atom_candidates(atom)?, id),
        }
    }

    /// Value of a node for one message at one position of the scan.
    pub fn evaluate(&self, pred: &Predicate, id: u64, position: u64) -> Result<Value> {
        match pred {
            Predicate::Literal(v) => Ok(v.clone()),
            Predicate::Custom { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.evaluate(a, id, position)?);
                }
                let result = dispatch::make(&self.dispatcher, OP_EVALUATE_PREDICATE)
                    .arg(id as i64)
                    .arg(position as i64)
                    .arg(name.as_str())
                    .args(values)
                    .as_default(self.options.custom_default)
                    .exec()
                    .unwrap_or(Value::Bool(self.options.custom_default));
                tracing::debug!(predicate = %name, message = id, result = %result, "custom predicate evaluated");
                Ok(result)
            }
            _ => Ok(Value::Bool(self.matches(pred, id)?)),
        }
    }
}

fn seek(stream: Candidates, id: u64) -> Result<bool> {
    for n in stream {
        let n = n?;
        if n >= id { return Ok(n == id); }
    }
    Ok(false)
}

/// Lazy ascending id stream of one predicate node.
pub enum Candidates {
    Empty,
    Postings { iter: NumbersIter, attribute: Option<Attribute> },
    Union(Union),
    Intersect(Intersect),
    Difference(Box<Difference>),
    Bundled(Box<Bundled>),
    Filter(Box<Filter>),
}

impl Iterator for Candidates {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Candidates::Empty => None,
            Candidates::Postings { iter, attribute } => match iter.next()? {
                Ok(v) => Some(Ok(v)),
                Err(e) => Some(Err(match attribute {
                    Some(a) => e.on_attribute(a.name()),
                    None => e,
                })),
            },
            Candidates::Union(u) => u.next(),
            Candidates::Intersect(i) => i.next(),
            Candidates::Difference(d) => d.next(),
            Candidates::Bundled(b) => b.next(),
            Candidates::Filter(f) => f.next(),
        }
    }
}

/// K-way merge; duplicates across children are emitted once.
pub struct Union {
    children: Vec<Candidates>,
    heads: Vec<Option<u64>>,
    primed: bool,
    skip_errors: bool,
}

impl Union {
    fn new(children: Vec<Candidates>, skip_errors: bool) -> Self {
        let heads = vec![None; children.len()];
        Self { children, heads, primed: false, skip_errors }
    }

    fn pull(&mut self, i: usize) -> Result<()> {
        self.heads[i] = match self.children[i].next() {
            None => None,
            Some(Ok(v)) => Some(v),
            Some(Err(e)) if self.skip_errors => {
                tracing::warn!(error = %e, "dropping failed branch of or");
                self.children[i] = Candidates::Empty;
                None
            }
            Some(Err(e)) => return Err(e),
        };
        Ok(())
    }

    fn next(&mut self) -> Option<Result<u64>> {
        if !self.primed {
            self.primed = true;
            for i in 0..self.children.len() {
                if let Err(e) = self.pull(i) { return Some(Err(e)); }
            }
        }
        let min = self.heads.iter().flatten().min().copied()?;
        for i in 0..self.children.len() {
            if self.heads[i] == Some(min) {
                if let Err(e) = self.pull(i) { return Some(Err(e)); }
            }
        }
        Some(Ok(min))
    }
}

/// Leapfrog intersection: the first child proposes, the others catch up.
pub struct Intersect {
    children: Vec<Candidates>,
    heads: Vec<Option<u64>>,
    done: bool,
}

impl Intersect {
    fn new(children: Vec<Candidates>) -> Self {
        let heads = vec![None; children.len()];
        Self { children, heads, done: false }
    }

    fn finish(&mut self, err: Option<BixError>) -> Option<Result<u64>> {
        self.done = true;
        err.map(Err)
    }

    fn next(&mut self) -> Option<Result<u64>> {
        if self.done { return None; }
        let mut target = match self.children[0].next() {
            None => return self.finish(None),
            Some(Err(e)) => return self.finish(Some(e)),
            Some(Ok(v)) => v,
        };
        'outer: loop {
            for i in 1..self.children.len() {
                let h = loop {
                    if let Some(h) = self.heads[i].filter(|&h| h >= target) { break h; }
                    match self.children[i].next() {
                        None => return self.finish(None),
                        Some(Err(e)) => return self.finish(Some(e)),
                        Some(Ok(v)) => self.heads[i] = Some(v),
                    }
                };
                if h > target {
                    loop {
                        match self.children[0].next() {
                            None => return self.finish(None),
                            Some(Err(e)) => return self.finish(Some(e)),
                            Some(Ok(v)) if v >= h => { target = v; continue 'outer; }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
            return Some(Ok(target));
        }
    }
}

pub struct Bundled {
    source: Candidates,
    markers: HashMap<u64, usize>,
    seen: HashSet<usize>,
}

impl Bundled {
    fn next(&mut self) -> Option<Result<u64>> {
        loop {
            let id = match self.source.next()? {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };
            if let Some(&m) = self.markers.get(&id) {
                if self.seen.insert(m) { return Some(Ok(id)); }
            }
        }
    }
}

/// Members of `left` absent from `right`.
pub struct Difference {
    left: Candidates,
    right: Candidates,
    head: Option<u64>,
    right_done: bool,
}

impl Difference {
    fn next(&mut self) -> Option<Result<u64>> {
        loop {
            let v = match self.left.next()? {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            while !self.right_done && self.head.map_or(true, |h| h < v) {
                match self.right.next() {
                    Some(Ok(h)) => self.head = Some(h),
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.right_done = true,
                }
            }
            if self.head != Some(v) {
                return Some(Ok(v));
            }
        }
    }
}

/// Universe filtered through a custom predicate; counts scan positions.
pub struct Filter {
    source: Candidates,
    predicate: Predicate,
    eval: Evaluator,
    position: u64,
}

impl Filter {
    fn next(&mut self) -> Option<Result<u64>> {
        loop {
            let id = match self.source.next()? {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };
            let position = self.position;
            self.position += 1;
            match self.eval.evaluate(&self.predicate, id, position) {
                Ok(v) if v.is_truthy() => return Some(Ok(id)),
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Parsed,
    Bound,
    Evaluating,
    Exhausted,
}

/// One evaluation of a predicate; an iterator of ascending ids.
///
/// The baseline is pinned for the whole run. After exhaustion (or the first
/// error) it yields nothing until [`Query::restart`].
pub struct Query {
    predicate: Predicate,
    evaluator: Option<Evaluator>,
    stream: Option<Candidates>,
    state: QueryState,
}

impl Query {
    pub fn new(predicate: Predicate) -> Self {
        Self { predicate, evaluator: None, stream: None, state: QueryState::Parsed }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self::new(super::parse(text)?))
    }

    pub fn bind(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = Some(evaluator);
        self.stream = None;
        self.state = QueryState::Bound;
        self
    }

    /// Start over against the same baseline.
    pub fn restart(&mut self) {
        if self.evaluator.is_some() {
            self.stream = None;
            self.state = QueryState::Bound;
        }
    }

    pub fn state(&self) -> QueryState { self.state }

    pub fn predicate(&self) -> &Predicate { &self.predicate }

    pub fn baseline(&self) -> Option<&Arc<Baseline>> {
        self.evaluator.as_ref().map(|e| e.baseline())
    }
}

impl Iterator for Query {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            QueryState::Parsed => {
                self.state = QueryState::Exhausted;
                Some(Err(BixError::InvalidInput("query is not bound to a baseline".into())))
            }
            QueryState::Exhausted => None,
            QueryState::Bound | QueryState::Evaluating => {
                if self.stream.is_none() {
                    let evaluator = self.evaluator.as_ref()?;
                    // built trees skip the parser's nesting check
                    if self.predicate.depth() > MAX_QUERY_DEPTH {
                        self.state = QueryState::Exhausted;
                        return Some(Err(BixError::InvalidInput(format!("predicate nests deeper than {MAX_QUERY_DEPTH}"))));
                    }
                    match evaluator.candidates(&self.predicate) {
                        Ok(s) => self.stream = Some(s),
                        Err(e) => {
                            self.state = QueryState::Exhausted;
                            return Some(Err(e));
                        }
                    }
                    self.state = QueryState::Evaluating;
                }
                let item = self.stream.as_mut()?.next();
                match &item {
                    None | Some(Err(_)) => {
                        self.state = QueryState::Exhausted;
                        self.stream = None;
                    }
                    Some(Ok(_)) => {}
                }
                item
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Registry;
    use crate::manifest::Manifest;
    use crate::writer::{build_generation, Batch};
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn baseline_of(dir: &Path, batch: &Batch) -> Arc<Baseline> {
        let built = build_generation(dir, &Baseline::empty(), 1, batch, false).unwrap();
        let mut m = Manifest::default();
        let rec = m.publish(built.number, built.attributes, built.messages).clone();
        Arc::new(Baseline::open(dir, &rec).unwrap())
    }

    fn sample(dir: &Path) -> Arc<Baseline> {
        let mut b = Batch::new();
        for m in [1, 2, 5] { b.add(Attribute::author(), "alice", m); }
        for m in [3, 5] { b.add(Attribute::author(), "bob", m); }
        b.add(Attribute::text(), "spam offer", 2);
        for m in [1, 2, 3] { b.add(Attribute::bout(), 7, m); }
        b.add(Attribute::bout(), 8, 5);
        b.bundle(1, "m1").bundle(2, "m1").bundle(3, "m2").bundle(5, "m2");
        baseline_of(dir, &b)
    }

    fn run(ev: &Evaluator, p: &Predicate) -> Vec<u64> {
        ev.candidates(p).unwrap().collect::<Result<Vec<_>>>().unwrap()
    }

    fn alice() -> Predicate { Predicate::eq(Attribute::author(), "alice") }
    fn bob() -> Predicate { Predicate::eq(Attribute::author(), "bob") }

    #[test]
    fn boolean_combinators() {
        let dir = tempdir().unwrap();
        let ev = Evaluator::standalone(sample(dir.path()));
        assert_eq!(run(&ev, &alice()), vec![1, 2, 5]);
        assert_eq!(run(&ev, &Predicate::and([alice(), bob()])), vec![5]);
        assert_eq!(run(&ev, &Predicate::or([alice(), bob()])), vec![1, 2, 3, 5]);
        assert_eq!(run(&ev, &Predicate::not(alice())), vec![3]);
        assert_eq!(run(&ev, &Predicate::and([])), vec![1, 2, 3, 5]);
        assert!(run(&ev, &Predicate::or([])).is_empty());
        assert!(run(&ev, &Predicate::eq(Attribute::author(), "carol")).is_empty());
        assert!(run(&ev, &Predicate::eq(Attribute::new("unknown").unwrap(), "x")).is_empty());
    }

    #[test]
    fn prefix_and_half_open_range() {
        let dir = tempdir().unwrap();
        let ev = Evaluator::standalone(sample(dir.path()));
        assert_eq!(run(&ev, &Predicate::prefix(Attribute::text(), "spam")), vec![2]);
        assert!(run(&ev, &Predicate::prefix(Attribute::text(), "ham")).is_empty());
        let r = |lo: Option<Value>, hi: Option<Value>| Predicate::range(Attribute::author(), lo, hi);
        assert_eq!(run(&ev, &r(Some("a".into()), Some("bob".into()))), vec![1, 2, 5]);
        assert_eq!(run(&ev, &r(Some("a".into()), None)), vec![1, 2, 3, 5]);
        assert_eq!(run(&ev, &Predicate::range(Attribute::bout(), Some(Value::Num(8)), None)), vec![5]);
    }

    #[test]
    fn bundled_keeps_first_message_per_bundle() {
        let dir = tempdir().unwrap();
        let ev = Evaluator::standalone(sample(dir.path()));
        let b7 = Predicate::eq(Attribute::bout(), 7);
        assert_eq!(run(&ev, &Predicate::bundled([b7.clone()])), vec![1, 3]);
        assert_eq!(run(&ev, &Predicate::bundled([alice()])), vec![1, 5]);
        assert!(run(&ev, &Predicate::bundled([])).is_empty());
        assert!(ev.matches(&Predicate::bundled([b7.clone()]), 3).unwrap());
        assert!(!ev.matches(&Predicate::bundled([b7]), 2).unwrap());
    }

    #[test]
    fn custom_predicates_go_through_the_dispatcher() {
        let dir = tempdir().unwrap();
        let base = sample(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = Registry::new();
        let log = seen.clone();
        reg.register_predicate("urn:test:even", move |msg, pos, _| {
            log.lock().unwrap().push((msg, pos));
            Value::Bool(msg % 2 == 0)
        });
        reg.register_predicate("urn:test:above", |msg, _, vals| match vals.first() {
            Some(Value::Num(n)) => Value::Bool(msg as i64 > *n),
            _ => Value::Bool(false),
        });
        let ev = Evaluator::new(base.clone(), Arc::new(reg), EvalOptions::default());
        assert_eq!(run(&ev, &Predicate::custom("urn:test:even", [])), vec![2]);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (2, 1), (3, 2), (5, 3)]);
        seen.lock().unwrap().clear();
        assert!(!ev.matches(&Predicate::custom("urn:test:even", []), 5).unwrap());
        assert!(ev.matches(&Predicate::custom("urn:test:even", []), 2).unwrap());
        // 4 is not a known message, so the handler is never asked
        assert!(!ev.matches(&Predicate::custom("urn:test:even", []), 4).unwrap());
        assert_eq!(*seen.lock().unwrap(), vec![(5, 3), (2, 1)]);
        assert_eq!(run(&ev, &Predicate::custom("urn:test:above", [Predicate::literal(2)])), vec![3, 5]);
        assert_eq!(run(&ev, &Predicate::and([alice(), Predicate::custom("urn:test:above", [Predicate::literal(1)])])), vec![2, 5]);

        // nobody handles it: the configured default decides
        assert!(run(&ev, &Predicate::custom("urn:test:nobody", [])).is_empty());
        let lenient = Evaluator::new(base, Arc::new(NoDispatch), EvalOptions { custom_default: true, ..Default::default() });
        assert_eq!(run(&lenient, &Predicate::custom("urn:test:nobody", [])), vec![1, 2, 3, 5]);
        assert_eq!(lenient.evaluate(&Predicate::custom("x", []), 1, 0).unwrap(), Value::Bool(true));
    }

    #[test]
    fn literals_and_point_matches() {
        let dir = tempdir().unwrap();
        let ev = Evaluator::standalone(sample(dir.path()));
        assert_eq!(run(&ev, &Predicate::literal(true)), vec![1, 2, 3, 5]);
        assert!(run(&ev, &Predicate::literal(0)).is_empty());
        assert!(ev.matches(&Predicate::and([alice(), bob()]), 5).unwrap());
        assert!(!ev.matches(&Predicate::not(bob()), 5).unwrap());
        assert!(ev.matches(&Predicate::or([alice(), bob()]), 3).unwrap());
        assert!(!ev.matches(&Predicate::literal(true), 4).unwrap());
        assert_eq!(ev.evaluate(&alice(), 2, 0).unwrap(), Value::Bool(true));
    }

    #[test]
    fn query_lifecycle() {
        let dir = tempdir().unwrap();
        let ev = Evaluator::standalone(sample(dir.path()));
        let q = Query::parse(r#"(or (eq author "bob") (eq bout 8))"#).unwrap();
        assert_eq!(q.state(), QueryState::Parsed);
        let mut q = q.bind(ev.clone());
        assert_eq!(q.state(), QueryState::Bound);
        assert_eq!(q.next().unwrap().unwrap(), 3);
        assert_eq!(q.state(), QueryState::Evaluating);
        assert_eq!(q.next().unwrap().unwrap(), 5);
        assert!(q.next().is_none());
        assert_eq!(q.state(), QueryState::Exhausted);
        assert!(q.next().is_none());
        q.restart();
        assert_eq!(q.by_ref().collect::<Result<Vec<_>>>().unwrap(), vec![3, 5]);

        let mut unbound = Query::new(alice());
        assert!(unbound.next().unwrap().is_err());
        assert!(unbound.next().is_none());

        let mut deep = alice();
        for _ in 0..MAX_QUERY_DEPTH {
            deep = Predicate::not(deep);
        }
        let mut q = Query::new(deep).bind(ev);
        assert!(matches!(q.next(), Some(Err(BixError::InvalidInput(_)))));
        assert_eq!(q.state(), QueryState::Exhausted);
    }

    fn id_set() -> impl Strategy<Value = std::collections::BTreeSet<u64>> {
        proptest::collection::btree_set(0u64..300, 0..60)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn and_or_not_match_set_algebra(a in id_set(), b in id_set(), c in id_set()) {
            let dir = tempdir().unwrap();
            let mut batch = Batch::new();
            for (v, ids) in [("a", &a), ("b", &b), ("c", &c)] {
                for &m in ids.iter() { batch.add(Attribute::author(), v, m); }
            }
            let ev = Evaluator::standalone(baseline_of(dir.path(), &batch));
            let p = |v: &str| Predicate::eq(Attribute::author(), v);

            let and: Vec<u64> = a.iter().filter(|m| b.contains(m) && c.contains(m)).copied().collect();
            prop_assert_eq!(run(&ev, &Predicate::and([p("a"), p("b"), p("c")])), and);
            let or: Vec<u64> = a.union(&b).copied().collect::<std::collections::BTreeSet<_>>().union(&c).copied().collect();
            prop_assert_eq!(run(&ev, &Predicate::or([p("a"), p("b"), p("c")])), or.clone());
            let not: Vec<u64> = or.iter().filter(|m| !a.contains(m)).copied().collect();
            prop_assert_eq!(run(&ev, &Predicate::not(p("a"))), not);
        }
    }
}
