//! Query predicates.
//!
//! A predicate is a plain tree built per query; it refers to attributes by
//! value and is bound to a [`Baseline`](crate::baseline::Baseline) only when
//! evaluated (see [`eval`]). The textual form is an s-expression:
//!
//! ```text
//! (and (eq author "alice") (not (prefix text "spam")) (bundled (eq bout 7)))
//! ```

pub mod eval;
pub mod parser;

use crate::attribute::{Attribute, Value};
use std::fmt;

pub use eval::{Candidates, EvalOptions, Evaluator, Query, QueryState};
pub use parser::parse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Eq(Value),
    /// Half-open: `lower <= v < upper`; `None` is unbounded.
    Range { lower: Option<Value>, upper: Option<Value> },
    /// String values starting with the prefix.
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub attribute: Attribute,
    pub matcher: Matcher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Atom(Atom),
    /// Sorted intersection; no children means every known message.
    And(Vec<Predicate>),
    /// Sorted union; no children means nothing.
    Or(Vec<Predicate>),
    /// Known messages not matching the child.
    Not(Box<Predicate>),
    /// First message of each bundle among those matching all children.
    /// No children means nothing.
    Bundled(Vec<Predicate>),
    /// Resolved through the dispatcher; children are evaluated to values first.
    Custom { name: String, args: Vec<Predicate> },
    Literal(Value),
}

impl Predicate {
    /// Forms on the longest path from the root; atoms and literals count one.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1usize)];
        while let Some((p, d)) = stack.pop() {
            deepest = deepest.max(d);
            match p {
                Predicate::And(c) | Predicate::Or(c) | Predicate::Bundled(c) => stack.extend(c.iter().map(|c| (c, d + 1))),
                Predicate::Custom { args, .. } => stack.extend(args.iter().map(|c| (c, d + 1))),
                Predicate::Not(c) => stack.push((c, d + 1)),
                Predicate::Atom(_) | Predicate::Literal(_) => {}
            }
        }
        deepest
    }

    pub fn eq(attribute: Attribute, value: impl Into<Value>) -> Self {
        Predicate::Atom(Atom { attribute, matcher: Matcher::Eq(value.into()) })
    }

    pub fn prefix(attribute: Attribute, prefix: &str) -> Self {
        Predicate::Atom(Atom { attribute, matcher: Matcher::Prefix(prefix.to_string()) })
    }

    pub fn range(attribute: Attribute, lower: Option<Value>, upper: Option<Value>) -> Self {
        Predicate::Atom(Atom { attribute, matcher: Matcher::Range { lower, upper } })
    }

    pub fn and(children: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And(children.into_iter().collect())
    }

    pub fn or(children: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or(children.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Predicate) -> Self {
        Predicate::Not(Box::new(child))
    }

    pub fn bundled(children: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Bundled(children.into_iter().collect())
    }

    pub fn custom(name: &str, args: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Custom { name: name.to_string(), args: args.into_iter().collect() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Predicate::Literal(value.into())
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, head: &str, items: &[Predicate]) -> fmt::Result {
    write!(f, "({head}")?;
    for p in items {
        write!(f, " {p}")?;
    }
    f.write_str(")")
}

fn write_bound(f: &mut fmt::Formatter<'_>, v: &Option<Value>) -> fmt::Result {
    match v {
        Some(v) => write!(f, " {v}"),
        None => f.write_str(" _"),
    }
}

/// Prints the s-expression form accepted by [`parse`].
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Atom(Atom { attribute, matcher }) => match matcher {
                Matcher::Eq(v) => write!(f, "(eq {attribute} {v})"),
                Matcher::Prefix(p) => write!(f, "(prefix {attribute} {p:?})"),
                Matcher::Range { lower, upper } => {
                    write!(f, "(range {attribute}")?;
                    write_bound(f, lower)?;
                    write_bound(f, upper)?;
                    f.write_str(")")
                }
            },
            Predicate::And(c) => write_list(f, "and", c),
            Predicate::Or(c) => write_list(f, "or", c),
            Predicate::Not(c) => write!(f, "(not {c})"),
            Predicate::Bundled(c) => write_list(f, "bundled", c),
            Predicate::Custom { name, args } => write_list(f, name, args),
            Predicate::Literal(v) => write!(f, "{v}"),
        }
    }
}
