pub mod consts;
pub mod errors;
pub mod utils;
pub mod attribute;
pub mod numbers;
pub mod catalog;
pub mod reverse;
pub mod manifest;
pub mod config;
pub mod baseline;
pub mod writer;
pub mod auditor;
pub mod dispatch;
pub mod predicate;
pub mod index;

pub use attribute::{Attribute, Value};
pub use auditor::{audit, audit_attribute, Problem, ProblemKind};
pub use baseline::Baseline;
pub use config::{ErrorPolicy, IndexConfig};
pub use dispatch::{Dispatcher, NoDispatch, Registry};
pub use errors::{BixError, Result};
pub use index::Index;
pub use numbers::{decode_sorted_u64, encode_sorted_u64, intersect_sorted, merge_sorted};
pub use predicate::{parse, EvalOptions, Evaluator, Predicate, Query, QueryState};
pub use writer::{bundle_marker, Batch, Fact, Op};
