//! Boundary to the external operation dispatcher.
//!
//! The index only treats it as a value source: an operation is invoked by
//! name with positional arguments and yields a value, or nothing when no
//! handler exists, in which case the caller's default is used.

use crate::attribute::Value;
use crate::consts::OP_EVALUATE_PREDICATE;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

pub trait Dispatcher: Send + Sync {
    /// `None` when nobody handles `op` (or, for predicates, the named predicate).
    fn invoke(&self, op: &str, args: &[Value]) -> Option<Value>;
}

/// Handles nothing; every operation resolves to its default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDispatch;

impl Dispatcher for NoDispatch {
    fn invoke(&self, _op: &str, _args: &[Value]) -> Option<Value> { None }
}

pub type Handler = Arc<dyn Fn(&[Value]) -> Option<Value> + Send + Sync>;
pub type PredicateHandler = Arc<dyn Fn(u64, u64, &[Value]) -> Value + Send + Sync>;

/// In-process dispatcher: plain operations by name, plus custom predicates
/// served through the `evaluate-predicate` operation.
#[derive(Clone, Default)]
pub struct Registry {
    ops: HashMap<String, Handler>,
    predicates: HashMap<String, PredicateHandler>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn register<F>(&mut self, op: &str, handler: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Option<Value> + Send + Sync + 'static,
    {
        self.ops.insert(op.to_string(), Arc::new(handler));
        self
    }

    /// `handler(message, position, argument values)`.
    pub fn register_predicate<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(u64, u64, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn has_predicate(&self, name: &str) -> bool { self.predicates.contains_key(name) }
}

impl Dispatcher for Registry {
    fn invoke(&self, op: &str, args: &[Value]) -> Option<Value> {
        if op == OP_EVALUATE_PREDICATE {
            // [message, position, name, values...]
            let (Value::Num(msg), Value::Num(pos), Value::Str(name)) = (args.first()?, args.get(1)?, args.get(2)?) else {
                return None;
            };
            let handler = self.predicates.get(name)?;
            return Some(handler(*msg as u64, *pos as u64, &args[3..]));
        }
        self.ops.get(op).and_then(|h| h(args))
    }
}

/// Builder for one invocation.
pub struct Operation {
    dispatcher: Arc<dyn Dispatcher>,
    name: String,
    args: Vec<Value>,
    default: Option<Value>,
}

pub fn make(dispatcher: &Arc<dyn Dispatcher>, name: &str) -> Operation {
    Operation { dispatcher: dispatcher.clone(), name: name.to_string(), args: Vec::new(), default: None }
}

impl Operation {
    pub fn arg(mut self, v: impl Into<Value>) -> Self {
        self.args.push(v.into());
        self
    }

    pub fn args(mut self, vs: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(vs);
        self
    }

    pub fn as_default(mut self, v: impl Into<Value>) -> Self {
        self.default = Some(v.into());
        self
    }

    /// Handler result, else the default.
    pub fn exec(self) -> Option<Value> {
        match self.dispatcher.invoke(&self.name, &self.args) {
            Some(v) => Some(v),
            None => {
                tracing::debug!(op = %self.name, "no handler, using default");
                self.default
            }
        }
    }

    /// Run on a separate thread; see [`Pending::wait`].
    pub fn exec_async(self) -> Pending {
        let default = self.default.clone();
        let handle = std::thread::spawn(move || self.exec());
        Pending { handle, default }
    }
}

pub struct Pending {
    handle: JoinHandle<Option<Value>>,
    default: Option<Value>,
}

impl Pending {
    /// Blocks until the handler returns; a panicking handler yields the default.
    pub fn wait(self) -> Option<Value> {
        self.handle.join().unwrap_or(self.default)
    }

    pub fn is_finished(&self) -> bool { self.handle.is_finished() }
}
