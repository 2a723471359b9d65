//! TL-002: Write-once value cells and deferred output composition.
//!
//! A [`ValueCell`] starts `Pending` and settles exactly once, either to a
//! value or to a [`CellError`]. Composition (`apply`, `try_apply`, `combine`,
//! `format`) never blocks: it registers a continuation on the source cell and
//! returns a new pending cell. Continuations run once, on the thread that
//! settles the source.
//!
//! An [`Output`] pairs a cell with the set of resource ids it reads from.
//! That set is what the dependency graph turns into edges.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Why a cell failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellFailure {
    /// The resource that produces the value failed or was skipped.
    Upstream,
    /// A composition function rejected its input.
    TypeMismatch(String),
    /// The run was cancelled before the producer executed.
    Cancelled,
}

/// A failed cell, tagged with the resource id or composition step it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellError {
    pub origin: String,
    pub failure: CellFailure,
}

impl CellError {
    pub fn upstream(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            failure: CellFailure::Upstream,
        }
    }

    pub fn cancelled(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            failure: CellFailure::Cancelled,
        }
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            CellFailure::Upstream => write!(f, "'{}' did not converge", self.origin),
            CellFailure::TypeMismatch(msg) => write!(f, "{}: {}", self.origin, msg),
            CellFailure::Cancelled => write!(f, "'{}' was cancelled", self.origin),
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Result<&T, &CellError>) + Send>;

enum CellState<T> {
    Pending(Vec<Continuation<T>>),
    Resolved(T),
    Failed(CellError),
}

/// A single deferred result.
pub struct ValueCell<T> {
    state: Mutex<CellState<T>>,
    notify: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone + Send + 'static> ValueCell<T> {
    pub fn pending() -> Self {
        Self {
            state: Mutex::new(CellState::Pending(Vec::new())),
            notify: Notify::new(),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self {
            state: Mutex::new(CellState::Resolved(value)),
            notify: Notify::new(),
        }
    }

    /// Settle the cell with a value. Returns false if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        let continuations = {
            let mut state = lock(&self.state);
            match &mut *state {
                CellState::Pending(conts) => {
                    let conts = std::mem::take(conts);
                    *state = CellState::Resolved(value.clone());
                    conts
                }
                _ => return false,
            }
        };
        for c in continuations {
            c(Ok(&value));
        }
        self.notify.notify_waiters();
        true
    }

    /// Settle the cell with an error. Returns false if it was already settled.
    pub fn fail(&self, error: CellError) -> bool {
        let continuations = {
            let mut state = lock(&self.state);
            match &mut *state {
                CellState::Pending(conts) => {
                    let conts = std::mem::take(conts);
                    *state = CellState::Failed(error.clone());
                    conts
                }
                _ => return false,
            }
        };
        for c in continuations {
            c(Err(&error));
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_pending(&self) -> bool {
        matches!(*lock(&self.state), CellState::Pending(_))
    }

    /// Current value, or `None` while pending.
    pub fn get(&self) -> Option<Result<T, CellError>> {
        match &*lock(&self.state) {
            CellState::Pending(_) => None,
            CellState::Resolved(v) => Some(Ok(v.clone())),
            CellState::Failed(e) => Some(Err(e.clone())),
        }
    }

    /// Suspend until the cell settles.
    pub async fn wait(&self) -> Result<T, CellError> {
        loop {
            let notified = self.notify.notified();
            if let Some(settled) = self.get() {
                return settled;
            }
            notified.await;
        }
    }

    /// Run `f` once the cell settles (immediately if it already has).
    pub fn on_settle<F>(&self, f: F)
    where
        F: FnOnce(Result<&T, &CellError>) + Send + 'static,
    {
        let settled = {
            let mut state = lock(&self.state);
            match &mut *state {
                CellState::Pending(conts) => {
                    conts.push(Box::new(f));
                    return;
                }
                CellState::Resolved(v) => Ok(v.clone()),
                CellState::Failed(e) => Err(e.clone()),
            }
        };
        match settled {
            Ok(v) => f(Ok(&v)),
            Err(e) => f(Err(&e)),
        }
    }
}

impl<T> fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.state) {
            CellState::Pending(_) => "pending",
            CellState::Resolved(_) => "resolved",
            CellState::Failed(_) => "failed",
        };
        f.debug_struct("ValueCell").field("state", &state).finish()
    }
}

/// A deferred value plus the resource ids it depends on.
pub struct Output<T = Value> {
    cell: Arc<ValueCell<T>>,
    deps: BTreeSet<String>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            deps: self.deps.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("cell", &self.cell)
            .field("deps", &self.deps)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Output<T> {
    /// An output that is already known and depends on nothing.
    pub fn known(value: T) -> Self {
        Self {
            cell: Arc::new(ValueCell::resolved(value)),
            deps: BTreeSet::new(),
        }
    }

    pub(crate) fn from_cell(cell: Arc<ValueCell<T>>, deps: BTreeSet<String>) -> Self {
        Self { cell, deps }
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.deps
    }

    pub fn cell(&self) -> &Arc<ValueCell<T>> {
        &self.cell
    }

    pub fn get(&self) -> Option<Result<T, CellError>> {
        self.cell.get()
    }

    pub async fn wait(&self) -> Result<T, CellError> {
        self.cell.wait().await
    }

    /// Derive a new output as `f(value)` once this one resolves.
    pub fn apply<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let target = Arc::new(ValueCell::pending());
        let sink = Arc::clone(&target);
        self.cell.on_settle(move |settled| match settled {
            Ok(v) => {
                sink.resolve(f(v.clone()));
            }
            Err(e) => {
                sink.fail(e.clone());
            }
        });
        Output::from_cell(target, self.deps.clone())
    }

    /// Like [`Output::apply`], but `f` may reject the value. A rejection fails
    /// the derived cell with a type mismatch attributed to `step`.
    pub fn try_apply<U, F>(&self, step: &str, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, String> + Send + 'static,
    {
        let target = Arc::new(ValueCell::pending());
        let sink = Arc::clone(&target);
        let step = step.to_string();
        self.cell.on_settle(move |settled| match settled {
            Ok(v) => match f(v.clone()) {
                Ok(u) => {
                    sink.resolve(u);
                }
                Err(msg) => {
                    sink.fail(CellError {
                        origin: step,
                        failure: CellFailure::TypeMismatch(msg),
                    });
                }
            },
            Err(e) => {
                sink.fail(e.clone());
            }
        });
        Output::from_cell(target, self.deps.clone())
    }

    /// Resolve once every source has resolved, as `f(values)` in source order.
    /// The first failing source fails the result.
    pub fn combine<U, F>(outputs: &[Output<T>], f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Vec<T>) -> U + Send + 'static,
    {
        let deps: BTreeSet<String> = outputs
            .iter()
            .flat_map(|o| o.deps.iter().cloned())
            .collect();
        let target = Arc::new(ValueCell::pending());

        if outputs.is_empty() {
            target.resolve(f(Vec::new()));
            return Output::from_cell(target, deps);
        }

        struct Gather<T, F> {
            slots: Vec<Option<T>>,
            remaining: usize,
            f: Option<F>,
        }

        let gather = Arc::new(Mutex::new(Gather {
            slots: vec![None; outputs.len()],
            remaining: outputs.len(),
            f: Some(f),
        }));

        for (idx, output) in outputs.iter().enumerate() {
            let gather = Arc::clone(&gather);
            let sink = Arc::clone(&target);
            output.cell.on_settle(move |settled| match settled {
                Ok(v) => {
                    let ready = {
                        let mut g = lock(&gather);
                        g.slots[idx] = Some(v.clone());
                        g.remaining -= 1;
                        if g.remaining == 0 {
                            let values: Vec<T> = g.slots.drain(..).flatten().collect();
                            g.f.take().map(|f| (f, values))
                        } else {
                            None
                        }
                    };
                    if let Some((f, values)) = ready {
                        sink.resolve(f(values));
                    }
                }
                Err(e) => {
                    sink.fail(e.clone());
                }
            });
        }

        Output::from_cell(target, deps)
    }
}

impl Output<Value> {
    /// Render `template`, replacing each `{}` with the next argument.
    pub fn format(template: &str, args: &[Output<Value>]) -> Output<Value> {
        let template = template.to_string();
        Output::combine(args, move |values| {
            Value::String(render_template(&template, &values))
        })
    }
}

impl From<&str> for Output<Value> {
    fn from(s: &str) -> Self {
        Output::known(Value::String(s.to_string()))
    }
}

/// Substitute `{}` placeholders in order. Surplus placeholders are kept verbatim.
pub fn render_template(template: &str, values: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut args = values.iter();
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.next() {
            Some(v) => out.push_str(&value_to_string(v)),
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

/// Convert a JSON value to a string for template rendering.
pub fn value_to_string(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
