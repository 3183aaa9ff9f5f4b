//! Dynamic values observed by watches.
//!
//! Scalars are compared by value. Lists and records are shared, mutable
//! containers: cloning a [`Value`] clones the handle, not the contents, so an
//! in-place mutation is seen by every holder. That is what makes the two
//! equality strategies different. Reference equality sees a mutated list as
//! unchanged, structural equality compares contents against a deep snapshot.
//!
//! Containers may contain themselves. Deep comparison treats a pair of
//! containers it is already comparing as equal, and deep copy reproduces the
//! cycle in the copy.

use foldhash::fast::FixedState;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Field map used by records and by scope storage.
pub type Fields = IndexMap<Arc<str>, Value, FixedState>;

/// Shared, interior-mutable container handle.
pub type Shared<T> = Arc<RwLock<T>>;

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value; what reading a missing field yields.
    #[default]
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number. `NaN` is equal to itself under both equality strategies.
    Number(f64),
    /// Immutable string, compared by content.
    Str(Arc<str>),
    /// Shared list.
    List(Shared<Vec<Value>>),
    /// Shared record with ordered fields.
    Record(Shared<Fields>),
}

impl Value {
    /// Build a new list container.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(Arc::new(RwLock::new(
            items.into_iter().map(Into::into).collect(),
        )))
    }

    /// Build a new record container.
    pub fn record<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arc<str>>,
        V: Into<Value>,
    {
        Value::Record(Arc::new(RwLock::new(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )))
    }

    /// True for [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// True for a `NaN` number.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Number(n) if n.is_nan())
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Number of elements of a list or fields of a record.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(items.read().len()),
            Value::Record(fields) => Some(fields.read().len()),
            _ => None,
        }
    }

    /// Append to a list in place. Returns `false` if this is not a list.
    pub fn push(&self, item: impl Into<Value>) -> bool {
        match self {
            Value::List(items) => {
                items.write().push(item.into());
                true
            }
            _ => false,
        }
    }

    /// Set a record field in place. Returns `false` if this is not a record.
    pub fn insert(&self, key: impl Into<Arc<str>>, value: impl Into<Value>) -> bool {
        match self {
            Value::Record(fields) => {
                fields.write().insert(key.into(), value.into());
                true
            }
            _ => false,
        }
    }

    /// Read a list element or record field; `Undefined` when absent.
    pub fn index(&self, key: impl Index) -> Value {
        key.lookup(self).unwrap_or_default()
    }

    /// Whether two values are the same primitive or the same container.
    ///
    /// Two `NaN`s are the same value here, otherwise a watch on `NaN` would
    /// report a change on every sweep.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(*a, *b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Record(a), Value::Record(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Deep content equality. Record field order is not significant.
    pub fn deep_eq(&self, other: &Value) -> bool {
        deep_eq_with(self, other, &mut Vec::new())
    }

    /// Recursively copy containers so the result shares nothing with `self`.
    ///
    /// Containers reachable along several paths are copied once, and stay
    /// shared within the copy.
    pub fn deep_copy(&self) -> Value {
        deep_copy_with(self, &mut Copies::default())
    }
}

/// Container pairs currently being compared, innermost last.
type Comparing = Vec<(*const (), *const ())>;

/// Original container address to its copy.
type Copies = IndexMap<*const (), Value, FixedState>;

fn container_ptr<T>(shared: &Shared<T>) -> *const () {
    Arc::as_ptr(shared).cast()
}

fn deep_eq_with(a: &Value, b: &Value, comparing: &mut Comparing) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) => compare_containers(x, y, comparing, |x, y, comparing| {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_eq_with(l, r, comparing))
        }),
        (Value::Record(x), Value::Record(y)) => {
            compare_containers(x, y, comparing, |x, y, comparing| {
                x.len() == y.len()
                    && x.iter()
                        .all(|(k, l)| y.get(k).is_some_and(|r| deep_eq_with(l, r, comparing)))
            })
        }
        _ => a.same(b),
    }
}

fn compare_containers<T>(
    x: &Shared<T>,
    y: &Shared<T>,
    comparing: &mut Comparing,
    contents: impl FnOnce(&T, &T, &mut Comparing) -> bool,
) -> bool {
    if Arc::ptr_eq(x, y) {
        return true;
    }
    let pair = (container_ptr(x), container_ptr(y));
    if comparing.contains(&pair) {
        return true;
    }
    comparing.push(pair);
    let equal = contents(&x.read_recursive(), &y.read_recursive(), comparing);
    comparing.pop();
    equal
}

fn deep_copy_with(value: &Value, copies: &mut Copies) -> Value {
    match value {
        Value::List(items) => {
            let key = container_ptr(items);
            if let Some(copy) = copies.get(&key) {
                return copy.clone();
            }
            let copy: Shared<Vec<Value>> = Arc::default();
            copies.insert(key, Value::List(copy.clone()));
            let contents: Vec<Value> = items
                .read_recursive()
                .iter()
                .map(|item| deep_copy_with(item, copies))
                .collect();
            *copy.write() = contents;
            Value::List(copy)
        }
        Value::Record(fields) => {
            let key = container_ptr(fields);
            if let Some(copy) = copies.get(&key) {
                return copy.clone();
            }
            let copy: Shared<Fields> = Arc::default();
            copies.insert(key, Value::Record(copy.clone()));
            let contents: Fields = fields
                .read_recursive()
                .iter()
                .map(|(k, v)| (k.clone(), deep_copy_with(v, copies)))
                .collect();
            *copy.write() = contents;
            Value::Record(copy)
        }
        scalar => scalar.clone(),
    }
}

fn numbers_equal(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Key types accepted by [`Value::index`].
pub trait Index {
    /// Look the key up in `value`.
    fn lookup(&self, value: &Value) -> Option<Value>;
}

impl Index for usize {
    fn lookup(&self, value: &Value) -> Option<Value> {
        match value {
            Value::List(items) => items.read().get(*self).cloned(),
            _ => None,
        }
    }
}

impl Index for &str {
    fn lookup(&self, value: &Value) -> Option<Value> {
        match value {
            Value::Record(fields) => fields.read().get(*self).cloned(),
            _ => None,
        }
    }
}

/// Structural equality; see [`Value::deep_eq`].
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items.read().iter()).finish(),
            Value::Record(fields) => f.debug_map().entries(fields.read().iter()).finish(),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Arc::new(RwLock::new(items)))
    }
}

/// How a watch decides whether its value changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Equality {
    /// Same primitive or same container ([`Value::same`]).
    #[default]
    Reference,
    /// Deep content comparison against a deep snapshot ([`Value::deep_eq`]).
    Structural,
}

impl Equality {
    /// Compare a freshly evaluated value against the recorded one.
    pub fn equal(self, new: &Value, last: &Value) -> bool {
        match self {
            Equality::Reference => new.same(last),
            Equality::Structural => new.deep_eq(last),
        }
    }

    /// What to record as the last value after a change.
    ///
    /// Structural watches keep a deep copy, otherwise mutating the live
    /// container would also mutate the recorded value.
    pub fn snapshot(self, value: &Value) -> Value {
        match self {
            Equality::Reference => value.clone(),
            Equality::Structural => value.deep_copy(),
        }
    }
}
