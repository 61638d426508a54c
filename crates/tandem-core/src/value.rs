//! Opaque value model.
//!
//! Compiled algorithms manipulate a single immutable [`Value`] sum covering
//! the shapes a specification can produce: booleans, signed 32-bit numbers,
//! strings, ordered tuples, deduplicated sets, and finite functions
//! (records) from values to values. Collections sit behind `Arc`, so cloning
//! a value is cheap and a pre-write snapshot is a pointer copy; functional
//! update clones the touched spine only.
//!
//! Equality is structural, the derived order is total (numbers compare
//! signed), and the hash agrees with equality, so values can key maps and
//! cross threads freely.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{RuntimeError, RuntimeResult};

/// An immutable value manipulated by compiled algorithms.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// Signed 32-bit integer; sufficient for all arithmetic used here
    Number(i32),
    /// Immutable string
    String(Arc<str>),
    /// Ordered tuple
    Tuple(Arc<Vec<Value>>),
    /// Unordered, deduplicated set
    Set(Arc<BTreeSet<Value>>),
    /// Finite function (record) from values to values
    Record(Arc<BTreeMap<Value, Value>>),
}

/// The boolean TRUE value
pub const TRUE: Value = Value::Bool(true);
/// The boolean FALSE value
pub const FALSE: Value = Value::Bool(false);

impl Value {
    /// The unit value: the empty tuple. Used where a slot must hold
    /// something before its first real write.
    pub fn unit() -> Self {
        Value::Tuple(Arc::new(Vec::new()))
    }

    /// Construct a number value
    pub fn number(n: i32) -> Self {
        Value::Number(n)
    }

    /// Construct a string value
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    /// Construct a tuple from its elements in order
    pub fn tuple(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(Arc::new(elements.into_iter().collect()))
    }

    /// Construct a set from its elements, deduplicating
    pub fn set(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(Arc::new(elements.into_iter().collect()))
    }

    /// Construct a record from (key, value) fields
    pub fn record(fields: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Value::Record(Arc::new(fields.into_iter().collect()))
    }

    /// Name of the stored variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Record(_) => "record",
        }
    }

    fn mismatch(&self, expected: &'static str) -> RuntimeError {
        RuntimeError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    /// The stored boolean, or `TypeMismatch`
    pub fn as_bool(&self) -> RuntimeResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    /// The stored number, or `TypeMismatch`
    pub fn as_number(&self) -> RuntimeResult<i32> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(other.mismatch("number")),
        }
    }

    /// The stored string, or `TypeMismatch`
    pub fn as_str(&self) -> RuntimeResult<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    /// The stored tuple elements, or `TypeMismatch`
    pub fn as_tuple(&self) -> RuntimeResult<&[Value]> {
        match self {
            Value::Tuple(t) => Ok(t),
            other => Err(other.mismatch("tuple")),
        }
    }

    /// The stored set, or `TypeMismatch`
    pub fn as_set(&self) -> RuntimeResult<&BTreeSet<Value>> {
        match self {
            Value::Set(s) => Ok(s),
            other => Err(other.mismatch("set")),
        }
    }

    /// The stored record, or `TypeMismatch`
    pub fn as_record(&self) -> RuntimeResult<&BTreeMap<Value, Value>> {
        match self {
            Value::Record(r) => Ok(r),
            other => Err(other.mismatch("record")),
        }
    }

    /// Function application: record lookup by key, or 1-based tuple
    /// indexing when applied to a tuple with a numeric argument. A missing
    /// key is reported as an internal error since compiled bodies only
    /// apply functions within their domain.
    pub fn apply(&self, arg: &Value) -> RuntimeResult<Value> {
        match self {
            Value::Record(r) => r.get(arg).cloned().ok_or_else(|| {
                RuntimeError::internal(format!("function {self} has no mapping for {arg}"))
            }),
            Value::Tuple(t) => {
                let idx = arg.as_number()?;
                usize::try_from(idx)
                    .ok()
                    .filter(|i| *i >= 1)
                    .and_then(|i| t.get(i - 1))
                    .cloned()
                    .ok_or_else(|| {
                        RuntimeError::internal(format!("tuple index {idx} out of range"))
                    })
            }
            other => Err(other.mismatch("record")),
        }
    }

    /// Functional record update: a new record equal to `self` except that
    /// `key` maps to `value`.
    pub fn with_entry(&self, key: Value, value: Value) -> RuntimeResult<Value> {
        let mut record = Arc::clone(match self {
            Value::Record(r) => r,
            other => return Err(other.mismatch("record")),
        });
        Arc::make_mut(&mut record).insert(key, value);
        Ok(Value::Record(record))
    }

    /// Read through a nested index path. The empty path is the value
    /// itself; each path element applies the function at that level.
    pub fn index(&self, path: &[Value]) -> RuntimeResult<Value> {
        match path.split_first() {
            None => Ok(self.clone()),
            Some((head, rest)) => self.apply(head)?.index(rest),
        }
    }

    /// Functional update through a nested index path. The empty path
    /// replaces the value outright; otherwise the spine of records along
    /// the path is rewritten, creating intermediate records for missing
    /// keys.
    pub fn with_index(&self, path: &[Value], value: Value) -> RuntimeResult<Value> {
        match path.split_first() {
            None => Ok(value),
            Some((head, rest)) => {
                let record = self.as_record()?;
                let inner = match record.get(head) {
                    Some(v) => v.clone(),
                    None if rest.is_empty() => Value::unit(),
                    None => Value::Record(Arc::new(BTreeMap::new())),
                };
                self.with_entry(head.clone(), inner.with_index(rest, value)?)
            }
        }
    }

    /// Numeric addition
    pub fn add(&self, other: &Value) -> RuntimeResult<Value> {
        Ok(Value::Number(
            self.as_number()?.wrapping_add(other.as_number()?),
        ))
    }

    /// Set membership
    pub fn contains(&self, element: &Value) -> RuntimeResult<bool> {
        Ok(self.as_set()?.contains(element))
    }

    /// Set difference: elements of `self` not in `other`
    pub fn set_minus(&self, other: &Value) -> RuntimeResult<Value> {
        let rhs = other.as_set()?;
        Ok(Value::set(
            self.as_set()?.iter().filter(|e| !rhs.contains(e)).cloned(),
        ))
    }

    /// Subset test: every element of `self` is in `other`
    pub fn is_subset_of(&self, other: &Value) -> RuntimeResult<bool> {
        Ok(self.as_set()?.is_subset(other.as_set()?))
    }

    /// The `n`-th element of a set in iteration order, for fairness-driven
    /// nondeterministic selection. `n` must be below the set's length.
    pub fn select(&self, n: usize) -> RuntimeResult<Value> {
        self.as_set()?
            .iter()
            .nth(n)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("selection index {n} out of range")))
    }

    /// Number of elements in a tuple, set, or record
    pub fn len(&self) -> RuntimeResult<usize> {
        match self {
            Value::Tuple(t) => Ok(t.len()),
            Value::Set(s) => Ok(s.len()),
            Value::Record(r) => Ok(r.len()),
            other => Err(other.mismatch("set")),
        }
    }

    /// Whether a tuple, set, or record is empty
    pub fn is_empty(&self) -> RuntimeResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::unit()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn comma_separated<'a>(
            f: &mut fmt::Formatter<'_>,
            items: impl Iterator<Item = &'a Value>,
        ) -> fmt::Result {
            for (i, item) in items.enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Value::Bool(true) => write!(f, "TRUE"),
            Value::Bool(false) => write!(f, "FALSE"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::Tuple(t) => {
                write!(f, "<<")?;
                comma_separated(f, t.iter())?;
                write!(f, ">>")
            }
            Value::Set(s) => {
                write!(f, "{{")?;
                comma_separated(f, s.iter())?;
                write!(f, "}}")
            }
            Value::Record(r) => {
                write!(f, "[")?;
                for (i, (k, v)) in r.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} |-> {v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn structural_equality_ignores_construction_order() {
        let a = Value::set([Value::number(3), Value::number(1), Value::number(2)]);
        let b = Value::set([Value::number(1), Value::number(2), Value::number(3)]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let r1 = Value::record([
            (Value::string("tpe"), Value::number(1)),
            (Value::string("value"), Value::number(7)),
        ]);
        let r2 = Value::record([
            (Value::string("value"), Value::number(7)),
            (Value::string("tpe"), Value::number(1)),
        ]);
        assert_eq!(r1, r2);
        assert_eq!(hash_of(&r1), hash_of(&r2));
    }

    #[test]
    fn numbers_compare_signed() {
        assert!(Value::number(-5) < Value::number(3));
        assert!(Value::number(i32::MIN) < Value::number(i32::MAX));
    }

    #[test]
    fn accessors_report_type_mismatch() {
        let err = Value::string("hello").as_number().unwrap_err();
        assert_eq!(
            err,
            RuntimeError::TypeMismatch {
                expected: "number",
                found: "string"
            }
        );
        assert!(Value::number(1).as_set().is_err());
        assert!(TRUE.as_record().is_err());
    }

    #[test]
    fn record_application_and_update() {
        let req = Value::record([
            (Value::string("tpe"), Value::string("read")),
            (Value::string("value"), Value::number(9)),
        ]);
        assert_eq!(
            req.apply(&Value::string("tpe")).unwrap(),
            Value::string("read")
        );
        assert!(req.apply(&Value::string("missing")).is_err());

        let updated = req
            .with_entry(Value::string("value"), Value::number(10))
            .unwrap();
        assert_eq!(
            updated.apply(&Value::string("value")).unwrap(),
            Value::number(10)
        );
        // original untouched
        assert_eq!(
            req.apply(&Value::string("value")).unwrap(),
            Value::number(9)
        );
    }

    #[test]
    fn tuple_application_is_one_based() {
        let t = Value::tuple([Value::string("a"), Value::string("b")]);
        assert_eq!(t.apply(&Value::number(1)).unwrap(), Value::string("a"));
        assert_eq!(t.apply(&Value::number(2)).unwrap(), Value::string("b"));
        assert!(t.apply(&Value::number(0)).is_err());
        assert!(t.apply(&Value::number(3)).is_err());
    }

    #[test]
    fn nested_index_update() {
        let state = Value::record([(
            Value::number(1),
            Value::record([(Value::string("inbox"), Value::number(0))]),
        )]);
        let updated = state
            .with_index(
                &[Value::number(1), Value::string("inbox")],
                Value::number(42),
            )
            .unwrap();
        assert_eq!(
            updated
                .index(&[Value::number(1), Value::string("inbox")])
                .unwrap(),
            Value::number(42)
        );
        // a fresh key grows the record
        let grown = state
            .with_index(&[Value::number(2)], Value::number(5))
            .unwrap();
        assert_eq!(grown.index(&[Value::number(2)]).unwrap(), Value::number(5));
    }

    #[test]
    fn set_operations() {
        let s = Value::set([Value::number(1), Value::number(2), Value::number(3)]);
        assert!(s.contains(&Value::number(2)).unwrap());
        let rest = s.set_minus(&Value::set([Value::number(2)])).unwrap();
        assert_eq!(rest, Value::set([Value::number(1), Value::number(3)]));
        assert!(rest.is_subset_of(&s).unwrap());
        assert_eq!(s.select(0).unwrap(), Value::number(1));
        assert_eq!(s.select(2).unwrap(), Value::number(3));
        assert!(s.select(3).is_err());
    }

    #[test]
    fn display_is_deterministic() {
        let v = Value::record([
            (Value::string("peers"), Value::set([Value::number(2), Value::number(1)])),
            (Value::string("up"), TRUE),
        ]);
        assert_eq!(v.to_string(), "[\"peers\" |-> {1, 2}, \"up\" |-> TRUE]");
        assert_eq!(
            Value::tuple([Value::number(1), Value::string("x")]).to_string(),
            "<<1, \"x\">>"
        );
        assert_eq!(Value::unit().to_string(), "<<>>");
    }
}
