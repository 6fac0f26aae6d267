//! src/item.rs
//!
//! The message schema shared by every pool variant.
//!
//! Work items and results cross execution-unit boundaries (threads always,
//! processes for the isolated pool), so both are built from one closed,
//! serializable [`Value`] type instead of arbitrary caller types. The pool
//! never interprets the content; it only moves it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A self-describing value that can travel through any pool transport.
///
/// This is the whole vocabulary: work-item arguments, worker start-args and
/// published results are all `Value`s. Keeping the schema closed is what
/// lets the process-isolated pool serialize items without ever serializing
/// code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// A named-argument bundle describing one unit of work.
///
/// Produced by the caller or a ventilator, consumed exactly once by exactly
/// one worker. Argument order is irrelevant; the map is sorted so encoded
/// items are byte-stable.
///
/// # Examples
/// ```ignore
/// let item = WorkItem::from_single("row_group", 7)
///     .with("columns", vec!["id", "label"]);
/// let rg = item.get_i64("row_group")?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem {
    args: BTreeMap<String, Value>,
}

impl WorkItem {
    /// Creates an empty work item. Valid as-is: a worker may take no
    /// arguments at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a work item from a single `(name, value)` pair.
    ///
    /// Chain with [`with`](Self::with) to add more arguments.
    pub fn from_single(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with(name, value)
    }

    /// Adds or overwrites an argument.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Returns the argument by name, or an error naming what is missing.
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.args
            .get(name)
            .ok_or_else(|| anyhow!("work item argument '{}' not found", name))
    }

    /// Returns the argument by name if present.
    pub fn opt(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Returns an integer argument, failing on absence or wrong kind.
    pub fn get_i64(&self, name: &str) -> Result<i64> {
        let value = self.get(name)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow!("work item argument '{}' is {}, expected int", name, value.kind()))
    }

    /// Returns a string argument, failing on absence or wrong kind.
    pub fn get_str(&self, name: &str) -> Result<&str> {
        let value = self.get(name)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("work item argument '{}' is {}, expected str", name, value.kind()))
    }

    /// Returns a list argument, failing on absence or wrong kind.
    pub fn get_list(&self, name: &str) -> Result<&[Value]> {
        let value = self.get(name)?;
        value
            .as_list()
            .ok_or_else(|| anyhow!("work item argument '{}' is {}, expected list", name, value.kind()))
    }

    /// Returns an iterator over all argument names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.args.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

#[cfg(test)]
mod item_test {
    use super::*;

    /// Helper function: a work item shaped like a columnar read request.
    fn make_item(row_group: i64) -> WorkItem {
        WorkItem::from_single("row_group", row_group)
            .with("columns", vec!["id", "label"])
            .with("shuffle", true)
    }

    #[test]
    fn test_item_basic_construction() -> Result<()> {
        let item = make_item(7);

        assert_eq!(item.get_i64("row_group")?, 7);
        assert_eq!(item.get_list("columns")?.len(), 2);
        assert_eq!(item.get("shuffle")?.as_bool(), Some(true));
        assert!(item.get("missing").is_err());
        assert!(item.get_str("row_group").is_err(), "kind mismatch must fail");
        Ok(())
    }

    #[test]
    fn test_item_survives_transport_encoding() -> Result<()> {
        let item = make_item(3).with("blob", Value::Bytes(vec![0xde, 0xad]));

        let encoded = serde_json::to_string(&item)?;
        let decoded: WorkItem = serde_json::from_str(&encoded)?;

        assert_eq!(decoded, item, "decoded item must match the original");
        assert_eq!(decoded.get("blob")?.as_bytes(), Some(&[0xde, 0xad][..]));
        Ok(())
    }
}
