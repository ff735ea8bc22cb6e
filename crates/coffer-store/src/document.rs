//! Operators over JSON documents.
//!
//! [`apply`] is the single implementation of set / add / subtract / push /
//! pull / delete. The flat-file store applies it to its whole tree; remote
//! backends apply it to one document. Keeping one code path means every
//! backend agrees on numeric promotion, absent-value defaults and failure
//! behavior.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{StoreError, StoreResult};
use crate::events::ChangeKind;
use crate::path::{self, DotPath, kind_name};

/// Largest magnitude at which an `f64` still represents every integer.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// A single mutating operation on a document slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Assign a value.
    Set { value: Value },
    /// Add to the numeric value (absent counts as zero).
    Add { amount: f64 },
    /// Subtract from the numeric value (absent counts as zero).
    Subtract { amount: f64 },
    /// Append to the array (absent counts as empty).
    Push { item: Value },
    /// Remove the first array element equal to `value`.
    Pull { value: Value },
    /// Remove the terminal key.
    Delete,
}

impl Mutation {
    /// Argument checks that must pass before any I/O is attempted.
    pub fn validate(&self, path: Option<&DotPath>) -> StoreResult<()> {
        match self {
            Self::Add { amount } | Self::Subtract { amount } if !amount.is_finite() => {
                Err(StoreError::invalid_type(
                    label(path),
                    format!("amount must be a finite number, got {amount}"),
                ))
            }
            _ => Ok(()),
        }
    }

    /// The notification tag for this operation.
    pub fn change_kind(&self) -> ChangeKind {
        match self {
            Self::Set { .. } => ChangeKind::Set,
            Self::Add { .. } => ChangeKind::Add,
            Self::Subtract { .. } => ChangeKind::Subtract,
            Self::Push { .. } => ChangeKind::Push,
            Self::Pull { .. } => ChangeKind::Pull,
            Self::Delete => ChangeKind::Delete,
        }
    }

    /// The numeric amount, for add and subtract.
    pub fn amount(&self) -> Option<f64> {
        match self {
            Self::Add { amount } | Self::Subtract { amount } => Some(*amount),
            _ => None,
        }
    }
}

/// Apply `mutation` to the slot at `path` (the whole document when `None`)
/// and return the slot's resulting value.
///
/// Delete returns `Value::Bool(removed)`. The existing value is checked
/// before anything is written, so an `Err` leaves `doc` untouched.
pub fn apply(doc: &mut Value, path: Option<&DotPath>, mutation: &Mutation) -> StoreResult<Value> {
    mutation.validate(path)?;
    match mutation {
        Mutation::Set { value } => {
            *slot_mut(doc, path)? = value.clone();
            Ok(value.clone())
        }
        Mutation::Add { amount } => {
            let next = add_numbers(read(doc, path), *amount, path)?;
            *slot_mut(doc, path)? = next.clone();
            Ok(next)
        }
        Mutation::Subtract { amount } => {
            let next = add_numbers(read(doc, path), -*amount, path)?;
            *slot_mut(doc, path)? = next.clone();
            Ok(next)
        }
        Mutation::Push { item } => {
            let mut items = current_array(read(doc, path), path)?;
            items.push(item.clone());
            let next = Value::Array(items);
            *slot_mut(doc, path)? = next.clone();
            Ok(next)
        }
        Mutation::Pull { value } => {
            let mut items = current_array(read(doc, path), path)?;
            if let Some(pos) = items.iter().position(|item| item == value) {
                items.remove(pos);
            }
            let next = Value::Array(items);
            *slot_mut(doc, path)? = next.clone();
            Ok(next)
        }
        Mutation::Delete => delete(doc, path).map(Value::Bool),
    }
}

/// Remove every element of the array at `path` for which `predicate`
/// returns true, returning the remaining array.
pub fn pull_where<F>(doc: &mut Value, path: Option<&DotPath>, predicate: F) -> StoreResult<Value>
where
    F: Fn(&Value) -> bool,
{
    let mut items = current_array(read(doc, path), path)?;
    items.retain(|item| !predicate(item));
    let next = Value::Array(items);
    *slot_mut(doc, path)? = next.clone();
    Ok(next)
}

/// Read the slot at `path`; `null` counts as absent.
pub fn read<'a>(doc: &'a Value, path: Option<&DotPath>) -> Option<&'a Value> {
    let found = match path {
        Some(path) => path::resolve_read(doc, path)?,
        None => doc,
    };
    (!found.is_null()).then_some(found)
}

fn slot_mut<'a>(doc: &'a mut Value, path: Option<&DotPath>) -> StoreResult<&'a mut Value> {
    match path {
        Some(path) => path::resolve_write(doc, path),
        None => Ok(doc),
    }
}

fn delete(doc: &mut Value, path: Option<&DotPath>) -> StoreResult<bool> {
    let Some(path) = path else {
        let existed = !doc.is_null();
        *doc = Value::Null;
        return Ok(existed);
    };
    Ok(path::resolve_parent_mut(doc, path)
        .is_some_and(|parent| parent.remove(path.last()).is_some()))
}

fn add_numbers(current: Option<&Value>, amount: f64, path: Option<&DotPath>) -> StoreResult<Value> {
    let base = match current {
        None => Number::from(0),
        Some(Value::Number(n)) => n.clone(),
        Some(other) => {
            return Err(StoreError::invalid_type(
                label(path),
                format!("existing value is {}, not a number", kind_name(other)),
            ));
        }
    };

    let integral = amount.fract() == 0.0 && amount.abs() <= MAX_EXACT_INT;
    if let (Some(int), true) = (base.as_i64(), integral) {
        if let Some(sum) = int.checked_add(amount as i64) {
            return Ok(Value::from(sum));
        }
    }

    let base = base.as_f64().ok_or_else(|| {
        StoreError::invalid_type(label(path), "existing number is not representable as f64")
    })?;
    Number::from_f64(base + amount)
        .map(Value::Number)
        .ok_or_else(|| StoreError::invalid_type(label(path), "result is not a finite number"))
}

fn current_array(current: Option<&Value>, path: Option<&DotPath>) -> StoreResult<Vec<Value>> {
    match current {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(StoreError::invalid_type(
            label(path),
            format!("existing value is {}, not an array", kind_name(other)),
        )),
    }
}

fn label(path: Option<&DotPath>) -> &str {
    path.map_or("<document>", DotPath::as_str)
}
