//! Portable value representation.
//!
//! Everything written to the shared store or passed between jobs is a
//! [`Value`]. The wire form is a tagged JSON document (`{"t":"int","v":3}`),
//! decoded by plain data parsing. Values with no portable form are rejected at
//! the point of encoding with [`Error::NoRemoteRepresentation`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Dispatch, Job, JobReference};

/// Placeholder symbol returned in place of a lost result when resolution
/// does not halt on data loss.
pub const MISSING: &str = "__missing";

/// A value that can cross process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    List(Vec<Value>),
    Job(Job),
    Ref(JobReference),
}

impl Value {
    pub fn symbol(name: impl Into<String>) -> Self {
        Value::Symbol(name.into())
    }

    pub fn missing() -> Self {
        Value::Symbol(MISSING.to_string())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Symbol(s) if s == MISSING)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Value::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&JobReference> {
        match self {
            Value::Ref(reference) => Some(reference),
            _ => None,
        }
    }

    /// Check that this value has a portable form.
    pub fn validate(&self) -> Result<()> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(Error::NoRemoteRepresentation(format!(
                "non-finite float {f}"
            ))),
            Value::List(items) => items.iter().try_for_each(Value::validate),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, ":{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Job(job) => write!(f, "job {job}"),
            Value::Ref(reference) => write!(f, "-> {}", reference.job),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Job> for Value {
    fn from(job: Job) -> Self {
        Value::Job(job)
    }
}

impl From<JobReference> for Value {
    fn from(reference: JobReference) -> Self {
        Value::Ref(reference)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Nil, Into::into)
    }
}

/// Convert any serializable type into a [`Value`].
///
/// Only primitives and sequences have a portable form; maps, structs and
/// integers outside the `i64` range fail with `NoRemoteRepresentation`.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let json = serde_json::to_value(value)?;
    from_json(json)
}

/// Convert a [`Value`] back into a deserializable type.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(serde_json::from_value(to_json(value)?)?)
}

fn from_json(json: serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;

    match json {
        Json::Null => Ok(Value::Nil),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if n.is_f64() {
                n.as_f64().map(Value::Float).ok_or_else(|| {
                    Error::NoRemoteRepresentation(format!("number {n}"))
                })
            } else {
                Err(Error::NoRemoteRepresentation(format!(
                    "integer {n} out of range"
                )))
            }
        }
        Json::String(s) => Ok(Value::Str(s)),
        Json::Array(items) => items
            .into_iter()
            .map(from_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Json::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            Err(Error::NoRemoteRepresentation(format!(
                "map with keys [{}]",
                keys.join(", ")
            )))
        }
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value> {
    use serde_json::Value as Json;

    value.validate()?;
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::from(*n),
        Value::Float(f) => Json::from(*f),
        Value::Str(s) | Value::Symbol(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect::<Result<_>>()?),
        Value::Job(job) => serde_json::to_value(job)?,
        Value::Ref(reference) => serde_json::to_value(reference)?,
    })
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Encode a value to its portable text form.
pub fn encode(value: &Value) -> Result<String> {
    value.validate()?;
    Ok(serde_json::to_string(value)?)
}

/// Decode a value previously produced by [`encode`].
pub fn decode(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a queue payload, rejecting arguments with no portable form.
pub fn encode_dispatch(dispatch: &Dispatch) -> Result<String> {
    use crate::model::Call;

    match &dispatch.call {
        Call::Process { args, .. } | Call::Deferred { args, .. } => {
            args.iter().try_for_each(Value::validate)?
        }
        Call::UpdateProgress => {}
    }
    Ok(serde_json::to_string(dispatch)?)
}

pub fn decode_dispatch(text: &str) -> Result<Dispatch> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_tagged() {
        assert_eq!(encode(&Value::Int(3)).unwrap(), r#"{"t":"int","v":3}"#);
        assert_eq!(encode(&Value::Nil).unwrap(), r#"{"t":"nil"}"#);
    }

    #[test]
    fn nested_lists_round_trip() {
        let value = Value::List(vec![
            Value::Int(1),
            Value::List(vec![Value::from("two"), Value::symbol("three")]),
            Value::Nil,
        ]);
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn non_finite_float_has_no_representation() {
        let err = encode(&Value::List(vec![Value::Float(f64::NAN)])).unwrap_err();
        assert!(matches!(err, Error::NoRemoteRepresentation(_)));
    }

    #[test]
    fn map_has_no_representation() {
        let mut map = std::collections::HashMap::new();
        map.insert("a", 1);
        assert!(matches!(
            to_value(&map),
            Err(Error::NoRemoteRepresentation(_))
        ));
    }

    #[test]
    fn typed_values_convert_both_ways() {
        let value = to_value(&vec![1u8, 2, 3]).unwrap();
        assert_eq!(value, Value::from(vec![1i64, 2, 3]));
        let back: Vec<u8> = from_value(&value).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
