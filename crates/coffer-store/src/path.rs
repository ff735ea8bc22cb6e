//! Dot-path addressing into JSON document trees.
//!
//! A [`DotPath`] such as `"guildA.user123.money"` names a sequence of object
//! keys to descend. Reads never mutate the tree and report absence as
//! `None`; writes create missing intermediate objects but refuse to descend
//! through a value that is present and not an object.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// A parsed, validated dot-separated path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DotPath {
    raw: String,
    segments: Vec<String>,
}

impl DotPath {
    /// Parse a path, rejecting empty paths and empty segments.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if raw.is_empty() {
            return Err(StoreError::invalid_path(raw, "path is empty"));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StoreError::invalid_path(raw, "path contains an empty segment"));
        }
        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    /// The path as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The individual key segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The last segment, i.e. the key of the addressed slot.
    pub fn last(&self) -> &str {
        // parse() guarantees at least one segment.
        &self.segments[self.segments.len() - 1]
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl FromStr for DotPath {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DotPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Look up the value at `path`, returning `None` as soon as a segment is
/// missing or the current node is not an object.
pub fn resolve_read<'a>(root: &'a Value, path: &DotPath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Return a mutable reference to the slot addressed by `path`, creating
/// every missing intermediate object along the way.
///
/// A missing terminal slot is created as `null` so the caller can assign to
/// it. `null` intermediates are treated as missing and replaced by objects.
pub fn resolve_write<'a>(root: &'a mut Value, path: &DotPath) -> StoreResult<&'a mut Value> {
    let mut node = root;
    for (depth, segment) in path.segments().iter().enumerate() {
        let map = as_object_for_write(node, path, depth)?;
        node = map.entry(segment.clone()).or_insert(Value::Null);
    }
    Ok(node)
}

/// Return the object that holds the terminal key of `path`, without
/// creating anything. `None` when an intermediate segment is absent or is
/// not an object, matching [`resolve_read`].
pub fn resolve_parent_mut<'a>(
    root: &'a mut Value,
    path: &DotPath,
) -> Option<&'a mut Map<String, Value>> {
    let parents = &path.segments()[..path.len() - 1];
    let mut node = root;
    for segment in parents {
        node = node.as_object_mut()?.get_mut(segment)?;
    }
    node.as_object_mut()
}

fn as_object_for_write<'a>(
    node: &'a mut Value,
    path: &DotPath,
    depth: usize,
) -> StoreResult<&'a mut Map<String, Value>> {
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => Ok(map),
        other => Err(conflict(path, depth, other)),
    }
}

fn conflict(path: &DotPath, depth: usize, found: &Value) -> StoreError {
    let prefix = if depth == 0 {
        "<root>".to_owned()
    } else {
        path.segments()[..depth].join(".")
    };
    StoreError::invalid_path(
        path.as_str(),
        format!("`{prefix}` is {}, not an object", kind_name(found)),
    )
}

/// Human-readable JSON kind, used in error messages.
pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn p(raw: &str) -> DotPath {
        DotPath::parse(raw).unwrap()
    }

    #[test]
    fn parse_rejects_empty_segments() {
        for raw in ["", ".", "a..b", ".a", "a."] {
            let err = DotPath::parse(raw).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidPath, "{raw:?}");
        }
    }

    #[test]
    fn parse_single_segment() {
        let path = p("money");
        assert_eq!(path.segments(), ["money"]);
        assert_eq!(path.last(), "money");
    }

    #[test]
    fn read_nested_value() {
        let doc = json!({"g1": {"u1": {"money": 10}}});
        assert_eq!(resolve_read(&doc, &p("g1.u1.money")), Some(&json!(10)));
        assert_eq!(resolve_read(&doc, &p("g1")), Some(&json!({"u1": {"money": 10}})));
    }

    #[test]
    fn read_missing_or_through_scalar_is_none() {
        let doc = json!({"g1": {"u1": 5}});
        assert_eq!(resolve_read(&doc, &p("g2.u1")), None);
        assert_eq!(resolve_read(&doc, &p("g1.u1.money")), None);
        assert_eq!(resolve_read(&doc, &p("g1.u2")), None);
    }

    #[test]
    fn write_creates_intermediates() {
        let mut doc = json!({});
        *resolve_write(&mut doc, &p("a.b.c")).unwrap() = json!(1);
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn write_replaces_null_intermediate() {
        let mut doc = json!({"a": null});
        *resolve_write(&mut doc, &p("a.b")).unwrap() = json!(true);
        assert_eq!(doc, json!({"a": {"b": true}}));

        let mut root = Value::Null;
        *resolve_write(&mut root, &p("x")).unwrap() = json!("y");
        assert_eq!(root, json!({"x": "y"}));
    }

    #[test]
    fn write_through_scalar_is_invalid_path() {
        let mut doc = json!({"a": 3});
        let err = resolve_write(&mut doc, &p("a.b")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPath);
        assert!(err.to_string().contains("`a` is a number"));
        assert_eq!(doc, json!({"a": 3}));
    }

    #[test]
    fn parent_lookup_never_creates() {
        let mut doc = json!({"a": {}});
        assert!(resolve_parent_mut(&mut doc, &p("a.b.c")).is_none());
        assert_eq!(doc, json!({"a": {}}));

        let parent = resolve_parent_mut(&mut doc, &p("a.b")).unwrap();
        assert!(parent.is_empty());
    }

    #[test]
    fn parent_lookup_through_scalar_or_array_is_none() {
        let mut doc = json!({"a": [1, 2], "n": 3});
        assert!(resolve_parent_mut(&mut doc, &p("a.b")).is_none());
        assert!(resolve_parent_mut(&mut doc, &p("n.b.c")).is_none());
        assert_eq!(doc, json!({"a": [1, 2], "n": 3}));
    }
}
