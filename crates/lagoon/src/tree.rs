//! Materialized result trees.
//!
//! [`TreeNode`] is the cache's own output representation: plain JSON-shaped
//! data whose objects and arrays are `Arc`-shared. Subtree identity is
//! observable through [`TreeNode::ptr_eq`], which is how structural sharing
//! across successive reads is surfaced to observers. An absent object key is
//! the "undefined" of the data model, distinct from an explicit [`TreeNode::Null`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::{SerializeMap, SerializeSeq};
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum TreeNode {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Opaque JSON carried through from a field with no selection.
    Json(Arc<Value>),
    Array(Arc<Vec<TreeNode>>),
    Object(Arc<BTreeMap<String, TreeNode>>),
}

impl TreeNode {
    pub fn object(fields: BTreeMap<String, TreeNode>) -> Self {
        TreeNode::Object(Arc::new(fields))
    }

    pub fn array(items: Vec<TreeNode>) -> Self {
        TreeNode::Array(Arc::new(items))
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, TreeNode>> {
        match self {
            TreeNode::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[TreeNode]> {
        match self {
            TreeNode::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Fetch a child by object key.
    pub fn get(&self, key: &str) -> Option<&TreeNode> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Fetch a child by array index.
    pub fn index(&self, index: usize) -> Option<&TreeNode> {
        self.as_array().and_then(|items| items.get(index))
    }

    /// Identity comparison: true when both sides are the same shared
    /// container (or equal scalars, which have no identity of their own).
    pub fn ptr_eq(&self, other: &TreeNode) -> bool {
        match (self, other) {
            (TreeNode::Object(a), TreeNode::Object(b)) => Arc::ptr_eq(a, b),
            (TreeNode::Array(a), TreeNode::Array(b)) => Arc::ptr_eq(a, b),
            (TreeNode::Json(a), TreeNode::Json(b)) => Arc::ptr_eq(a, b),
            (TreeNode::Null, TreeNode::Null) => true,
            (TreeNode::Bool(a), TreeNode::Bool(b)) => a == b,
            (TreeNode::Number(a), TreeNode::Number(b)) => a == b,
            (TreeNode::String(a), TreeNode::String(b)) => a == b,
            _ => false,
        }
    }

    /// Convert to a plain `serde_json::Value`.
    pub fn to_value(&self) -> Value {
        match self {
            TreeNode::Null => Value::Null,
            TreeNode::Bool(b) => Value::Bool(*b),
            TreeNode::Number(n) => Value::Number(n.clone()),
            TreeNode::String(s) => Value::String(s.clone()),
            TreeNode::Json(v) => (**v).clone(),
            TreeNode::Array(items) => Value::Array(items.iter().map(TreeNode::to_value).collect()),
            TreeNode::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => TreeNode::Null,
            Value::Bool(b) => TreeNode::Bool(*b),
            Value::Number(n) => TreeNode::Number(n.clone()),
            Value::String(s) => TreeNode::String(s.clone()),
            Value::Array(items) => TreeNode::array(items.iter().map(TreeNode::from_value).collect()),
            Value::Object(map) => TreeNode::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), TreeNode::from_value(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TreeNode::Null, TreeNode::Null) => true,
            (TreeNode::Bool(a), TreeNode::Bool(b)) => a == b,
            (TreeNode::Number(a), TreeNode::Number(b)) => a == b,
            (TreeNode::String(a), TreeNode::String(b)) => a == b,
            (TreeNode::Json(a), TreeNode::Json(b)) => a == b,
            (TreeNode::Array(a), TreeNode::Array(b)) => a == b,
            (TreeNode::Object(a), TreeNode::Object(b)) => a == b,
            // Json leaves compare structurally against plain scalars too,
            // so deep equality is representation-independent.
            (TreeNode::Json(a), other) | (other, TreeNode::Json(a)) => {
                other.to_value() == **a
            }
            _ => false,
        }
    }
}

impl PartialEq<Value> for TreeNode {
    fn eq(&self, other: &Value) -> bool {
        self.to_value() == *other
    }
}

impl serde::Serialize for TreeNode {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            TreeNode::Null => s.serialize_unit(),
            TreeNode::Bool(b) => s.serialize_bool(*b),
            TreeNode::Number(n) => n.serialize(s),
            TreeNode::String(v) => s.serialize_str(v),
            TreeNode::Json(v) => v.serialize(s),
            TreeNode::Array(items) => {
                let mut seq = s.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            TreeNode::Object(map) => {
                let mut out = s.serialize_map(Some(map.len()))?;
                for (key, value) in map.iter() {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn value_round_trip() {
        let value = json!({
            "user": {"id": "u1", "scores": [1, 2.5, null], "active": true},
            "empty": {},
        });
        let tree = TreeNode::from_value(&value);
        assert_eq!(tree.to_value(), value);
        assert_eq!(serde_json::to_value(&tree).unwrap(), value);
    }

    #[test]
    fn ptr_eq_tracks_shared_containers() {
        let a = TreeNode::object(BTreeMap::from([(
            "x".to_string(),
            TreeNode::Bool(true),
        )]));
        let b = a.clone();
        let c = TreeNode::from_value(&a.to_value());

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        // Deep equality still holds for the rebuilt tree.
        assert_eq!(a, c);
    }

    #[test]
    fn undefined_is_absence() {
        let tree = TreeNode::from_value(&json!({"bio": null}));
        assert_eq!(tree.get("bio"), Some(&TreeNode::Null));
        assert_eq!(tree.get("missing"), None);
    }
}
