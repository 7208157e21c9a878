use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Key of a record in the graph.
///
/// Keys are interned strings, cheap to clone and to use as map keys. The key
/// families are: the root (`@`), entities (`TypeName:id`), concrete connection
/// pages (`@.<parent?>.<field>(<args>)`), canonical connections
/// (`@connection.<parent?>.<key>(<filters>)`), and derived sub-records
/// (edges, pageInfo, inline containers, list items).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey(Arc<str>);

impl RecordKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The root record key.
    pub fn root() -> Self {
        Self(Arc::from("@"))
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == "@"
    }

    /// Whether this key names a canonical connection record or one of its
    /// sub-records.
    pub fn is_canonical(&self) -> bool {
        self.0.starts_with("@connection.")
    }

    /// Whether this key names a concrete connection page or one of its
    /// sub-records.
    pub fn is_page(&self) -> bool {
        self.0.starts_with("@.")
    }

    /// Entity key for a typename and id, e.g. `User:u1`.
    pub fn entity(typename: &str, id: &str) -> Self {
        Self(Arc::from(format!("{typename}:{id}").as_str()))
    }

    /// Derived sub-record key under a parent, e.g. `User:u1.address`.
    pub fn derived(parent: &RecordKey, segment: &str) -> Self {
        Self(Arc::from(format!("{parent}.{segment}").as_str()))
    }

    /// Derived key for an indexed list item, e.g. `@.posts({}).edges.3`.
    pub fn indexed(parent: &RecordKey, segment: &str, index: usize) -> Self {
        Self(Arc::from(format!("{parent}.{segment}.{index}").as_str()))
    }

    /// The `TypeName` prefix of an entity key, when the key has one.
    pub fn typename(&self) -> Option<&str> {
        if self.is_root() || self.is_page() || self.is_canonical() {
            return None;
        }
        self.0.split_once(':').map(|(typename, _)| typename)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", &self.0)
    }
}

impl Borrow<str> for RecordKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RecordKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key.as_str()))
    }
}

/// A single stored field value.
///
/// Scalars are stored as typed values. Fields selected without a child
/// selection store their raw JSON subvalue as [`FieldValue::Json`]; the graph
/// owns that value after the write. Links are replaced atomically, never
/// deep-merged.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Opaque JSON subvalue for a field with no selection.
    Json(Value),
    /// Reference to another record.
    Link(RecordKey),
    /// Ordered references; `None` entries preserve explicit list nulls.
    Links(Vec<Option<RecordKey>>),
}

impl FieldValue {
    /// Convert a scalar or opaque JSON value into its stored form.
    /// Objects and arrays become opaque [`FieldValue::Json`].
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => FieldValue::Number(n.clone()),
            Value::String(s) => FieldValue::String(s.clone()),
            composite => FieldValue::Json(composite.clone()),
        }
    }

    /// Render the value back to JSON. Links render as `{"__ref": key}` and
    /// link lists as `{"__refs": [...]}`, matching the wire shape of the
    /// normalized store.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => Value::Number(n.clone()),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Json(v) => v.clone(),
            FieldValue::Link(key) => {
                serde_json::json!({ "__ref": key.as_str() })
            }
            FieldValue::Links(keys) => {
                let refs: Vec<Value> = keys
                    .iter()
                    .map(|k| match k {
                        Some(key) => Value::String(key.as_str().to_string()),
                        None => Value::Null,
                    })
                    .collect();
                serde_json::json!({ "__refs": refs })
            }
        }
    }

    pub fn as_link(&self) -> Option<&RecordKey> {
        match self {
            FieldValue::Link(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&[Option<RecordKey>]> {
        match self {
            FieldValue::Links(keys) => Some(keys),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A patch of fields to merge into (or replace within) a record.
pub type RecordPatch = BTreeMap<String, FieldValue>;

/// A flat record: sorted field keys to field values. The unit of versioning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FieldValue>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field_key: &str) -> Option<&FieldValue> {
        self.fields.get(field_key)
    }

    pub fn typename(&self) -> Option<&str> {
        self.get("__typename").and_then(FieldValue::as_str)
    }

    /// Merge `patch` into the record. Returns true when any field value
    /// actually changed. Links and link lists replace atomically.
    pub fn merge(&mut self, patch: RecordPatch) -> bool {
        let mut changed = false;
        for (field_key, value) in patch {
            match self.fields.get(&field_key) {
                Some(existing) if *existing == value => {}
                _ => {
                    self.fields.insert(field_key, value);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Replace the record's fields wholesale. Returns true on any change.
    pub fn replace(&mut self, fields: BTreeMap<String, FieldValue>) -> bool {
        if self.fields == fields {
            return false;
        }
        self.fields = fields;
        true
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render the record as a JSON object, links included in their
    /// `__ref`/`__refs` wire shape.
    pub fn to_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }
}

/// Parse a JSON object into a record patch. `{"__ref": ...}` and
/// `{"__refs": [...]}` objects become links; other composites stay opaque.
pub fn patch_from_json(object: &serde_json::Map<String, Value>) -> RecordPatch {
    object
        .iter()
        .map(|(field_key, value)| (field_key.clone(), field_value_from_json(value)))
        .collect()
}

fn field_value_from_json(value: &Value) -> FieldValue {
    if let Value::Object(map) = value {
        if map.len() == 1 {
            if let Some(Value::String(key)) = map.get("__ref") {
                return FieldValue::Link(RecordKey::new(key));
            }
            if let Some(Value::Array(refs)) = map.get("__refs") {
                let keys = refs
                    .iter()
                    .map(|r| match r {
                        Value::String(key) => Some(RecordKey::new(key)),
                        _ => None,
                    })
                    .collect();
                return FieldValue::Links(keys);
            }
        }
    }
    FieldValue::from_json(value)
}
