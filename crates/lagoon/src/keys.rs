//! Stable string identities for fields, pages, and canonical connections.
//!
//! All JSON rendered into keys is deterministic: top-level argument order is
//! dictated by the field's declaration, nested objects sort their keys
//! lexicographically, and absent arguments are omitted. Two variable maps
//! carrying the same values always produce the same key, regardless of
//! iteration order.

use std::fmt::Write;

use plan::{FieldPlan, Variables};
use serde_json::Value;

use crate::record::RecordKey;

/// Render a JSON value with all object keys sorted, recursively.
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_stable(&mut out, value);
    out
}

fn write_stable(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_stable(out, &map[*key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(out, item);
            }
            out.push(']');
        }
        scalar => {
            // Scalars serialize identically regardless of context.
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_json_string(out: &mut String, s: &str) {
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

/// Render evaluated arguments as a JSON object, preserving the given
/// (declared) top-level order and sorting nested objects.
fn args_json(args: &[(&str, Value)]) -> String {
    let mut out = String::new();
    out.push('{');
    for (i, (name, value)) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_json_string(&mut out, name);
        out.push(':');
        write_stable(&mut out, value);
    }
    out.push('}');
    out
}

/// Field key under a record: `fieldName` when no arguments evaluate to a
/// value, otherwise `fieldName({argsJSON})`.
pub fn field_key(field: &FieldPlan, vars: &Variables) -> String {
    let args = field.evaluate_args(vars);
    if args.is_empty() {
        field.field_name.clone()
    } else {
        format!("{}({})", field.field_name, args_json(&args))
    }
}

/// Concrete page key for a connection field:
/// `@.{parent}.{fieldKey}`, with the parent segment omitted at the root.
pub fn page_key(field: &FieldPlan, parent: &RecordKey, vars: &Variables) -> RecordKey {
    let field_key = field_key(field, vars);
    if parent.is_root() {
        RecordKey::from(format!("@.{field_key}"))
    } else {
        RecordKey::from(format!("@.{parent}.{field_key}"))
    }
}

/// Canonical connection key:
/// `@connection.{parent?}.{connectionKey || fieldName}({filtersJSON})`.
///
/// Filters are the field's declared connection filters, defaulting to every
/// non-pagination argument; `first`, `last`, `after` and `before` are
/// excluded unconditionally even when declared as filters.
pub fn canonical_key(field: &FieldPlan, parent: &RecordKey, vars: &Variables) -> RecordKey {
    let args = field.evaluate_args(vars);

    let mut filters: Vec<(&str, Value)> = match &field.connection_filters {
        Some(declared) => args
            .into_iter()
            .filter(|(name, _)| {
                !FieldPlan::is_pagination_arg(name) && declared.iter().any(|f| f == *name)
            })
            .collect(),
        None => args
            .into_iter()
            .filter(|(name, _)| !FieldPlan::is_pagination_arg(name))
            .collect(),
    };
    // Filter identity is order-independent.
    filters.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

    let name = field
        .connection_key
        .as_deref()
        .unwrap_or(&field.field_name);

    if parent.is_root() {
        RecordKey::from(format!("@connection.{name}({})", args_json(&filters)))
    } else {
        RecordKey::from(format!(
            "@connection.{parent}.{name}({})",
            args_json(&filters)
        ))
    }
}

/// Canonical key assembled from raw parts, used by the optimistic connection
/// editor where no plan field is in scope.
pub fn canonical_key_from_parts(
    parent: Option<&RecordKey>,
    name: &str,
    filters: &Value,
) -> RecordKey {
    let filters = match filters {
        Value::Null => "{}".to_string(),
        other => stable_json(other),
    };
    match parent {
        Some(parent) if !parent.is_root() => {
            RecordKey::from(format!("@connection.{parent}.{name}({filters})"))
        }
        _ => RecordKey::from(format!("@connection.{name}({filters})")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use plan::{field, variables};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn stable_json_sorts_nested_objects() {
        let value = json!({"b": {"z": 1, "a": [{"y": 2, "x": 3}]}, "a": true});
        assert_eq!(
            stable_json(&value),
            r#"{"a":true,"b":{"a":[{"x":3,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn field_key_orders_args_by_declaration() {
        let f = field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .build();

        // Same values, different variable-map insertion order.
        let v1 = variables(json!({"category": "tech", "first": 2}));
        let mut v2 = plan::Variables::new();
        v2.insert("first".into(), json!(2));
        v2.insert("category".into(), json!("tech"));

        let k1 = field_key(&f, &v1);
        let k2 = field_key(&f, &v2);
        assert_eq!(k1, k2);
        assert_eq!(k1, r#"posts({"category":"tech","first":2})"#);
    }

    #[test]
    fn field_key_without_args_is_bare() {
        let f = field("viewer").build();
        assert_eq!(field_key(&f, &variables(json!({}))), "viewer");

        // Declared args that are all absent also reduce to bare.
        let f = field("viewer").arg_var("locale", "locale").build();
        assert_eq!(field_key(&f, &variables(json!({}))), "viewer");
    }

    #[test]
    fn page_key_omits_root_parent() {
        let f = field("posts").arg_var("first", "first").connection().build();
        let vars = variables(json!({"first": 2}));

        assert_eq!(
            page_key(&f, &RecordKey::root(), &vars).as_str(),
            r#"@.posts({"first":2})"#
        );
        assert_eq!(
            page_key(&f, &RecordKey::entity("User", "u1"), &vars).as_str(),
            r#"@.User:u1.posts({"first":2})"#
        );
    }

    #[test]
    fn canonical_key_excludes_pagination_args() {
        let f = field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .arg_var("after", "after")
            .connection()
            .build();
        let vars = variables(json!({"category": "tech", "first": 2, "after": "p2"}));

        assert_eq!(
            canonical_key(&f, &RecordKey::root(), &vars).as_str(),
            r#"@connection.posts({"category":"tech"})"#
        );
    }

    #[test]
    fn canonical_key_pagination_excluded_even_when_declared_as_filter() {
        let f = field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .connection_filters(["category", "first"])
            .build();
        let vars = variables(json!({"category": "tech", "first": 2}));

        assert_eq!(
            canonical_key(&f, &RecordKey::root(), &vars).as_str(),
            r#"@connection.posts({"category":"tech"})"#
        );
    }

    #[test]
    fn canonical_key_uses_connection_key_and_parent() {
        let f = field("items")
            .arg_var("kind", "kind")
            .connection_key("inventory")
            .build();
        let vars = variables(json!({"kind": "tool"}));

        assert_eq!(
            canonical_key(&f, &RecordKey::entity("Shop", "s1"), &vars).as_str(),
            r#"@connection.Shop:s1.inventory({"kind":"tool"})"#
        );
    }

    #[test]
    fn key_shapes() {
        let f = field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .connection_filters(["category"])
            .build();
        let vars = variables(json!({"category": "tech", "first": 2}));

        insta::assert_snapshot!(
            page_key(&f, &RecordKey::root(), &vars),
            @r#"@.posts({"category":"tech","first":2})"#
        );
        insta::assert_snapshot!(
            canonical_key(&f, &RecordKey::entity("User", "u1"), &vars),
            @r#"@connection.User:u1.posts({"category":"tech"})"#
        );
    }

    #[test]
    fn canonical_key_from_parts_matches_plan_form() {
        let f = field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .connection_filters(["category"])
            .build();
        let vars = variables(json!({"category": "tech", "first": 2}));

        let from_plan = canonical_key(&f, &RecordKey::root(), &vars);
        let from_parts =
            canonical_key_from_parts(None, "posts", &json!({"category": "tech"}));
        assert_eq!(from_plan, from_parts);
    }
}
