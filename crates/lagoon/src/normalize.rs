//! Normalization: decompose a response tree into flat, keyed records.
//!
//! The walk is depth-first over the response data, guided by the plan's
//! selection tree. Each visited object accumulates one record patch and is
//! written with a single `put`, so a record's version bumps at most once per
//! object visit. Connection pages are recorded as canonical jobs and folded
//! into their canonical views by the caller after the walk, in write order.

use plan::{ConnectionMode, Document, FieldPlan, OperationKind, SelectionSet, Variables};
use serde_json::Value;

use crate::canonical::{detect_role, PageHint};
use crate::config::CacheConfig;
use crate::error::Error;
use crate::graph::Graph;
use crate::keys;
use crate::record::{FieldValue, RecordKey, RecordPatch};

/// A connection page written during normalization, to be folded into its
/// canonical view once the walk completes.
#[derive(Debug)]
pub struct CanonicalJob {
    pub canonical: RecordKey,
    pub page: RecordKey,
    pub role: PageHint,
    pub mode: ConnectionMode,
}

/// Normalize `data` for `document`, rooted at `root` (the root record for
/// queries and mutations, an entity for fragments). Returns the canonical
/// jobs collected along the walk.
pub fn normalize_document(
    graph: &mut Graph,
    config: &CacheConfig,
    document: &Document,
    vars: &Variables,
    data: &Value,
    root: RecordKey,
) -> Result<Vec<CanonicalJob>, Error> {
    let Some(object) = data.as_object() else {
        return Ok(Vec::new());
    };
    let mut normalizer = Normalizer {
        graph,
        config,
        vars,
        jobs: Vec::new(),
    };
    // Mutations update entity bodies without rewriting the root shape:
    // no links are attached to the mutation root itself.
    let link_root = document.operation() != OperationKind::Mutation;
    normalizer.walk(root, document.root(), object, link_root)?;
    Ok(normalizer.jobs)
}

struct Normalizer<'a> {
    graph: &'a mut Graph,
    config: &'a CacheConfig,
    vars: &'a Variables,
    jobs: Vec<CanonicalJob>,
}

impl Normalizer<'_> {
    /// Write one object's fields into the record at `key`, recursing into
    /// children. `link_fields` is false only at a mutation root.
    fn walk(
        &mut self,
        key: RecordKey,
        selection: &SelectionSet,
        object: &serde_json::Map<String, Value>,
        link_fields: bool,
    ) -> Result<(), Error> {
        let mut patch = RecordPatch::new();
        self.stamp_typename(&key, object, &mut patch);

        for field in selection.fields() {
            if !self.type_condition_matches(field, object) {
                continue;
            }
            let Some(value) = object.get(&field.response_key) else {
                continue;
            };
            self.visit_field(&key, field, value, link_fields, &mut patch)?;
        }
        self.graph.put(&key, patch);
        Ok(())
    }

    fn visit_field(
        &mut self,
        parent: &RecordKey,
        field: &FieldPlan,
        value: &Value,
        link_fields: bool,
        patch: &mut RecordPatch,
    ) -> Result<(), Error> {
        let field_key = keys::field_key(field, self.vars);

        if field.is_connection {
            if let Some(object) = value.as_object() {
                let page_key = self.walk_page(parent, field, object)?;
                if link_fields {
                    patch.insert(field_key, FieldValue::Link(page_key));
                }
                return Ok(());
            }
            // A null (or otherwise non-object) connection value falls
            // through and is stored like any other field value.
        }

        let Some(child_selection) = &field.selection else {
            // A field with no selection stores its raw value, objects and
            // arrays included, as an opaque subvalue.
            patch.insert(field_key, FieldValue::from_json(value));
            return Ok(());
        };

        match value {
            // An explicit null is a stored value, distinct from missing.
            Value::Null => {
                patch.insert(field_key, FieldValue::Null);
            }
            Value::Object(object) => {
                let child_key = match self.config.identify(value) {
                    Some(entity) => entity,
                    None => {
                        tracing::warn!(
                            parent = %parent,
                            field = %field_key,
                            "object is unidentifiable, using a derived container key",
                        );
                        RecordKey::derived(parent, &field_key)
                    }
                };
                self.walk(child_key.clone(), child_selection, object, true)?;
                if link_fields {
                    patch.insert(field_key, FieldValue::Link(child_key));
                }
            }
            Value::Array(items) => {
                let mut refs = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    match item {
                        Value::Null => refs.push(None),
                        Value::Object(object) => {
                            let child_key = self
                                .config
                                .identify(item)
                                .unwrap_or_else(|| RecordKey::indexed(parent, &field_key, index));
                            self.walk(child_key.clone(), child_selection, object, true)?;
                            refs.push(Some(child_key));
                        }
                        other => {
                            tracing::warn!(
                                parent = %parent,
                                field = %field_key,
                                index,
                                "non-object item in a selected list, dropped: {other}",
                            );
                            refs.push(None);
                        }
                    }
                }
                if link_fields {
                    patch.insert(field_key, FieldValue::Links(refs));
                }
            }
            scalar => {
                // A scalar where a selection was planned: store it as data.
                patch.insert(field_key, FieldValue::from_json(scalar));
            }
        }
        Ok(())
    }

    /// Write a connection page: the page record, its edge and pageInfo
    /// sub-records, and a canonical job for the post-pass.
    fn walk_page(
        &mut self,
        parent: &RecordKey,
        field: &FieldPlan,
        object: &serde_json::Map<String, Value>,
    ) -> Result<RecordKey, Error> {
        let page_key = keys::page_key(field, parent, self.vars);
        let canonical = keys::canonical_key(field, parent, self.vars);
        let selection = field.selection.as_ref().ok_or_else(|| Error::Plan {
            response_key: field.response_key.clone(),
        })?;

        let mut patch = RecordPatch::new();
        self.stamp_typename(&page_key, object, &mut patch);

        for sub in selection.fields() {
            let Some(value) = object.get(&sub.response_key) else {
                continue;
            };
            match (sub.field_name.as_str(), value) {
                ("edges", Value::Array(items)) => {
                    let edge_selection = sub.selection.as_ref().ok_or_else(|| Error::Plan {
                        response_key: sub.response_key.clone(),
                    })?;
                    let mut refs = Vec::with_capacity(items.len());
                    for (index, item) in items.iter().enumerate() {
                        match item {
                            Value::Object(edge) => {
                                let edge_key = RecordKey::indexed(&page_key, "edges", index);
                                self.walk_edge(&edge_key, edge_selection, edge)?;
                                refs.push(Some(edge_key));
                            }
                            _ => refs.push(None),
                        }
                    }
                    patch.insert(keys::field_key(sub, self.vars), FieldValue::Links(refs));
                }
                ("pageInfo", Value::Object(info)) => {
                    let info_selection = sub.selection.as_ref().ok_or_else(|| Error::Plan {
                        response_key: sub.response_key.clone(),
                    })?;
                    let info_key = RecordKey::derived(&page_key, "pageInfo");
                    self.walk(info_key.clone(), info_selection, info, true)?;
                    patch.insert(keys::field_key(sub, self.vars), FieldValue::Link(info_key));
                }
                _ => self.visit_field(&page_key, sub, value, true, &mut patch)?,
            }
        }
        self.graph.put(&page_key, patch);

        let role = detect_role(&field.evaluate_args(self.vars));
        self.jobs.push(CanonicalJob {
            canonical,
            page: page_key.clone(),
            role,
            mode: field.connection_mode,
        });
        Ok(page_key)
    }

    fn walk_edge(
        &mut self,
        edge_key: &RecordKey,
        selection: &SelectionSet,
        edge: &serde_json::Map<String, Value>,
    ) -> Result<(), Error> {
        let mut patch = RecordPatch::new();
        self.stamp_typename(edge_key, edge, &mut patch);

        for field in selection.fields() {
            let Some(value) = edge.get(&field.response_key) else {
                continue;
            };
            if field.field_name == "node" {
                match value {
                    Value::Null => {
                        patch.insert(keys::field_key(field, self.vars), FieldValue::Null);
                    }
                    Value::Object(node) => {
                        let node_selection =
                            field.selection.as_ref().ok_or_else(|| Error::Plan {
                                response_key: field.response_key.clone(),
                            })?;
                        let node_key = match self.config.identify(value) {
                            Some(entity) => entity,
                            None => {
                                tracing::warn!(
                                    edge = %edge_key,
                                    "edge node is unidentifiable, using a derived key",
                                );
                                RecordKey::derived(edge_key, "node")
                            }
                        };
                        self.walk(node_key.clone(), node_selection, node, true)?;
                        patch.insert(
                            keys::field_key(field, self.vars),
                            FieldValue::Link(node_key),
                        );
                    }
                    other => {
                        patch.insert(
                            keys::field_key(field, self.vars),
                            FieldValue::from_json(other),
                        );
                    }
                }
            } else {
                self.visit_field(edge_key, field, value, true, &mut patch)?;
            }
        }
        self.graph.put(edge_key, patch);
        Ok(())
    }

    fn stamp_typename(
        &self,
        key: &RecordKey,
        object: &serde_json::Map<String, Value>,
        patch: &mut RecordPatch,
    ) {
        let Some(typename) = object.get("__typename").and_then(Value::as_str) else {
            return;
        };
        if let Some(existing) = self.graph.record(key).and_then(|r| r.typename()) {
            if existing != typename {
                // Internal error: the same key cannot change type. Overwrite,
                // loudly.
                tracing::error!(
                    key = %key,
                    existing,
                    incoming = typename,
                    "__typename mismatch on existing record, overwriting",
                );
            }
        }
        patch.insert(
            "__typename".to_string(),
            FieldValue::String(typename.to_string()),
        );
    }

    fn type_condition_matches(
        &self,
        field: &FieldPlan,
        object: &serde_json::Map<String, Value>,
    ) -> bool {
        let Some(condition) = &field.type_condition else {
            return true;
        };
        let Some(typename) = object.get("__typename").and_then(Value::as_str) else {
            return false;
        };
        self.config.matches_type(condition, typename)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use plan::{field, variables};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn normalize(
        graph: &mut Graph,
        document: &Document,
        vars: &Variables,
        data: Value,
    ) -> Vec<CanonicalJob> {
        let config = CacheConfig::new().validate().unwrap();
        normalize_document(graph, &config, document, vars, &data, RecordKey::root()).unwrap()
    }

    #[test]
    fn entity_fields_flatten_into_records() {
        let mut graph = Graph::new();
        let document = Document::query([field("user")
            .arg_var("id", "id")
            .select([field("__typename"), field("id"), field("email")])]);
        let vars = variables(json!({"id": "u1"}));

        normalize(
            &mut graph,
            &document,
            &vars,
            json!({"user": {"__typename": "User", "id": "u1", "email": "a@x"}}),
        );

        let root = graph.record(&RecordKey::root()).unwrap();
        assert_eq!(
            root.get(r#"user({"id":"u1"})"#),
            Some(&FieldValue::Link(RecordKey::entity("User", "u1")))
        );
        let user = graph.record(&RecordKey::entity("User", "u1")).unwrap();
        assert_eq!(user.get("email"), Some(&FieldValue::String("a@x".into())));
        assert_eq!(user.typename(), Some("User"));
    }

    #[test]
    fn null_fields_are_stored_not_skipped() {
        let mut graph = Graph::new();
        let document = Document::query([field("user")
            .select([field("__typename"), field("id"), field("bio").select([field("text")])])]);

        normalize(
            &mut graph,
            &document,
            &Variables::new(),
            json!({"user": {"__typename": "User", "id": "u1", "bio": null}}),
        );

        let user = graph.record(&RecordKey::entity("User", "u1")).unwrap();
        assert_eq!(user.get("bio"), Some(&FieldValue::Null));
    }

    #[test]
    fn unidentifiable_objects_fall_back_to_derived_containers() {
        let mut graph = Graph::new();
        let document = Document::query([field("settings").select([field("theme")])]);

        normalize(
            &mut graph,
            &document,
            &Variables::new(),
            json!({"settings": {"theme": "dark"}}),
        );

        let container = RecordKey::new("@.settings");
        assert_eq!(
            graph.record(&RecordKey::root()).unwrap().get("settings"),
            Some(&FieldValue::Link(container.clone()))
        );
        assert_eq!(
            graph.record(&container).unwrap().get("theme"),
            Some(&FieldValue::String("dark".into()))
        );
    }

    #[test]
    fn selected_lists_mix_entities_and_derived_keys() {
        let mut graph = Graph::new();
        let document = Document::query([field("user").select([
            field("__typename"),
            field("id"),
            field("badges").select([field("__typename"), field("id"), field("label")]),
        ])]);

        normalize(
            &mut graph,
            &document,
            &Variables::new(),
            json!({"user": {"__typename": "User", "id": "u1", "badges": [
                {"__typename": "Badge", "id": "b1", "label": "x"},
                null,
                {"__typename": "Badge", "label": "anon"},
            ]}}),
        );

        let user = graph.record(&RecordKey::entity("User", "u1")).unwrap();
        assert_eq!(
            user.get("badges"),
            Some(&FieldValue::Links(vec![
                Some(RecordKey::entity("Badge", "b1")),
                None,
                Some(RecordKey::new("User:u1.badges.2")),
            ]))
        );
    }

    #[test]
    fn raw_json_is_stored_for_unselected_fields() {
        let mut graph = Graph::new();
        let document = Document::query([field("user").select([
            field("__typename"),
            field("id"),
            field("meta"),
        ])]);

        normalize(
            &mut graph,
            &document,
            &Variables::new(),
            json!({"user": {"__typename": "User", "id": "u1", "meta": {"tags": ["a"]}}}),
        );

        let user = graph.record(&RecordKey::entity("User", "u1")).unwrap();
        assert_eq!(
            user.get("meta"),
            Some(&FieldValue::Json(json!({"tags": ["a"]})))
        );
    }

    #[test]
    fn connection_pages_produce_records_and_jobs() {
        let mut graph = Graph::new();
        let document = Document::query([field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .arg_var("after", "after")
            .connection_filters(["category"])
            .select([
                field("__typename"),
                field("edges").select([
                    field("cursor"),
                    field("node").select([field("__typename"), field("id"), field("title")]),
                ]),
                field("pageInfo").select([
                    field("startCursor"),
                    field("endCursor"),
                    field("hasNextPage"),
                ]),
            ])]);
        let vars = variables(json!({"category": "tech", "first": 2}));

        let jobs = normalize(
            &mut graph,
            &document,
            &vars,
            json!({"posts": {
                "__typename": "PostConnection",
                "edges": [
                    {"cursor": "p1", "node": {"__typename": "Post", "id": "p1", "title": "one"}},
                    {"cursor": "p2", "node": {"__typename": "Post", "id": "p2", "title": "two"}},
                ],
                "pageInfo": {"startCursor": "p1", "endCursor": "p2", "hasNextPage": true},
            }}),
        );

        let page_key = RecordKey::new(r#"@.posts({"category":"tech","first":2})"#);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].page, page_key);
        assert_eq!(
            jobs[0].canonical,
            RecordKey::new(r#"@connection.posts({"category":"tech"})"#)
        );
        assert_eq!(jobs[0].role, PageHint::Leader);

        let page = graph.record(&page_key).unwrap();
        assert_eq!(
            page.get("edges"),
            Some(&FieldValue::Links(vec![
                Some(RecordKey::indexed(&page_key, "edges", 0)),
                Some(RecordKey::indexed(&page_key, "edges", 1)),
            ]))
        );
        let edge0 = graph.record(&RecordKey::indexed(&page_key, "edges", 0)).unwrap();
        assert_eq!(
            edge0.get("node"),
            Some(&FieldValue::Link(RecordKey::entity("Post", "p1")))
        );
        assert_eq!(edge0.get("cursor"), Some(&FieldValue::String("p1".into())));
        let info = graph
            .record(&RecordKey::derived(&page_key, "pageInfo"))
            .unwrap();
        assert_eq!(info.get("hasNextPage"), Some(&FieldValue::Bool(true)));

        // The root links to the concrete page.
        assert_eq!(
            graph
                .record(&RecordKey::root())
                .unwrap()
                .get(r#"posts({"category":"tech","first":2})"#),
            Some(&FieldValue::Link(page_key))
        );
    }

    #[test]
    fn after_pages_detect_their_role() {
        let mut graph = Graph::new();
        let document = Document::query([field("posts")
            .arg_var("first", "first")
            .arg_var("after", "after")
            .connection()
            .select([
                field("edges").select([field("node").select([field("__typename"), field("id")])]),
            ])]);
        let vars = variables(json!({"first": 2, "after": "p2"}));

        let jobs = normalize(
            &mut graph,
            &document,
            &vars,
            json!({"posts": {"edges": []}}),
        );
        assert_eq!(jobs[0].role, PageHint::After);
    }

    #[test]
    fn mutation_roots_do_not_link() {
        let mut graph = Graph::new();
        let document = Document::mutation([field("updateUser")
            .select([field("__typename"), field("id"), field("email")])]);

        let config = CacheConfig::new().validate().unwrap();
        normalize_document(
            &mut graph,
            &config,
            &document,
            &Variables::new(),
            &json!({"updateUser": {"__typename": "User", "id": "u1", "email": "new@x"}}),
            RecordKey::root(),
        )
        .unwrap();

        // The entity body landed.
        assert_eq!(
            graph
                .record(&RecordKey::entity("User", "u1"))
                .unwrap()
                .get("email"),
            Some(&FieldValue::String("new@x".into()))
        );
        // The root gained no link for the mutation field.
        let root = graph.record(&RecordKey::root());
        assert!(root.map_or(true, |r| r.get("updateUser").is_none()));
    }

    #[test]
    fn fragment_roots_write_into_the_entity() {
        let mut graph = Graph::new();
        let document = Document::fragment([field("__typename"), field("id"), field("email")]);
        let config = CacheConfig::new().validate().unwrap();

        normalize_document(
            &mut graph,
            &config,
            &document,
            &Variables::new(),
            &json!({"__typename": "User", "id": "u1", "email": "frag@x"}),
            RecordKey::entity("User", "u1"),
        )
        .unwrap();

        assert_eq!(
            graph
                .record(&RecordKey::entity("User", "u1"))
                .unwrap()
                .get("email"),
            Some(&FieldValue::String("frag@x".into()))
        );
    }

    #[test]
    fn type_conditions_gate_normalization() {
        let mut graph = Graph::new();
        let document = Document::query([field("media").select([
            field("__typename"),
            field("id"),
            field("duration").on("VideoPost"),
            field("transcript").on("AudioPost"),
        ])]);

        normalize(
            &mut graph,
            &document,
            &Variables::new(),
            json!({"media": {"__typename": "VideoPost", "id": "v1", "duration": 120}}),
        );

        let video = graph.record(&RecordKey::entity("VideoPost", "v1")).unwrap();
        assert_eq!(video.get("duration"), Some(&FieldValue::Number(120.into())));
        assert_eq!(video.get("transcript"), None);
    }
}
