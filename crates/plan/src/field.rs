use std::sync::Arc;

use fxhash::FxHashMap;
use serde_json::Value;

use crate::Variables;

/// Where a field argument's value comes from at request time.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgSource {
    /// Resolved from the request variables by name. An absent variable means
    /// the argument is omitted entirely, which is distinct from a `null`
    /// variable value.
    Variable(String),
    /// A literal baked in by the compiler.
    Literal(Value),
}

/// One declared argument of a field. Declaration order is significant: key
/// serialization renders top-level arguments in this order.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgPlan {
    pub name: String,
    pub source: ArgSource,
}

/// How a paginated field folds its pages into the canonical view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// The canonical view is the deterministic union of every page seen.
    #[default]
    Infinite,
    /// The canonical view is exactly the latest page.
    Page,
}

/// A single selected field within a plan.
#[derive(Debug)]
pub struct FieldPlan {
    /// Key under which the field appears in the response tree. Differs from
    /// `field_name` when the document aliases the field.
    pub response_key: String,
    /// Schema field name, used for record field keys.
    pub field_name: String,
    /// Declared arguments, in declaration order.
    pub args: Vec<ArgPlan>,
    /// Child selection, when the field selects into an object.
    pub selection: Option<SelectionSet>,
    /// Inline-fragment type condition gating this field.
    pub type_condition: Option<String>,
    /// Whether the field is a paginated connection.
    pub is_connection: bool,
    /// Argument names participating in the canonical connection identity.
    /// `None` means every non-pagination argument participates.
    pub connection_filters: Option<Vec<String>>,
    /// Stable connection name overriding the field name in canonical keys.
    pub connection_key: Option<String>,
    pub connection_mode: ConnectionMode,
}

impl FieldPlan {
    /// Evaluate the field's arguments against request variables, preserving
    /// declaration order. Arguments whose variable is absent are omitted.
    pub fn evaluate_args(&self, vars: &Variables) -> Vec<(&str, Value)> {
        let mut out = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            match &arg.source {
                ArgSource::Variable(name) => {
                    if let Some(value) = vars.get(name) {
                        out.push((arg.name.as_str(), value.clone()));
                    }
                }
                ArgSource::Literal(value) => out.push((arg.name.as_str(), value.clone())),
            }
        }
        out
    }

    /// Whether `name` is one of the conventional pagination arguments, which
    /// never participate in canonical connection identity.
    pub fn is_pagination_arg(name: &str) -> bool {
        matches!(name, "first" | "last" | "after" | "before")
    }
}

/// An ordered selection of fields plus a response-key lookup map.
#[derive(Debug)]
pub struct SelectionSet {
    fields: Vec<Arc<FieldPlan>>,
    by_response_key: FxHashMap<String, usize>,
}

impl SelectionSet {
    pub fn new(fields: Vec<Arc<FieldPlan>>) -> Self {
        let by_response_key = fields
            .iter()
            .enumerate()
            .map(|(index, field)| (field.response_key.clone(), index))
            .collect();
        Self {
            fields,
            by_response_key,
        }
    }

    pub fn build<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = crate::FieldBuilder>,
    {
        Self::new(fields.into_iter().map(|b| Arc::new(b.build())).collect())
    }

    pub fn fields(&self) -> &[Arc<FieldPlan>] {
        &self.fields
    }

    /// Look up a field by its response key. Lookups hit the map; iteration
    /// preserves document order.
    pub fn field(&self, response_key: &str) -> Option<&Arc<FieldPlan>> {
        self.by_response_key
            .get(response_key)
            .map(|&index| &self.fields[index])
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{field, variables};
    use serde_json::json;

    #[test]
    fn args_evaluate_in_declared_order() {
        let f = field("posts")
            .arg_var("category", "cat")
            .arg_var("first", "n")
            .build();

        let vars = variables(json!({"n": 2, "cat": "tech"}));
        let args = f.evaluate_args(&vars);
        assert_eq!(
            args,
            vec![("category", json!("tech")), ("first", json!(2))],
        );
    }

    #[test]
    fn absent_variable_omits_argument_but_null_does_not() {
        let f = field("posts")
            .arg_var("after", "cursor")
            .arg_lit("first", json!(10))
            .build();

        let args = f.evaluate_args(&variables(json!({})));
        assert_eq!(args, vec![("first", json!(10))]);

        let args = f.evaluate_args(&variables(json!({"cursor": null})));
        assert_eq!(args, vec![("after", json!(null)), ("first", json!(10))]);
    }

    #[test]
    fn selection_lookup_by_response_key() {
        let sel = SelectionSet::build([field("id"), field("name").alias("displayName")]);
        assert_eq!(sel.len(), 2);
        assert_eq!(sel.field("displayName").unwrap().field_name, "name");
        assert!(sel.field("name").is_none());
    }

    #[test]
    fn pagination_args_are_fixed() {
        for name in ["first", "last", "after", "before"] {
            assert!(FieldPlan::is_pagination_arg(name));
        }
        assert!(!FieldPlan::is_pagination_arg("category"));
    }
}
