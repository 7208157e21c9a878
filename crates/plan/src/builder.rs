use serde_json::Value;

use crate::field::{ArgPlan, ArgSource, ConnectionMode, FieldPlan, SelectionSet};

/// Start building a field selecting `name`.
pub fn field(name: impl Into<String>) -> FieldBuilder {
    let name = name.into();
    FieldBuilder {
        response_key: name.clone(),
        field_name: name,
        args: Vec::new(),
        selection: None,
        type_condition: None,
        is_connection: false,
        connection_filters: None,
        connection_key: None,
        connection_mode: ConnectionMode::Infinite,
    }
}

/// Fluent builder for a [`FieldPlan`]. Mirrors what the document compiler
/// emits so tests can assemble plans directly.
pub struct FieldBuilder {
    response_key: String,
    field_name: String,
    args: Vec<ArgPlan>,
    selection: Option<SelectionSet>,
    type_condition: Option<String>,
    is_connection: bool,
    connection_filters: Option<Vec<String>>,
    connection_key: Option<String>,
    connection_mode: ConnectionMode,
}

impl FieldBuilder {
    /// Set the response key (the field's alias in the document).
    pub fn alias(mut self, response_key: impl Into<String>) -> Self {
        self.response_key = response_key.into();
        self
    }

    /// Declare an argument sourced from a request variable.
    pub fn arg_var(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.args.push(ArgPlan {
            name: name.into(),
            source: ArgSource::Variable(variable.into()),
        });
        self
    }

    /// Declare an argument with a literal value.
    pub fn arg_lit(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.push(ArgPlan {
            name: name.into(),
            source: ArgSource::Literal(value),
        });
        self
    }

    /// Gate this field behind an inline-fragment type condition.
    pub fn on(mut self, type_condition: impl Into<String>) -> Self {
        self.type_condition = Some(type_condition.into());
        self
    }

    /// Select child fields.
    pub fn select<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = FieldBuilder>,
    {
        self.selection = Some(SelectionSet::build(fields));
        self
    }

    /// Mark the field as a paginated connection with default identity:
    /// every non-pagination argument is a canonical filter.
    pub fn connection(mut self) -> Self {
        self.is_connection = true;
        self
    }

    /// Restrict the canonical connection identity to the named arguments.
    pub fn connection_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.is_connection = true;
        self.connection_filters = Some(filters.into_iter().map(Into::into).collect());
        self
    }

    /// Override the field name in canonical keys with a stable name.
    pub fn connection_key(mut self, key: impl Into<String>) -> Self {
        self.is_connection = true;
        self.connection_key = Some(key.into());
        self
    }

    /// Set the connection's canonical assembly mode.
    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.is_connection = true;
        self.connection_mode = mode;
        self
    }

    pub fn build(self) -> FieldPlan {
        FieldPlan {
            response_key: self.response_key,
            field_name: self.field_name,
            args: self.args,
            selection: self.selection,
            type_condition: self.type_condition,
            is_connection: self.is_connection,
            connection_filters: self.connection_filters,
            connection_key: self.connection_key,
            connection_mode: self.connection_mode,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_a_connection_field() {
        let f = field("posts")
            .arg_var("category", "category")
            .arg_var("first", "first")
            .arg_var("after", "after")
            .connection_filters(["category"])
            .connection_key("posts")
            .select([
                field("edges").select([
                    field("cursor"),
                    field("node").select([field("__typename"), field("id")]),
                ]),
                field("pageInfo").select([field("endCursor"), field("hasNextPage")]),
            ])
            .build();

        assert!(f.is_connection);
        assert_eq!(f.connection_filters.as_deref(), Some(&["category".to_string()][..]));
        assert_eq!(f.connection_key.as_deref(), Some("posts"));
        assert_eq!(f.connection_mode, ConnectionMode::Infinite);
        let edges = f.selection.as_ref().unwrap().field("edges").unwrap();
        assert!(edges.selection.is_some());
    }

    #[test]
    fn alias_and_literal_args() {
        let f = field("user")
            .alias("viewer")
            .arg_lit("id", json!("u1"))
            .build();
        assert_eq!(f.response_key, "viewer");
        assert_eq!(f.field_name, "user");
        assert_eq!(f.args[0].source, ArgSource::Literal(json!("u1")));
    }
}
