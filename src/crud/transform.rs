//! Collection query transformer
//!
//! Turns a `(type, view, viewParams)` triple into a database query by
//! sanitising the params down to the view's declared fields and composing
//! the caller-supplied transform onto the base query.

use serde_json::{Map, Value};

use crate::db::ViewQuery;
use crate::error::{CrudError, Result};
use crate::schema::{Schema, ViewSchema};

/// Keep only the view's declared `param_fields`; missing ones become null.
pub fn sanitize_view_params(
    view: &ViewSchema,
    params: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut sanitized = Map::new();
    for field in &view.param_fields {
        let value = params
            .and_then(|p| p.get(field))
            .cloned()
            .unwrap_or(Value::Null);
        sanitized.insert(field.clone(), value);
    }
    sanitized
}

/// Build the collection query for a view read.
pub fn transformed_view_query(
    schema: &Schema,
    model: &str,
    view_name: &str,
    params: Option<&Map<String, Value>>,
    base: ViewQuery,
) -> Result<ViewQuery> {
    let (_, view) = schema.find_view(model, view_name).ok_or_else(|| {
        CrudError::InvalidParams(format!(
            "View {view_name} is not defined for type {model}"
        ))
    })?;
    let sanitized = sanitize_view_params(view, params);
    match &view.transform {
        Some(transform) => Ok(transform(base, &sanitized)),
        None => Ok(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::constraint::string;
    use crate::schema::ModelSchema;
    use serde_json::json;
    use std::sync::Arc;

    fn schema_with_transform() -> Schema {
        Schema::builder()
            .model(
                "Item",
                ModelSchema::new()
                    .field("id", string())
                    .field("owner", string())
                    .view(
                        "byOwner",
                        ViewSchema::new()
                            .with_param_fields(["owner"])
                            .with_transform(Arc::new(|base: ViewQuery, params| {
                                base.filter_eq(
                                    "owner",
                                    params.get("owner").cloned().unwrap_or(Value::Null),
                                )
                                .order_by("id")
                            })),
                    )
                    .view("all", ViewSchema::new()),
            )
            .build()
    }

    #[test]
    fn test_sanitize_drops_undeclared_and_fills_missing() {
        let view = ViewSchema::new().with_param_fields(["owner", "kind"]);
        let params = json!({"owner": "u1", "rogue": true}).as_object().cloned();
        let sanitized = sanitize_view_params(&view, params.as_ref());
        assert_eq!(sanitized.get("owner"), Some(&json!("u1")));
        assert_eq!(sanitized.get("kind"), Some(&Value::Null));
        assert!(!sanitized.contains_key("rogue"));
    }

    #[test]
    fn test_transform_composes_onto_base() {
        let schema = schema_with_transform();
        let params = json!({"owner": "u1"}).as_object().cloned();
        let query = transformed_view_query(
            &schema,
            "Item",
            "byOwner",
            params.as_ref(),
            ViewQuery::table("Item"),
        )
        .unwrap();
        assert_eq!(query.filters.len(), 1);
        assert!(query.order_by.is_some());
    }

    #[test]
    fn test_view_without_transform_is_noop() {
        let schema = schema_with_transform();
        let query =
            transformed_view_query(&schema, "Item", "all", None, ViewQuery::table("Item"))
                .unwrap();
        assert!(query.filters.is_empty());
        assert!(query.order_by.is_none());
    }

    #[test]
    fn test_unknown_view_errors() {
        let schema = schema_with_transform();
        assert!(
            transformed_view_query(&schema, "Item", "ghost", None, ViewQuery::table("Item"))
                .is_err()
        );
    }
}
