//! Query normalisation and validation

use serde_json::Value;

use crate::error::{CrudError, Result};
use crate::query::{Action, Query};
use crate::schema::Schema;

/// Normalise a raw RPC payload into a [`Query`].
///
/// Shape violations are reported one at a time with the offending field
/// named; semantic checks against the schema happen in [`validate_query`].
pub fn parse_query(data: &Value) -> Result<Query> {
    let obj = match data {
        Value::Object(obj) => obj,
        _ => {
            return Err(CrudError::InvalidParams(
                "Query was null or not an object".to_string(),
            ))
        }
    };

    let action = match obj.get("action") {
        None => None,
        Some(Value::String(s)) => Some(parse_action(s)?),
        Some(_) => {
            return Err(CrudError::InvalidOperation(
                "Query action must be a string".to_string(),
            ))
        }
    };

    let model = match obj.get("type") {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(CrudError::InvalidModelType(
                "Query type must be a string".to_string(),
            ))
        }
    };

    let id = optional_string(obj.get("id"), "id")?;
    let field = optional_string(obj.get("field"), "field")?;
    let view = optional_string(obj.get("view"), "view")?;
    let publisher_id = optional_string(obj.get("publisherId"), "publisherId")?;

    let view_params = match obj.get("viewParams") {
        None | Some(Value::Null) => None,
        Some(Value::Object(params)) => Some(params.clone()),
        Some(_) => {
            return Err(CrudError::InvalidParams(
                "Query viewParams must be an object".to_string(),
            ))
        }
    };

    let offset = optional_u64(obj.get("offset"), "offset")?;
    let page_size = optional_u64(obj.get("pageSize"), "pageSize")?;
    let slice_to = optional_u64(obj.get("sliceTo"), "sliceTo")?.map(|n| n as usize);

    let get_count = match obj.get("getCount") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            return Err(CrudError::InvalidParams(
                "Query getCount must be a boolean".to_string(),
            ))
        }
    };

    Ok(Query {
        action,
        model,
        id,
        field,
        value: obj.get("value").cloned(),
        view,
        view_params,
        offset,
        page_size,
        get_count,
        slice_to,
        publisher_id,
    })
}

fn parse_action(raw: &str) -> Result<Action> {
    match raw {
        "create" => Ok(Action::Create),
        "read" => Ok(Action::Read),
        "update" => Ok(Action::Update),
        "delete" => Ok(Action::Delete),
        "subscribe" => Ok(Action::Subscribe),
        other => Err(CrudError::InvalidOperation(format!(
            "Unknown action: {other}"
        ))),
    }
}

fn optional_string(value: Option<&Value>, name: &str) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(CrudError::InvalidParams(format!(
            "Query {name} must be a string"
        ))),
    }
}

fn optional_u64(value: Option<&Value>, name: &str) -> Result<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            CrudError::InvalidParams(format!("Query {name} must be a non-negative integer"))
        }).map(Some),
        Some(_) => Err(CrudError::InvalidParams(format!(
            "Query {name} must be a number"
        ))),
    }
}

/// Validate a normalised query against the schema.
pub fn validate_query(query: &Query, schema: &Schema) -> Result<()> {
    if query.model.is_empty() {
        return Err(CrudError::InvalidModelType(
            "Query did not specify a type".to_string(),
        ));
    }
    if !schema.has_model(&query.model) {
        return Err(CrudError::InvalidModelType(format!(
            "Model {} is not defined in the schema",
            query.model
        )));
    }

    if query.field.is_some() && query.id.is_none() {
        return Err(CrudError::InvalidParams(
            "Queries addressing a field must also carry an id".to_string(),
        ));
    }

    if let Some(view_name) = &query.view {
        let (_, view) = schema.find_view(&query.model, view_name).ok_or_else(|| {
            CrudError::InvalidParams(format!(
                "View {view_name} is not defined for type {}",
                query.model
            ))
        })?;

        if !view.param_fields.is_empty() || view.primary_fields.is_some() {
            let params = query.view_params.as_ref().ok_or_else(|| {
                CrudError::InvalidParams(format!(
                    "View {view_name} requires viewParams"
                ))
            })?;
            if let Some(primary) = &view.primary_fields {
                for field in primary {
                    let present = params.get(field).map(|v| !v.is_null()).unwrap_or(false);
                    if !present {
                        return Err(CrudError::InvalidParams(format!(
                            "View {view_name} requires the {field} param"
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::constraint::string;
    use crate::schema::{ModelSchema, Schema, ViewSchema};
    use serde_json::json;

    fn schema() -> Schema {
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
                            .with_primary_fields(["owner"]),
                    ),
            )
            .build()
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(parse_query(&json!(null)).is_err());
        assert!(parse_query(&json!("str")).is_err());
        assert!(parse_query(&json!({"type": "Item"})).is_ok());
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(parse_query(&json!({"type": "Item", "id": 7})).is_err());
        assert!(parse_query(&json!({"type": "Item", "offset": "1"})).is_err());
        assert!(parse_query(&json!({"type": "Item", "pageSize": -1})).is_err());
        assert!(parse_query(&json!({"type": "Item", "getCount": "yes"})).is_err());
        assert!(parse_query(&json!({"type": "Item", "viewParams": []})).is_err());
        assert!(parse_query(&json!({"type": "Item", "action": "upsert"})).is_err());
    }

    #[test]
    fn test_validate_unknown_model() {
        let err = validate_query(&Query::resource("Order", "o1"), &schema()).unwrap_err();
        assert!(matches!(err, CrudError::InvalidModelType(_)));
    }

    #[test]
    fn test_validate_field_without_id() {
        let query = Query {
            model: "Item".to_string(),
            field: Some("owner".to_string()),
            ..Query::default()
        };
        assert!(validate_query(&query, &schema()).is_err());
    }

    #[test]
    fn test_validate_view_params() {
        let mut query = Query {
            model: "Item".to_string(),
            view: Some("byOwner".to_string()),
            ..Query::default()
        };
        assert!(validate_query(&query, &schema()).is_err(), "params required");

        query.view_params = Some(
            json!({"owner": null})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert!(
            validate_query(&query, &schema()).is_err(),
            "primary param may not be null"
        );

        query.view_params = Some(json!({"owner": "u1"}).as_object().cloned().unwrap());
        assert!(validate_query(&query, &schema()).is_ok());
    }

    #[test]
    fn test_validate_unknown_view() {
        let query = Query {
            model: "Item".to_string(),
            view: Some("byColor".to_string()),
            ..Query::default()
        };
        assert!(validate_query(&query, &schema()).is_err());
    }
}
