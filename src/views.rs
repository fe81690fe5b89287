//! View-affect engine
//!
//! Given a resource state and optionally the set of modified fields, this
//! module enumerates every view whose membership or routing could have
//! changed: the views declared on the resource's own model plus the
//! foreign-parented views derived at schema build time. Param values are
//! resolved through relation functions when one is declared, so a view on
//! model X can be keyed by a value derived from a resource of model Y.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::schema::{Resource, Schema};

/// One affected view: where to publish and what routed it there.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewData {
    /// View name.
    pub view: String,
    /// Model the view's channel lives on.
    pub model: String,
    /// Field values that route to a channel name.
    pub params: Map<String, Value>,
    /// Field values that determine membership without rerouting.
    pub affecting_data: Map<String, Value>,
}

/// A single field transition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Value before the write; `None` when the field was absent.
    pub before: Option<Value>,
    /// Value after the write; `None` when the field was removed.
    pub after: Option<Value>,
}

/// Compute the fields that differ between two resource states.
///
/// Considers the union of keys present on either side and compares values
/// strictly.
pub fn modified_fields(
    old: Option<&Resource>,
    new: Option<&Resource>,
) -> BTreeMap<String, FieldChange> {
    let mut changed = BTreeMap::new();
    let empty = Resource::new();
    let old = old.unwrap_or(&empty);
    let new = new.unwrap_or(&empty);

    for (field, before) in old {
        match new.get(field) {
            Some(after) if after == before => {}
            after => {
                changed.insert(
                    field.clone(),
                    FieldChange {
                        before: Some(before.clone()),
                        after: after.cloned(),
                    },
                );
            }
        }
    }
    for (field, after) in new {
        if !old.contains_key(field) {
            changed.insert(
                field.clone(),
                FieldChange {
                    before: None,
                    after: Some(after.clone()),
                },
            );
        }
    }
    changed
}

/// Enumerate the views affected by a write to `resource`.
///
/// When `fields` is supplied, a candidate is kept only if one of the
/// modified fields appears in `{id} ∪ param_fields ∪ affecting_fields`, or
/// if any of its fields resolves through a relation function (a relation
/// may derive its value from any part of the resource, so such candidates
/// cannot be ruled out).
pub fn affected_views(
    schema: &Schema,
    model: &str,
    resource: &Resource,
    fields: Option<&[String]>,
) -> Vec<ViewData> {
    let mut affected = Vec::new();

    if let Some(model_schema) = schema.model(model) {
        for (view_name, view) in &model_schema.views {
            push_candidate(
                schema,
                &mut affected,
                model,
                model,
                view_name,
                &view.param_fields,
                &view.affecting_fields,
                resource,
                fields,
            );
        }
    }

    if let Some(parents) = schema.foreign_views_of(model) {
        for (parent, views) in parents {
            for (view_name, decl) in views {
                push_candidate(
                    schema,
                    &mut affected,
                    model,
                    parent,
                    view_name,
                    &decl.param_fields,
                    &decl.affecting_fields,
                    resource,
                    fields,
                );
            }
        }
    }

    affected
}

#[allow(clippy::too_many_arguments)]
fn push_candidate(
    schema: &Schema,
    affected: &mut Vec<ViewData>,
    source_model: &str,
    target_model: &str,
    view_name: &str,
    param_fields: &[String],
    affecting_fields: &[String],
    resource: &Resource,
    fields: Option<&[String]>,
) {
    let mut uses_relation = false;
    let mut resolve = |field: &String| -> Value {
        match schema.relation(source_model, target_model, field) {
            Some(relation) => {
                uses_relation = true;
                relation(resource)
            }
            None => resource.get(field).cloned().unwrap_or(Value::Null),
        }
    };

    let mut params = Map::new();
    for field in param_fields {
        params.insert(field.clone(), resolve(field));
    }
    let mut affecting_data = Map::new();
    for field in affecting_fields {
        affecting_data.insert(field.clone(), resolve(field));
    }

    if let Some(modified) = fields {
        let touches_declared = modified.iter().any(|f| {
            f == "id"
                || param_fields.iter().any(|p| p == f)
                || affecting_fields.iter().any(|a| a == f)
        });
        if !touches_declared && !uses_relation {
            return;
        }
    }

    affected.push(ViewData {
        view: view_name.to_string(),
        model: target_model.to_string(),
        params,
        affecting_data,
    });
}
