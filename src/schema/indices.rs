//! Derived cross-model indices
//!
//! The schema graph contains back-references (relations and foreign
//! affecting fields) that would form model-to-model cycles if followed
//! naively. They are flattened here into two precomputed lookup tables at
//! build time; the schema tree itself stays acyclic.

use std::collections::BTreeMap;

use super::{ModelSchema, RelationFn};

/// One foreign-view declaration: a view whose channel lives on a parent
/// model but whose membership is driven by writes to the declaring model.
#[derive(Debug, Clone)]
pub struct ForeignViewDecl {
    /// Fields routing a resource to a channel, under the parent namespace.
    pub param_fields: Vec<String>,
    /// Parent-model fields that affect membership without rerouting.
    pub affecting_fields: Vec<String>,
}

/// trigger model -> parent model -> view name -> declaration.
pub type ForeignViewIndex = BTreeMap<String, BTreeMap<String, BTreeMap<String, ForeignViewDecl>>>;

/// source model -> target model -> field name -> relation function.
pub type TypeRelationIndex = BTreeMap<String, BTreeMap<String, BTreeMap<String, RelationFn>>>;

/// Flatten every view's `foreign_affecting_fields` into a per-trigger-model
/// table. A view declared on model T with a foreign entry for model P is
/// recomputed whenever a T resource changes, and publishes on P's channel
/// namespace.
pub fn build_foreign_view_index(models: &BTreeMap<String, ModelSchema>) -> ForeignViewIndex {
    let mut index = ForeignViewIndex::new();
    for (model_name, model) in models {
        for (view_name, view) in &model.views {
            for (parent, affecting_fields) in &view.foreign_affecting_fields {
                index
                    .entry(model_name.clone())
                    .or_default()
                    .entry(parent.clone())
                    .or_default()
                    .insert(
                        view_name.clone(),
                        ForeignViewDecl {
                            param_fields: view.param_fields.clone(),
                            affecting_fields: affecting_fields.clone(),
                        },
                    );
            }
        }
    }
    index
}

/// Flatten per-model relation declarations into a single lookup table.
pub fn build_type_relation_index(models: &BTreeMap<String, ModelSchema>) -> TypeRelationIndex {
    let mut index = TypeRelationIndex::new();
    for (model_name, model) in models {
        for (target, fields) in &model.relations {
            for (field, function) in fields {
                index
                    .entry(model_name.clone())
                    .or_default()
                    .entry(target.clone())
                    .or_default()
                    .insert(field.clone(), function.clone());
            }
        }
    }
    index
}
