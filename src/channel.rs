//! Channel-name codec
//!
//! Three channel shapes share the `crud>` namespace:
//!
//! | Shape          | Format                   |
//! |----------------|--------------------------|
//! | Resource       | `crud>TYPE/ID`           |
//! | Resource field | `crud>TYPE/ID/FIELD`     |
//! | View           | `crud>VIEW(JSON):TYPE`   |
//!
//! The view JSON is a stable, key-sorted serialization of the view's
//! routing params, so both sides of the publish/subscribe boundary hash to
//! the same channel regardless of key order or (by default) whether a param
//! arrived as a number or a string.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::query::Query;
use crate::schema::ViewSchema;

/// Namespace prefix shared by every CRUD channel.
pub const CHANNEL_PREFIX: &str = "crud>";

static ENVELOPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^crud>(.*)$").expect("valid regex"));

static VIEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^(]*)\((.*)\):([^:]*)$").expect("valid regex"));

/// The parsed form of a CRUD channel name.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelQuery {
    /// `crud>TYPE/ID`
    Resource {
        /// Model name.
        model: String,
        /// Resource id.
        id: String,
    },
    /// `crud>TYPE/ID/FIELD`
    Field {
        /// Model name.
        model: String,
        /// Resource id.
        id: String,
        /// Field name.
        field: String,
    },
    /// `crud>VIEW(JSON):TYPE`
    View {
        /// View name.
        view: String,
        /// Model name.
        model: String,
        /// Parsed params; `None` when the inner JSON did not parse.
        view_params: Option<Map<String, Value>>,
    },
}

impl ChannelQuery {
    /// The model this channel belongs to.
    pub fn model(&self) -> &str {
        match self {
            ChannelQuery::Resource { model, .. }
            | ChannelQuery::Field { model, .. }
            | ChannelQuery::View { model, .. } => model,
        }
    }

    /// Convert to a [`Query`] for validation and filtering.
    pub fn to_query(&self) -> Query {
        match self {
            ChannelQuery::Resource { model, id } => Query {
                model: model.clone(),
                id: Some(id.clone()),
                ..Query::default()
            },
            ChannelQuery::Field { model, id, field } => Query {
                model: model.clone(),
                id: Some(id.clone()),
                field: Some(field.clone()),
                ..Query::default()
            },
            ChannelQuery::View {
                view,
                model,
                view_params,
            } => Query {
                model: model.clone(),
                view: Some(view.clone()),
                view_params: view_params.clone(),
                ..Query::default()
            },
        }
    }
}

/// `crud>TYPE/ID`
pub fn resource_channel(model: &str, id: &str) -> String {
    format!("{CHANNEL_PREFIX}{model}/{id}")
}

/// `crud>TYPE/ID/FIELD`
pub fn field_channel(model: &str, id: &str, field: &str) -> String {
    format!("{CHANNEL_PREFIX}{model}/{id}/{field}")
}

/// `crud>VIEW(JSON):TYPE` over already-routed params.
pub fn view_channel(view: &str, model: &str, routed_params: &Map<String, Value>) -> String {
    let json = stable_stringify(&Value::Object(routed_params.clone()));
    format!("{CHANNEL_PREFIX}{view}({json}):{model}")
}

/// Project `params` down to the view's routing fields and apply the string
/// coercion that keeps channel names invariant across number/string inputs.
///
/// When the view declares `primary_fields`, only those appear (missing ones
/// coerced to null); otherwise the whole params object is used. Unless
/// `typed` is set, scalar values are coerced to their string representation.
pub fn routed_view_params(
    view: &ViewSchema,
    params: Option<&Map<String, Value>>,
    typed: bool,
) -> Map<String, Value> {
    let empty = Map::new();
    let source = params.unwrap_or(&empty);
    let mut routed = Map::new();
    match &view.primary_fields {
        Some(primary) => {
            for field in primary {
                routed.insert(
                    field.clone(),
                    source.get(field).cloned().unwrap_or(Value::Null),
                );
            }
        }
        None => {
            routed = source.clone();
        }
    }
    if !typed {
        for (_, value) in routed.iter_mut() {
            coerce_in_place(value);
        }
    }
    routed
}

fn coerce_in_place(value: &mut Value) {
    match value {
        Value::Number(n) => *value = Value::String(n.to_string()),
        Value::Bool(b) => *value = Value::String(b.to_string()),
        _ => {}
    }
}

/// Serialize with lexicographically sorted object keys, recursively.
/// Arrays preserve their order.
pub fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let quoted = serde_json::to_string(key)
                        .unwrap_or_else(|_| String::from("\"\""));
                    format!("{quoted}:{}", stable_stringify(&map[key]))
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(stable_stringify).collect();
            format!("[{}]", entries.join(","))
        }
        scalar => serde_json::to_string(scalar).unwrap_or_else(|_| String::from("null")),
    }
}

/// Parse a channel name back into its CRUD query, or `None` when the
/// channel is not CRUD-shaped.
///
/// For view channels an unparseable inner JSON yields `view_params: None`
/// without failing the call.
pub fn parse_channel_resource_query(name: &str) -> Option<ChannelQuery> {
    let envelope = ENVELOPE_RE.captures(name)?;
    let rest = envelope.get(1)?.as_str();

    if let Some(view) = VIEW_RE.captures(rest) {
        let view_name = view.get(1)?.as_str();
        let json = view.get(2)?.as_str();
        let model = view.get(3)?.as_str();
        if view_name.is_empty() || model.is_empty() {
            return None;
        }
        let view_params = serde_json::from_str::<Value>(json)
            .ok()
            .and_then(|v| v.as_object().cloned());
        return Some(ChannelQuery::View {
            view: view_name.to_string(),
            model: model.to_string(),
            view_params,
        });
    }

    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [model, id] if !model.is_empty() && !id.is_empty() => Some(ChannelQuery::Resource {
            model: model.to_string(),
            id: id.to_string(),
        }),
        [model, id, field] if !model.is_empty() && !id.is_empty() && !field.is_empty() => {
            Some(ChannelQuery::Field {
                model: model.to_string(),
                id: id.to_string(),
                field: field.to_string(),
            })
        }
        _ => None,
    }
}

/// Whether a channel name lives in the CRUD namespace at all.
pub fn is_crud_channel(name: &str) -> bool {
    name.starts_with(CHANNEL_PREFIX)
}
