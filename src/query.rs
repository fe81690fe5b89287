//! Query value objects
//!
//! Every operation receives a [`Query`]: the parsed form of an RPC payload
//! or of a channel name. Wire field names are camelCase to match the
//! client protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The operation a query requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Insert a new resource.
    Create,
    /// Read a resource, field, or collection page.
    Read,
    /// Mutate fields of an existing resource.
    Update,
    /// Remove a resource or one of its fields.
    Delete,
    /// Subscribe to a resource, field, or view channel.
    Subscribe,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Subscribe => "subscribe",
        };
        write!(f, "{name}")
    }
}

/// A CRUD query.
///
/// `model` is the wire field `type`; the rest keeps the client's camelCase
/// names under the hood.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Query {
    /// Requested operation, when the context requires one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Model name.
    #[serde(rename = "type")]
    pub model: String,
    /// Resource id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Single field addressed within the resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Payload for writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// View name for collection reads and view subscriptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    /// Parameters selecting the view instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_params: Option<Map<String, Value>>,
    /// Collection page offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Collection page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u64>,
    /// Also fetch the total collection count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_count: Option<bool>,
    /// Truncate a projected string field to this many characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_to: Option<usize>,
    /// Caller-chosen marker echoed in publications it causes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
}

impl Query {
    /// A read query addressing one resource.
    pub fn resource(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            action: Some(Action::Read),
            model: model.into(),
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// The `"type/id"` cache path, when both parts are present.
    pub fn resource_path(&self) -> Option<String> {
        if self.model.is_empty() {
            return None;
        }
        self.id.as_ref().map(|id| format!("{}/{}", self.model, id))
    }
}
