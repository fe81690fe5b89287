//! Publication dispatcher
//!
//! Routes a single write to its channel publications, in the observable
//! order clients rely on: resource channel first, then field channels, then
//! view channels. View publications expand multi-valued params into
//! single-value variant channels, suppress variants a resource never left,
//! and honour the per-write fanout cap.

use std::collections::HashSet;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::EngineInner;
use crate::channel::{field_channel, resource_channel, routed_view_params, view_channel};
use crate::error::Result;
use crate::views::ViewData;

/// Multi-value sentinel published for a null param.
const NULL_VARIANT: &str = "false";

/// Kind of a view publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOp {
    /// A resource entered the view.
    Create,
    /// A resource moved or changed within the view.
    Update,
    /// A resource left the view.
    Delete,
}

impl ViewOp {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewOp::Create => "create",
            ViewOp::Update => "update",
            ViewOp::Delete => "delete",
        }
    }
}

/// One channel a view publication would go to, with variant bookkeeping for
/// the fanout cap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ViewChannel {
    name: String,
    variant: bool,
}

/// Dispatches the publications of one write.
pub(crate) struct Publisher<'a> {
    inner: &'a EngineInner,
    publisher_socket_id: Option<String>,
    publisher_id: Option<String>,
    variants_published: usize,
}

impl<'a> Publisher<'a> {
    pub(crate) fn new(
        inner: &'a EngineInner,
        publisher_socket_id: Option<String>,
        publisher_id: Option<String>,
    ) -> Self {
        Self {
            inner,
            publisher_socket_id,
            publisher_id,
            variants_published: 0,
        }
    }

    /// Publish the no-payload invalidation on `crud>TYPE/ID`.
    pub(crate) async fn resource_changed(&self, model: &str, id: &str) -> Result<()> {
        self.inner
            .exchange
            .transmit_publish(&resource_channel(model, id), None)
            .await
    }

    /// Publish `{type: "update", value}` on a field channel.
    pub(crate) async fn field_updated(
        &self,
        model: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let payload = self.field_payload("update", Some(value));
        self.inner
            .exchange
            .transmit_publish(&field_channel(model, id, field), Some(payload))
            .await
    }

    /// Publish `{type: "delete"}` on a field channel.
    pub(crate) async fn field_removed(&self, model: &str, id: &str, field: &str) -> Result<()> {
        let payload = self.field_payload("delete", None);
        self.inner
            .exchange
            .transmit_publish(&field_channel(model, id, field), Some(payload))
            .await
    }

    /// Publish a name-only notification on a field channel, for changes
    /// whose value cannot be represented in a payload.
    pub(crate) async fn field_touched(&self, model: &str, id: &str, field: &str) -> Result<()> {
        self.inner
            .exchange
            .transmit_publish(&field_channel(model, id, field), None)
            .await
    }

    fn field_payload(&self, op: &str, value: Option<Value>) -> Value {
        let mut payload = Map::new();
        payload.insert("type".to_string(), Value::String(op.to_string()));
        if let Some(value) = value {
            payload.insert("value".to_string(), value);
        }
        if let Some(socket_id) = &self.publisher_socket_id {
            payload.insert(
                "publisherSocketId".to_string(),
                Value::String(socket_id.clone()),
            );
        }
        if let Some(publisher_id) = &self.publisher_id {
            payload.insert(
                "publisherId".to_string(),
                Value::String(publisher_id.clone()),
            );
        }
        Value::Object(payload)
    }

    /// Publish one view event on every channel the view-data routes to.
    pub(crate) async fn publish_view(
        &mut self,
        view_data: &ViewData,
        op: ViewOp,
        id: Option<&str>,
    ) -> Result<()> {
        if self.realtime_disabled(view_data) {
            return Ok(());
        }
        let channels = self.channel_set(view_data);
        let payload = view_payload(op, id);
        for channel in channels {
            self.publish_view_channel(&channel, &payload).await?;
        }
        Ok(())
    }

    /// Publish the channel transitions of an update.
    ///
    /// Channels the resource left or entered always get a publication;
    /// channels it stayed in are republished only when the affecting data
    /// changed.
    pub(crate) async fn publish_view_transition(
        &mut self,
        old: &ViewData,
        new: &ViewData,
        id: Option<&str>,
    ) -> Result<()> {
        if self.realtime_disabled(new) {
            return Ok(());
        }
        let params_changed = old.params != new.params;
        let affecting_changed = old.affecting_data != new.affecting_data;
        if !params_changed && !affecting_changed {
            return Ok(());
        }

        let old_set = self.channel_set(old);
        let new_set = self.channel_set(new);
        let old_names: HashSet<&str> = old_set.iter().map(|c| c.name.as_str()).collect();
        let new_names: HashSet<&str> = new_set.iter().map(|c| c.name.as_str()).collect();

        let payload = view_payload(ViewOp::Update, id);
        for channel in &old_set {
            if !new_names.contains(channel.name.as_str()) {
                self.publish_view_channel(channel, &payload).await?;
            }
        }
        for channel in &new_set {
            if !old_names.contains(channel.name.as_str()) {
                self.publish_view_channel(channel, &payload).await?;
            }
        }
        if affecting_changed {
            for channel in &new_set {
                if old_names.contains(channel.name.as_str()) {
                    self.publish_view_channel(channel, &payload).await?;
                }
            }
        }
        Ok(())
    }

    async fn publish_view_channel(&mut self, channel: &ViewChannel, payload: &Value) -> Result<()> {
        if channel.variant {
            if self.variants_published >= self.inner.options.max_multi_publish {
                debug!(
                    channel = %channel.name,
                    cap = self.inner.options.max_multi_publish,
                    "multi publish cap reached, dropping variant publication"
                );
                return Ok(());
            }
            self.variants_published += 1;
        }
        self.inner
            .exchange
            .transmit_publish(&channel.name, Some(payload.clone()))
            .await
    }

    fn realtime_disabled(&self, view_data: &ViewData) -> bool {
        self.inner
            .schema
            .find_view(&view_data.model, &view_data.view)
            .map(|(_, view)| view.disable_realtime)
            .unwrap_or(false)
    }

    /// The base channel plus one variant channel per multi-field value.
    fn channel_set(&self, view_data: &ViewData) -> Vec<ViewChannel> {
        let typed = self.inner.options.typed_view_channel_params;
        let routed = match self
            .inner
            .schema
            .find_view(&view_data.model, &view_data.view)
        {
            Some((_, view)) => routed_view_params(view, Some(&view_data.params), typed),
            None => view_data.params.clone(),
        };

        let mut channels = Vec::new();
        let mut seen = HashSet::new();
        let base = view_channel(&view_data.view, &view_data.model, &routed);
        seen.insert(base.clone());
        channels.push(ViewChannel {
            name: base,
            variant: false,
        });

        for (field, value) in &routed {
            if !self.is_multi_field(view_data, field) {
                continue;
            }
            let parts: Vec<String> = match value {
                Value::String(joined) => joined.split(',').map(str::to_string).collect(),
                Value::Null => vec![NULL_VARIANT.to_string()],
                _ => continue,
            };
            for part in parts {
                let mut variant_params = routed.clone();
                variant_params.insert(field.clone(), Value::String(part));
                let name = view_channel(&view_data.view, &view_data.model, &variant_params);
                if seen.insert(name.clone()) {
                    channels.push(ViewChannel {
                        name,
                        variant: true,
                    });
                }
            }
        }
        channels
    }

    fn is_multi_field(&self, view_data: &ViewData, field: &str) -> bool {
        if let Some(constraint) = self
            .inner
            .schema
            .model(&view_data.model)
            .and_then(|m| m.fields.get(field))
        {
            return constraint.is_multi();
        }
        if let Some((declaring, _)) = self
            .inner
            .schema
            .find_view(&view_data.model, &view_data.view)
        {
            if let Some(constraint) = self
                .inner
                .schema
                .model(declaring)
                .and_then(|m| m.fields.get(field))
            {
                return constraint.is_multi();
            }
        }
        false
    }
}

fn view_payload(op: ViewOp, id: Option<&str>) -> Value {
    match id {
        Some(id) => json!({"type": op.as_str(), "value": {"id": id}}),
        None => json!({"type": op.as_str()}),
    }
}
