//! External-notify API
//!
//! Entry points for writes that happened outside this engine instance
//! (another process, a migration script, a direct database edit). They
//! replay the publication pipeline so subscribers stay coherent without the
//! write having passed through the CRUD operations.

use serde_json::{Map, Value};
use tracing::debug;

use super::dispatch::{Publisher, ViewOp};
use super::CrudEngine;
use crate::error::{CrudError, Result};
use crate::schema::Resource;
use crate::views::{affected_views, modified_fields, ViewData};

impl CrudEngine {
    /// Announce an external write to `model/id` touching `fields`.
    ///
    /// Publishes the resource-channel invalidation plus a name-only
    /// notification per field (the values are unknown here).
    pub async fn notify_resource_update(
        &self,
        model: &str,
        id: &str,
        fields: &[String],
    ) -> Result<()> {
        debug!(model, id, ?fields, "external resource update");
        let publisher = Publisher::new(self.inner(), None, None);
        publisher.resource_changed(model, id).await?;
        for field in fields {
            publisher.field_touched(model, id, field).await?;
        }
        Ok(())
    }

    /// Announce an external change to one view instance.
    pub async fn notify_view_update(
        &self,
        model: &str,
        view: &str,
        params: Option<&Map<String, Value>>,
        operation: ViewOp,
    ) -> Result<()> {
        if self.inner().schema.find_view(model, view).is_none() {
            return Err(CrudError::InvalidParams(format!(
                "View {view} is not defined for type {model}"
            )));
        }
        let view_data = ViewData {
            view: view.to_string(),
            model: model.to_string(),
            params: params.cloned().unwrap_or_default(),
            affecting_data: Map::new(),
        };
        let mut publisher = Publisher::new(self.inner(), None, None);
        publisher.publish_view(&view_data, operation, None).await
    }

    /// Replay the full dispatcher against an externally observed
    /// `(old, new)` resource pair.
    pub async fn notify_update(
        &self,
        model: &str,
        old: Option<&Resource>,
        new: Option<&Resource>,
    ) -> Result<()> {
        let id = new
            .or(old)
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CrudError::InvalidArguments(
                    "notify_update requires a resource with an id".to_string(),
                )
            })?
            .to_string();

        let modified = modified_fields(old, new);
        if modified.is_empty() {
            return Ok(());
        }

        let mut publisher = Publisher::new(self.inner(), None, None);
        publisher.resource_changed(model, &id).await?;
        for (field, change) in &modified {
            match &change.after {
                Some(value) => {
                    publisher
                        .field_updated(model, &id, field, value.clone())
                        .await?;
                }
                None => {
                    publisher.field_removed(model, &id, field).await?;
                }
            }
        }

        let schema = self.inner().schema.clone();
        let modified_names: Vec<String> = modified.keys().cloned().collect();
        match (old, new) {
            (None, Some(new)) => {
                for view_data in affected_views(&schema, model, new, None) {
                    publisher
                        .publish_view(&view_data, ViewOp::Create, Some(&id))
                        .await?;
                }
            }
            (Some(old), None) => {
                for view_data in affected_views(&schema, model, old, None) {
                    publisher
                        .publish_view(&view_data, ViewOp::Delete, Some(&id))
                        .await?;
                }
            }
            (Some(old), Some(new)) => {
                let old_views = affected_views(&schema, model, old, Some(&modified_names));
                let new_views = affected_views(&schema, model, new, Some(&modified_names));
                self.publish_transitions(&mut publisher, old_views, new_views, &id)
                    .await?;
            }
            (None, None) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrudOptions;
    use crate::crud::EngineDependencies;
    use crate::db::MemoryDatabase;
    use crate::schema::constraint::string;
    use crate::schema::{ModelSchema, Schema, ViewSchema};
    use crate::socket::{Exchange, MemoryExchange};
    use serde_json::json;
    use std::sync::Arc;

    fn engine_with_exchange() -> (CrudEngine, MemoryExchange) {
        let exchange = MemoryExchange::new();
        let schema = Schema::builder()
            .model(
                "Item",
                ModelSchema::new()
                    .field("id", string())
                    .field("owner", string())
                    .view("byOwner", ViewSchema::new().with_param_fields(["owner"])),
            )
            .build();
        let engine = CrudEngine::new(EngineDependencies {
            schema,
            db: Arc::new(MemoryDatabase::new()),
            exchange: Arc::new(exchange.clone()),
            options: CrudOptions::default(),
            client_error_mapper: None,
        });
        (engine, exchange)
    }

    fn resource(value: serde_json::Value) -> Resource {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_notify_resource_update_publishes_name_only_fields() {
        let (engine, exchange) = engine_with_exchange();
        let mut resource_sub = exchange.subscribe("crud>Item/i1").await.unwrap();
        let mut field_sub = exchange.subscribe("crud>Item/i1/owner").await.unwrap();

        engine
            .notify_resource_update("Item", "i1", &["owner".to_string()])
            .await
            .unwrap();

        assert_eq!(resource_sub.receiver.recv().await, Some(None));
        assert_eq!(field_sub.receiver.recv().await, Some(None));
    }

    #[tokio::test]
    async fn test_notify_view_update_publishes_operation() {
        let (engine, exchange) = engine_with_exchange();
        let mut view_sub = exchange
            .subscribe(r#"crud>byOwner({"owner":"u1"}):Item"#)
            .await
            .unwrap();

        let params = resource(json!({"owner": "u1"}));
        engine
            .notify_view_update("Item", "byOwner", Some(&params), ViewOp::Update)
            .await
            .unwrap();

        assert_eq!(
            view_sub.receiver.recv().await,
            Some(Some(json!({"type": "update"})))
        );
    }

    #[tokio::test]
    async fn test_notify_update_replays_dispatcher() {
        let (engine, exchange) = engine_with_exchange();
        let mut old_view = exchange
            .subscribe(r#"crud>byOwner({"owner":"u1"}):Item"#)
            .await
            .unwrap();
        let mut new_view = exchange
            .subscribe(r#"crud>byOwner({"owner":"u2"}):Item"#)
            .await
            .unwrap();

        let old = resource(json!({"id": "i1", "owner": "u1"}));
        let new = resource(json!({"id": "i1", "owner": "u2"}));
        engine
            .notify_update("Item", Some(&old), Some(&new))
            .await
            .unwrap();

        assert_eq!(
            old_view.receiver.recv().await,
            Some(Some(json!({"type": "update", "value": {"id": "i1"}})))
        );
        assert_eq!(
            new_view.receiver.recv().await,
            Some(Some(json!({"type": "update", "value": {"id": "i1"}})))
        );
    }

    #[tokio::test]
    async fn test_notify_update_without_changes_is_silent() {
        let (engine, exchange) = engine_with_exchange();
        let mut resource_sub = exchange.subscribe("crud>Item/i1").await.unwrap();
        let same = resource(json!({"id": "i1", "owner": "u1"}));
        engine
            .notify_update("Item", Some(&same), Some(&same))
            .await
            .unwrap();
        assert!(
            resource_sub.receiver.try_recv().is_err(),
            "no publication expected for an unchanged pair"
        );
    }
}
