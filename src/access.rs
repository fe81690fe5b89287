//! Access-filter pipeline
//!
//! Implements the socket server's inbound and outbound middleware. Every
//! `crud` invocation and every subscription to a CRUD-shaped channel passes
//! the schema-declared pre hook; subscriptions additionally pre-fetch their
//! subject and pass the post hook, and the fetched subject becomes the
//! subscription payload. Clients can never publish into CRUD channels, and
//! publisher echoes are suppressed on the way out.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::channel::{is_crud_channel, parse_channel_resource_query};
use crate::crud::transform::transformed_view_query;
use crate::crud::CrudEngine;
use crate::db::ViewQuery;
use crate::error::{BlockedKind, CrudError, Result};
use crate::query::{Action, Query};
use crate::schema::{AccessDenial, AccessRequest};
use crate::socket::{
    InboundAction, InboundActionKind, InboundDecision, InboundMiddleware, OutboundAction,
    OutboundDecision, OutboundMiddleware, SocketInfo,
};
use crate::validate::{parse_query, validate_query};

/// Middleware wrapper around a [`CrudEngine`].
pub struct AccessFilter {
    engine: CrudEngine,
}

impl AccessFilter {
    /// Wrap an engine.
    pub fn new(engine: CrudEngine) -> Self {
        Self { engine }
    }

    async fn run_pre_hook(&self, socket: &SocketInfo, action: Action, query: &Query) -> Result<()> {
        let inner = self.engine.inner();
        let hook = inner
            .schema
            .model(&query.model)
            .and_then(|m| m.access.pre.clone());
        match hook {
            Some(hook) => {
                let request = AccessRequest {
                    socket: Some(socket.clone()),
                    action,
                    auth_token: socket.auth_token.clone(),
                    query: query.clone(),
                    resource: None,
                };
                match hook(request).await {
                    Ok(()) => Ok(()),
                    Err(AccessDenial::Deny) => Err(CrudError::Blocked {
                        kind: BlockedKind::Pre,
                    }),
                    Err(AccessDenial::Error(err)) => Err(err),
                }
            }
            None => {
                if inner.options.block_pre_by_default {
                    Err(CrudError::Blocked {
                        kind: BlockedKind::Pre,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn filter_invoke(&self, socket: &SocketInfo, data: Option<Value>) -> Result<()> {
        let data = data.unwrap_or(Value::Null);
        let query = parse_query(&data)?;
        validate_query(&query, &self.engine.inner().schema)?;
        let action = query.action.ok_or_else(|| {
            CrudError::InvalidOperation("Query did not specify an action".to_string())
        })?;

        if action == Action::Read && query.view.is_some() {
            if let Some(page_size) = query.page_size {
                let ceiling = self
                    .engine
                    .inner()
                    .schema
                    .max_page_size(&query.model, self.engine.inner().options.max_page_size);
                if page_size > ceiling {
                    return Err(CrudError::InvalidParams(format!(
                        "pageSize {page_size} exceeds the maximum of {ceiling}"
                    )));
                }
            }
        }

        self.run_pre_hook(socket, action, &query).await
    }

    async fn filter_subscribe(
        &self,
        socket: &SocketInfo,
        channel: &str,
        data: Option<Value>,
    ) -> Result<Value> {
        let Some(channel_query) = parse_channel_resource_query(channel) else {
            // Not CRUD-shaped; the caller lets it through untouched.
            return Ok(Value::Null);
        };
        let mut query = channel_query.to_query();
        query.action = Some(Action::Subscribe);
        validate_query(&query, &self.engine.inner().schema)?;

        self.run_pre_hook(socket, Action::Subscribe, &query).await?;
        self.apply_post_access_filter(socket, &mut query, data.as_ref())
            .await
    }

    /// Pre-fetch the subscription subject, run the post hook against it,
    /// and return it as the subscription payload.
    ///
    /// Client-supplied `viewParams` in the subscribe data augment the
    /// parsed channel params, but routing fields can never be rewritten
    /// this way.
    async fn apply_post_access_filter(
        &self,
        socket: &SocketInfo,
        query: &mut Query,
        data: Option<&Value>,
    ) -> Result<Value> {
        let inner = self.engine.inner();

        if let Some(view_name) = query.view.clone() {
            if let Some(Value::Object(data)) = data {
                if let Some(Value::Object(extra)) = data.get("viewParams") {
                    let protected: Vec<String> = inner
                        .schema
                        .find_view(&query.model, &view_name)
                        .map(|(_, view)| view.routing_fields().to_vec())
                        .unwrap_or_default();
                    let params = query.view_params.get_or_insert_with(Map::new);
                    for (key, value) in extra {
                        if !protected.iter().any(|p| p == key) {
                            params.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        let resource: Value = if let Some(id) = query.id.clone() {
            let db = inner.db.clone();
            let model = query.model.clone();
            inner
                .cache
                .pass(query, move || async move { db.get(&model, &id).await })
                .await?
                .map(Value::Object)
                .unwrap_or(Value::Null)
        } else if let Some(view_name) = &query.view {
            let collection_query = transformed_view_query(
                &inner.schema,
                &query.model,
                view_name,
                query.view_params.as_ref(),
                ViewQuery::table(&query.model),
            )?
            .take(inner.options.default_page_size);
            json!(inner.db.query_ids(&collection_query).await?)
        } else {
            Value::Null
        };

        self.engine
            .apply_post_filter(
                Some(socket),
                Action::Subscribe,
                query,
                Some(resource.clone()),
            )
            .await?;
        Ok(resource)
    }
}

#[async_trait]
impl InboundMiddleware for AccessFilter {
    async fn process(&self, action: InboundAction) -> InboundDecision {
        match &action.kind {
            InboundActionKind::Invoke { procedure } => {
                if procedure != "crud" {
                    return InboundDecision::Allow(None);
                }
                match self.filter_invoke(&action.socket, action.data).await {
                    Ok(()) => InboundDecision::Allow(None),
                    Err(err) => InboundDecision::Block(err),
                }
            }
            InboundActionKind::Subscribe { channel } => {
                if parse_channel_resource_query(channel).is_none() {
                    return InboundDecision::Allow(None);
                }
                let channel = channel.clone();
                match self
                    .filter_subscribe(&action.socket, &channel, action.data)
                    .await
                {
                    Ok(payload) => InboundDecision::Allow(Some(payload)),
                    Err(err) => {
                        debug!(channel = %channel, error = %err, "subscription blocked");
                        InboundDecision::Block(err)
                    }
                }
            }
            InboundActionKind::PublishIn { channel } => {
                if is_crud_channel(channel) {
                    InboundDecision::Block(CrudError::PublishNotAllowed)
                } else {
                    InboundDecision::Allow(None)
                }
            }
        }
    }
}

#[async_trait]
impl OutboundMiddleware for AccessFilter {
    async fn process(&self, action: OutboundAction) -> OutboundDecision {
        if !is_crud_channel(&action.channel) {
            return OutboundDecision::Deliver(action.data);
        }
        match action.data {
            Some(Value::Object(mut payload)) => {
                let is_echo = payload
                    .get("publisherSocketId")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id == action.socket.id);
                if is_echo {
                    if payload.contains_key("publisherId") {
                        payload.remove("publisherSocketId");
                        OutboundDecision::Deliver(Some(Value::Object(payload)))
                    } else {
                        OutboundDecision::Drop
                    }
                } else {
                    payload.remove("publisherSocketId");
                    payload.remove("publisherId");
                    OutboundDecision::Deliver(Some(Value::Object(payload)))
                }
            }
            other => OutboundDecision::Deliver(other),
        }
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
    use crate::socket::MemoryExchange;
    use std::sync::Arc;

    fn filter_with(options: CrudOptions, model: ModelSchema) -> AccessFilter {
        let schema = Schema::builder().model("Item", model).build();
        let engine = CrudEngine::new(EngineDependencies {
            schema,
            db: Arc::new(MemoryDatabase::new()),
            exchange: Arc::new(MemoryExchange::new()),
            options,
            client_error_mapper: None,
        });
        AccessFilter::new(engine)
    }

    fn base_model() -> ModelSchema {
        ModelSchema::new()
            .field("id", string())
            .field("owner", string())
            .view("byOwner", ViewSchema::new().with_param_fields(["owner"]))
    }

    fn socket() -> SocketInfo {
        SocketInfo {
            id: "socket-1".to_string(),
            auth_token: None,
        }
    }

    #[tokio::test]
    async fn test_invoke_rejects_oversized_page() {
        let filter = filter_with(
            CrudOptions::default().with_max_page_size(10),
            base_model(),
        );
        let err = filter
            .filter_invoke(
                &socket(),
                Some(json!({
                    "action": "read",
                    "type": "Item",
                    "view": "byOwner",
                    "viewParams": {"owner": "u1"},
                    "pageSize": 11
                })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_pre_deny_upgrades_to_blocked() {
        let model = base_model().pre_access(crate::schema::access_hook(|_request| async {
            Err(AccessDenial::Deny)
        }));
        let filter = filter_with(CrudOptions::default(), model);
        let err = filter
            .filter_invoke(
                &socket(),
                Some(json!({"action": "read", "type": "Item", "id": "i1"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CrudError::Blocked {
                kind: BlockedKind::Pre
            }
        ));
    }

    #[tokio::test]
    async fn test_block_pre_by_default_without_hook() {
        let filter = filter_with(
            CrudOptions::default().with_block_pre_by_default(true),
            base_model(),
        );
        let err = filter
            .filter_invoke(
                &socket(),
                Some(json!({"action": "read", "type": "Item", "id": "i1"})),
            )
            .await
            .unwrap_err();
        assert!(err.is_blocked());
    }

    #[tokio::test]
    async fn test_publish_in_blocked_on_crud_channels() {
        let filter = filter_with(CrudOptions::default(), base_model());
        let decision = crate::socket::InboundMiddleware::process(
            &filter,
            InboundAction {
                kind: InboundActionKind::PublishIn {
                    channel: "crud>Item/i1".to_string(),
                },
                socket: socket(),
                data: Some(json!({"sneaky": true})),
            },
        )
        .await;
        assert!(matches!(
            decision,
            InboundDecision::Block(CrudError::PublishNotAllowed)
        ));

        let open = crate::socket::InboundMiddleware::process(
            &filter,
            InboundAction {
                kind: InboundActionKind::PublishIn {
                    channel: "chat/lobby".to_string(),
                },
                socket: socket(),
                data: Some(json!("hi")),
            },
        )
        .await;
        assert!(matches!(open, InboundDecision::Allow(None)));
    }

    #[tokio::test]
    async fn test_outbound_echo_suppression() {
        let filter = filter_with(CrudOptions::default(), base_model());
        let payload = json!({"type": "update", "value": "u2", "publisherSocketId": "socket-1"});

        let echo = crate::socket::OutboundMiddleware::process(
            &filter,
            OutboundAction {
                socket: socket(),
                channel: "crud>Item/i1/owner".to_string(),
                data: Some(payload.clone()),
            },
        )
        .await;
        assert!(matches!(echo, OutboundDecision::Drop));

        let other = crate::socket::OutboundMiddleware::process(
            &filter,
            OutboundAction {
                socket: SocketInfo {
                    id: "socket-2".to_string(),
                    auth_token: None,
                },
                channel: "crud>Item/i1/owner".to_string(),
                data: Some(payload),
            },
        )
        .await;
        match other {
            OutboundDecision::Deliver(Some(Value::Object(delivered))) => {
                assert!(!delivered.contains_key("publisherSocketId"));
                assert_eq!(delivered.get("value"), Some(&json!("u2")));
            }
            other => panic!("expected sanitised delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_echo_kept_with_publisher_id() {
        let filter = filter_with(CrudOptions::default(), base_model());
        let payload = json!({
            "type": "update",
            "value": "u2",
            "publisherSocketId": "socket-1",
            "publisherId": "op-7"
        });
        let decision = crate::socket::OutboundMiddleware::process(
            &filter,
            OutboundAction {
                socket: socket(),
                channel: "crud>Item/i1/owner".to_string(),
                data: Some(payload),
            },
        )
        .await;
        match decision {
            OutboundDecision::Deliver(Some(Value::Object(delivered))) => {
                assert_eq!(delivered.get("publisherId"), Some(&json!("op-7")));
                assert!(!delivered.contains_key("publisherSocketId"));
            }
            other => panic!("expected delivery with publisherId, got {other:?}"),
        }
    }
}
