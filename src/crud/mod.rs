//! CRUD core
//!
//! The engine behind the `crud` RPC procedure: it validates queries, runs
//! them against the database, keeps the resource cache coherent, and fans
//! every write out to the affected channels. One engine instance owns its
//! cache, its resource-channel subscriptions, and the background tasks
//! wiring socket handshakes and cache lifecycle events.

pub mod dispatch;
pub mod notify;
pub mod transform;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::cache::{CacheEventKind, CacheStats, ResourceCache};
use crate::channel::{resource_channel, CHANNEL_PREFIX};
use crate::config::CrudOptions;
use crate::db::Database;
use crate::error::{CrudError, Result};
use crate::query::{Action, Query};
use crate::schema::{AccessDenial, AccessRequest, Resource, Schema};
use crate::socket::{
    Exchange, ServerSocket, SocketInfo, SocketServer, SubscriptionHandle,
};
use crate::validate::{
    build_model_validator, parse_query, validate_query, ModelValidator, ModelValidatorOptions,
};
use crate::views::{affected_views, modified_fields, ViewData};

use dispatch::{Publisher, ViewOp};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maps an operation error before it is returned to a client.
pub type ClientErrorMapper =
    Arc<dyn Fn(CrudError, Option<Action>, &Query) -> CrudError + Send + Sync>;

/// Engine lifecycle events, observable as a broadcast stream.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A create completed.
    Create {
        /// The query that ran.
        query: Query,
    },
    /// An update completed.
    Update {
        /// The query that ran.
        query: Query,
    },
    /// A delete completed.
    Delete {
        /// The query that ran.
        query: Query,
    },
    /// Any operation failed.
    Error {
        /// The failure.
        error: CrudError,
    },
    /// A create failed.
    CreateFail {
        /// The failure.
        error: CrudError,
    },
    /// An update failed.
    UpdateFail {
        /// The failure.
        error: CrudError,
    },
    /// A delete failed.
    DeleteFail {
        /// The failure.
        error: CrudError,
    },
}

enum SubscriptionState {
    Pending(Vec<oneshot::Sender<Result<()>>>),
    Ready(SubscriptionHandle),
}

pub(crate) struct EngineInner {
    pub(crate) schema: Arc<Schema>,
    pub(crate) options: CrudOptions,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) exchange: Arc<dyn Exchange>,
    pub(crate) cache: ResourceCache,
    pub(crate) client_error_mapper: Option<ClientErrorMapper>,
    validators: HashMap<String, ModelValidator>,
    subscriptions: Mutex<HashMap<String, SubscriptionState>>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: broadcast::Sender<()>,
}

/// Everything an engine needs to run.
pub struct EngineDependencies {
    /// Declared models.
    pub schema: Schema,
    /// The document store.
    pub db: Arc<dyn Database>,
    /// The pub/sub exchange publications go out on.
    pub exchange: Arc<dyn Exchange>,
    /// Runtime knobs.
    pub options: CrudOptions,
    /// Optional error rewrite applied to RPC replies.
    pub client_error_mapper: Option<ClientErrorMapper>,
}

/// The realtime CRUD engine.
#[derive(Clone)]
pub struct CrudEngine {
    inner: Arc<EngineInner>,
}

impl CrudEngine {
    /// Build an engine from its dependencies.
    pub fn new(deps: EngineDependencies) -> Self {
        let validator_options = ModelValidatorOptions {
            max_error_count: deps.options.max_error_count,
        };
        let validators = deps
            .schema
            .models()
            .map(|(name, model)| {
                (
                    name.to_string(),
                    build_model_validator(name, model.fields.clone(), validator_options.clone()),
                )
            })
            .collect();
        let cache = ResourceCache::new(deps.options.cache_duration(), deps.options.cache_disabled);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(EngineInner {
                schema: Arc::new(deps.schema),
                options: deps.options,
                db: deps.db,
                exchange: deps.exchange,
                cache,
                client_error_mapper: deps.client_error_mapper,
                validators,
                subscriptions: Mutex::new(HashMap::new()),
                events,
                shutdown,
            }),
        }
    }

    /// Subscribe to engine lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// The schema this engine serves.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Cache hit/miss counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Handle to the engine's resource cache, for observation.
    pub fn cache(&self) -> ResourceCache {
        self.inner.cache.clone()
    }

    /// Stop the background tasks started by [`CrudEngine::attach`].
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    /// Attach to a socket server: install the access filter middleware and
    /// start the handshake and cache-event background tasks.
    pub fn attach(&self, server: &dyn SocketServer) {
        let filter = Arc::new(crate::access::AccessFilter::new(self.clone()));
        server.set_inbound_middleware(filter.clone());
        server.set_outbound_middleware(filter);

        let mut handshakes = server.handshakes();
        let engine = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    socket = handshakes.recv() => match socket {
                        Some(socket) => engine.handle_socket(socket),
                        None => break,
                    },
                }
            }
        });

        let engine = self.clone();
        let mut cache_events = self.inner.cache.events();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = cache_events.recv() => match event {
                        Ok(event) => {
                            if matches!(event.kind, CacheEventKind::Expire | CacheEventKind::Clear)
                            {
                                engine.unsubscribe_resource(&event.resource_path);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "cache event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        info!("crud engine attached to socket server");
    }

    fn handle_socket(&self, socket: Arc<dyn ServerSocket>) {
        let engine = self.clone();
        let info = socket.info();
        let mut requests = socket.procedure("crud");
        let mut shutdown = self.inner.shutdown.subscribe();
        debug!(socket = %info.id, "wiring crud procedure");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        // Requests on one socket are handled strictly in
                        // arrival order.
                        let data = request.data.clone();
                        match engine.execute(data, &info).await {
                            Ok(result) => request.end(result),
                            Err(err) => request.error(err),
                        }
                    }
                }
            }
        });
    }

    /// Dispatch one RPC payload to the matching operation.
    pub async fn execute(
        &self,
        data: Value,
        socket: &SocketInfo,
    ) -> std::result::Result<Value, CrudError> {
        let query = match parse_query(&data) {
            Ok(query) => query,
            Err(err) => return Err(self.map_client_error(err, None, &Query::default())),
        };
        let action = match query.action {
            Some(action) => action,
            None => {
                let err = CrudError::InvalidOperation(
                    "Query did not specify an action".to_string(),
                );
                return Err(self.map_client_error(err, None, &query));
            }
        };
        let result = match action {
            Action::Create => self.create(query.clone(), Some(socket)).await,
            Action::Read => self.read(query.clone(), Some(socket)).await,
            Action::Update => self
                .update(query.clone(), Some(socket))
                .await
                .map(|_| Value::Null),
            Action::Delete => self
                .delete(query.clone(), Some(socket))
                .await
                .map(|_| Value::Null),
            Action::Subscribe => Err(CrudError::InvalidOperation(
                "subscribe is not an invocable action".to_string(),
            )),
        };
        result.map_err(|err| self.map_client_error(err, Some(action), &query))
    }

    fn map_client_error(
        &self,
        err: CrudError,
        action: Option<Action>,
        query: &Query,
    ) -> CrudError {
        match &self.inner.client_error_mapper {
            Some(mapper) => mapper(err, action, query),
            None => err,
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    fn validator(&self, model: &str) -> Result<&ModelValidator> {
        self.inner
            .validators
            .get(model)
            .ok_or_else(|| CrudError::InvalidModelType(format!("Model {model} is not defined")))
    }

    // ── create ───────────────────────────────────────────────────────────

    /// Insert a resource and publish its arrival.
    pub async fn create(&self, query: Query, socket: Option<&SocketInfo>) -> Result<Value> {
        match self.create_inner(&query, socket).await {
            Ok(id) => {
                debug!(model = %query.model, id = %id, "created resource");
                self.emit(EngineEvent::Create { query });
                Ok(Value::String(id))
            }
            Err(err) => {
                self.emit(EngineEvent::Error { error: err.clone() });
                self.emit(EngineEvent::CreateFail { error: err.clone() });
                Err(err)
            }
        }
    }

    async fn create_inner(&self, query: &Query, socket: Option<&SocketInfo>) -> Result<String> {
        validate_query(query, &self.inner.schema)?;
        let value = match &query.value {
            Some(Value::Object(value)) => value.clone(),
            _ => {
                return Err(CrudError::InvalidParams(
                    "Create requires an object value".to_string(),
                ))
            }
        };
        let sanitized = self.validator(&query.model)?.validate(&value, false, false)?;

        let changes = self
            .inner
            .db
            .insert(&query.model, sanitized)
            .await?
            .into_changes()?;
        let new_val = changes
            .first()
            .and_then(|c| c.new_val.clone())
            .ok_or_else(|| CrudError::Database("Insert returned no changes".to_string()))?;
        let id = new_val
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CrudError::Database("Inserted document has no id".to_string()))?
            .to_string();

        let mut publisher = self.publisher(socket, query);
        publisher.resource_changed(&query.model, &id).await?;
        let affected = affected_views(&self.inner.schema, &query.model, &new_val, None);
        for view_data in &affected {
            publisher
                .publish_view(view_data, ViewOp::Create, Some(&id))
                .await?;
        }
        Ok(id)
    }

    // ── read ─────────────────────────────────────────────────────────────

    /// Read a resource, a field of it, or a collection page.
    pub async fn read(&self, query: Query, socket: Option<&SocketInfo>) -> Result<Value> {
        match self.read_inner(&query, socket).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.emit(EngineEvent::Error { error: err.clone() });
                Err(err)
            }
        }
    }

    async fn read_inner(&self, query: &Query, socket: Option<&SocketInfo>) -> Result<Value> {
        validate_query(query, &self.inner.schema)?;
        if query.id.is_some() {
            self.read_resource(query, socket).await
        } else {
            self.read_collection(query, socket).await
        }
    }

    async fn read_resource(&self, query: &Query, socket: Option<&SocketInfo>) -> Result<Value> {
        let id = query.id.as_deref().unwrap_or_default();
        let channel = resource_channel(&query.model, id);
        self.ensure_resource_subscription(&channel).await?;

        let db = self.inner.db.clone();
        let model = query.model.clone();
        let doc_id = id.to_string();
        let resource = self
            .inner
            .cache
            .pass(query, move || async move { db.get(&model, &doc_id).await })
            .await?;

        self.apply_post_filter(
            socket,
            Action::Read,
            query,
            resource.clone().map(Value::Object),
        )
        .await?;

        let value = match &query.field {
            Some(field) => {
                let projected = resource
                    .as_ref()
                    .and_then(|r| r.get(field))
                    .cloned()
                    .unwrap_or(Value::Null);
                match (projected, query.slice_to) {
                    (Value::String(s), Some(slice_to)) => {
                        Value::String(s.chars().take(slice_to).collect())
                    }
                    (other, _) => other,
                }
            }
            None => resource.map(Value::Object).unwrap_or(Value::Null),
        };
        Ok(value)
    }

    async fn read_collection(&self, query: &Query, socket: Option<&SocketInfo>) -> Result<Value> {
        let page_size = query
            .page_size
            .unwrap_or(self.inner.options.default_page_size);
        let offset = query.offset.unwrap_or(0);

        let base = crate::db::ViewQuery::table(&query.model);
        let collection_query = match &query.view {
            Some(view_name) => transform::transformed_view_query(
                &self.inner.schema,
                &query.model,
                view_name,
                query.view_params.as_ref(),
                base,
            )?,
            None => base,
        };
        let page_query = collection_query.clone().skip(offset).take(page_size + 1);

        let (ids, count) = if query.get_count.unwrap_or(false) {
            let (ids, count) = tokio::join!(
                self.inner.db.query_ids(&page_query),
                self.inner.db.query_count(&collection_query)
            );
            (ids?, Some(count?))
        } else {
            (self.inner.db.query_ids(&page_query).await?, None)
        };

        let is_last_page = (ids.len() as u64) < page_size + 1;
        let mut data = ids;
        data.truncate(page_size as usize);

        self.apply_post_filter(socket, Action::Read, query, Some(json!(data.clone())))
            .await?;

        let mut result = Map::new();
        result.insert("data".to_string(), json!(data));
        if let Some(count) = count {
            result.insert("count".to_string(), json!(count));
        }
        result.insert("isLastPage".to_string(), Value::Bool(is_last_page));
        Ok(Value::Object(result))
    }

    // ── update ───────────────────────────────────────────────────────────

    /// Mutate fields of a resource and publish the transitions.
    pub async fn update(&self, query: Query, socket: Option<&SocketInfo>) -> Result<()> {
        match self.update_inner(&query, socket).await {
            Ok(()) => {
                self.emit(EngineEvent::Update { query });
                Ok(())
            }
            Err(err) => {
                self.emit(EngineEvent::Error { error: err.clone() });
                self.emit(EngineEvent::UpdateFail { error: err.clone() });
                Err(err)
            }
        }
    }

    async fn update_inner(&self, query: &Query, socket: Option<&SocketInfo>) -> Result<()> {
        validate_query(query, &self.inner.schema)?;
        let id = query
            .id
            .clone()
            .ok_or_else(|| CrudError::InvalidParams("Update requires an id".to_string()))?;
        if query.field.as_deref() == Some("id") {
            return Err(CrudError::InvalidOperation(
                "The id field cannot be updated".to_string(),
            ));
        }

        let old = self
            .inner
            .db
            .get(&query.model, &id)
            .await?
            .ok_or(CrudError::DocumentNotFound)?;

        self.apply_post_filter(
            socket,
            Action::Update,
            query,
            Some(Value::Object(old.clone())),
        )
        .await?;

        let update_map: Resource = match &query.field {
            Some(field) => {
                let mut map = Map::new();
                map.insert(
                    field.clone(),
                    query.value.clone().unwrap_or(Value::Null),
                );
                map
            }
            None => match &query.value {
                Some(Value::Object(value)) => value.clone(),
                _ => {
                    return Err(CrudError::InvalidParams(
                        "Update requires an object value or a field".to_string(),
                    ))
                }
            },
        };
        let sanitized = self
            .validator(&query.model)?
            .validate(&update_map, true, false)?;

        let changes = self
            .inner
            .db
            .update(&query.model, &id, sanitized.clone())
            .await?
            .into_changes()?;
        let new_val = changes
            .first()
            .and_then(|c| c.new_val.clone())
            .unwrap_or_else(|| {
                let mut merged = old.clone();
                for (field, value) in &sanitized {
                    merged.insert(field.clone(), value.clone());
                }
                merged
            });

        let mut reconcile = query.clone();
        reconcile.value = Some(Value::Object(sanitized));
        self.inner.cache.update(&reconcile);

        let modified = modified_fields(Some(&old), Some(&new_val));
        let mut publisher = self.publisher(socket, query);
        publisher.resource_changed(&query.model, &id).await?;
        for (field, change) in &modified {
            publisher
                .field_updated(
                    &query.model,
                    &id,
                    field,
                    change.after.clone().unwrap_or(Value::Null),
                )
                .await?;
        }

        let modified_names: Vec<String> = modified.keys().cloned().collect();
        let old_views =
            affected_views(&self.inner.schema, &query.model, &old, Some(&modified_names));
        let new_views = affected_views(
            &self.inner.schema,
            &query.model,
            &new_val,
            Some(&modified_names),
        );
        self.publish_transitions(&mut publisher, old_views, new_views, &id)
            .await?;
        Ok(())
    }

    async fn publish_transitions(
        &self,
        publisher: &mut Publisher<'_>,
        old_views: Vec<ViewData>,
        new_views: Vec<ViewData>,
        id: &str,
    ) -> Result<()> {
        let mut new_by_key: HashMap<(String, String), ViewData> = new_views
            .into_iter()
            .map(|v| ((v.view.clone(), v.model.clone()), v))
            .collect();
        for old in old_views {
            let key = (old.view.clone(), old.model.clone());
            match new_by_key.remove(&key) {
                Some(new) => {
                    publisher
                        .publish_view_transition(&old, &new, Some(id))
                        .await?;
                }
                None => {
                    publisher.publish_view(&old, ViewOp::Update, Some(id)).await?;
                }
            }
        }
        for new in new_by_key.into_values() {
            publisher.publish_view(&new, ViewOp::Update, Some(id)).await?;
        }
        Ok(())
    }

    // ── delete ───────────────────────────────────────────────────────────

    /// Remove a resource or one of its fields and publish the departure.
    pub async fn delete(&self, query: Query, socket: Option<&SocketInfo>) -> Result<()> {
        match self.delete_inner(&query, socket).await {
            Ok(()) => {
                self.emit(EngineEvent::Delete { query });
                Ok(())
            }
            Err(err) => {
                self.emit(EngineEvent::Error { error: err.clone() });
                self.emit(EngineEvent::DeleteFail { error: err.clone() });
                Err(err)
            }
        }
    }

    async fn delete_inner(&self, query: &Query, socket: Option<&SocketInfo>) -> Result<()> {
        validate_query(query, &self.inner.schema)?;
        let id = query
            .id
            .clone()
            .ok_or_else(|| CrudError::InvalidParams("Delete requires an id".to_string()))?;

        let old = self
            .inner
            .db
            .get(&query.model, &id)
            .await?
            .ok_or(CrudError::DocumentNotFound)?;

        self.apply_post_filter(
            socket,
            Action::Delete,
            query,
            Some(Value::Object(old.clone())),
        )
        .await?;

        let mut publisher = self.publisher(socket, query);
        match &query.field {
            None => {
                self.inner
                    .db
                    .delete(&query.model, &id)
                    .await?
                    .into_changes()?;
                self.inner.cache.clear(query);

                publisher.resource_changed(&query.model, &id).await?;
                let declared_fields: Vec<String> = self
                    .inner
                    .schema
                    .model(&query.model)
                    .map(|m| m.fields.keys().cloned().collect())
                    .unwrap_or_default();
                for field in &declared_fields {
                    publisher.field_removed(&query.model, &id, field).await?;
                }
                // Membership transitions come from the pre-delete snapshot.
                let old_views = affected_views(&self.inner.schema, &query.model, &old, None);
                for view_data in &old_views {
                    publisher
                        .publish_view(view_data, ViewOp::Delete, Some(&id))
                        .await?;
                }
            }
            Some(field) => {
                self.validator(&query.model)?.check_removal(field)?;
                let mut new_state = old.clone();
                new_state.remove(field);
                self.inner
                    .db
                    .replace(&query.model, &id, new_state.clone())
                    .await?
                    .into_changes()?;
                self.inner.cache.clear(query);

                publisher.resource_changed(&query.model, &id).await?;
                publisher.field_removed(&query.model, &id, field).await?;

                let removed = vec![field.clone()];
                let old_views =
                    affected_views(&self.inner.schema, &query.model, &old, Some(&removed));
                let new_views = affected_views(
                    &self.inner.schema,
                    &query.model,
                    &new_state,
                    Some(&removed),
                );
                self.publish_transitions(&mut publisher, old_views, new_views, &id)
                    .await?;
            }
        }
        Ok(())
    }

    // ── shared plumbing ──────────────────────────────────────────────────

    fn publisher<'a>(&'a self, socket: Option<&SocketInfo>, query: &Query) -> Publisher<'a> {
        Publisher::new(
            &self.inner,
            socket.map(|s| s.id.clone()),
            query.publisher_id.clone(),
        )
    }

    pub(crate) async fn apply_post_filter(
        &self,
        socket: Option<&SocketInfo>,
        action: Action,
        query: &Query,
        resource: Option<Value>,
    ) -> Result<()> {
        let Some(socket) = socket else {
            return Ok(());
        };
        let hook = self
            .inner
            .schema
            .model(&query.model)
            .and_then(|m| m.access.post.clone());
        let Some(hook) = hook else {
            return Ok(());
        };
        let request = AccessRequest {
            socket: Some(socket.clone()),
            action,
            auth_token: socket.auth_token.clone(),
            query: query.clone(),
            resource,
        };
        match hook(request).await {
            Ok(()) => Ok(()),
            Err(AccessDenial::Deny) => Err(CrudError::Blocked {
                kind: crate::error::BlockedKind::Post,
            }),
            Err(AccessDenial::Error(err)) => Err(err),
        }
    }

    /// Make sure the engine listens on a resource channel before serving a
    /// cached read of it. Concurrent readers buffer behind one subscribe;
    /// a failure rejects all of them and the next read retries.
    pub(crate) async fn ensure_resource_subscription(&self, channel: &str) -> Result<()> {
        let waiter = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.entry(channel.to_string()) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    SubscriptionState::Ready(_) => return Ok(()),
                    SubscriptionState::Pending(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                },
                Entry::Vacant(vacant) => {
                    vacant.insert(SubscriptionState::Pending(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(result) => result,
                Err(_) => Err(CrudError::FailedToSubscribeToResourceChannel(
                    channel.to_string(),
                )),
            };
        }

        match self.inner.exchange.subscribe(channel).await {
            Ok(subscription) => {
                let mut receiver = subscription.receiver;
                let handle = subscription.handle;
                let engine = self.clone();
                let change_channel = channel.to_string();
                tokio::spawn(async move {
                    while receiver.recv().await.is_some() {
                        engine.handle_resource_change(&change_channel);
                    }
                });

                let waiters = {
                    let mut subscriptions = self.inner.subscriptions.lock();
                    match subscriptions.remove(channel) {
                        Some(SubscriptionState::Pending(waiters)) => {
                            subscriptions
                                .insert(channel.to_string(), SubscriptionState::Ready(handle));
                            waiters
                        }
                        other => {
                            // Unsubscribed while the subscribe was in
                            // flight; tear the fresh handle down again.
                            if let Some(state) = other {
                                subscriptions.insert(channel.to_string(), state);
                            }
                            handle.kill();
                            Vec::new()
                        }
                    }
                };
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                warn!(channel, error = %err, "resource channel subscription failed");
                let waiters = {
                    let mut subscriptions = self.inner.subscriptions.lock();
                    match subscriptions.remove(channel) {
                        Some(SubscriptionState::Pending(waiters)) => waiters,
                        _ => Vec::new(),
                    }
                };
                let err = CrudError::FailedToSubscribeToResourceChannel(channel.to_string());
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    fn handle_resource_change(&self, channel: &str) {
        if let Some(path) = channel.strip_prefix(CHANNEL_PREFIX) {
            debug!(resource = %path, "resource change notification");
            self.inner.cache.clear_path(path);
        }
    }

    fn unsubscribe_resource(&self, resource_path: &str) {
        let channel = format!("{CHANNEL_PREFIX}{resource_path}");
        let state = self.inner.subscriptions.lock().remove(&channel);
        if let Some(SubscriptionState::Ready(handle)) = state {
            debug!(channel = %channel, "dropping resource channel subscription");
            handle.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::schema::constraint::string;
    use crate::schema::{ModelSchema, ViewSchema};
    use crate::socket::MemoryExchange;
    use serde_json::json;

    fn engine() -> CrudEngine {
        let schema = Schema::builder()
            .model(
                "Item",
                ModelSchema::new()
                    .field("id", string())
                    .field("owner", string())
                    .view("byOwner", ViewSchema::new().with_param_fields(["owner"])),
            )
            .build();
        CrudEngine::new(EngineDependencies {
            schema,
            db: Arc::new(MemoryDatabase::new()),
            exchange: Arc::new(MemoryExchange::new()),
            options: CrudOptions::default(),
            client_error_mapper: None,
        })
    }

    #[tokio::test]
    async fn test_create_then_read_roundtrip() {
        let engine = engine();
        let id = engine
            .create(
                Query {
                    action: Some(Action::Create),
                    model: "Item".to_string(),
                    value: Some(json!({"id": "i1", "owner": "u1"})),
                    ..Query::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(id, json!("i1"));

        let read = engine.read(Query::resource("Item", "i1"), None).await.unwrap();
        assert_eq!(read["owner"], json!("u1"));
    }

    #[tokio::test]
    async fn test_field_read_projects_and_slices() {
        let engine = engine();
        engine
            .create(
                Query {
                    action: Some(Action::Create),
                    model: "Item".to_string(),
                    value: Some(json!({"id": "i1", "owner": "ulysses"})),
                    ..Query::default()
                },
                None,
            )
            .await
            .unwrap();

        let mut query = Query::resource("Item", "i1");
        query.field = Some("owner".to_string());
        let full = engine.read(query.clone(), None).await.unwrap();
        assert_eq!(full, json!("ulysses"));

        query.slice_to = Some(3);
        let sliced = engine.read(query.clone(), None).await.unwrap();
        assert_eq!(sliced, json!("uly"));

        query.field = Some("ghost".to_string());
        let missing = engine.read(query, None).await.unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[tokio::test]
    async fn test_read_missing_returns_null() {
        let engine = engine();
        let read = engine
            .read(Query::resource("Item", "ghost"), None)
            .await
            .unwrap();
        assert_eq!(read, Value::Null);
    }

    #[tokio::test]
    async fn test_update_rejects_id_field() {
        let engine = engine();
        let err = engine
            .update(
                Query {
                    action: Some(Action::Update),
                    model: "Item".to_string(),
                    id: Some("i1".to_string()),
                    field: Some("id".to_string()),
                    value: Some(json!("i2")),
                    ..Query::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_update_missing_document_fails_and_emits() {
        let engine = engine();
        let mut events = engine.events();
        let err = engine
            .update(
                Query {
                    action: Some(Action::Update),
                    model: "Item".to_string(),
                    id: Some("ghost".to_string()),
                    value: Some(json!({"owner": "u2"})),
                    ..Query::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::DocumentNotFound));

        let mut saw_update_fail = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::UpdateFail { .. }) {
                saw_update_fail = true;
            }
        }
        assert!(saw_update_fail, "updateFail event should have fired");
    }

    #[tokio::test]
    async fn test_collection_read_pages() {
        let engine = engine();
        for i in 0..5 {
            engine
                .create(
                    Query {
                        action: Some(Action::Create),
                        model: "Item".to_string(),
                        value: Some(json!({"id": format!("i{i}"), "owner": "u1"})),
                        ..Query::default()
                    },
                    None,
                )
                .await
                .unwrap();
        }
        let page = engine
            .read(
                Query {
                    action: Some(Action::Read),
                    model: "Item".to_string(),
                    page_size: Some(2),
                    offset: Some(1),
                    get_count: Some(true),
                    ..Query::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(page["data"], json!(["i1", "i2"]));
        assert_eq!(page["count"], json!(5));
        assert_eq!(page["isLastPage"], json!(false));

        let tail = engine
            .read(
                Query {
                    action: Some(Action::Read),
                    model: "Item".to_string(),
                    page_size: Some(2),
                    offset: Some(4),
                    ..Query::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(tail["data"], json!(["i4"]));
        assert_eq!(tail["isLastPage"], json!(true));
    }

    struct FailingExchange;

    #[async_trait::async_trait]
    impl Exchange for FailingExchange {
        async fn transmit_publish(&self, _channel: &str, _payload: Option<Value>) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _channel: &str) -> Result<crate::socket::ChannelSubscription> {
            Err(CrudError::Database("exchange is down".to_string()))
        }
        fn is_subscribed(&self, _channel: &str, _include_pending: bool) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_failed_resource_subscription_rejects_readers_and_retries() {
        let schema = Schema::builder()
            .model("Item", ModelSchema::new().field("id", string()))
            .build();
        let engine = CrudEngine::new(EngineDependencies {
            schema,
            db: Arc::new(MemoryDatabase::new()),
            exchange: Arc::new(FailingExchange),
            options: CrudOptions::default(),
            client_error_mapper: None,
        });

        let (a, b) = tokio::join!(
            engine.read(Query::resource("Item", "i1"), None),
            engine.read(Query::resource("Item", "i1"), None),
        );
        for result in [a, b] {
            match result {
                Err(CrudError::FailedToSubscribeToResourceChannel(channel)) => {
                    assert_eq!(channel, "crud>Item/i1");
                }
                other => panic!("expected subscription failure, got {other:?}"),
            }
        }

        // The buffer was cleared, so a later read attempts a fresh
        // subscribe instead of hanging.
        let retry = engine.read(Query::resource("Item", "i1"), None).await;
        assert!(matches!(
            retry,
            Err(CrudError::FailedToSubscribeToResourceChannel(_))
        ));
    }
}
