//! Shared fixtures for the integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use lodestone::db::{Database, MemoryDatabase, ViewQuery, WriteResult};
use lodestone::schema::constraint::string;
use lodestone::socket::{ChannelSubscription, Exchange, MemoryServer, SocketServer};
use lodestone::{
    CrudEngine, CrudOptions, EngineDependencies, IndexSpec, ModelSchema, Resource, Result, Schema,
    ViewSchema,
};

/// One recorded publication.
#[derive(Debug, Clone)]
pub struct Publication {
    pub channel: String,
    pub payload: Option<Value>,
}

/// Exchange decorator that records every publication in order.
#[derive(Clone)]
pub struct RecordingExchange {
    inner: Arc<dyn Exchange>,
    log: Arc<Mutex<Vec<Publication>>>,
}

impl RecordingExchange {
    pub fn new(inner: Arc<dyn Exchange>) -> Self {
        Self {
            inner,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn take(&self) -> Vec<Publication> {
        std::mem::take(&mut *self.log.lock())
    }

    pub fn channels(&self) -> Vec<String> {
        self.log.lock().iter().map(|p| p.channel.clone()).collect()
    }
}

#[async_trait]
impl Exchange for RecordingExchange {
    async fn transmit_publish(&self, channel: &str, payload: Option<Value>) -> Result<()> {
        self.log.lock().push(Publication {
            channel: channel.to_string(),
            payload: payload.clone(),
        });
        self.inner.transmit_publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription> {
        self.inner.subscribe(channel).await
    }

    fn is_subscribed(&self, channel: &str, include_pending: bool) -> bool {
        self.inner.is_subscribed(channel, include_pending)
    }
}

/// Database decorator counting point reads.
pub struct CountingDatabase {
    inner: MemoryDatabase,
    gets: AtomicUsize,
}

impl CountingDatabase {
    pub fn new() -> Self {
        Self {
            inner: MemoryDatabase::new(),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for CountingDatabase {
    async fn ensure_database(&self) -> Result<()> {
        self.inner.ensure_database().await
    }
    async fn table_list(&self) -> Result<Vec<String>> {
        self.inner.table_list().await
    }
    async fn table_create(&self, table: &str) -> Result<()> {
        self.inner.table_create(table).await
    }
    async fn index_list(&self, table: &str) -> Result<Vec<String>> {
        self.inner.index_list(table).await
    }
    async fn index_create(&self, table: &str, index: &IndexSpec) -> Result<()> {
        self.inner.index_create(table, index).await
    }
    async fn index_drop(&self, table: &str, name: &str) -> Result<()> {
        self.inner.index_drop(table, name).await
    }
    async fn get(&self, table: &str, id: &str) -> Result<Option<Resource>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        // Give concurrent readers a chance to pile onto the same load.
        tokio::task::yield_now().await;
        self.inner.get(table, id).await
    }
    async fn insert(&self, table: &str, value: Resource) -> Result<WriteResult> {
        self.inner.insert(table, value).await
    }
    async fn update(&self, table: &str, id: &str, value: Resource) -> Result<WriteResult> {
        self.inner.update(table, id, value).await
    }
    async fn replace(&self, table: &str, id: &str, value: Resource) -> Result<WriteResult> {
        self.inner.replace(table, id, value).await
    }
    async fn delete(&self, table: &str, id: &str) -> Result<WriteResult> {
        self.inner.delete(table, id).await
    }
    async fn query_ids(&self, query: &ViewQuery) -> Result<Vec<String>> {
        self.inner.query_ids(query).await
    }
    async fn query_count(&self, query: &ViewQuery) -> Result<u64> {
        self.inner.query_count(query).await
    }
}

/// `Item` model with an owner-keyed view.
pub fn item_schema() -> Schema {
    Schema::builder()
        .model(
            "Item",
            ModelSchema::new()
                .field("id", string())
                .field("owner", string())
                .field("name", string())
                .view("byOwner", ViewSchema::new().with_param_fields(["owner"])),
        )
        .build()
}

/// A full engine + server rig over the given schema.
pub struct Rig {
    pub engine: CrudEngine,
    pub server: MemoryServer,
    pub recorder: RecordingExchange,
    pub db: Arc<MemoryDatabase>,
}

pub fn rig(schema: Schema, options: CrudOptions) -> Rig {
    let server = MemoryServer::new();
    let recorder = RecordingExchange::new(server.exchange());
    let db = Arc::new(MemoryDatabase::new());
    let engine = CrudEngine::new(EngineDependencies {
        schema,
        db: db.clone(),
        exchange: Arc::new(recorder.clone()),
        options,
        client_error_mapper: None,
    });
    Rig {
        engine,
        server,
        recorder,
        db,
    }
}

pub fn create_query(model: &str, value: Value) -> lodestone::Query {
    lodestone::Query {
        action: Some(lodestone::Action::Create),
        model: model.to_string(),
        value: Some(value),
        ..lodestone::Query::default()
    }
}

pub fn update_field_query(model: &str, id: &str, field: &str, value: Value) -> lodestone::Query {
    lodestone::Query {
        action: Some(lodestone::Action::Update),
        model: model.to_string(),
        id: Some(id.to_string()),
        field: Some(field.to_string()),
        value: Some(value),
        ..lodestone::Query::default()
    }
}

pub fn delete_query(model: &str, id: &str) -> lodestone::Query {
    lodestone::Query {
        action: Some(lodestone::Action::Delete),
        model: model.to_string(),
        id: Some(id.to_string()),
        ..lodestone::Query::default()
    }
}

/// Seed a resource without generating publications.
pub async fn seed(db: &MemoryDatabase, table: &str, value: Value) {
    db.insert(table, value.as_object().cloned().expect("object"))
        .await
        .expect("seed insert")
        .into_changes()
        .expect("seed insert changes");
}

pub fn expect_payload(publication: &Publication) -> &Value {
    publication
        .payload
        .as_ref()
        .unwrap_or_else(|| panic!("publication on {} had no payload", publication.channel))
}

pub fn assert_channel_order(publications: &[Publication], first: &str, then: &str) {
    let first_at = publications
        .iter()
        .position(|p| p.channel == first)
        .unwrap_or_else(|| panic!("no publication on {first}"));
    let then_at = publications
        .iter()
        .position(|p| p.channel == then)
        .unwrap_or_else(|| panic!("no publication on {then}"));
    assert!(
        first_at < then_at,
        "expected {first} before {then}, got order {:?}",
        publications.iter().map(|p| &p.channel).collect::<Vec<_>>()
    );
}
