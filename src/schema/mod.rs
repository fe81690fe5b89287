//! Schema declarations
//!
//! The schema maps model names to field constraints, views, indexes,
//! relations, and access hooks. It is built once, derives its cross-model
//! indices, and is shared read-only for the lifetime of the engine.

pub mod constraint;
pub mod indices;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::db::ViewQuery;
use crate::error::CrudError;
use crate::query::{Action, Query};
use crate::socket::SocketInfo;
pub use constraint::{ConstraintKind, TypeConstraint};
pub use indices::{ForeignViewDecl, ForeignViewIndex, TypeRelationIndex};

/// A document belonging to a model. Always carries a string `id`.
pub type Resource = Map<String, Value>;

/// Maps a resource of one model to the value of a field under another
/// model's namespace. Must be pure.
pub type RelationFn = Arc<dyn Fn(&Resource) -> Value + Send + Sync>;

/// Derives an index key from a resource.
pub type IndexFn = Arc<dyn Fn(&Resource) -> Value + Send + Sync>;

/// Composes a view's filtering/ordering onto a base collection query.
/// Receives the sanitized view params.
pub type TransformFn = Arc<dyn Fn(ViewQuery, &Map<String, Value>) -> ViewQuery + Send + Sync>;

/// Context handed to pre and post access hooks.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    /// The requesting socket, absent for server-origin calls.
    pub socket: Option<SocketInfo>,
    /// The operation being attempted.
    pub action: Action,
    /// The socket's auth token, passed through opaquely.
    pub auth_token: Option<Value>,
    /// The full query under evaluation.
    pub query: Query,
    /// The loaded subject, set only for post hooks.
    pub resource: Option<Value>,
}

/// How an access hook refused a request.
#[derive(Debug, Clone)]
pub enum AccessDenial {
    /// Plain refusal with no detail; lifted to a canonical blocked error.
    Deny,
    /// Refusal carrying a specific error for the client.
    Error(CrudError),
}

/// An asynchronous access hook. Returning `Ok(())` allows the request.
pub type AccessHook = Arc<
    dyn Fn(AccessRequest) -> BoxFuture<'static, std::result::Result<(), AccessDenial>>
        + Send
        + Sync,
>;

/// Wrap an async closure as an [`AccessHook`].
pub fn access_hook<F, Fut>(hook: F) -> AccessHook
where
    F: Fn(AccessRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), AccessDenial>> + Send + 'static,
{
    Arc::new(move |request| {
        let boxed: BoxFuture<'static, std::result::Result<(), AccessDenial>> =
            Box::pin(hook(request));
        boxed
    })
}

/// Pre- and post-access hooks for one model.
#[derive(Clone, Default)]
pub struct AccessHooks {
    /// Runs before the operation touches the database.
    pub pre: Option<AccessHook>,
    /// Runs after the subject has been loaded.
    pub post: Option<AccessHook>,
}

impl std::fmt::Debug for AccessHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessHooks")
            .field("pre", &self.pre.as_ref().map(|_| "<hook>"))
            .field("post", &self.post.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

/// Kind of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKind {
    /// Single-field index on the named field.
    Simple,
    /// Index over a comma-separated multi field, one entry per value.
    Multi,
    /// Compound index over several fields.
    Compound(Vec<String>),
}

/// One declared secondary index.
#[derive(Clone)]
pub struct IndexSpec {
    /// Index name; for simple indexes this is also the field name.
    pub name: String,
    /// Optional custom key derivation.
    pub function: Option<IndexFn>,
    /// Index kind.
    pub kind: IndexKind,
    /// Driver-specific options, passed through.
    pub options: Map<String, Value>,
}

impl IndexSpec {
    /// A plain single-field index.
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: None,
            kind: IndexKind::Simple,
            options: Map::new(),
        }
    }

    /// An index with a custom key function.
    pub fn with_function(name: impl Into<String>, function: IndexFn) -> Self {
        Self {
            name: name.into(),
            function: Some(function),
            kind: IndexKind::Simple,
            options: Map::new(),
        }
    }

    /// A compound index over the given fields.
    pub fn compound(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            function: None,
            kind: IndexKind::Compound(fields),
            options: Map::new(),
        }
    }

    /// Mark the index as multi-valued.
    pub fn multi(mut self) -> Self {
        self.kind = IndexKind::Multi;
        self
    }

    /// Attach driver options.
    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("function", &self.function.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A named, parameterised projection over a model.
#[derive(Clone, Default)]
pub struct ViewSchema {
    /// Fields whose values select which view channel a resource belongs to.
    pub param_fields: Vec<String>,
    /// Fields which alter membership without changing channel identity.
    pub affecting_fields: Vec<String>,
    /// Routing subset of `param_fields`; when declared, only these fields
    /// appear in the channel name.
    pub primary_fields: Option<Vec<String>>,
    /// Foreign model name to the fields of it this view depends on.
    pub foreign_affecting_fields: BTreeMap<String, Vec<String>>,
    /// Caller-supplied query transform.
    pub transform: Option<TransformFn>,
    /// Suppress all realtime publications for this view.
    pub disable_realtime: bool,
}

impl ViewSchema {
    /// An empty view declaration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the param fields.
    pub fn with_param_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the affecting fields.
    pub fn with_affecting_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affecting_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the routing subset of the params.
    pub fn with_primary_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Declare a dependency on fields of a foreign model.
    pub fn with_foreign_affecting_fields<I, S>(
        mut self,
        model: impl Into<String>,
        fields: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foreign_affecting_fields
            .insert(model.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Attach the collection query transform.
    pub fn with_transform(mut self, transform: TransformFn) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Suppress realtime publications for this view.
    pub fn with_realtime_disabled(mut self) -> Self {
        self.disable_realtime = true;
        self
    }

    /// The fields used to route to a channel name.
    pub fn routing_fields(&self) -> &[String] {
        match &self.primary_fields {
            Some(primary) => primary,
            None => &self.param_fields,
        }
    }
}

impl std::fmt::Debug for ViewSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSchema")
            .field("param_fields", &self.param_fields)
            .field("affecting_fields", &self.affecting_fields)
            .field("primary_fields", &self.primary_fields)
            .field("foreign_affecting_fields", &self.foreign_affecting_fields)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("disable_realtime", &self.disable_realtime)
            .finish()
    }
}

/// Declaration of one model: fields, views, indexes, relations, policy.
#[derive(Clone, Default)]
pub struct ModelSchema {
    /// Field name to type constraint.
    pub fields: BTreeMap<String, TypeConstraint>,
    /// Declared secondary indexes, in creation order.
    pub indexes: Vec<IndexSpec>,
    /// View name to declaration.
    pub views: BTreeMap<String, ViewSchema>,
    /// Target model name to field name to relation function. The function
    /// receives a resource of *this* model and produces the value of the
    /// target model's field.
    pub relations: BTreeMap<String, BTreeMap<String, RelationFn>>,
    /// Access hooks interposed on every invocation and subscription.
    pub access: AccessHooks,
    /// Per-model ceiling on collection page sizes.
    pub max_page_size: Option<u64>,
}

impl ModelSchema {
    /// An empty model declaration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    pub fn field(mut self, name: impl Into<String>, constraint: TypeConstraint) -> Self {
        self.fields.insert(name.into(), constraint);
        self
    }

    /// Declare a view.
    pub fn view(mut self, name: impl Into<String>, view: ViewSchema) -> Self {
        self.views.insert(name.into(), view);
        self
    }

    /// Declare a secondary index.
    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declare a relation: resources of this model map to `target.field`
    /// through `function`.
    pub fn relation(
        mut self,
        target: impl Into<String>,
        field: impl Into<String>,
        function: RelationFn,
    ) -> Self {
        self.relations
            .entry(target.into())
            .or_default()
            .insert(field.into(), function);
        self
    }

    /// Install the pre access hook.
    pub fn pre_access(mut self, hook: AccessHook) -> Self {
        self.access.pre = Some(hook);
        self
    }

    /// Install the post access hook.
    pub fn post_access(mut self, hook: AccessHook) -> Self {
        self.access.post = Some(hook);
        self
    }

    /// Cap page sizes for this model.
    pub fn with_max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = Some(size);
        self
    }
}

/// The process-wide schema: immutable after construction.
pub struct Schema {
    models: BTreeMap<String, ModelSchema>,
    foreign_views: ForeignViewIndex,
    type_relations: TypeRelationIndex,
}

impl Schema {
    /// Build the schema and derive the flat cross-model indices.
    pub fn build(models: BTreeMap<String, ModelSchema>) -> Self {
        let foreign_views = indices::build_foreign_view_index(&models);
        let type_relations = indices::build_type_relation_index(&models);
        Self {
            models,
            foreign_views,
            type_relations,
        }
    }

    /// Start from a single builder entry point.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Whether `name` is a declared model.
    pub fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Look up a model declaration.
    pub fn model(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name)
    }

    /// All model names, in declaration order.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// All models.
    pub fn models(&self) -> impl Iterator<Item = (&str, &ModelSchema)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a view visible under `model`: the model's own views first,
    /// then views another model declares with `model` as the foreign parent.
    /// Returns the declaring model alongside the view.
    pub fn find_view<'a>(&'a self, model: &str, view: &str) -> Option<(&'a str, &'a ViewSchema)> {
        if let Some(own) = self.models.get(model).and_then(|m| m.views.get(view)) {
            return Some((
                self.models.get_key_value(model).map(|(k, _)| k.as_str())?,
                own,
            ));
        }
        for (declaring, parents) in &self.foreign_views {
            if parents.get(model).is_some_and(|v| v.contains_key(view)) {
                let declared = self
                    .models
                    .get(declaring)
                    .and_then(|m| m.views.get(view))?;
                return Some((declaring.as_str(), declared));
            }
        }
        None
    }

    /// The foreign-view declarations triggered by writes to `model`.
    pub fn foreign_views_of(
        &self,
        model: &str,
    ) -> Option<&BTreeMap<String, BTreeMap<String, ForeignViewDecl>>> {
        self.foreign_views.get(model)
    }

    /// Relation function mapping a `source` resource to `target.field`.
    pub fn relation(&self, source: &str, target: &str, field: &str) -> Option<&RelationFn> {
        self.type_relations.get(source)?.get(target)?.get(field)
    }

    /// Effective page-size ceiling for `model`.
    pub fn max_page_size(&self, model: &str, default: u64) -> u64 {
        self.models
            .get(model)
            .and_then(|m| m.max_page_size)
            .unwrap_or(default)
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Incremental schema construction.
#[derive(Default)]
pub struct SchemaBuilder {
    models: BTreeMap<String, ModelSchema>,
}

impl SchemaBuilder {
    /// Add one model declaration.
    pub fn model(mut self, name: impl Into<String>, model: ModelSchema) -> Self {
        self.models.insert(name.into(), model);
        self
    }

    /// Finish and derive the flat indices.
    pub fn build(self) -> Schema {
        Schema::build(self.models)
    }
}
