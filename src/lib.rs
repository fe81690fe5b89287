#![forbid(unsafe_code)]

//! # Lodestone
//!
//! Realtime CRUD coherence engine: sits between pub/sub-connected clients
//! and a document database, translating every `create` / `read` / `update`
//! / `delete` into the precise set of channel publications that keeps
//! remote UIs coherent without polling.
//!
//! The moving parts:
//!
//! - [`schema`] — model declarations (fields, views, relations, access
//!   hooks) plus the derived cross-model indices.
//! - [`validate`] — query normalisation and record validation.
//! - [`channel`] — the `crud>` channel-name codec with stable params
//!   serialization.
//! - [`cache`] — the per-resource TTL cache with single-flight loading.
//! - [`views`] — the view-affect engine mapping field mutations to
//!   affected view channels, own and foreign.
//! - [`crud`] — the engine: operations, publication dispatch, socket
//!   attach, external notify.
//! - [`access`] — pre/post access filtering on the socket middleware.
//! - [`bootstrap`] — table and index preparation.
//! - [`db`] / [`socket`] — the external collaborators as traits, each with
//!   an embedded in-memory implementation.

pub mod access;
pub mod bootstrap;
pub mod cache;
pub mod channel;
pub mod config;
pub mod crud;
pub mod db;
pub mod error;
pub mod query;
pub mod schema;
pub mod socket;
pub mod validate;
pub mod views;

pub use cache::{CacheEvent, CacheEventKind, CacheStats, ResourceCache};
pub use config::CrudOptions;
pub use crud::dispatch::ViewOp;
pub use crud::{CrudEngine, EngineDependencies, EngineEvent};
pub use error::{BlockedKind, CrudError, FieldValidationError, Result};
pub use query::{Action, Query};
pub use schema::{
    access_hook, AccessDenial, AccessHooks, AccessRequest, IndexSpec, ModelSchema, Resource,
    Schema, TypeConstraint, ViewSchema,
};
pub use views::{affected_views, modified_fields, FieldChange, ViewData};
