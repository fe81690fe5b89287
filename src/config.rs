//! Engine configuration
//!
//! Runtime knobs for the CRUD engine, with sensible defaults for every
//! optional value. Options deserialize from the same JSON/TOML shapes the
//! rest of the system uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lifetime of an idle cache entry in milliseconds.
pub const DEFAULT_CACHE_DURATION_MS: u64 = 10_000;

/// Default cap on multi-value view channel fanout per write.
pub const DEFAULT_MAX_MULTI_PUBLISH: usize = 20;

/// Default page size for collection reads that do not name one.
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// Default upper bound on client-requested page sizes.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 100;

/// Default number of field errors accumulated before validation gives up.
pub const DEFAULT_MAX_ERROR_COUNT: usize = 100;

/// Options controlling a [`CrudEngine`](crate::crud::CrudEngine) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CrudOptions {
    /// How long an untouched cache entry lives, in milliseconds.
    pub cache_duration_ms: u64,
    /// Disable the resource cache entirely; every read hits the database.
    pub cache_disabled: bool,
    /// Per-write cap on the number of multi-value view channel variants.
    pub max_multi_publish: usize,
    /// Block invocations on models that declare no pre access filter.
    pub block_pre_by_default: bool,
    /// Keep view channel params typed instead of coercing them to strings.
    pub typed_view_channel_params: bool,
    /// Page size used when a collection read does not request one.
    pub default_page_size: u64,
    /// Upper bound on client-requested page sizes (models may lower it).
    pub max_page_size: u64,
    /// Field errors accumulated per record before validation aborts.
    pub max_error_count: usize,
}

impl Default for CrudOptions {
    fn default() -> Self {
        Self {
            cache_duration_ms: DEFAULT_CACHE_DURATION_MS,
            cache_disabled: false,
            max_multi_publish: DEFAULT_MAX_MULTI_PUBLISH,
            block_pre_by_default: false,
            typed_view_channel_params: false,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            max_error_count: DEFAULT_MAX_ERROR_COUNT,
        }
    }
}

impl CrudOptions {
    /// Create options with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache entry lifetime.
    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Turn the resource cache off.
    pub fn with_cache_disabled(mut self, disabled: bool) -> Self {
        self.cache_disabled = disabled;
        self
    }

    /// Cap multi-value view fanout per write.
    pub fn with_max_multi_publish(mut self, cap: usize) -> Self {
        self.max_multi_publish = cap;
        self
    }

    /// Block models without a pre access filter by default.
    pub fn with_block_pre_by_default(mut self, block: bool) -> Self {
        self.block_pre_by_default = block;
        self
    }

    /// Serialize view channel params as-is instead of coercing to strings.
    pub fn with_typed_view_channel_params(mut self, typed: bool) -> Self {
        self.typed_view_channel_params = typed;
        self
    }

    /// Set the default collection page size.
    pub fn with_default_page_size(mut self, size: u64) -> Self {
        self.default_page_size = size;
        self
    }

    /// Set the global page size ceiling.
    pub fn with_max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = size;
        self
    }

    /// Cache entry lifetime as a [`Duration`].
    pub fn cache_duration(&self) -> Duration {
        Duration::from_millis(self.cache_duration_ms)
    }
}
