//! appdeck public read API (in-process).
//!
//! One [`ResourceGetter`] per kind binds the cache, the kind's predicate/comparator pair
//! and the list engine. [`Resources`] resolves kind names to accessors for frontends.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use appdeck_core::{Field, Kind, ListResult, Query, ResourceObject};
use appdeck_query::{KindPolicy, QueryDebugInfo, Registry};
use appdeck_store::CacheStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Read-path errors, returned synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("not_found: {kind} {name:?}")]
    NotFound { kind: Kind, name: String },
    #[error("configuration: {0}")]
    Configuration(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Per-kind facade over the cache.
pub trait ResourceAccessor: Send + Sync {
    fn kind(&self) -> Kind;

    fn get(&self, name: &str) -> ApiResult<Arc<ResourceObject>>;

    fn list(&self, query: &Query) -> ApiResult<ListResult>;

    /// List plus per-stage counts.
    fn explain(&self, query: &Query) -> ApiResult<(ListResult, QueryDebugInfo)>;
}

/// Generic accessor; one instantiation per kind.
pub struct ResourceGetter<S: CacheStore + ?Sized> {
    kind: Kind,
    store: Arc<S>,
    policy: KindPolicy,
}

impl<S: CacheStore + ?Sized> ResourceGetter<S> {
    pub fn new(kind: Kind, store: Arc<S>, policy: KindPolicy) -> Self { Self { kind, store, policy } }

    /// Reject filters the kind does not understand and malformed label/annotation filters.
    fn validate(&self, query: &Query) -> ApiResult<()> {
        for f in &query.filters {
            if !self.policy.accepts(&f.field) {
                return Err(ApiError::Configuration(format!("unknown filter field {:?} for {}", f.field.as_str(), self.kind)));
            }
            if matches!(f.field, Field::Label | Field::Annotation) {
                let key = f.value.split('=').next().unwrap_or("").trim_end_matches('!');
                if key.is_empty() {
                    return Err(ApiError::Configuration(format!("malformed {} filter {:?}", f.field, f.value)));
                }
            }
        }
        Ok(())
    }
}

impl<S: CacheStore + ?Sized> ResourceAccessor for ResourceGetter<S> {
    fn kind(&self) -> Kind { self.kind }

    fn get(&self, name: &str) -> ApiResult<Arc<ResourceObject>> {
        self.store.get_by_name(self.kind, name).ok_or_else(|| {
            debug!(kind = %self.kind, name = %name, "api: get miss");
            ApiError::NotFound { kind: self.kind, name: name.to_string() }
        })
    }

    fn list(&self, query: &Query) -> ApiResult<ListResult> { self.explain(query).map(|(res, _)| res) }

    fn explain(&self, query: &Query) -> ApiResult<(ListResult, QueryDebugInfo)> {
        let t0 = Instant::now();
        self.validate(query)?;
        let items = self.store.list_all(self.kind);
        let (res, dbg) = appdeck_query::execute_with_debug(items, query, &self.policy);
        metrics::counter!("api_list_total", 1u64, "kind" => self.kind.as_str());
        debug!(kind = %self.kind, total = res.total, returned = res.items.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok((res, dbg))
    }
}

/// Kind-name routing over the per-kind accessors.
pub struct Resources {
    accessors: BTreeMap<Kind, Arc<dyn ResourceAccessor>>,
}

impl Resources {
    /// Build an accessor for every kind registered in `registry`.
    pub fn new(store: Arc<dyn CacheStore>, registry: &Registry) -> Self {
        let mut accessors: BTreeMap<Kind, Arc<dyn ResourceAccessor>> = BTreeMap::new();
        for kind in registry.kinds() {
            if let Some(policy) = registry.policy(kind) {
                accessors.insert(kind, Arc::new(ResourceGetter::new(kind, Arc::clone(&store), *policy)));
            }
        }
        info!(kinds = accessors.len(), "api: resources ready");
        Self { accessors }
    }

    pub fn with_defaults(store: Arc<dyn CacheStore>) -> Self { Self::new(store, &Registry::with_defaults()) }

    pub fn kinds(&self) -> Vec<Kind> { self.accessors.keys().copied().collect() }

    pub fn accessor(&self, kind: &str) -> ApiResult<Arc<dyn ResourceAccessor>> {
        let k: Kind = kind.parse().map_err(|e: appdeck_core::UnknownKind| ApiError::Configuration(e.to_string()))?;
        self.accessors
            .get(&k)
            .cloned()
            .ok_or_else(|| ApiError::Configuration(format!("no accessor registered for {}", k)))
    }

    pub fn get(&self, kind: &str, name: &str) -> ApiResult<Arc<ResourceObject>> { self.accessor(kind)?.get(name) }

    pub fn list(&self, kind: &str, query: &Query) -> ApiResult<ListResult> { self.accessor(kind)?.list(query) }

    /// Parse request parameters into a query and list.
    pub fn list_params<I, K, V>(&self, kind: &str, params: I) -> ApiResult<ListResult>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let accessor = self.accessor(kind)?;
        let query = Query::from_params(params).map_err(|e| ApiError::Configuration(e.to_string()))?;
        accessor.list(&query)
    }
}
