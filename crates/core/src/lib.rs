//! appdeck core types: resource kinds, cached objects, deltas and queries.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod columns;
pub mod query;
pub mod selector;

pub use query::{Field, Filter, ListResult, Pagination, ParseError, Query, SortDirection};
pub use selector::LabelSelector;

/// API group serving the application custom resources.
pub const GROUP: &str = "apps.appdeck.io";
/// Served version of the application custom resources.
pub const VERSION: &str = "v1alpha1";

/// Resource kinds mirrored by the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Application,
    ApplicationVersion,
    Release,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Application, Kind::ApplicationVersion, Kind::Release];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Application => "Application",
            Kind::ApplicationVersion => "ApplicationVersion",
            Kind::Release => "Release",
        }
    }

    /// Lowercase plural used in REST paths.
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Application => "applications",
            Kind::ApplicationVersion => "applicationversions",
            Kind::Release => "releases",
        }
    }

    /// `group/version/Kind` key as used by discovery and the watcher.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}/{}", GROUP, VERSION, self.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let k = s.trim().to_ascii_lowercase();
        // Accept a full gvk key as well as short aliases
        let k = k.rsplit('/').next().unwrap_or("");
        match k {
            "application" | "applications" | "app" | "apps" => Ok(Kind::Application),
            "applicationversion" | "applicationversions" | "appversion" | "appversions" | "version" | "versions" => {
                Ok(Kind::ApplicationVersion)
            }
            "release" | "releases" | "rls" => Ok(Kind::Release),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// Well-known state strings. States stay free-form strings on objects.
pub mod states {
    pub const DRAFT: &str = "draft";
    pub const SUBMITTED: &str = "submitted";
    pub const PASSED: &str = "passed";
    pub const REJECTED: &str = "rejected";
    pub const SUSPENDED: &str = "suspended";
    pub const ACTIVE: &str = "active";
    pub const DELETED: &str = "deleted";

    pub const CREATING: &str = "creating";
    pub const CREATED: &str = "created";
    pub const UPGRADING: &str = "upgrading";
    pub const UPGRADED: &str = "upgraded";
    pub const DELETING: &str = "deleting";
    pub const FAILED: &str = "failed";
}

/// Identity of an object inside the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: Kind,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, name: impl Into<String>) -> Self { Self { kind, name: name.into() } }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: ObjectKey,
    pub op: DeltaKind,
    /// Raw object (managed fields stripped)
    pub raw: serde_json::Value,
}

impl Delta {
    /// Build a delta from a raw object, reading `metadata.name`.
    pub fn from_raw(kind: Kind, op: DeltaKind, raw: serde_json::Value) -> Option<Self> {
        let name = raw.pointer("/metadata/name").and_then(|v| v.as_str())?.to_string();
        Some(Self { key: ObjectKey { kind, name }, op, raw })
    }

    /// Deletion known only by name, e.g. an object missing from a relist.
    pub fn tombstone(kind: Kind, name: impl Into<String>) -> Self {
        let name = name.into();
        let raw = serde_json::json!({ "metadata": { "name": name } });
        Self { key: ObjectKey { kind, name }, op: DeltaKind::Deleted, raw }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub uid: String,
    pub kind: String,
}

/// Cached, read-only projection of an application resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceObject {
    pub kind: Kind,
    /// metadata.name; identity within a kind.
    pub name: String,
    /// spec.name, falling back to metadata.name.
    pub display_name: String,
    pub namespace: Option<String>,
    pub uid: String,
    /// status.state; empty when the controller has not reported yet.
    pub state: String,
    pub creation_ts: i64,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 4]>,
    pub owner_refs: SmallVec<[OwnerRef; 2]>,
    /// Projected per-kind columns (see [`columns`]).
    pub projected: SmallVec<[ProjectedEntry; 8]>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub raw: serde_json::Value,
}

impl ResourceObject {
    /// Minimal object, mostly useful for tests and fixtures.
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind,
            display_name: name.clone(),
            name,
            namespace: None,
            uid: String::new(),
            state: String::new(),
            creation_ts: 0,
            labels: SmallVec::new(),
            annotations: SmallVec::new(),
            owner_refs: SmallVec::new(),
            projected: SmallVec::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self { self.state = state.into(); self }
    pub fn with_display_name(mut self, n: impl Into<String>) -> Self { self.display_name = n.into(); self }
    pub fn with_creation_ts(mut self, ts: i64) -> Self { self.creation_ts = ts; self }
    pub fn with_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.labels.push((k.into(), v.into()));
        self
    }

    pub fn key(&self) -> ObjectKey { ObjectKey { kind: self.kind, name: self.name.clone() } }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn projected(&self, id: u32) -> Option<&str> {
        self.projected.iter().find(|(i, _)| *i == id).map(|(_, v)| v.as_str())
    }
}

/// Entry representing a projected field: `(ColumnId, RenderedValue)`
pub type ProjectedEntry = (u32, String);

/// Projector takes a raw JSON object and yields rendered projected scalars.
pub trait Projector: Send + Sync {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]>;
}

/// Identity of a release targeted by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReleaseId {
    pub namespace: Option<String>,
    pub name: String,
}

impl ReleaseId {
    pub fn new(name: impl Into<String>) -> Self { Self { namespace: None, name: name.into() } }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&ResourceObject> for ReleaseId {
    fn from(o: &ResourceObject) -> Self { Self { namespace: o.namespace.clone(), name: o.name.clone() } }
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, Field, Filter, Kind, LabelSelector, ListResult, ObjectKey, Projector, ProjectedEntry, Query,
        ReleaseId, ResourceObject, SortDirection,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_aliases_parse() {
        assert_eq!("apps".parse::<Kind>().unwrap(), Kind::Application);
        assert_eq!("AppVersion".parse::<Kind>().unwrap(), Kind::ApplicationVersion);
        assert_eq!("apps.appdeck.io/v1alpha1/Release".parse::<Kind>().unwrap(), Kind::Release);
        assert!("pods".parse::<Kind>().is_err());
    }

    #[test]
    fn delta_requires_name() {
        let raw = serde_json::json!({ "metadata": { "name": "a" } });
        let d = Delta::from_raw(Kind::Release, DeltaKind::Applied, raw).unwrap();
        assert_eq!(d.key, ObjectKey::new(Kind::Release, "a"));
        assert!(Delta::from_raw(Kind::Release, DeltaKind::Applied, serde_json::json!({})).is_none());
    }

    #[test]
    fn release_id_display() {
        assert_eq!(ReleaseId::new("r").to_string(), "r");
        assert_eq!(ReleaseId::namespaced("ns", "r").to_string(), "ns/r");
    }
}
