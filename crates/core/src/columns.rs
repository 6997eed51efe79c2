//! Per-kind columns and projectors for the application resources.
//!
//! This module provides:
//! - Stable column IDs + specs (labels, widths, kinds)
//! - A registry mapping each [`Kind`] to its column set
//! - A JSON projector that fills `ResourceObject.projected`

#![forbid(unsafe_code)]

use smallvec::SmallVec;

use crate::{Kind, ProjectedEntry, Projector};

/// Label carrying the owning application id on versions and releases.
pub const LABEL_APP_ID: &str = "application.appdeck.io/app-id";
/// Label carrying the application version id on releases.
pub const LABEL_APP_VERSION_ID: &str = "application.appdeck.io/app-version-id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Name,
    DisplayName,
    Status,
    Age,
    Projected(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    pub label: &'static str,
    pub width: usize,
}

// ---------------- Column IDs (stable) ----------------
// Applications
pub const APP_LATEST_VERSION: u32 = 10_001;
pub const APP_UPDATED: u32 = 10_002;

// Application versions
pub const VER_VERSION: u32 = 11_001;
pub const VER_APP_ID: u32 = 11_002;

// Releases
pub const RLS_NAMESPACE: u32 = 12_001;
pub const RLS_CHART_VERSION: u32 = 12_002;
pub const RLS_APP_VERSION_ID: u32 = 12_003;
pub const RLS_MESSAGE: u32 = 12_004;

fn col(kind: ColumnKind, label: &'static str, width: usize) -> ColumnSpec {
    ColumnSpec { kind, label, width }
}

/// Return the full column set for a kind, including Name/Display/Status/Age.
pub fn columns_for(kind: Kind) -> Vec<ColumnSpec> {
    let mut cols = vec![col(ColumnKind::Name, "NAME", 40), col(ColumnKind::DisplayName, "DISPLAY", 24)];
    match kind {
        Kind::Application => {
            cols.push(col(ColumnKind::Projected(APP_LATEST_VERSION), "LATEST", 12));
            cols.push(col(ColumnKind::Projected(APP_UPDATED), "UPDATED", 22));
        }
        Kind::ApplicationVersion => {
            cols.push(col(ColumnKind::Projected(VER_VERSION), "VERSION", 12));
            cols.push(col(ColumnKind::Projected(VER_APP_ID), "APP", 24));
        }
        Kind::Release => {
            cols.push(col(ColumnKind::Projected(RLS_NAMESPACE), "TARGET", 16));
            cols.push(col(ColumnKind::Projected(RLS_CHART_VERSION), "CHART", 12));
            cols.push(col(ColumnKind::Projected(RLS_APP_VERSION_ID), "APP VERSION", 24));
        }
    }
    cols.push(col(ColumnKind::Status, "STATUS", 12));
    cols.push(col(ColumnKind::Age, "AGE", 8));
    if kind == Kind::Release {
        // free text, kept last so it does not shift the fixed-width columns
        cols.push(col(ColumnKind::Projected(RLS_MESSAGE), "MESSAGE", 0));
    }
    cols
}

/// Projector for a kind.
pub fn projector_for(kind: Kind) -> std::sync::Arc<dyn Projector + Send + Sync> {
    std::sync::Arc::new(KindProjector { kind })
}

struct KindProjector {
    kind: Kind,
}

fn str_at<'a>(raw: &'a serde_json::Value, ptr: &str) -> Option<&'a str> {
    raw.pointer(ptr).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

impl KindProjector {
    fn project_application(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        if let Some(v) = str_at(raw, "/status/latestVersion") { out.push((APP_LATEST_VERSION, v.to_string())); }
        if let Some(ts) = str_at(raw, "/status/updateTime") { out.push((APP_UPDATED, ts.to_string())); }
        out
    }

    fn project_version(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        // Chart metadata carries the version when spec.version is absent
        if let Some(v) = str_at(raw, "/spec/version").or_else(|| str_at(raw, "/spec/metadata/version")) {
            out.push((VER_VERSION, v.to_string()));
        }
        if let Some(app) = raw
            .pointer("/metadata/labels")
            .and_then(|l| l.get(LABEL_APP_ID))
            .and_then(|v| v.as_str())
        {
            out.push((VER_APP_ID, app.to_string()));
        }
        out
    }

    fn project_release(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        if let Some(ns) = str_at(raw, "/spec/namespace").or_else(|| str_at(raw, "/metadata/namespace")) {
            out.push((RLS_NAMESPACE, ns.to_string()));
        }
        if let Some(v) = str_at(raw, "/spec/chartVersion") { out.push((RLS_CHART_VERSION, v.to_string())); }
        let app_version = str_at(raw, "/spec/applicationVersionId")
            .or_else(|| raw.pointer("/metadata/labels").and_then(|l| l.get(LABEL_APP_VERSION_ID)).and_then(|v| v.as_str()));
        if let Some(v) = app_version { out.push((RLS_APP_VERSION_ID, v.to_string())); }
        if let Some(m) = str_at(raw, "/status/message") { out.push((RLS_MESSAGE, m.to_string())); }
        out
    }
}

impl Projector for KindProjector {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        match self.kind {
            Kind::Application => self.project_application(raw),
            Kind::ApplicationVersion => self.project_version(raw),
            Kind::Release => self.project_release(raw),
        }
    }
}
