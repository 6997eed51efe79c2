//! Query model shared by the query engine, accessors and frontends.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;
use crate::ResourceObject;

/// Named field a filter or sort key refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Name,
    Names,
    Uid,
    Namespace,
    OwnerReference,
    OwnerKind,
    Annotation,
    Label,
    Status,
    CreateTime,
    Other(String),
}

impl Field {
    pub fn as_str(&self) -> &str {
        match self {
            Field::Name => "name",
            Field::Names => "names",
            Field::Uid => "uid",
            Field::Namespace => "namespace",
            Field::OwnerReference => "ownerReference",
            Field::OwnerKind => "ownerKind",
            Field::Annotation => "annotation",
            Field::Label => "label",
            Field::Status => "status",
            Field::CreateTime => "createTime",
            Field::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        match s {
            "name" => Field::Name,
            "names" => Field::Names,
            "uid" => Field::Uid,
            "namespace" => Field::Namespace,
            "ownerReference" => Field::OwnerReference,
            "ownerKind" => Field::OwnerKind,
            "annotation" => Field::Annotation,
            "label" => Field::Label,
            "status" => Field::Status,
            "createTime" | "creationTimestamp" => Field::CreateTime,
            other => Field::Other(other.to_string()),
        }
    }
}

impl FromStr for Field {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Ok(Field::from(s)) }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// `(field, expected value)`; matching semantics are decided per field by the kind's policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub field: Field,
    pub value: String,
}

impl Filter {
    pub fn new(field: impl Into<Field>, value: impl Into<String>) -> Self {
        Self { field: field.into(), value: value.into() }
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self { Field::from(s.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pagination {
    /// `None` returns every matching object.
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self { Self { limit: Some(limit), offset } }

    /// Clamp the window to `len` items.
    pub fn bounds(&self, len: usize) -> (usize, usize) {
        let start = self.offset.min(len);
        let end = match self.limit {
            Some(l) => start.saturating_add(l).min(len),
            None => len,
        };
        (start, end)
    }
}

/// `Forward` applies the kind comparator as registered, `Reverse` inverts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortDirection {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub pagination: Pagination,
    pub sort_by: Field,
    pub direction: SortDirection,
    pub filters: Vec<Filter>,
    pub label_selector: Option<LabelSelector>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            pagination: Pagination::default(),
            sort_by: Field::CreateTime,
            direction: SortDirection::Forward,
            filters: Vec::new(),
            label_selector: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid number for {key}: {value:?}")]
    InvalidNumber { key: String, value: String },
    #[error("invalid boolean for {key}: {value:?}")]
    InvalidBool { key: String, value: String },
    #[error("invalid label selector: {0}")]
    Selector(String),
    #[error("{0} and {1} cannot be combined")]
    Conflict(&'static str, &'static str),
}

pub const PARAM_LIMIT: &str = "limit";
pub const PARAM_PAGE: &str = "page";
pub const PARAM_OFFSET: &str = "offset";
pub const PARAM_SORT_BY: &str = "sortBy";
pub const PARAM_ASCENDING: &str = "ascending";
pub const PARAM_REVERSE: &str = "reverse";
pub const PARAM_LABEL_SELECTOR: &str = "labelSelector";

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn limit(mut self, limit: usize) -> Self { self.pagination.limit = Some(limit); self }
    pub fn offset(mut self, offset: usize) -> Self { self.pagination.offset = offset; self }
    pub fn sort_by(mut self, field: impl Into<Field>) -> Self { self.sort_by = field.into(); self }
    pub fn direction(mut self, d: SortDirection) -> Self { self.direction = d; self }
    pub fn filter(mut self, field: impl Into<Field>, value: impl Into<String>) -> Self {
        self.filters.push(Filter::new(field, value));
        self
    }
    pub fn selector(mut self, s: LabelSelector) -> Self { self.label_selector = Some(s); self }

    /// Parse request parameters. Reserved keys drive pagination, sorting and the label
    /// selector; every other key becomes a filter, in order of appearance.
    ///
    /// `page` is 1-based and only meaningful together with `limit`; it cannot be combined
    /// with an explicit `offset`. `ascending=true`
    /// (or `reverse=true`) flips the registered comparator.
    pub fn from_params<I, K, V>(params: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut q = Query::default();
        let mut page: Option<usize> = None;
        let mut offset_set = false;
        for (k, v) in params {
            let (k, v) = (k.as_ref(), v.as_ref().trim());
            match k {
                PARAM_LIMIT => q.pagination.limit = Some(parse_usize(k, v)?),
                PARAM_PAGE => page = Some(parse_usize(k, v)?),
                PARAM_OFFSET => {
                    q.pagination.offset = parse_usize(k, v)?;
                    offset_set = true;
                }
                PARAM_SORT_BY => q.sort_by = Field::from(v),
                PARAM_ASCENDING | PARAM_REVERSE => {
                    q.direction = if parse_bool(k, v)? { SortDirection::Reverse } else { SortDirection::Forward }
                }
                PARAM_LABEL_SELECTOR => {
                    if !v.is_empty() {
                        q.label_selector = Some(LabelSelector::parse(v).map_err(|e| ParseError::Selector(e.to_string()))?);
                    }
                }
                other => q.filters.push(Filter::new(other, v)),
            }
        }
        if page.is_some() && offset_set {
            return Err(ParseError::Conflict(PARAM_PAGE, PARAM_OFFSET));
        }
        if let (Some(p), Some(l)) = (page, q.pagination.limit) {
            q.pagination.offset = p.saturating_sub(1).saturating_mul(l);
        }
        Ok(q)
    }
}

fn parse_usize(key: &str, v: &str) -> Result<usize, ParseError> {
    v.parse::<usize>().map_err(|_| ParseError::InvalidNumber { key: key.to_string(), value: v.to_string() })
}

fn parse_bool(key: &str, v: &str) -> Result<bool, ParseError> {
    match v {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(ParseError::InvalidBool { key: key.to_string(), value: v.to_string() }),
    }
}

/// One page of results plus the number of filter-matched objects before pagination.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ListResult {
    pub items: Vec<Arc<ResourceObject>>,
    pub total: usize,
}

impl ListResult {
    pub fn names(&self) -> Vec<&str> { self.items.iter().map(|o| o.name.as_str()).collect() }
}
