//! Filter, count, sort and page a kind's objects.

use std::sync::Arc;
use std::time::Instant;

use appdeck_core::{ListResult, Query, ResourceObject, SortDirection};
use tracing::debug;

use crate::registry::KindPolicy;

/// Stage counts for `--explain` style output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueryDebugInfo {
    pub total: usize,
    pub after_selector: usize,
    pub after_filters: usize,
    pub returned: usize,
}

/// Run `query` over `objects` with the kind's `policy`.
///
/// Every filter must match (logical AND). `total` counts the filtered set before the
/// page window is applied. Sorting is stable, so equal elements keep their snapshot
/// order and successive pages over an unchanged snapshot never overlap. An offset past
/// the end yields an empty page, never an error.
pub fn execute(objects: Vec<Arc<ResourceObject>>, query: &Query, policy: &KindPolicy) -> ListResult {
    execute_with_debug(objects, query, policy).0
}

pub fn execute_with_debug(
    mut objects: Vec<Arc<ResourceObject>>,
    query: &Query,
    policy: &KindPolicy,
) -> (ListResult, QueryDebugInfo) {
    let started = Instant::now();
    let mut dbg = QueryDebugInfo { total: objects.len(), ..Default::default() };

    if let Some(sel) = query.label_selector.as_ref().filter(|s| !s.is_empty()) {
        objects.retain(|o| sel.matches(&o.labels));
    }
    dbg.after_selector = objects.len();

    if !query.filters.is_empty() {
        objects.retain(|o| query.filters.iter().all(|f| policy.matches(o, f)));
    }
    dbg.after_filters = objects.len();
    let total = objects.len();

    objects.sort_by(|a, b| {
        let ord = policy.compare(a, b, &query.sort_by);
        match query.direction {
            SortDirection::Forward => ord,
            SortDirection::Reverse => ord.reverse(),
        }
    });

    let (start, end) = query.pagination.bounds(total);
    let items: Vec<Arc<ResourceObject>> = if start == 0 && end == total {
        objects
    } else {
        objects.drain(start..end).collect()
    };
    dbg.returned = items.len();

    metrics::histogram!("query_exec_ms", started.elapsed().as_secs_f64() * 1000.0);
    metrics::histogram!("query_candidates", dbg.after_selector as f64);
    debug!(total = dbg.total, matched = total, returned = dbg.returned, sort_by = %query.sort_by, "query executed");
    (ListResult { items, total }, dbg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DISPLAY_NAME_POLICY;
    use appdeck_core::{Field, Kind, LabelSelector};

    fn objs(names: &[&str]) -> Vec<Arc<ResourceObject>> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| Arc::new(ResourceObject::new(Kind::Application, *n).with_creation_ts(i as i64)))
            .collect()
    }

    #[test]
    fn name_sort_is_descending_by_default() {
        let q = Query::new().sort_by(Field::Name);
        let res = execute(objs(&["a", "c", "b"]), &q, &DISPLAY_NAME_POLICY);
        assert_eq!(res.names(), vec!["c", "b", "a"]);
        let q = q.direction(SortDirection::Reverse);
        let res = execute(objs(&["a", "c", "b"]), &q, &DISPLAY_NAME_POLICY);
        assert_eq!(res.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn default_sort_is_creation_ascending() {
        let mut items = objs(&["x", "y", "z"]);
        items.reverse();
        let res = execute(items, &Query::new(), &DISPLAY_NAME_POLICY);
        assert_eq!(res.names(), vec!["x", "y", "z"]);
    }

    #[test]
    fn offset_past_end_keeps_total() {
        let q = Query::new().filter(Field::Name, "a").limit(5).offset(10);
        let res = execute(objs(&["a1", "a2", "b1"]), &q, &DISPLAY_NAME_POLICY);
        assert!(res.items.is_empty());
        assert_eq!(res.total, 2);
    }

    #[test]
    fn filters_are_anded_and_selector_applies_first() {
        let items = vec![
            Arc::new(ResourceObject::new(Kind::Release, "r1").with_state("active").with_label("env", "prod")),
            Arc::new(ResourceObject::new(Kind::Release, "r2").with_state("active").with_label("env", "dev")),
            Arc::new(ResourceObject::new(Kind::Release, "r3").with_state("failed").with_label("env", "prod")),
        ];
        let q = Query::new()
            .filter(Field::Status, "active")
            .filter(Field::Name, "r")
            .selector(LabelSelector::parse("env=prod").unwrap());
        let (res, dbg) = execute_with_debug(items, &q, &DISPLAY_NAME_POLICY);
        assert_eq!(res.names(), vec!["r1"]);
        assert_eq!(dbg, QueryDebugInfo { total: 3, after_selector: 2, after_filters: 1, returned: 1 });
    }
}
