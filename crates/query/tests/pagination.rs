#![forbid(unsafe_code)]

use std::sync::Arc;

use appdeck_core::{Field, Filter, Kind, Query, ResourceObject, SortDirection};
use appdeck_query::{execute, Registry, DISPLAY_NAME_POLICY};

fn fixture() -> Vec<Arc<ResourceObject>> {
    let states = ["Active", "Draft", "Inactive", "active", "Active-pending", "Deleted"];
    (0..37)
        .map(|i| {
            Arc::new(
                ResourceObject::new(Kind::Application, format!("app-{i:03}"))
                    .with_display_name(format!("chart-{}", i % 7))
                    .with_state(states[i % states.len()])
                    // duplicate timestamps exercise the name tie-break
                    .with_creation_ts((i / 3) as i64),
            )
        })
        .collect()
}

fn matching(items: &[Arc<ResourceObject>], filters: &[Filter]) -> usize {
    items.iter().filter(|o| filters.iter().all(|f| DISPLAY_NAME_POLICY.matches(o, f))).count()
}

#[test]
fn total_is_independent_of_window() {
    let items = fixture();
    let filter_sets = vec![
        vec![],
        vec![Filter::new(Field::Status, "Active")],
        vec![Filter::new(Field::Name, "chart-1"), Filter::new(Field::Status, "ctive")],
        vec![Filter::new(Field::Name, "nope")],
    ];
    for filters in filter_sets {
        let expected = matching(&items, &filters);
        for (limit, offset) in [(1, 0), (5, 3), (10, 30), (100, 0), (3, 1000)] {
            let mut q = Query::new().limit(limit).offset(offset);
            q.filters = filters.clone();
            let res = execute(items.clone(), &q, &DISPLAY_NAME_POLICY);
            assert_eq!(res.total, expected, "filters={:?} limit={} offset={}", filters, limit, offset);
            assert!(res.items.len() <= limit);
        }
    }
}

#[test]
fn page_sweep_reproduces_full_sequence_once() {
    let items = fixture();
    for sort in [Field::Name, Field::CreateTime, Field::Other("unknown".into())] {
        for dir in [SortDirection::Forward, SortDirection::Reverse] {
            let full = Query::new().sort_by(sort.clone()).direction(dir).filter(Field::Status, "ctive");
            let all = execute(items.clone(), &full, &DISPLAY_NAME_POLICY);
            for limit in [1usize, 4, 7, 50] {
                let mut swept: Vec<String> = Vec::new();
                let mut offset = 0;
                while offset < all.total {
                    let page = execute(items.clone(), &full.clone().limit(limit).offset(offset), &DISPLAY_NAME_POLICY);
                    assert_eq!(page.total, all.total);
                    swept.extend(page.items.iter().map(|o| o.name.clone()));
                    offset += limit;
                }
                let expected: Vec<String> = all.items.iter().map(|o| o.name.clone()).collect();
                assert_eq!(swept, expected, "sort={} dir={:?} limit={}", sort, dir, limit);
            }
        }
    }
}

#[test]
fn status_substring_is_case_sensitive() {
    let items = fixture();
    let q = Query::new().filter(Field::Status, "Active");
    let res = execute(items.clone(), &q, &DISPLAY_NAME_POLICY);
    assert!(!res.items.is_empty());
    for o in &res.items {
        assert!(o.state.contains("Active"), "{} has state {}", o.name, o.state);
    }
    // "Inactive" and lowercase "active" are excluded; "Active-pending" is included
    let states: std::collections::BTreeSet<&str> = res.items.iter().map(|o| o.state.as_str()).collect();
    assert_eq!(states.into_iter().collect::<Vec<_>>(), vec!["Active", "Active-pending"]);
    assert_eq!(res.total, matching(&items, &q.filters));
}

#[test]
fn name_sort_reverse_alphabetical() {
    let items: Vec<Arc<ResourceObject>> =
        ["a", "c", "b"].iter().map(|n| Arc::new(ResourceObject::new(Kind::Release, *n))).collect();
    let res = execute(items, &Query::new().sort_by("name"), &DISPLAY_NAME_POLICY);
    assert_eq!(res.names(), vec!["c", "b", "a"]);
}

#[test]
fn out_of_range_page_is_empty_with_total() {
    let items = fixture();
    let q = Query::new().filter(Field::Status, "Draft").limit(10).offset(500);
    let res = execute(items.clone(), &q, &DISPLAY_NAME_POLICY);
    assert!(res.items.is_empty());
    assert!(res.total > 0);
}

#[test]
fn every_registered_kind_shares_the_engine() {
    let reg = Registry::with_defaults();
    for kind in Kind::ALL {
        let policy = reg.policy(kind).expect("registered");
        let items: Vec<Arc<ResourceObject>> =
            ["x", "z", "y"].iter().map(|n| Arc::new(ResourceObject::new(kind, *n).with_state("active"))).collect();
        let res = execute(items, &Query::new().sort_by(Field::Name).filter(Field::Status, "act"), policy);
        assert_eq!(res.names(), vec!["z", "y", "x"], "kind {}", kind);
    }
}
