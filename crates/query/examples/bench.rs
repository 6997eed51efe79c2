use std::sync::Arc;
use std::time::Instant;

use appdeck_core::{Field, Kind, LabelSelector, Query, ResourceObject, SortDirection};
use appdeck_query::{execute, DISPLAY_NAME_POLICY};

fn gen_obj(i: usize) -> ResourceObject {
    let state = match i % 3 {
        0 => "active",
        1 => "draft",
        _ => "suspended",
    };
    ResourceObject::new(Kind::Application, format!("app-{i:06}"))
        .with_display_name(format!("chart-{}", i % 1000))
        .with_state(state)
        .with_creation_ts(1_577_836_800 + (i % 86_400) as i64) // 2020-01-01
        .with_label("team", format!("team{}", i % 20))
}

fn percentile_us(xs: &mut [u128], p: f64) -> u128 {
    xs.sort_unstable();
    let idx = ((xs.len() as f64 - 1.0) * p).round() as usize;
    xs[idx]
}

fn main() {
    let n: usize = std::env::var("APPDECK_BENCH_DOCS").ok().and_then(|s| s.parse().ok()).unwrap_or(100_000);
    let limit: usize = std::env::var("APPDECK_BENCH_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(50);

    eprintln!("building snapshot: {} objects", n);
    let t0 = Instant::now();
    let items: Vec<Arc<ResourceObject>> = (0..n).map(|i| Arc::new(gen_obj(i))).collect();
    let build_ms = t0.elapsed().as_secs_f64() * 1_000.0;

    let mut status_only: Vec<Query> = Vec::new();
    for (page, st) in ["active", "draft", "susp"].iter().enumerate() {
        status_only.push(Query::new().filter(Field::Status, *st).limit(limit).offset(page * limit));
    }
    let mut name_sorted: Vec<Query> = Vec::new();
    for v in 0..20 {
        let dir = if v % 2 == 0 { SortDirection::Forward } else { SortDirection::Reverse };
        name_sorted.push(Query::new().filter(Field::Name, format!("chart-{}", v)).sort_by(Field::Name).direction(dir).limit(limit));
    }
    let mut selected: Vec<Query> = Vec::new();
    for t in 0..20 {
        if let Ok(sel) = LabelSelector::parse(&format!("team=team{}", t)) {
            selected.push(Query::new().selector(sel).limit(limit));
        }
    }

    let run = |label: &str, qs: &[Query]| {
        let mut times: Vec<u128> = Vec::with_capacity(qs.len());
        let mut matched = 0usize;
        for q in qs {
            let t = Instant::now();
            matched += execute(items.clone(), q, &DISPLAY_NAME_POLICY).total;
            times.push(t.elapsed().as_micros());
        }
        let p50 = percentile_us(&mut times.clone(), 0.50) as f64 / 1000.0;
        let p99 = percentile_us(&mut times, 0.99) as f64 / 1000.0;
        println!("{}: p50={:.3}ms p99={:.3}ms ({} queries, limit={}, matched={})", label, p50, p99, qs.len(), limit, matched);
    };

    println!("snapshot_build: {:.1}ms objects={}", build_ms, n);
    run("status", &status_only);
    run("name_sorted", &name_sorted);
    run("label_selector", &selected);
}
