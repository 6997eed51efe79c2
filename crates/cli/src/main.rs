use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use appdeck_api::Resources;
use appdeck_core::columns::{columns_for, ColumnKind, ColumnSpec};
use appdeck_core::{Delta, DeltaKind, Kind, ListResult, Query, ReleaseId, ResourceObject};
use appdeck_reconcile::{ReleaseControllerOptions, ReleasePhase, ReleaseScheduler, TaskEvent};
use appdeck_store::{spawn_ingest, BackendHandle};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "appdeckctl", version, about = "appdeck CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all)
    #[arg(long = "ns", global = true, env = "APPDECK_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the served resource kinds
    Kinds,
    /// List objects of a kind with filters, ordering and paging
    Ls {
        /// Kind name or alias, e.g. "apps", "versions", "releases"
        kind: String,
        #[arg(long)]
        limit: Option<usize>,
        /// 1-based page; needs --limit
        #[arg(long, conflicts_with = "offset")]
        page: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        /// name, createTime, status, ...
        #[arg(long = "sort-by")]
        sort_by: Option<String>,
        /// Invert the kind's natural order
        #[arg(long, action = ArgAction::SetTrue)]
        reverse: bool,
        /// Field filter `field=value`; repeatable, all must match
        #[arg(short = 'f', long = "filter")]
        filters: Vec<String>,
        /// Label selector, e.g. "env=prod,tier in (web,api)"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Print per-stage counts
        #[arg(long, action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// Fetch one object by name
    Get { kind: String, name: String },
    /// Run the release controller until Ctrl-C
    Reconcile {
        /// YAML options file (maxConcurrent, waitTime)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long = "max-concurrent")]
        max_concurrent: Option<usize>,
        /// Poll interval, e.g. "30s", "1m"
        #[arg(long = "wait-time", value_parser = humantime_arg)]
        wait_time: Option<Duration>,
    },
}

fn humantime_arg(s: &str) -> Result<Duration, String> { appdeck_reconcile::options::parse_wait(s) }

fn init_tracing() {
    let env = std::env::var("APPDECK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPDECK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid APPDECK_METRICS_ADDR; expected host:port");
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Kinds => {
            let rows: Vec<_> = Kind::ALL
                .iter()
                .map(|k| serde_json::json!({ "kind": k.as_str(), "plural": k.plural(), "gvk": k.gvk_key() }))
                .collect();
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<22} GVK", "KIND", "PLURAL");
                    for k in Kind::ALL {
                        println!("{:<20} {:<22} {}", k.as_str(), k.plural(), k.gvk_key());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&rows)?),
            }
        }
        Commands::Ls { kind, limit, page, offset, sort_by, reverse, filters, selector, explain } => {
            let k: Kind = kind.parse()?;
            let mut params: Vec<(String, String)> = Vec::new();
            let mut push = |key: &str, v: Option<String>| {
                if let Some(v) = v {
                    params.push((key.to_string(), v));
                }
            };
            push(appdeck_core::query::PARAM_LIMIT, limit.map(|v| v.to_string()));
            push(appdeck_core::query::PARAM_PAGE, page.map(|v| v.to_string()));
            push(appdeck_core::query::PARAM_OFFSET, offset.map(|v| v.to_string()));
            push(appdeck_core::query::PARAM_SORT_BY, sort_by);
            push(appdeck_core::query::PARAM_REVERSE, reverse.then(|| "true".to_string()));
            push(appdeck_core::query::PARAM_LABEL_SELECTOR, selector);
            for f in &filters {
                params.push(parse_filter(f)?);
            }
            let query = Query::from_params(params)?;
            info!(kind = %k, ns = ?ns, filters = query.filters.len(), "ls invoked");

            let (backend, watcher) = sync_kind(k, ns).await?;
            let resources = Resources::with_defaults(Arc::new(backend));
            let (res, dbg) = resources.accessor(k.as_str())?.explain(&query)?;
            match cli.output {
                Output::Human => print_table(k, &res),
                Output::Json | Output::Yaml => {
                    #[derive(serde::Serialize)]
                    struct Listing<'a> {
                        total: usize,
                        items: Vec<&'a ResourceObject>,
                        #[serde(skip_serializing_if = "Option::is_none")]
                        debug: Option<&'a appdeck_query::QueryDebugInfo>,
                    }
                    let out = Listing { total: res.total, items: res.items.iter().map(|o| o.as_ref()).collect(), debug: explain.then_some(&dbg) };
                    if cli.output == Output::Json {
                        println!("{}", serde_json::to_string_pretty(&out)?);
                    } else {
                        print!("{}", serde_yaml::to_string(&out)?);
                    }
                }
            }
            if explain && cli.output == Output::Human {
                eprintln!(
                    "debug: total={} after_selector={} after_filters={} returned={}",
                    dbg.total, dbg.after_selector, dbg.after_filters, dbg.returned
                );
            }
            watcher.abort();
        }
        Commands::Get { kind, name } => {
            let k: Kind = kind.parse()?;
            info!(kind = %k, name = %name, "get invoked");
            let (backend, watcher) = sync_kind(k, ns).await?;
            let resources = Resources::with_defaults(Arc::new(backend));
            let obj = resources.get(k.as_str(), &name)?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&obj.raw)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj.raw)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&*obj)?),
            }
            watcher.abort();
        }
        Commands::Reconcile { config, max_concurrent, wait_time } => {
            let mut opts = match &config {
                Some(path) => ReleaseControllerOptions::load(path)?,
                None => ReleaseControllerOptions::default(),
            };
            opts.apply_env()?;
            if let Some(n) = max_concurrent {
                opts.max_concurrent = n;
            }
            if let Some(d) = wait_time {
                opts.wait_time = d;
            }
            let problems = opts.validate();
            if !problems.is_empty() {
                let msg: Vec<String> = problems.iter().map(|e| e.to_string()).collect();
                bail!("invalid release controller options: {}", msg.join("; "));
            }
            run_controller(opts, ns, cli.output).await?;
        }
    }

    Ok(())
}

/// Start list+watch for one kind and wait for the first snapshot.
async fn sync_kind(kind: Kind, ns: Option<&str>) -> Result<(BackendHandle, tokio::task::JoinHandle<()>)> {
    let cap = env_usize("APPDECK_QUEUE_CAP", 2048);
    let (ingest_tx, backend) = spawn_ingest(cap);
    let watcher = tokio::spawn({
        let ns = ns.map(|s| s.to_string());
        let tx = ingest_tx.clone();
        async move {
            if let Err(e) = appdeck_kubehub::start_watcher(kind, ns.as_deref(), tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });
    let primed = appdeck_kubehub::prime_list(kind, ns, &ingest_tx).await.context("initial list")?;
    if primed > 0 {
        let wait_secs = env_usize("APPDECK_WAIT_SECS", 8) as u64;
        let seen = backend.wait_for_count(kind, primed, Duration::from_secs(wait_secs)).await;
        if seen < primed {
            warn!(kind = %kind, seen, primed, "snapshot incomplete after wait");
        } else {
            info!(kind = %kind, seen, epoch = *backend.subscribe_epoch().borrow(), "snapshot ready");
        }
    }
    Ok((backend, watcher))
}

async fn run_controller(opts: ReleaseControllerOptions, ns: Option<&str>, output: Output) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let provider = Arc::new(appdeck_kubehub::KubeReleaseStatus::new(client.clone()).await?);
    let sink = Arc::new(appdeck_kubehub::KubeStatusSink::new(client).await?);
    let cancel = CancellationToken::new();
    let scheduler = ReleaseScheduler::new(opts, provider, sink, cancel.clone());

    let printer = tokio::spawn(print_events(scheduler.subscribe(), output));
    let cap = env_usize("APPDECK_QUEUE_CAP", 2048);
    let (tap_tx, mut tap_rx) = mpsc::channel::<Delta>(cap);
    let watcher = tokio::spawn({
        let ns = ns.map(|s| s.to_string());
        async move {
            if let Err(e) = appdeck_kubehub::start_watcher(Kind::Release, ns.as_deref(), tap_tx).await {
                error!(error = ?e, "release watcher failed");
            }
        }
    });
    info!(max_concurrent = opts.max_concurrent, wait_time = ?opts.wait_time, "release controller started");

    loop {
        tokio::select! {
            maybe = tap_rx.recv() => {
                match maybe {
                    Some(d) => match feed_action(&d) {
                        Some(FeedAction::Enqueue(id)) => {
                            scheduler.enqueue(id);
                        }
                        Some(FeedAction::Cancel(id)) => {
                            scheduler.cancel(&id);
                        }
                        None => {}
                    },
                    None => {
                        warn!("release feed closed; stopping controller");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down controller");
                break;
            }
        }
    }

    watcher.abort();
    scheduler.shutdown().await;
    printer.abort();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum FeedAction {
    Enqueue(ReleaseId),
    Cancel(ReleaseId),
}

/// Deleted releases stop their task; applied ones are enqueued while their state is unsettled.
fn feed_action(d: &Delta) -> Option<FeedAction> {
    let name = d.key.name.clone();
    let id = match d.raw.pointer("/metadata/namespace").and_then(|v| v.as_str()) {
        Some(ns) => ReleaseId::namespaced(ns, name),
        None => ReleaseId::new(name),
    };
    if d.op == DeltaKind::Deleted {
        return Some(FeedAction::Cancel(id));
    }
    let state = d.raw.pointer("/status/state").and_then(|v| v.as_str()).unwrap_or("");
    if appdeck_kubehub::status::phase_from_state(state, None) != ReleasePhase::Pending {
        return None;
    }
    Some(FeedAction::Enqueue(id))
}

async fn print_events(mut rx: broadcast::Receiver<TaskEvent>, output: Output) {
    loop {
        match rx.recv().await {
            Ok(ev) => match output {
                Output::Human => {
                    println!("{:>5} {:<40} {:<12} attempts={}", ev.generation, ev.id.to_string(), format!("{:?}", ev.state), ev.attempts)
                }
                Output::Json | Output::Yaml => match serde_json::to_string(&ev) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "encode event"),
                },
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn parse_filter(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => bail!("invalid filter {:?}; expected field=value", s),
    }
}

fn print_table(kind: Kind, res: &ListResult) {
    let cols = columns_for(kind);
    let header: Vec<String> = cols.iter().map(|c| format!("{:<w$}", c.label, w = c.width)).collect();
    println!("{}", header.join(" ").trim_end());
    for obj in &res.items {
        let row: Vec<String> = cols.iter().map(|c| format!("{:<w$}", cell(c, obj), w = c.width)).collect();
        println!("{}", row.join(" ").trim_end());
    }
    eprintln!("{} of {} shown", res.items.len(), res.total);
}

fn cell(col: &ColumnSpec, obj: &ResourceObject) -> String {
    match col.kind {
        ColumnKind::Name => obj.name.clone(),
        ColumnKind::DisplayName => obj.display_name.clone(),
        ColumnKind::Status => if obj.state.is_empty() { "-".to_string() } else { obj.state.clone() },
        ColumnKind::Age => render_age(obj.creation_ts, chrono::Utc::now().timestamp()),
        ColumnKind::Projected(id) => obj.projected(id).unwrap_or("-").to_string(),
    }
}

fn render_age(creation_ts: i64, now: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
