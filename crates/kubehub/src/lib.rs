//! appdeck kubehub: list+watch of the application resources and the kube-backed release
//! status provider/sink.

#![forbid(unsafe_code)]

pub mod status;

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use appdeck_core::{Delta, DeltaKind, Kind, GROUP};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use tokio::sync::mpsc;

pub use status::{KubeReleaseStatus, KubeStatusSink};

/// Resolve the served resource for `kind` via discovery of the appdeck group.
pub(crate) async fn find_api_resource(client: Client, kind: Kind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).filter(&[GROUP]).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.kind == kind.as_str() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("resource not served: {}", kind.gvk_key()))
}

pub(crate) fn scoped_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn delta_from(kind: Kind, obj: &DynamicObject, op: DeltaKind) -> Result<Delta> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Delta::from_raw(kind, op, raw).ok_or_else(|| anyhow!("{} object missing metadata.name", kind))
}

async fn send_delta(kind: Kind, obj: &DynamicObject, op: DeltaKind, tx: &mpsc::Sender<Delta>) -> bool {
    match delta_from(kind, obj, op) {
        Ok(d) => tx.send(d).await.is_ok(),
        Err(e) => {
            warn!(kind = %kind, error = %e, "watch: skipping object");
            true
        }
    }
}

/// Names forwarded by one watcher, used to turn a relist into deletions for objects that
/// vanished while the watch was down.
#[derive(Debug, Default)]
pub struct SeenNames {
    names: HashSet<String>,
}

impl SeenNames {
    pub fn applied(&mut self, name: &str) { self.names.insert(name.to_string()); }

    pub fn deleted(&mut self, name: &str) { self.names.remove(name); }

    /// Replace the known set with `relisted` and return the names that disappeared, sorted.
    pub fn relist<'a>(&mut self, relisted: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let fresh: HashSet<String> = relisted.into_iter().map(str::to_string).collect();
        let mut gone: Vec<String> = self.names.difference(&fresh).cloned().collect();
        gone.sort();
        self.names = fresh;
        gone
    }

    pub fn len(&self) -> usize { self.names.len() }

    pub fn is_empty(&self) -> bool { self.names.is_empty() }
}

/// One-shot list of `kind`, sent as applied deltas. Returns the number of objects.
pub async fn prime_list(kind: Kind, namespace: Option<&str>, delta_tx: &mpsc::Sender<Delta>) -> Result<usize> {
    let client = Client::try_default().await?;
    let (ar, namespaced) = find_api_resource(client.clone(), kind).await?;
    let api = scoped_api(client, &ar, namespaced, namespace);
    let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", kind.plural()))?;
    let n = list.items.len();
    for o in &list.items {
        if !send_delta(kind, o, DeltaKind::Applied, delta_tx).await {
            break;
        }
    }
    info!(kind = %kind, ns = ?namespace, count = n, "prime list sent");
    Ok(n)
}

/// List+watch `kind` and forward every event as a delta. Returns when the stream ends or the
/// receiver goes away.
pub async fn start_watcher(kind: Kind, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let client = Client::try_default().await?;
    let (ar, namespaced) = find_api_resource(client.clone(), kind).await?;
    let api = scoped_api(client, &ar, namespaced, namespace);

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watcher started");
    let mut seen = SeenNames::default();
    while let Some(ev) = stream.try_next().await? {
        let open = match ev {
            Event::Applied(o) => {
                seen.applied(&o.name_any());
                send_delta(kind, &o, DeltaKind::Applied, &delta_tx).await
            }
            Event::Deleted(o) => {
                seen.deleted(&o.name_any());
                send_delta(kind, &o, DeltaKind::Deleted, &delta_tx).await
            }
            Event::Restarted(list) => {
                let gone = seen.relist(list.iter().filter_map(|o| o.metadata.name.as_deref()));
                debug!(kind = %kind, count = list.len(), gone = gone.len(), "watch restart");
                metrics::counter!("watch_restarts_total", 1u64, "kind" => kind.as_str());
                let mut open = true;
                for o in list.iter() {
                    if !send_delta(kind, o, DeltaKind::Applied, &delta_tx).await {
                        open = false;
                        break;
                    }
                }
                for name in gone {
                    if !open {
                        break;
                    }
                    open = delta_tx.send(Delta::tombstone(kind, name)).await.is_ok();
                }
                open
            }
        };
        if !open {
            debug!(kind = %kind, "watch: receiver closed");
            return Ok(());
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}
