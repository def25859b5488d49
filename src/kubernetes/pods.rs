// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Pod listing and watch stream feeding the workload/image watcher

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Only running pods have stable image IDs
pub const RUNNING_PODS_SELECTOR: &str = "status.phase=Running";

/// Page size for the initial listing
const PAGE_SIZE: u32 = 500;

/// Buffered watch events between the API stream and the watcher loop
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// A full pod listing and the resource version to watch from
#[derive(Debug, Clone, Default)]
pub struct PodSnapshot {
    pub pods: Vec<Pod>,
    pub resource_version: String,
}

#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

#[async_trait]
pub trait PodSource: Send + Sync {
    /// Synchronous full listing
    async fn list_pods(&self) -> Result<PodSnapshot>;

    /// Subscribe to changes after `resource_version`
    ///
    /// The receiver yields events until the stream ends (channel closed) or
    /// fails (an `Err` item, after which nothing more is sent).
    async fn watch_pods(&self, resource_version: &str) -> Result<mpsc::Receiver<Result<PodEvent>>>;
}

/// Pod source over the Kubernetes API, cluster-wide
#[derive(Clone)]
pub struct KubePodSource {
    api: Api<Pod>,
    field_selector: String,
    watch_timeout_secs: u32,
}

impl KubePodSource {
    pub fn new(client: Client, watch_timeout_secs: u32) -> Self {
        Self {
            api: Api::all(client),
            field_selector: RUNNING_PODS_SELECTOR.to_string(),
            watch_timeout_secs,
        }
    }
}

#[async_trait]
impl PodSource for KubePodSource {
    async fn list_pods(&self) -> Result<PodSnapshot> {
        let mut snapshot = PodSnapshot::default();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = ListParams::default()
                .fields(&self.field_selector)
                .limit(PAGE_SIZE);
            if let Some(ref token) = continue_token {
                params = params.continue_token(token);
            }

            let list = self
                .api
                .list(&params)
                .await
                .map_err(|e| anyhow!("K8s API error listing pods: {}", e))?;

            snapshot.pods.extend(list.items);
            if let Some(rv) = list.metadata.resource_version {
                snapshot.resource_version = rv;
            }

            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        debug!(
            pods = snapshot.pods.len(),
            resource_version = %snapshot.resource_version,
            "Listed running pods"
        );
        Ok(snapshot)
    }

    async fn watch_pods(&self, resource_version: &str) -> Result<mpsc::Receiver<Result<PodEvent>>> {
        let api = self.api.clone();
        let params = WatchParams::default()
            .fields(&self.field_selector)
            .timeout(self.watch_timeout_secs);
        let version = resource_version.to_string();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let opened = tokio::select! {
                _ = tx.closed() => return,
                opened = api.watch(&params, &version) => opened,
            };
            match opened {
                Ok(stream) => forward_watch_events(stream, tx).await,
                Err(e) => {
                    let _ = tx.send(Err(anyhow!("Failed to start pod watch: {}", e))).await;
                }
            }
        });

        Ok(rx)
    }
}

/// Forward API watch events to the watcher until the stream ends, fails, or
/// the receiver is dropped
async fn forward_watch_events<S>(stream: S, tx: mpsc::Sender<Result<PodEvent>>)
where
    S: Stream<Item = kube::Result<WatchEvent<Pod>>>,
{
    futures::pin_mut!(stream);

    loop {
        let item = tokio::select! {
            // Receiver dropped: the watcher is shutting down
            _ = tx.closed() => {
                debug!("Pod watch receiver dropped, closing stream");
                return;
            }
            item = stream.next() => item,
        };
        let Some(item) = item else {
            return;
        };

        let event = match item {
            Ok(WatchEvent::Added(pod)) => PodEvent::Added(pod),
            Ok(WatchEvent::Modified(pod)) => PodEvent::Modified(pod),
            Ok(WatchEvent::Deleted(pod)) => PodEvent::Deleted(pod),
            Ok(WatchEvent::Bookmark(_)) => continue,
            Ok(WatchEvent::Error(e)) => {
                warn!(error = ?e, "Pod watch returned an error event");
                let _ = tx.send(Err(anyhow!("Pod watch error: {:?}", e))).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(anyhow!("Pod watch stream failed: {}", e))).await;
                return;
            }
        };
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
}
