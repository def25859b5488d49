// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! In-memory accessor and pod source for unit tests

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::accessor::ClusterAccessor;
use super::discovery;
use super::pods::{PodEvent, PodSnapshot, PodSource};
use super::workload::Workload;

/// Accessor backed by a fixed set of objects
#[derive(Default)]
pub struct FakeAccessor {
    objects: Vec<Workload>,
    failing_kinds: HashSet<String>,
    pub gets: AtomicUsize,
}

impl FakeAccessor {
    pub fn with(mut self, workload: Workload) -> Self {
        self.objects.push(workload);
        self
    }

    /// Make listing of `kind` fail like an unreachable API server
    pub fn failing_list(mut self, kind: &str) -> Self {
        self.failing_kinds.insert(kind.to_string());
        self
    }

    fn same_kind(workload: &Workload, kind: &str) -> bool {
        let wanted = discovery::core_registry()
            .get(kind)
            .map(|info| info.api_resource.kind.clone())
            .unwrap_or_else(|| kind.to_string());
        workload.kind().eq_ignore_ascii_case(&wanted)
    }
}

#[async_trait]
impl ClusterAccessor for FakeAccessor {
    async fn list_workloads(
        &self,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>> {
        if self.failing_kinds.contains(kind) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self
            .objects
            .iter()
            .filter(|w| Self::same_kind(w, kind))
            // Cluster-scoped objects ignore the namespace, as the API does
            .filter(|w| {
                namespace.is_empty() || w.namespace().is_empty() || w.namespace() == namespace
            })
            .filter(|w| {
                let object_labels = w.metadata().labels.clone().unwrap_or_default();
                labels.iter().all(|(k, v)| object_labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn get_workload(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        // Kinds outside the registry need their group and version, like discovery
        if api_version.is_empty() && discovery::core_registry().get(kind).is_none() {
            return Err(anyhow!("Failed to discover kind {} ()", kind));
        }
        self.objects
            .iter()
            .filter(|w| api_version.is_empty() || w.api_version() == api_version)
            .find(|w| Self::same_kind(w, kind) && w.namespace() == namespace && w.name() == name)
            .cloned()
            .ok_or_else(|| anyhow!("{} \"{}\" not found", kind.to_lowercase(), name))
    }
}

/// Object with no owner
pub fn object(api_version: &str, kind: &str, namespace: &str, name: &str) -> Workload {
    owned_object(api_version, kind, namespace, name, None)
}

/// Object with an optional controller owner (api_version, kind, name)
pub fn owned_object(
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    owner: Option<(&str, &str, &str)>,
) -> Workload {
    let mut metadata = json!({
        "name": name,
        "namespace": namespace,
        "resourceVersion": "1",
    });
    if let Some((owner_api, owner_kind, owner_name)) = owner {
        metadata["ownerReferences"] = json!([{
            "apiVersion": owner_api,
            "kind": owner_kind,
            "name": owner_name,
            "uid": format!("uid-{}", owner_name),
            "controller": true,
        }]);
    }
    Workload::from_value(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": metadata,
    }))
    .expect("valid test object")
}

pub fn pod_meta(namespace: &str, name: &str, owners: &[(&str, &str, &str)]) -> ObjectMeta {
    let owner_references: Vec<OwnerReference> = owners
        .iter()
        .map(|(api_version, kind, owner_name)| OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: owner_name.to_string(),
            uid: format!("uid-{}", owner_name),
            controller: Some(true),
            ..Default::default()
        })
        .collect();
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        owner_references: (!owner_references.is_empty()).then_some(owner_references),
        ..Default::default()
    }
}

/// Pod with (container name, image ID) statuses in the given order
pub fn pod(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Pod {
    owned_pod(namespace, name, &[], containers)
}

pub fn owned_pod(
    namespace: &str,
    name: &str,
    owners: &[(&str, &str, &str)],
    containers: &[(&str, &str)],
) -> Pod {
    let statuses = containers
        .iter()
        .map(|(container, image_id)| ContainerStatus {
            name: container.to_string(),
            image_id: image_id.to_string(),
            ..Default::default()
        })
        .collect();
    Pod {
        metadata: pod_meta(namespace, name, owners),
        status: Some(PodStatus {
            container_statuses: Some(statuses),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod source replaying scripted listings and watch sessions
///
/// Each `list_pods` call pops the next snapshot; each `watch_pods` call pops
/// the next batch of events. Open sessions keep their sender alive after the
/// batch, closing sessions drop it.
#[derive(Default)]
pub struct FakePodSource {
    snapshots: Mutex<VecDeque<Result<Vec<Pod>, String>>>,
    sessions: Mutex<VecDeque<(Vec<Result<PodEvent, String>>, bool)>>,
    open: Mutex<Vec<mpsc::Sender<Result<PodEvent>>>>,
    pub lists: AtomicUsize,
}

impl FakePodSource {
    pub fn snapshot(self, pods: Vec<Pod>) -> Self {
        self.push_snapshot(Ok(pods));
        self
    }

    pub fn failing_snapshot(self, reason: &str) -> Self {
        self.push_snapshot(Err(reason.to_string()));
        self
    }

    /// Watch session that closes after delivering `events`
    pub fn closing_session(self, events: Vec<Result<PodEvent, String>>) -> Self {
        self.push_session(events, false);
        self
    }

    /// Watch session that delivers `events` and then stays open
    pub fn open_session(self, events: Vec<Result<PodEvent, String>>) -> Self {
        self.push_session(events, true);
        self
    }

    fn push_snapshot(&self, snapshot: Result<Vec<Pod>, String>) {
        self.snapshots
            .lock()
            .expect("snapshot lock")
            .push_back(snapshot);
    }

    fn push_session(&self, events: Vec<Result<PodEvent, String>>, keep_open: bool) {
        self.sessions
            .lock()
            .expect("session lock")
            .push_back((events, keep_open));
    }
}

#[async_trait]
impl PodSource for FakePodSource {
    async fn list_pods(&self) -> Result<PodSnapshot> {
        let generation = self.lists.fetch_add(1, Ordering::SeqCst);
        let next = self
            .snapshots
            .lock()
            .expect("snapshot lock")
            .pop_front()
            .unwrap_or_else(|| Err("no more snapshots".to_string()));
        match next {
            Ok(pods) => Ok(PodSnapshot {
                pods,
                resource_version: format!("rv-{}", generation),
            }),
            Err(reason) => Err(anyhow!(reason)),
        }
    }

    async fn watch_pods(&self, _resource_version: &str) -> Result<mpsc::Receiver<Result<PodEvent>>> {
        let (events, keep_open) = self
            .sessions
            .lock()
            .expect("session lock")
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let event = event.map_err(|reason| anyhow!(reason));
            tx.try_send(event).expect("channel sized for session");
        }
        if keep_open {
            self.open.lock().expect("open lock").push(tx);
        }
        Ok(rx)
    }
}
