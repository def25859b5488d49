// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Workload/image watcher
//!
//! Keeps two maps current against the running pods of the cluster:
//!
//! - image reference -> WLIDs running it (insertion ordered, deduplicated)
//! - WLID -> container name -> image reference
//!
//! Each map has its own lock and the two are never held together, so a reader
//! may briefly see an image in one map before the other. A resync clears both
//! maps before the fresh listing is written.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::identifiers::{self, normalize_image_reference};
use crate::kubernetes::{ClusterAccessor, PodEvent, PodSource, Workload, explicit_wlid};
use crate::progress::{ProgressHandle, create_progress_handle};

/// Image reference -> WLIDs
pub type ImageIndex = HashMap<String, Vec<String>>;

/// WLID -> container name -> image reference
pub type ContainerImages = HashMap<String, HashMap<String, String>>;

/// Default pause between failed listings and after failed watch sessions
pub const DEFAULT_RESYNC_BACKOFF: Duration = Duration::from_secs(5);

/// Watch sessions ending sooner than this are treated as failed
const MIN_WATCH_SESSION: Duration = Duration::from_secs(1);

pub struct WorkloadWatcher {
    cluster: String,
    accessor: Arc<dyn ClusterAccessor>,
    pods: Arc<dyn PodSource>,
    images_to_wlids: Mutex<ImageIndex>,
    wlids_to_container_images: Mutex<ContainerImages>,
    progress: ProgressHandle,
    resync_backoff: Duration,
}

impl WorkloadWatcher {
    pub fn new(
        cluster: impl Into<String>,
        accessor: Arc<dyn ClusterAccessor>,
        pods: Arc<dyn PodSource>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            accessor,
            pods,
            images_to_wlids: Mutex::new(HashMap::new()),
            wlids_to_container_images: Mutex::new(HashMap::new()),
            progress: create_progress_handle(),
            resync_backoff: DEFAULT_RESYNC_BACKOFF,
        }
    }

    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_resync_backoff(mut self, backoff: Duration) -> Self {
        self.resync_backoff = backoff;
        self
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    /// List, build, then watch and resync until `shutdown` completes
    ///
    /// Fails only if the initial listing fails. The maps are left as they are
    /// on shutdown.
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                info!("Watcher shutting down");
                Ok(())
            }
            result = self.run() => result,
        }
    }

    async fn run(&self) -> Result<()> {
        let mut resource_version = self
            .list_and_build()
            .await
            .context("Initial pod listing failed")?;

        loop {
            let opened = Instant::now();
            let result = self.watch(&resource_version).await;

            // Keep serving the current maps while backing off
            if result.is_err() || opened.elapsed() < MIN_WATCH_SESSION {
                debug!(
                    backoff_ms = self.resync_backoff.as_millis(),
                    "Pod watch ended early, backing off before resync"
                );
                tokio::time::sleep(self.resync_backoff).await;
            }

            self.cleanup().await;
            self.progress.resyncing();
            resource_version = self.relist().await;
        }
    }

    /// Keep listing until one succeeds
    async fn relist(&self) -> String {
        loop {
            match self.list_and_build().await {
                Ok(resource_version) => return resource_version,
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.resync_backoff.as_millis(),
                        "Pod listing failed, retrying"
                    );
                    tokio::time::sleep(self.resync_backoff).await;
                }
            }
        }
    }

    async fn list_and_build(&self) -> Result<String> {
        self.progress.listing();
        let started = Instant::now();

        let snapshot = self.pods.list_pods().await?;
        let errors = self.build_from_pod_list(&snapshot.pods).await;
        for err in &errors {
            warn!(error = %err, "Skipping pod");
        }

        let images = self.images_to_wlids.lock().await.len();
        let workloads = self.wlids_to_container_images.lock().await.len();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            pods = snapshot.pods.len(),
            images,
            workloads,
            errors = errors.len(),
            elapsed_ms,
            "Built image maps from pod listing"
        );
        self.progress
            .synced(snapshot.pods.len(), images, workloads, errors.len(), elapsed_ms);

        Ok(snapshot.resource_version)
    }

    /// Apply events until the stream closes or fails
    async fn watch(&self, resource_version: &str) -> Result<()> {
        let mut events = match self.pods.watch_pods(resource_version).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Failed to open pod watch");
                self.progress.stream_closed(Some(format!("{:#}", e)));
                return Err(e);
            }
        };

        debug!(resource_version = %resource_version, "Watching pods");
        self.progress.watching(resource_version);

        while let Some(item) = events.recv().await {
            match item {
                Ok(PodEvent::Deleted(pod)) => {
                    debug!(
                        namespace = %pod.metadata.namespace.as_deref().unwrap_or_default(),
                        pod = %pod.metadata.name.as_deref().unwrap_or_default(),
                        "Pod deleted, kept until next resync"
                    );
                }
                Ok(event) => {
                    if let Err(e) = self.apply_pod_update(event.pod()).await {
                        warn!(error = %e, "Failed to apply pod update");
                    }
                    self.progress.event_applied();
                }
                Err(e) => {
                    warn!(error = %e, "Pod watch failed, resyncing");
                    self.progress.stream_closed(Some(format!("{:#}", e)));
                    return Err(e);
                }
            }
        }

        debug!("Pod watch closed, resyncing");
        self.progress.stream_closed(None);
        Ok(())
    }

    /// Record every pod of a listing; returns the pods whose owner could not
    /// be resolved
    pub async fn build_from_pod_list(&self, pods: &[Pod]) -> Vec<ResolveError> {
        let mut errors = Vec::new();
        for pod in pods {
            match self.pod_wlid(pod).await {
                Ok(wlid) => self.record(&wlid, &container_images(pod)).await,
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Record only the containers whose image changed or is new for the
    /// pod's WLID
    pub async fn apply_pod_update(&self, pod: &Pod) -> Result<(), ResolveError> {
        let wlid = self.pod_wlid(pod).await?;
        let delta = self.new_container_images(&wlid, pod).await;
        if !delta.is_empty() {
            debug!(wlid = %wlid, containers = delta.len(), "Recording new container images");
            self.record(&wlid, &delta).await;
        }
        Ok(())
    }

    /// (container, image) pairs of `pod` not yet recorded under `wlid`, in
    /// container status order
    pub async fn new_container_images(&self, wlid: &str, pod: &Pod) -> Vec<(String, String)> {
        let recorded = self
            .wlids_to_container_images
            .lock()
            .await
            .get(wlid)
            .cloned()
            .unwrap_or_default();

        container_images(pod)
            .into_iter()
            .filter(|(container, image)| recorded.get(container) != Some(image))
            .collect()
    }

    /// Empty both maps
    pub async fn cleanup(&self) {
        self.images_to_wlids.lock().await.clear();
        self.wlids_to_container_images.lock().await.clear();
    }

    /// Instance IDs of every container of `pod` under an already known
    /// parent, recording the pod's images under `wlid`
    pub async fn resolve_instance_ids(
        &self,
        wlid: &str,
        parent: &Workload,
        pod: &Pod,
    ) -> Vec<String> {
        let namespace = match parent.namespace() {
            "" => pod.metadata.namespace.as_deref().unwrap_or_default(),
            ns => ns,
        };

        let ids = container_statuses(pod)
            .map(|(container, _)| {
                identifiers::instance_id(
                    parent.api_version(),
                    namespace,
                    parent.kind(),
                    parent.name(),
                    parent.resource_version(),
                    container,
                )
            })
            .collect();

        self.record(wlid, &container_images(pod)).await;
        ids
    }

    /// Snapshot of the image index
    pub async fn images_to_wlids(&self) -> ImageIndex {
        self.images_to_wlids.lock().await.clone()
    }

    /// Snapshot of the container map
    pub async fn wlids_to_container_images(&self) -> ContainerImages {
        self.wlids_to_container_images.lock().await.clone()
    }

    /// Container map entry of one WLID
    pub async fn container_images_for(&self, wlid: &str) -> Option<HashMap<String, String>> {
        self.wlids_to_container_images
            .lock()
            .await
            .get(wlid)
            .cloned()
    }

    /// WLID owning a pod: its explicit identifier, else its top-level controller
    async fn pod_wlid(&self, pod: &Pod) -> Result<String, ResolveError> {
        if let Some(id) = explicit_wlid(&pod.metadata) {
            return Ok(id.to_string());
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let owner = self
            .accessor
            .resolve_owning_controller("v1", "Pod", &pod.metadata)
            .await
            .map_err(|e| {
                ResolveError::new(
                    namespace,
                    "Pod",
                    pod.metadata.name.as_deref().unwrap_or_default(),
                    e,
                )
            })?;

        Ok(identifiers::wlid(&self.cluster, namespace, &owner.kind, &owner.name))
    }

    /// Write (container, image) pairs to both maps, one lock at a time
    async fn record(&self, wlid: &str, containers: &[(String, String)]) {
        if containers.is_empty() {
            return;
        }

        {
            let mut index = self.images_to_wlids.lock().await;
            for (_, image) in containers {
                add_image_wlid(&mut index, image, wlid);
            }
        }

        let mut map = self.wlids_to_container_images.lock().await;
        for (container, image) in containers {
            add_container_image(&mut map, wlid, container, image);
        }
    }
}

fn add_image_wlid(index: &mut ImageIndex, image: &str, wlid: &str) {
    let wlids = index.entry(image.to_string()).or_default();
    if !wlids.iter().any(|w| w == wlid) {
        wlids.push(wlid.to_string());
    }
}

fn add_container_image(map: &mut ContainerImages, wlid: &str, container: &str, image: &str) {
    map.entry(wlid.to_string())
        .or_default()
        .insert(container.to_string(), image.to_string());
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = (&str, &str)> {
    pod.status
        .iter()
        .flat_map(|s| s.container_statuses.iter().flatten())
        .map(|cs| (cs.name.as_str(), cs.image_id.as_str()))
}

/// Normalized (container, image) pairs of a pod; containers without an image
/// ID yet are skipped
pub fn container_images(pod: &Pod) -> Vec<(String, String)> {
    container_statuses(pod)
        .filter(|(_, image_id)| !image_id.is_empty())
        .map(|(container, image_id)| {
            (
                container.to_string(),
                normalize_image_reference(image_id).to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::workload::WLID_ANNOTATION;
    use crate::kubernetes::fake::{
        FakeAccessor, FakePodSource, object, owned_object, owned_pod, pod,
    };
    use crate::progress::ProgressUpdate;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::sync::oneshot;

    fn watcher(accessor: FakeAccessor) -> WorkloadWatcher {
        WorkloadWatcher::new(
            "c",
            Arc::new(accessor),
            Arc::new(FakePodSource::default()),
        )
    }

    fn pod_wlid(namespace: &str, name: &str) -> String {
        identifiers::wlid("c", namespace, "Pod", name)
    }

    /// ReplicaSet nginx-7d9f owned by Deployment nginx in namespace web
    fn deployment_accessor() -> FakeAccessor {
        FakeAccessor::default()
            .with(owned_object(
                "apps/v1",
                "ReplicaSet",
                "web",
                "nginx-7d9f",
                Some(("apps/v1", "Deployment", "nginx")),
            ))
            .with(object("apps/v1", "Deployment", "web", "nginx"))
    }

    fn nginx_replica(name: &str, image: &str) -> Pod {
        owned_pod(
            "web",
            name,
            &[("apps/v1", "ReplicaSet", "nginx-7d9f")],
            &[("nginx", image)],
        )
    }

    #[test]
    fn test_container_images_strips_markers_and_skips_empty() {
        let p = pod(
            "default",
            "test",
            &[
                ("a", "docker-pullable://alpine@sha256:1"),
                ("b", "docker://alpine@sha256:2"),
                ("c", "alpine@sha256:3"),
                ("pending", ""),
            ],
        );
        assert_eq!(
            container_images(&p),
            vec![
                ("a".to_string(), "alpine@sha256:1".to_string()),
                ("b".to_string(), "alpine@sha256:2".to_string()),
                ("c".to_string(), "alpine@sha256:3".to_string()),
            ]
        );
    }

    #[test]
    fn test_container_images_without_status() {
        assert!(container_images(&Pod::default()).is_empty());
    }

    #[tokio::test]
    async fn test_build_single_pod() {
        let w = watcher(FakeAccessor::default());
        let errors = w
            .build_from_pod_list(&[pod(
                "default",
                "test",
                &[("container1", "docker-pullable://alpine@sha256:1")],
            )])
            .await;
        assert!(errors.is_empty());

        let wlid = pod_wlid("default", "test");
        let images = w.images_to_wlids().await;
        assert_eq!(images["alpine@sha256:1"], vec![wlid.clone()]);

        let containers = w.wlids_to_container_images().await;
        assert_eq!(containers[&wlid]["container1"], "alpine@sha256:1");
    }

    #[tokio::test]
    async fn test_build_one_image_two_workloads_keeps_order() {
        let w = watcher(FakeAccessor::default());
        w.build_from_pod_list(&[
            pod("default", "first", &[("app", "docker-pullable://alpine@sha256:1")]),
            pod("default", "second", &[("app", "alpine@sha256:1")]),
        ])
        .await;

        let images = w.images_to_wlids().await;
        assert_eq!(
            images["alpine@sha256:1"],
            vec![pod_wlid("default", "first"), pod_wlid("default", "second")]
        );
    }

    #[tokio::test]
    async fn test_build_one_workload_two_images() {
        let w = watcher(FakeAccessor::default());
        w.build_from_pod_list(&[pod(
            "default",
            "test",
            &[
                ("container1", "docker-pullable://alpine@sha256:1"),
                ("container2", "docker-pullable://alpine@sha256:2"),
            ],
        )])
        .await;

        let wlid = pod_wlid("default", "test");
        let images = w.images_to_wlids().await;
        assert_eq!(images.len(), 2);
        assert_eq!(images["alpine@sha256:1"], vec![wlid.clone()]);
        assert_eq!(images["alpine@sha256:2"], vec![wlid.clone()]);

        let containers = w.wlids_to_container_images().await;
        assert_eq!(containers[&wlid].len(), 2);
        assert_eq!(containers[&wlid]["container2"], "alpine@sha256:2");
    }

    #[tokio::test]
    async fn test_build_replicas_share_one_wlid() {
        let w = watcher(deployment_accessor());
        let errors = w
            .build_from_pod_list(&[
                nginx_replica("nginx-7d9f-aaaaa", "docker-pullable://nginx@sha256:1"),
                nginx_replica("nginx-7d9f-bbbbb", "docker-pullable://nginx@sha256:1"),
            ])
            .await;
        assert!(errors.is_empty());

        let wlid = identifiers::wlid("c", "web", "Deployment", "nginx");
        assert_eq!(wlid, "wlid://cluster-c/namespace-web/deployment-nginx");

        let images = w.images_to_wlids().await;
        assert_eq!(images["nginx@sha256:1"], vec![wlid.clone()]);
        assert_eq!(w.wlids_to_container_images().await.len(), 1);
    }

    #[tokio::test]
    async fn test_build_continues_past_unresolvable_pod() {
        let w = watcher(FakeAccessor::default());
        let orphan = owned_pod(
            "web",
            "orphan",
            &[("apps/v1", "ReplicaSet", "gone")],
            &[("app", "alpine@sha256:9")],
        );
        let errors = w
            .build_from_pod_list(&[orphan, pod("web", "ok", &[("app", "alpine@sha256:1")])])
            .await;

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, "orphan");
        assert_eq!(errors[0].kind, "pod");

        let images = w.images_to_wlids().await;
        assert!(!images.contains_key("alpine@sha256:9"));
        assert_eq!(images["alpine@sha256:1"], vec![pod_wlid("web", "ok")]);
    }

    #[tokio::test]
    async fn test_build_uses_explicit_identifier() {
        let accessor = FakeAccessor::default();
        let mut p = owned_pod(
            "web",
            "tagged",
            &[("apps/v1", "ReplicaSet", "gone")],
            &[("app", "alpine@sha256:1")],
        );
        p.metadata.annotations = Some(BTreeMap::from([(
            WLID_ANNOTATION.to_string(),
            "wlid://cluster-c/namespace-web/deployment-tagged".to_string(),
        )]));

        let w = watcher(accessor);
        let errors = w.build_from_pod_list(&[p]).await;
        assert!(errors.is_empty());
        assert_eq!(
            w.images_to_wlids().await["alpine@sha256:1"],
            vec!["wlid://cluster-c/namespace-web/deployment-tagged".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rebuilding_same_pods_is_noop() {
        let w = watcher(FakeAccessor::default());
        let pods = [pod("default", "test", &[("app", "alpine@sha256:1")])];
        w.build_from_pod_list(&pods).await;
        let images = w.images_to_wlids().await;
        let containers = w.wlids_to_container_images().await;

        w.build_from_pod_list(&pods).await;
        assert_eq!(w.images_to_wlids().await, images);
        assert_eq!(w.wlids_to_container_images().await, containers);
    }

    #[tokio::test]
    async fn test_new_container_images_delta() {
        let w = watcher(FakeAccessor::default());
        let wlid = pod_wlid("namespace1", "pod1");
        w.build_from_pod_list(&[pod(
            "namespace1",
            "pod1",
            &[
                ("container1", "docker-pullable://alpine@sha256:1"),
                ("container2", "docker-pullable://alpine@sha256:2"),
            ],
        )])
        .await;

        // Nothing new
        let same = pod(
            "namespace1",
            "pod1",
            &[
                ("container1", "docker-pullable://alpine@sha256:1"),
                ("container2", "docker-pullable://alpine@sha256:2"),
            ],
        );
        assert!(w.new_container_images(&wlid, &same).await.is_empty());

        // One new container
        let one_new = pod(
            "namespace1",
            "pod1",
            &[
                ("container1", "docker-pullable://alpine@sha256:1"),
                ("container4", "docker-pullable://alpine@sha256:4"),
            ],
        );
        assert_eq!(
            w.new_container_images(&wlid, &one_new).await,
            vec![("container4".to_string(), "alpine@sha256:4".to_string())]
        );

        // Unknown WLID: everything is new, in container order
        let other = pod(
            "namespace3",
            "pod3",
            &[
                ("container4", "docker-pullable://alpine@sha256:4"),
                ("container5", "docker-pullable://alpine@sha256:5"),
            ],
        );
        assert_eq!(
            w.new_container_images(&pod_wlid("namespace3", "pod3"), &other)
                .await,
            vec![
                ("container4".to_string(), "alpine@sha256:4".to_string()),
                ("container5".to_string(), "alpine@sha256:5".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_pod_update() {
        let w = watcher(deployment_accessor());
        let wlid = identifiers::wlid("c", "web", "Deployment", "nginx");
        w.build_from_pod_list(&[nginx_replica("nginx-7d9f-aaaaa", "nginx@sha256:1")])
            .await;
        let before = w.images_to_wlids().await;

        // Same state again
        w.apply_pod_update(&nginx_replica("nginx-7d9f-aaaaa", "nginx@sha256:1"))
            .await
            .unwrap();
        assert_eq!(w.images_to_wlids().await, before);

        // Rolled image replaces the container entry, old image keeps its WLID
        w.apply_pod_update(&nginx_replica("nginx-7d9f-bbbbb", "docker-pullable://nginx@sha256:2"))
            .await
            .unwrap();
        let images = w.images_to_wlids().await;
        assert_eq!(images["nginx@sha256:1"], vec![wlid.clone()]);
        assert_eq!(images["nginx@sha256:2"], vec![wlid.clone()]);
        assert_eq!(
            w.container_images_for(&wlid).await.unwrap()["nginx"],
            "nginx@sha256:2"
        );
    }

    #[tokio::test]
    async fn test_apply_pod_update_unresolvable_owner() {
        let w = watcher(FakeAccessor::default());
        let err = w
            .apply_pod_update(&owned_pod(
                "web",
                "orphan",
                &[("apps/v1", "ReplicaSet", "gone")],
                &[("app", "alpine@sha256:1")],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.namespace, "web");
        assert!(w.images_to_wlids().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup() {
        let w = watcher(FakeAccessor::default());
        w.build_from_pod_list(&[
            pod("a", "one", &[("app", "alpine@sha256:1")]),
            pod("b", "two", &[("app", "alpine@sha256:2")]),
        ])
        .await;
        assert_eq!(w.images_to_wlids().await.len(), 2);

        w.cleanup().await;
        assert!(w.images_to_wlids().await.is_empty());
        assert!(w.wlids_to_container_images().await.is_empty());

        // Cleaning empty maps is fine too
        w.cleanup().await;
        assert!(w.images_to_wlids().await.is_empty());
    }

    fn nginx_deployment() -> Workload {
        Workload::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "nginx-deployment",
                "namespace": "test",
                "resourceVersion": "59145"
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_instance_ids_two_containers() {
        let w = watcher(FakeAccessor::default());
        let p = pod(
            "test",
            "pod",
            &[
                ("nginx", "docker-pullable://alpine@sha256:1"),
                ("nginx2", "docker-pullable://alpine@sha256:2"),
            ],
        );

        let ids = w
            .resolve_instance_ids("deployment", &nginx_deployment(), &p)
            .await;
        assert_eq!(
            ids,
            vec![
                "apiversion-apps/v1/namespace-test/kind-deployment/name-nginx-deployment/resourceversion-59145/container-nginx",
                "apiversion-apps/v1/namespace-test/kind-deployment/name-nginx-deployment/resourceversion-59145/container-nginx2",
            ]
        );

        let containers = w.wlids_to_container_images().await;
        assert_eq!(
            containers["deployment"],
            HashMap::from([
                ("nginx".to_string(), "alpine@sha256:1".to_string()),
                ("nginx2".to_string(), "alpine@sha256:2".to_string()),
            ])
        );
        let images = w.images_to_wlids().await;
        assert_eq!(images["alpine@sha256:1"], vec!["deployment".to_string()]);
        assert_eq!(images["alpine@sha256:2"], vec!["deployment".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_instance_ids_one_container() {
        let w = watcher(FakeAccessor::default());
        let p = pod("test", "pod", &[("nginx", "docker-pullable://alpine@sha256:1")]);

        let ids = w
            .resolve_instance_ids("deployment", &nginx_deployment(), &p)
            .await;
        assert_eq!(
            ids,
            vec!["apiversion-apps/v1/namespace-test/kind-deployment/name-nginx-deployment/resourceversion-59145/container-nginx"]
        );
        assert_eq!(w.images_to_wlids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_initial_listing_fails() {
        let pods = FakePodSource::default().failing_snapshot("connection refused");
        let w = WorkloadWatcher::new("c", Arc::new(FakeAccessor::default()), Arc::new(pods));

        let err = w.start(std::future::pending()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection refused"));
    }

    #[tokio::test]
    async fn test_start_resyncs_after_stream_closes() {
        let pods = FakePodSource::default()
            .snapshot(vec![pod("default", "a", &[("app", "img@sha256:1")])])
            .closing_session(vec![Ok(PodEvent::Added(pod(
                "default",
                "b",
                &[("app", "img@sha256:2")],
            )))])
            .failing_snapshot("etcd unavailable")
            .snapshot(vec![pod("default", "c", &[("app", "img@sha256:3")])])
            .open_session(vec![]);
        let pods = Arc::new(pods);
        let w = WorkloadWatcher::new("c", Arc::new(FakeAccessor::default()), pods.clone())
            .with_resync_backoff(Duration::ZERO);

        let mut updates = w.progress().subscribe();
        let (stop, stopped) = oneshot::channel::<()>();
        let watcher = &w;

        let observe = async move {
            let mut seen = Vec::new();
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        let done = matches!(update, ProgressUpdate::Watching { .. })
                            && seen
                                .iter()
                                .any(|u| matches!(u, ProgressUpdate::Resyncing { .. }));
                        seen.push(update);
                        if done {
                            break;
                        }
                    }
                    Err(e) => panic!("progress channel failed: {}", e),
                }
            }
            let images = watcher.images_to_wlids().await;
            let _ = stop.send(());
            (seen, images)
        };
        let run = w.start(async move {
            let _ = stopped.await;
        });

        let (result, (seen, images)) = tokio::join!(run, observe);
        result.unwrap();

        // Maps reflect only the latest listing
        assert_eq!(images.len(), 1);
        assert_eq!(images["img@sha256:3"], vec![pod_wlid("default", "c")]);

        // Initial listing, the failed retry and the successful one
        assert_eq!(pods.lists.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(
            seen.iter()
                .any(|u| matches!(u, ProgressUpdate::StreamClosed { reason: None }))
        );
        assert_eq!(
            seen.iter()
                .filter(|u| matches!(u, ProgressUpdate::Synced { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_failed_watch_backs_off_and_keeps_maps() {
        let backoff = Duration::from_millis(300);
        let pods = FakePodSource::default()
            .snapshot(vec![pod("default", "a", &[("app", "img@sha256:1")])])
            .closing_session(vec![Err("watch timeout out of range".to_string())])
            .snapshot(vec![pod("default", "a", &[("app", "img@sha256:1")])])
            .open_session(vec![]);
        let w = WorkloadWatcher::new("c", Arc::new(FakeAccessor::default()), Arc::new(pods))
            .with_resync_backoff(backoff);

        let mut updates = w.progress().subscribe();
        let (stop, stopped) = oneshot::channel::<()>();
        let watcher = &w;

        let observe = async move {
            let mut closed_at = None;
            let mut images_while_backing_off = None;
            while let Ok(update) = updates.recv().await {
                match update {
                    ProgressUpdate::StreamClosed { reason: Some(_) } => {
                        closed_at = Some(Instant::now());
                        images_while_backing_off = Some(watcher.images_to_wlids().await);
                    }
                    ProgressUpdate::Resyncing { .. } => break,
                    _ => {}
                }
            }
            let waited = closed_at.map(|at| at.elapsed());
            let _ = stop.send(());
            (waited, images_while_backing_off)
        };
        let run = w.start(async move {
            let _ = stopped.await;
        });

        let (result, (waited, images)) = tokio::join!(run, observe);
        result.unwrap();

        assert!(waited.unwrap() >= backoff);
        assert_eq!(images.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_rebuild_and_instance_resolution() {
        let w = Arc::new(watcher(FakeAccessor::default()));
        let listing: Vec<Pod> = (0..50)
            .map(|i| {
                let name = format!("job-{}", i);
                let image = format!("docker://img@sha256:{}", i);
                pod("batch", &name, &[("app", image.as_str())])
            })
            .collect();
        let nginx = identifiers::wlid("c", "test", "Deployment", "nginx-deployment");
        let replica = pod("test", "nginx-deployment-x", &[("nginx", "nginx@sha256:1")]);

        let build = {
            let w = Arc::clone(&w);
            tokio::spawn(async move { w.build_from_pod_list(&listing).await })
        };
        let resolve = {
            let w = Arc::clone(&w);
            let nginx = nginx.clone();
            tokio::spawn(async move {
                let parent = nginx_deployment();
                let mut ids = Vec::new();
                for _ in 0..50 {
                    ids.extend(w.resolve_instance_ids(&nginx, &parent, &replica).await);
                }
                ids
            })
        };
        let (errors, ids) = tokio::join!(build, resolve);
        assert!(errors.unwrap().is_empty());
        assert_eq!(ids.unwrap().len(), 50);

        let images = w.images_to_wlids().await;
        let containers = w.wlids_to_container_images().await;
        assert_eq!(images.len(), 51);
        assert_eq!(containers.len(), 51);
        assert_eq!(images["nginx@sha256:1"], vec![nginx.clone()]);

        // Both maps describe the same (wlid, image) pairs
        for (wlid, by_container) in &containers {
            for image in by_container.values() {
                assert!(images[image].contains(wlid));
            }
        }
        for (image, wlids) in &images {
            for wlid in wlids {
                assert!(containers[wlid].values().any(|i| i == image));
            }
        }
    }

    #[tokio::test]
    async fn test_start_resyncs_after_stream_error() {
        let pods = FakePodSource::default()
            .snapshot(vec![pod("default", "a", &[("app", "img@sha256:1")])])
            .closing_session(vec![Err("too old resource version".to_string())])
            .snapshot(vec![pod("default", "a", &[("app", "img@sha256:1")])])
            .open_session(vec![]);
        let w = WorkloadWatcher::new("c", Arc::new(FakeAccessor::default()), Arc::new(pods))
            .with_resync_backoff(Duration::ZERO);

        let mut updates = w.progress().subscribe();
        let (stop, stopped) = oneshot::channel::<()>();

        let observe = async move {
            let mut reason = None;
            while let Ok(update) = updates.recv().await {
                match update {
                    ProgressUpdate::StreamClosed { reason: r } => reason = r,
                    ProgressUpdate::Synced { generation: 1, .. } => break,
                    _ => {}
                }
            }
            let _ = stop.send(());
            reason
        };
        let run = w.start(async move {
            let _ = stopped.await;
        });

        let (result, reason) = tokio::join!(run, observe);
        result.unwrap();
        assert!(reason.unwrap().contains("too old resource version"));
    }
}
