// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Command resolution
//!
//! Turns a command into the concrete identifiers it targets: the listed
//! objects of every kind relevant to the command, resolved to WLIDs/SIDs,
//! filtered by the wildcard and the namespace exclusion policy.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandKind};
use crate::error::{OwnerChainError, ResolveError};
use crate::identifiers::{self, WLID_PREFIX, namespace_from_wlid, wild_wlid_matches};
use crate::kubernetes::{ClusterAccessor, Owner, Workload};
use crate::policy::CommandPolicy;
use crate::watcher::WorkloadWatcher;

/// Resolved targets of one command
#[derive(Debug, Clone, Default)]
pub struct CommandTargets {
    /// Identifiers the command applies to, sorted
    pub identifiers: Vec<String>,
    /// Objects whose identifier could not be resolved
    pub errors: Vec<ResolveError>,
    /// Identifiers dropped by the namespace policy
    pub excluded: Vec<String>,
    /// Container -> image per target (scan commands with a watcher)
    pub images: BTreeMap<String, HashMap<String, String>>,
    /// Instance IDs per target (scan commands with a watcher)
    pub instance_ids: BTreeMap<String, Vec<String>>,
}

/// A listed object, its identifier and the controller found by climbing its
/// owner chain (none for namespaces, secrets and explicit identifiers)
type Resolved = (Workload, String, Option<Owner>);

pub struct CommandResolver {
    cluster: String,
    accessor: Arc<dyn ClusterAccessor>,
    policy: Arc<CommandPolicy>,
    watcher: Option<Arc<WorkloadWatcher>>,
}

impl CommandResolver {
    pub fn new(
        cluster: impl Into<String>,
        accessor: Arc<dyn ClusterAccessor>,
        policy: Arc<CommandPolicy>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            accessor,
            policy,
            watcher: None,
        }
    }

    /// Attach a watcher so scan commands carry images and instance IDs
    pub fn with_watcher(mut self, watcher: Arc<WorkloadWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn relevant_resource_kinds(&self, kind: &CommandKind) -> &'static [&'static str] {
        self.policy.relevant_resource_kinds(kind)
    }

    pub fn is_namespace_excluded(&self, kind: &CommandKind, namespace: &str) -> bool {
        self.policy.is_namespace_excluded(kind, namespace)
    }

    /// Identifiers of listed objects, deduplicated and sorted
    ///
    /// Namespaces map to their namespace WLID, secrets to a SID, everything
    /// else to its explicit WLID or its top-level controller's WLID. Objects
    /// whose owner chain fails are reported and skipped.
    pub async fn resolve_resource_identifiers(
        &self,
        namespace: &str,
        workloads: &[Workload],
    ) -> (Vec<String>, Vec<ResolveError>) {
        let (resolved, errors) = self.resolve_each(namespace, workloads).await;
        let ids: BTreeSet<String> = resolved.into_iter().map(|(_, id, _)| id).collect();
        (ids.into_iter().collect(), errors)
    }

    /// Identifier of every listed object, in listing order
    async fn resolve_each(
        &self,
        namespace: &str,
        workloads: &[Workload],
    ) -> (Vec<Resolved>, Vec<ResolveError>) {
        let mut resolved = Vec::with_capacity(workloads.len());
        let mut errors = Vec::new();

        for workload in workloads {
            match workload.kind() {
                "Namespace" => {
                    let id = identifiers::wlid(
                        &self.cluster,
                        workload.name(),
                        "Namespace",
                        workload.name(),
                    );
                    resolved.push((workload.clone(), id, None));
                }
                "Secret" => {
                    let id = identifiers::sid(
                        &self.cluster,
                        object_namespace(workload, namespace),
                        workload.name(),
                        "",
                    );
                    resolved.push((workload.clone(), id, None));
                }
                _ => match self.workload_identifier(namespace, workload).await {
                    Ok((id, owner)) => resolved.push((workload.clone(), id, owner)),
                    Err(e) => errors.push(e),
                },
            }
        }

        (resolved, errors)
    }

    /// Resolve a command to its targets
    ///
    /// Listing failures abort; per-object failures land in
    /// [`CommandTargets::errors`].
    pub async fn resolve_command(&self, command: &Command) -> Result<CommandTargets> {
        let kind = &command.command_name;
        let mut targets = CommandTargets::default();

        if !command.wlid.is_empty() {
            let namespace = namespace_from_wlid(&command.wlid).unwrap_or_default();
            if self.is_namespace_excluded(kind, namespace) {
                info!(command = %kind, wlid = %command.wlid, "Target namespace excluded");
                targets.excluded.push(command.wlid.clone());
            } else {
                targets.identifiers.push(command.wlid.clone());
                if kind.is_scan() {
                    self.attach_images(&mut targets).await;
                }
            }
            return Ok(targets);
        }

        let namespace = command.target_namespace();
        let labels = command.labels();
        let mut ids = BTreeSet::new();
        let mut pods = Vec::new();

        for resource in self.relevant_resource_kinds(kind) {
            let workloads = self
                .accessor
                .list_workloads(resource, &namespace, &labels)
                .await
                .with_context(|| {
                    format!("Failed to list {} in namespace '{}'", resource, namespace)
                })?;
            debug!(
                command = %kind,
                resource = %resource,
                namespace = %namespace,
                count = workloads.len(),
                "Listed objects for command"
            );

            let (resolved, errors) = self.resolve_each(&namespace, &workloads).await;
            targets.errors.extend(errors);
            for (workload, id, owner) in resolved {
                ids.insert(id.clone());
                if *resource == "pods" && kind.is_scan() {
                    pods.push((workload, id, owner));
                }
            }
        }

        for id in ids {
            // SIDs are scoped by the namespace listing alone
            if id.starts_with(WLID_PREFIX) && !wild_wlid_matches(&command.wild_wlid, &id) {
                continue;
            }
            match namespace_from_wlid(&id) {
                Some(ns) if self.is_namespace_excluded(kind, ns) => targets.excluded.push(id),
                _ => targets.identifiers.push(id),
            }
        }

        if !targets.excluded.is_empty() {
            info!(
                command = %kind,
                excluded = targets.excluded.len(),
                "Dropped targets in excluded namespaces"
            );
        }

        if kind.is_scan() {
            self.attach_instance_ids(&namespace, pods, &mut targets).await;
            self.attach_images(&mut targets).await;
        }

        Ok(targets)
    }

    /// WLID of a non-namespace, non-secret object, with its owner when the
    /// owner chain was climbed
    async fn workload_identifier(
        &self,
        namespace: &str,
        workload: &Workload,
    ) -> Result<(String, Option<Owner>), ResolveError> {
        if let Some(id) = workload.explicit_wlid() {
            return Ok((id.to_string(), None));
        }

        let owner = self
            .accessor
            .resolve_owning_controller(workload.api_version(), workload.kind(), workload.metadata())
            .await
            .map_err(|e| {
                ResolveError::new(
                    object_namespace(workload, namespace),
                    workload.kind(),
                    workload.name(),
                    e,
                )
            })?;

        let id = identifiers::wlid(
            &self.cluster,
            object_namespace(workload, namespace),
            &owner.kind,
            &owner.name,
        );
        Ok((id, Some(owner)))
    }

    /// Instance IDs for listed pods under each target, reusing the owners
    /// found while resolving; each parent is fetched once
    async fn attach_instance_ids(
        &self,
        namespace: &str,
        pods: Vec<Resolved>,
        targets: &mut CommandTargets,
    ) {
        let Some(watcher) = &self.watcher else {
            return;
        };

        let wanted: BTreeSet<&str> = targets.identifiers.iter().map(String::as_str).collect();
        let mut parents: HashMap<String, Workload> = HashMap::new();
        let mut instance_ids: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (workload, id, owner) in pods {
            if !wanted.contains(id.as_str()) {
                continue;
            }

            let pod = match workload.to_pod() {
                Ok(pod) => pod,
                Err(e) => {
                    warn!(error = %e, "Skipping object listed as pod");
                    continue;
                }
            };

            let parent = match owner {
                // Standalone pod, or explicit identifier: the pod is its own parent
                None => workload.clone(),
                Some(owner) if owner.kind == "Pod" => workload.clone(),
                Some(owner) => {
                    if let Some(parent) = parents.get(&id).cloned() {
                        parent
                    } else {
                        let ns = object_namespace(&workload, namespace);
                        match self
                            .accessor
                            .get_workload(&owner.api_version, &owner.kind, ns, &owner.name)
                            .await
                        {
                            Ok(parent) => {
                                parents.insert(id.clone(), parent.clone());
                                parent
                            }
                            Err(e) => {
                                targets.errors.push(ResolveError::new(
                                    ns,
                                    workload.kind(),
                                    workload.name(),
                                    OwnerChainError::Fetch {
                                        kind: owner.kind,
                                        name: owner.name,
                                        reason: format!("{:#}", e),
                                    },
                                ));
                                continue;
                            }
                        }
                    }
                }
            };

            let ids = watcher.resolve_instance_ids(&id, &parent, &pod).await;
            instance_ids.entry(id).or_default().extend(ids);
        }

        targets.instance_ids = instance_ids
            .into_iter()
            .map(|(id, ids)| (id, ids.into_iter().collect()))
            .collect();
    }

    /// Current container images of each target, from the watcher
    async fn attach_images(&self, targets: &mut CommandTargets) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        for id in &targets.identifiers {
            if let Some(containers) = watcher.container_images_for(id).await {
                targets.images.insert(id.clone(), containers);
            }
        }
    }
}

/// The object's own namespace, else the one it was listed in
fn object_namespace<'a>(workload: &'a Workload, listed_in: &'a str) -> &'a str {
    match workload.namespace() {
        "" => listed_in,
        ns => ns,
    }
}
