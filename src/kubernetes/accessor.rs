// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cluster access seam used by the watcher and the command resolver
//!
//! Owner-chain resolution is implemented once here on top of `get_workload`,
//! so every accessor climbs the same way: controller reference first, bounded
//! depth, cycle detection.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::discovery::ApiResource;
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

use super::discovery;
use super::workload::Workload;
use crate::error::OwnerChainError;

/// Maximum number of owner hops from an object to its top-level controller
pub const MAX_OWNER_DEPTH: usize = 10;

/// Top-level controller of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[async_trait]
pub trait ClusterAccessor: Send + Sync {
    /// List objects of `kind` (plural, kind name or alias). An empty
    /// namespace lists across all namespaces.
    async fn list_workloads(
        &self,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>>;

    /// Fetch one object. `api_version` comes from the owner reference and is
    /// used when `kind` is not a built-in.
    async fn get_workload(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Workload>;

    /// API resource for a kind name
    fn group_version_resource(&self, kind: &str) -> Result<ApiResource> {
        Ok(discovery::core_registry()
            .api_resource(kind)?
            .api_resource
            .clone())
    }

    /// Climb owner references from an object to its top-level controller
    ///
    /// An object without owners is its own controller. The returned owner
    /// carries the apiVersion needed to fetch it again.
    async fn resolve_owning_controller(
        &self,
        api_version: &str,
        kind: &str,
        meta: &ObjectMeta,
    ) -> Result<Owner, OwnerChainError> {
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(OwnerChainError::MissingName)?;

        let mut current = Owner {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        };
        let mut owners: Vec<OwnerReference> = meta.owner_references.clone().unwrap_or_default();
        let mut visited = HashSet::from([(current.kind.to_lowercase(), current.name.clone())]);
        let mut depth = 0;

        loop {
            let Some(owner) = controller_reference(&owners) else {
                return Ok(current);
            };
            if depth == MAX_OWNER_DEPTH {
                return Err(OwnerChainError::DepthExceeded(MAX_OWNER_DEPTH));
            }
            if !visited.insert((owner.kind.to_lowercase(), owner.name.clone())) {
                return Err(OwnerChainError::Cycle {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                });
            }

            trace!(
                namespace = %namespace,
                kind = %owner.kind,
                name = %owner.name,
                depth,
                "Climbing owner reference"
            );

            let parent = self
                .get_workload(&owner.api_version, &owner.kind, namespace, &owner.name)
                .await
                .map_err(|e| OwnerChainError::Fetch {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    reason: format!("{:#}", e),
                })?;

            current = Owner {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
            };
            owners = parent.owner_references().to_vec();
            depth += 1;
        }
    }
}

/// The managing controller reference, or the first owner if none is marked
fn controller_reference(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners
        .iter()
        .find(|o| o.controller == Some(true))
        .or_else(|| owners.first())
}
