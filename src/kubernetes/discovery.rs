// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Kind registry for the workload kinds the agent lists and climbs through.
//!
//! Built from k8s-openapi compile-time type information so lookups need no
//! discovery round trip. Kinds outside this table (custom controllers) are
//! resolved through the discovery API by the client.

use anyhow::{Result, anyhow};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Information about a known Kubernetes resource kind
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// The API resource definition
    pub api_resource: ApiResource,
    /// API capabilities (scope)
    pub capabilities: ApiCapabilities,
    /// Plural resource name, e.g. "replicasets"
    pub plural: String,
    /// Short names and the lowercased kind
    pub aliases: Vec<String>,
}

/// Kinds indexed by plural, lowercased kind, and short names
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    by_plural: HashMap<String, ResourceInfo>,
    alias_map: HashMap<String, String>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: ResourceInfo) {
        for alias in &info.aliases {
            self.alias_map.insert(alias.clone(), info.plural.clone());
        }
        self.alias_map
            .insert(info.plural.clone(), info.plural.clone());
        self.by_plural.insert(info.plural.clone(), info);
    }

    /// Look up by plural ("pods"), kind ("Pod", case-insensitive) or short name ("po")
    pub fn get(&self, name: &str) -> Option<&ResourceInfo> {
        let plural = self.alias_map.get(&name.to_lowercase())?;
        self.by_plural.get(plural)
    }

    /// Same as `get`, as an error for unknown kinds
    pub fn api_resource(&self, name: &str) -> Result<&ResourceInfo> {
        self.get(name)
            .ok_or_else(|| anyhow!("Unknown resource kind: '{}'", name))
    }
}

static CORE_KINDS: LazyLock<KindRegistry> = LazyLock::new(build_core_registry);

/// Shared registry of built-in kinds
pub fn core_registry() -> &'static KindRegistry {
    &CORE_KINDS
}

/// Build the registry of built-in workload kinds
pub fn build_core_registry() -> KindRegistry {
    use k8s_openapi::api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{Namespace, Pod, ReplicationController, Secret},
    };
    use kube::Resource;

    let mut registry = KindRegistry::new();

    // The Resource trait's Scope is an associated type, so scope is spelled out here
    macro_rules! add_resource {
        ($type:ty, namespaced, [$($alias:expr),* $(,)?]) => {{
            add_resource!(@inner $type, Scope::Namespaced, [$($alias),*])
        }};
        ($type:ty, cluster, [$($alias:expr),* $(,)?]) => {{
            add_resource!(@inner $type, Scope::Cluster, [$($alias),*])
        }};
        (@inner $type:ty, $scope:expr, [$($alias:expr),* $(,)?]) => {{
            let ar = ApiResource {
                group: <$type>::group(&()).to_string(),
                version: <$type>::version(&()).to_string(),
                api_version: <$type>::api_version(&()).to_string(),
                kind: <$type>::kind(&()).to_string(),
                plural: <$type>::plural(&()).to_string(),
            };
            let caps = ApiCapabilities {
                scope: $scope,
                subresources: vec![],
                operations: vec![],
            };
            let short_names: Vec<String> = vec![$($alias.to_string()),*];
            let mut aliases = vec![ar.kind.to_lowercase()];
            aliases.extend(short_names);
            registry.add(ResourceInfo {
                plural: ar.plural.clone(),
                api_resource: ar,
                capabilities: caps,
                aliases,
            });
        }};
    }

    add_resource!(Pod, namespaced, ["po"]);
    add_resource!(Secret, namespaced, []);
    add_resource!(ReplicationController, namespaced, ["rc"]);
    add_resource!(Namespace, cluster, ["ns"]);

    add_resource!(Deployment, namespaced, ["deploy"]);
    add_resource!(StatefulSet, namespaced, ["sts"]);
    add_resource!(DaemonSet, namespaced, ["ds"]);
    add_resource!(ReplicaSet, namespaced, ["rs"]);

    add_resource!(Job, namespaced, []);
    add_resource!(CronJob, namespaced, ["cj"]);

    registry
}
