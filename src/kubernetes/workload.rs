// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Kind-agnostic view of a listed cluster object

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;

/// Annotation carrying an identifier assigned to an object ahead of time
pub const WLID_ANNOTATION: &str = "cluster-agent/wlid";

/// An object returned by the cluster accessor (pod, secret, namespace, controller...)
#[derive(Debug, Clone)]
pub struct Workload {
    object: DynamicObject,
}

impl Workload {
    pub fn new(object: DynamicObject) -> Self {
        Self { object }
    }

    /// Build from a full JSON manifest (apiVersion, kind, metadata, ...)
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let object: DynamicObject =
            serde_json::from_value(value).context("Failed to parse workload object")?;
        Ok(Self { object })
    }

    pub fn kind(&self) -> &str {
        self.object
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or_default()
    }

    pub fn api_version(&self) -> &str {
        self.object
            .types
            .as_ref()
            .map(|t| t.api_version.as_str())
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.object.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn resource_version(&self) -> &str {
        self.object
            .metadata
            .resource_version
            .as_deref()
            .unwrap_or_default()
    }

    pub fn metadata(&self) -> &ObjectMeta {
        &self.object.metadata
    }

    /// Identifier carried by the object itself, if any
    pub fn explicit_wlid(&self) -> Option<&str> {
        explicit_wlid(&self.object.metadata)
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.object
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
    }

    /// Typed view, for objects listed as pods
    pub fn to_pod(&self) -> Result<Pod> {
        let value = serde_json::to_value(&self.object).context("Failed to serialize object")?;
        serde_json::from_value(value)
            .with_context(|| format!("Object '{}/{}' is not a pod", self.namespace(), self.name()))
    }

}

impl From<DynamicObject> for Workload {
    fn from(object: DynamicObject) -> Self {
        Self::new(object)
    }
}

/// Non-empty identifier annotation on an object
pub fn explicit_wlid(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(WLID_ANNOTATION))
        .map(String::as_str)
        .filter(|w| !w.is_empty())
}
