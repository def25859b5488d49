// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cluster accessor backed by the Kubernetes API

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, TypeMeta};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::accessor::ClusterAccessor;
use super::discovery::{self, KindRegistry};
use super::workload::Workload;

/// Timeout for connecting to K8s API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reading K8s API responses
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Page size for paginated list requests
const PAGE_SIZE: u32 = 500;

/// Build a client from the in-cluster service account, falling back to kubeconfig
pub async fn connect() -> Result<Client> {
    let mut config = Config::infer()
        .await
        .context("Failed to infer Kubernetes client configuration")?;

    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);

    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Accessor over a live cluster
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    registry: &'static KindRegistry,
}

impl KubeAccessor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registry: discovery::core_registry(),
        }
    }

    /// Resolve the API resource for a kind, asking discovery for kinds
    /// outside the built-in table
    async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(info) = self.registry.get(kind) {
            return Ok((info.api_resource.clone(), info.capabilities.clone()));
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        debug!(api_version = %api_version, kind = %kind, "Discovering non-core kind");
        kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("Failed to discover kind {} ({})", kind, api_version))
    }

    fn api_for(
        &self,
        ar: &ApiResource,
        caps: &ApiCapabilities,
        namespace: &str,
    ) -> Api<DynamicObject> {
        if caps.scope == Scope::Namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        } else {
            Api::all_with(self.client.clone(), ar)
        }
    }

    /// List with pagination; each page retried on transient failures
    async fn list_all(
        &self,
        api: &Api<DynamicObject>,
        base_params: &ListParams,
        kind: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut all_items: Vec<DynamicObject> = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut page_count = 0u32;

        loop {
            let mut params = base_params.clone().limit(PAGE_SIZE);
            if let Some(ref token) = continue_token {
                params = params.continue_token(token);
            }

            let list = self.list_page_with_retry(api, &params, kind).await?;
            all_items.extend(list.items);
            page_count += 1;

            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    trace!(kind = %kind, page = page_count, total_so_far = all_items.len(), "Fetched page, continuing");
                    continue_token = Some(token);
                }
                _ => break,
            }
        }

        Ok(all_items)
    }

    async fn list_page_with_retry(
        &self,
        api: &Api<DynamicObject>,
        params: &ListParams,
        kind: &str,
    ) -> Result<kube::api::ObjectList<DynamicObject>> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match api.list(params).await {
                Ok(list) => return Ok(list),
                Err(e) if is_retryable_error(&e) => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(
                        kind = %kind,
                        attempt = attempt + 1,
                        max_attempts = MAX_RETRIES,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(anyhow!("K8s API error: {}", e)),
            }
        }

        Err(anyhow!(
            "Failed after {} retries: {}",
            MAX_RETRIES,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

#[async_trait]
impl ClusterAccessor for KubeAccessor {
    async fn list_workloads(
        &self,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>> {
        let info = self.registry.api_resource(kind)?;
        let api = self.api_for(&info.api_resource, &info.capabilities, namespace);

        let mut params = ListParams::default();
        let selector = label_selector(labels);
        if !selector.is_empty() {
            params = params.labels(&selector);
        }

        debug!(
            kind = %kind,
            namespace = %namespace,
            label_selector = %selector,
            "Listing workloads"
        );

        let items = self.list_all(&api, &params, kind).await?;
        let types = TypeMeta {
            api_version: info.api_resource.api_version.clone(),
            kind: info.api_resource.kind.clone(),
        };

        // List responses do not carry apiVersion/kind per item
        Ok(items
            .into_iter()
            .map(|mut item| {
                if item.types.is_none() {
                    item.types = Some(types.clone());
                }
                Workload::new(item)
            })
            .collect())
    }

    async fn get_workload(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        let (ar, caps) = self.resolve_kind(api_version, kind).await?;
        let api = self.api_for(&ar, &caps, namespace);

        let mut object = api
            .get(name)
            .await
            .with_context(|| format!("Failed to get {} '{}/{}'", kind, namespace, name))?;
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            });
        }
        Ok(Workload::new(object))
    }
}

/// Render a label map as a Kubernetes equality selector ("a=1,b=2")
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Check if an error is retryable (transient failures)
fn is_retryable_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::HyperError(_) => true,
        // 429 (rate limit), 503 (unavailable), 504 (timeout)
        kube::Error::Api(api_err) => matches!(api_err.code, 429 | 503 | 504),
        _ => false,
    }
}
