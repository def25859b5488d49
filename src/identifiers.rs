// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Canonical identifiers for cluster objects
//!
//! - WLID: `wlid://cluster-<cluster>/namespace-<ns>/<kind>-<name>`
//! - SID: `sid://cluster-<cluster>/namespace-<ns>/secret-<name>[/subsecret-<key>]`
//! - Instance ID: one container of one workload revision
//!
//! Generation stops at the first empty level, so a WLID built without a kind
//! is the namespace-level prefix that wildcard addressing uses.

pub const WLID_PREFIX: &str = "wlid://";
pub const SID_PREFIX: &str = "sid://";

const CLUSTER_LEVEL: &str = "cluster-";
const NAMESPACE_LEVEL: &str = "namespace-";
const SECRET_LEVEL: &str = "secret-";
const SUBSECRET_LEVEL: &str = "subsecret-";

/// Scheme markers container runtimes put in front of image IDs
const IMAGE_SCHEME_MARKERS: &[&str] = &["docker-pullable://", "docker://"];

/// Derive the workload identifier for (cluster, namespace, kind, name)
pub fn wlid(cluster: &str, namespace: &str, kind: &str, name: &str) -> String {
    let kind = normalize_kind(kind);

    let mut id = format!("{}{}{}", WLID_PREFIX, CLUSTER_LEVEL, cluster);
    if namespace.is_empty() {
        return id;
    }
    id.push('/');
    id.push_str(NAMESPACE_LEVEL);
    id.push_str(namespace);

    if kind.is_empty() {
        return id;
    }
    id.push('/');
    id.push_str(&kind);

    if name.is_empty() {
        return id;
    }
    id.push('-');
    id.push_str(name);
    id
}

/// Derive the secret identifier. `subkey` addresses a single data key.
pub fn sid(cluster: &str, namespace: &str, name: &str, subkey: &str) -> String {
    let mut id = format!("{}{}{}", SID_PREFIX, CLUSTER_LEVEL, cluster);
    if namespace.is_empty() {
        return id;
    }
    id.push('/');
    id.push_str(NAMESPACE_LEVEL);
    id.push_str(namespace);

    if name.is_empty() {
        return id;
    }
    id.push('/');
    id.push_str(SECRET_LEVEL);
    id.push_str(name);

    if !subkey.is_empty() {
        id.push('/');
        id.push_str(SUBSECRET_LEVEL);
        id.push_str(subkey);
    }
    id
}

/// Derive the identifier of one container in one revision of a workload
pub fn instance_id(
    api_version: &str,
    namespace: &str,
    kind: &str,
    name: &str,
    resource_version: &str,
    container: &str,
) -> String {
    format!(
        "apiversion-{}/namespace-{}/kind-{}/name-{}/resourceversion-{}/container-{}",
        api_version,
        namespace,
        kind.to_lowercase(),
        name,
        resource_version,
        container
    )
}

/// Strip one leading runtime scheme marker from an image reference
///
/// Returns the input unchanged when no known marker is present.
pub fn normalize_image_reference(raw: &str) -> &str {
    IMAGE_SCHEME_MARKERS
        .iter()
        .find_map(|marker| raw.strip_prefix(marker))
        .unwrap_or(raw)
}

/// Extract the namespace level of a WLID, SID or wildcard WLID
pub fn namespace_from_wlid(id: &str) -> Option<&str> {
    let rest = id
        .strip_prefix(WLID_PREFIX)
        .or_else(|| id.strip_prefix(SID_PREFIX))?;
    rest.split('/')
        .nth(1)
        .and_then(|level| level.strip_prefix(NAMESPACE_LEVEL))
        .filter(|ns| !ns.is_empty())
}

/// Check whether `wlid` falls under a wildcard WLID
///
/// Patterns with `*` or `?` are matched as globs against the whole identifier.
/// Other patterns match the identifier itself and everything below it on a
/// level boundary (`.../namespace-a` matches `.../namespace-a/pod-x` but not
/// `.../namespace-ab`). A pattern ending in a bare kind level matches every
/// name of that kind (`.../namespace-a/deployment` matches
/// `.../namespace-a/deployment-web`).
pub fn wild_wlid_matches(pattern: &str, wlid: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    if pattern.contains('*') || pattern.contains('?') {
        return glob_match(pattern, wlid);
    }
    match wlid.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) if rest.starts_with('/') => true,
        Some(rest) if rest.starts_with('-') => ends_in_kind_level(pattern),
        _ => false,
    }
}

/// Whether the last level of a WLID pattern is a kind with no name
///
/// Cluster and namespace levels carry a `-`, kinds never do.
fn ends_in_kind_level(pattern: &str) -> bool {
    let Some(levels) = pattern.strip_prefix(WLID_PREFIX) else {
        return false;
    };
    match levels.rsplit('/').next() {
        Some(last) => !last.is_empty() && !last.contains('-'),
        None => false,
    }
}

/// Kinds are lowercased and stripped of dashes so the first `-` after the
/// kind always separates it from the name
fn normalize_kind(kind: &str) -> String {
    kind.chars()
        .filter(|c| *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Simple glob pattern matching (supports * and ?)
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let mut pi = 0; // pattern index
    let mut ti = 0; // text index
    let mut star_pi = None; // position of last '*' in pattern
    let mut star_ti = 0; // position in text when we saw last '*'

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star_pi = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(sp) = star_pi {
            // Backtrack: let the last '*' swallow one more character
            pi = sp + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }

    pi == pattern.len()
}
