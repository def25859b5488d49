// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

/// Why an owner chain could not be climbed to its top-level controller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OwnerChainError {
    #[error("object has no name")]
    MissingName,

    #[error("owner chain deeper than {0} levels")]
    DepthExceeded(usize),

    #[error("owner reference cycle at {kind} '{name}'")]
    Cycle { kind: String, name: String },

    #[error("failed to get owner {kind} '{name}': {reason}")]
    Fetch {
        kind: String,
        name: String,
        reason: String,
    },
}

/// Identifier resolution failure for one object in a batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to resolve owner: namespace: {namespace}, {kind} name: {name}, error: {source}")]
pub struct ResolveError {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    #[source]
    pub source: OwnerChainError,
}

impl ResolveError {
    pub fn new(namespace: &str, kind: &str, name: &str, source: OwnerChainError) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_lowercase(),
            name: name.to_string(),
            source,
        }
    }
}
