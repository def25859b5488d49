// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Static command policy
//!
//! Which resource kinds each command lists, and which namespaces a command may
//! never touch. Built once at startup and shared read-only.

use std::collections::HashMap;

use crate::command::CommandKind;

pub const NAMESPACE_SYSTEM: &str = "kube-system";
pub const NAMESPACE_PUBLIC: &str = "kube-public";

/// Resource kinds (plural, as used for listing) relevant to a command
///
/// Every command kind maps to something; unlisted kinds get pods.
pub fn relevant_resource_kinds(kind: &CommandKind) -> &'static [&'static str] {
    match kind {
        CommandKind::Unregistered => &["namespaces", "pods"],
        CommandKind::Encrypt | CommandKind::Decrypt => &["secrets"],
        _ => &["pods"],
    }
}

/// Namespaces each command is forbidden from targeting
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    excluded: HashMap<CommandKind, Vec<String>>,
}

impl CommandPolicy {
    /// Build the exclusion table. `agent_namespace` is where the agent itself
    /// runs and is protected from mutating commands.
    pub fn new(agent_namespace: &str) -> Self {
        let protected = vec![
            NAMESPACE_SYSTEM.to_string(),
            NAMESPACE_PUBLIC.to_string(),
            agent_namespace.to_string(),
        ];

        let mut excluded = HashMap::new();
        for kind in [
            CommandKind::Update,
            CommandKind::Inject,
            CommandKind::Decrypt,
            CommandKind::Encrypt,
            CommandKind::Remove,
        ] {
            excluded.insert(kind, protected.clone());
        }
        excluded.insert(
            CommandKind::Restart,
            vec![NAMESPACE_SYSTEM.to_string(), NAMESPACE_PUBLIC.to_string()],
        );
        excluded.insert(CommandKind::Scan, Vec::new());

        Self { excluded }
    }

    pub fn relevant_resource_kinds(&self, kind: &CommandKind) -> &'static [&'static str] {
        relevant_resource_kinds(kind)
    }

    pub fn is_namespace_excluded(&self, kind: &CommandKind, namespace: &str) -> bool {
        self.excluded
            .get(kind)
            .is_some_and(|namespaces| namespaces.iter().any(|ns| ns == namespace))
    }
}
