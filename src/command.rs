// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Remote commands delivered by the control backend
//!
//! A command names an action and addresses its targets either with an explicit
//! WLID, with a wildcard WLID (namespace or kind scoped), or with a label
//! selector in `args.labels` combined with the wildcard's namespace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::identifiers;

/// Action requested by a command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    /// Discovery scan of workloads not yet registered with the backend
    Unregistered,
    Scan,
    Update,
    Encrypt,
    Decrypt,
    Inject,
    Remove,
    Restart,
    /// Any command this agent has no dedicated policy for
    Other(String),
}

impl CommandKind {
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Unregistered => "unregistered",
            CommandKind::Scan => "scan",
            CommandKind::Update => "update",
            CommandKind::Encrypt => "encrypt",
            CommandKind::Decrypt => "decrypt",
            CommandKind::Inject => "inject",
            CommandKind::Remove => "remove",
            CommandKind::Restart => "restart",
            CommandKind::Other(name) => name,
        }
    }

    /// Whether findings for this command are correlated by image
    pub fn is_scan(&self) -> bool {
        matches!(self, CommandKind::Scan | CommandKind::Unregistered)
    }
}

impl From<&str> for CommandKind {
    fn from(name: &str) -> Self {
        match name {
            "unregistered" => CommandKind::Unregistered,
            "scan" => CommandKind::Scan,
            "update" => CommandKind::Update,
            "encrypt" | "encryptSecret" => CommandKind::Encrypt,
            "decrypt" | "decryptSecret" => CommandKind::Decrypt,
            "inject" => CommandKind::Inject,
            "remove" => CommandKind::Remove,
            "restart" => CommandKind::Restart,
            other => CommandKind::Other(other.to_string()),
        }
    }
}

impl From<String> for CommandKind {
    fn from(name: String) -> Self {
        CommandKind::from(name.as_str())
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_name: CommandKind,
    #[serde(default, rename = "responseID", skip_serializing_if = "String::is_empty")]
    pub response_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wlid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wild_wlid: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl Command {
    pub fn new(command_name: CommandKind) -> Self {
        Self {
            command_name,
            response_id: String::new(),
            wlid: String::new(),
            wild_wlid: String::new(),
            args: serde_json::Map::new(),
        }
    }

    pub fn with_wlid(mut self, wlid: impl Into<String>) -> Self {
        self.wlid = wlid.into();
        self
    }

    pub fn with_wild_wlid(mut self, wild_wlid: impl Into<String>) -> Self {
        self.wild_wlid = wild_wlid.into();
        self
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: serde_json::Map<String, serde_json::Value> = labels
            .into_iter()
            .map(|(k, v)| (k.into(), serde_json::Value::String(v.into())))
            .collect();
        self.args
            .insert("labels".to_string(), serde_json::Value::Object(map));
        self
    }

    /// Namespace used to scope listing: from the explicit WLID, else from
    /// the wildcard WLID, else empty (all namespaces)
    pub fn target_namespace(&self) -> String {
        if !self.wlid.is_empty() {
            return identifiers::namespace_from_wlid(&self.wlid)
                .unwrap_or_default()
                .to_string();
        }
        if !self.wild_wlid.is_empty() {
            return identifiers::namespace_from_wlid(&self.wild_wlid)
                .unwrap_or_default()
                .to_string();
        }
        String::new()
    }

    /// Addressing key handed to executors: explicit WLID, else wildcard WLID
    pub fn target_identifier(&self) -> &str {
        if !self.wlid.is_empty() {
            return &self.wlid;
        }
        &self.wild_wlid
    }

    /// Label selector from `args.labels`; non-string values are ignored
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.args
            .get("labels")
            .and_then(|v| v.as_object())
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Batch envelope as sent by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Parse either a single command or a `{"commands": [...]}` envelope
pub fn parse_commands(input: &str) -> anyhow::Result<Vec<Command>> {
    let value: serde_json::Value = serde_json::from_str(input)?;
    if value.get("commands").is_some() {
        let batch: Commands = serde_json::from_value(value)?;
        Ok(batch.commands)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}
