//! The execution intent consumed from the upstream planning layer.
//!
//! Intents are read-only here: the planner derives plans from them and the
//! red-line validator cross-checks patch paths against their evidence, but
//! nothing in this crate mutates one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::risk::RiskTier;

/// An evidence-backed change request produced upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionIntent {
    pub intent_id: String,
    #[serde(default)]
    pub scope: IntentScope,
    /// Evidence identifiers backing the intent as a whole.
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub planned_commands: Vec<PlannedCommand>,
    #[serde(default)]
    pub risk: IntentRisk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentScope {
    #[serde(default)]
    pub targets: ScopeTargets,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeTargets {
    /// Repository-relative files the intent is allowed to touch.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRisk {
    #[serde(default)]
    pub overall: RiskTier,
}

/// One command the upstream planner wants executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCommand {
    pub command_id: String,
    /// Operation name, checked literally against the sandbox allowlist.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Full replacement content for file-writing actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Pre-rendered unified diff, used verbatim when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskTier>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Extra action parameters (for example `name`/`value` for `set_env`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl PlannedCommand {
    /// Minimal command with no path, evidence or dependencies.
    pub fn new(command_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            action: action.into(),
            path: None,
            content: None,
            diff: None,
            commit_message: None,
            risk: None,
            evidence_refs: Vec::new(),
            depends_on: Vec::new(),
            params: BTreeMap::new(),
        }
    }
}

impl ExecutionIntent {
    /// Parse an intent from its JSON form.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Every evidence id the intent declares, at intent and command level.
    pub fn all_evidence_refs(&self) -> impl Iterator<Item = &str> {
        self.evidence_refs.iter().map(String::as_str).chain(
            self.planned_commands
                .iter()
                .flat_map(|c| c.evidence_refs.iter().map(String::as_str)),
        )
    }

    /// SHA-256 over the intent's evidence snapshot.
    ///
    /// Covers the scope targets, intent evidence and each command's evidence
    /// in declaration order, so two intents differing only in evidence never
    /// share a digest.
    pub fn evidence_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for target in &self.scope.targets.files {
            hasher.update(b"target\0");
            hasher.update(target.as_bytes());
            hasher.update(b"\n");
        }
        for evidence in &self.evidence_refs {
            hasher.update(b"intent\0");
            hasher.update(evidence.as_bytes());
            hasher.update(b"\n");
        }
        for command in &self.planned_commands {
            for evidence in &command.evidence_refs {
                hasher.update(command.command_id.as_bytes());
                hasher.update(b"\0");
                hasher.update(evidence.as_bytes());
                hasher.update(b"\n");
            }
        }
        hex::encode(hasher.finalize())
    }
}
