//! Red-line validation of dry-run results.
//!
//! [`RedLineValidator`] is the only place the hard invariants DE1 through DE6
//! are enforced. Violations are returned as values in a [`RedLineReport`];
//! the validator never fails and never panics, so callers decide what a
//! violation costs.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{DryExecutionResult, ExecutionIntent};
use crate::obs;

/// Metadata keys that betray imperative execution during a dry run.
pub const EXECUTION_KEYS: &[&str] = &[
    "executed",
    "subprocess",
    "shell",
    "shell_command",
    "exit_code",
    "pid",
    "process",
    "stdout",
    "stderr",
    "command_output",
    "invoked_commands",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RedLineId {
    /// Dry run must not execute anything.
    DE1,
    /// Outputs stay inside the output directory.
    DE2,
    /// Patch paths are backed by intent evidence.
    DE3,
    /// Every graph node carries evidence.
    DE4,
    /// High risk is routed to review.
    DE5,
    /// Checksum and lineage are recorded.
    DE6,
}

impl RedLineId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DE1 => "DE1",
            Self::DE2 => "DE2",
            Self::DE3 => "DE3",
            Self::DE4 => "DE4",
            Self::DE5 => "DE5",
            Self::DE6 => "DE6",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::DE1 | Self::DE2 | Self::DE5 => Severity::Critical,
            Self::DE3 | Self::DE4 => Severity::High,
            Self::DE6 => Severity::Medium,
        }
    }
}

impl std::fmt::Display for RedLineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: RedLineId,
    pub severity: Severity,
    pub message: String,
    pub evidence: Value,
}

impl Violation {
    fn new(id: RedLineId, message: impl Into<String>, evidence: Value) -> Self {
        Self {
            id,
            severity: id.severity(),
            message: message.into(),
            evidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedLineReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl RedLineReport {
    pub fn ids(&self) -> Vec<RedLineId> {
        self.violations.iter().map(|v| v.id).collect()
    }

    pub fn has(&self, id: RedLineId) -> bool {
        self.violations.iter().any(|v| v.id == id)
    }

    /// Comma-separated violation ids, e.g. `DE4, DE5`.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct RedLineValidator {
    output_dir: PathBuf,
    source_root: Option<PathBuf>,
}

impl RedLineValidator {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: lexical_normalize(output_dir.as_ref()).unwrap_or_default(),
            source_root: None,
        }
    }

    /// Declared outputs under `root` are violations even if they also fall
    /// under the output directory.
    pub fn with_source_root(mut self, root: impl AsRef<Path>) -> Self {
        self.source_root = lexical_normalize(root.as_ref());
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Evaluate every red line. DE3 is only checked when `intent` is given.
    pub fn validate(
        &self,
        result: &DryExecutionResult,
        intent: Option<&ExecutionIntent>,
    ) -> RedLineReport {
        let mut violations = Vec::new();
        self.check_no_execution(result, &mut violations);
        self.check_output_containment(result, &mut violations);
        if let Some(intent) = intent {
            check_path_provenance(result, intent, &mut violations);
        }
        check_node_evidence(result, &mut violations);
        check_review_routing(result, &mut violations);
        check_integrity_fields(result, &mut violations);

        let report = RedLineReport {
            valid: violations.is_empty(),
            violations,
        };
        obs::emit_red_line_evaluated(report.valid, report.violations.len());
        report
    }

    fn check_no_execution(&self, result: &DryExecutionResult, out: &mut Vec<Violation>) {
        let mut hits = Vec::new();
        for (key, value) in &result.metadata {
            find_execution_keys(key, value, key, &mut hits);
        }
        if !hits.is_empty() {
            out.push(Violation::new(
                RedLineId::DE1,
                "dry run metadata shows imperative execution",
                json!({ "keys": hits }),
            ));
        }
    }

    fn check_output_containment(&self, result: &DryExecutionResult, out: &mut Vec<Violation>) {
        for declared in &result.declared_outputs {
            let joined = if declared.is_absolute() {
                declared.clone()
            } else {
                self.output_dir.join(declared)
            };
            let message = match lexical_normalize(&joined) {
                None => Some("declared output escapes the filesystem root"),
                Some(p) if !p.starts_with(&self.output_dir) => {
                    Some("declared output lies outside the output directory")
                }
                Some(p)
                    if self
                        .source_root
                        .as_ref()
                        .is_some_and(|root| p.starts_with(root)) =>
                {
                    Some("declared output lies inside the source tree")
                }
                Some(_) => None,
            };
            if let Some(message) = message {
                out.push(Violation::new(
                    RedLineId::DE2,
                    message,
                    json!({
                        "path": declared.display().to_string(),
                        "output_dir": self.output_dir.display().to_string(),
                    }),
                ));
            }
        }
    }
}

fn find_execution_keys(key: &str, value: &Value, trail: &str, hits: &mut Vec<String>) {
    if EXECUTION_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
        hits.push(trail.to_string());
    }
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                find_execution_keys(k, v, &format!("{trail}.{k}"), hits);
            }
        }
        Value::Array(items) => {
            for (idx, v) in items.iter().enumerate() {
                if let Value::Object(map) = v {
                    for (k, inner) in map {
                        find_execution_keys(k, inner, &format!("{trail}[{idx}].{k}"), hits);
                    }
                }
            }
        }
        _ => {}
    }
}

fn check_path_provenance(
    result: &DryExecutionResult,
    intent: &ExecutionIntent,
    out: &mut Vec<Violation>,
) {
    let sources: Vec<&str> = intent
        .scope
        .targets
        .files
        .iter()
        .map(String::as_str)
        .chain(intent.all_evidence_refs())
        .collect();

    for path in result.patch_plan.paths() {
        if !sources.iter().any(|s| backs_path(s, path)) {
            out.push(Violation::new(
                RedLineId::DE3,
                format!("path fabrication detected: {path}"),
                json!({ "path": path }),
            ));
        }
    }
}

/// `source` names `path` exactly or ends with it at a `/` boundary.
fn backs_path(source: &str, path: &str) -> bool {
    let source = source.strip_prefix("./").unwrap_or(source);
    let path = path.strip_prefix("./").unwrap_or(path);
    if path.is_empty() {
        return false;
    }
    source == path
        || source
            .strip_suffix(path)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

fn check_node_evidence(result: &DryExecutionResult, out: &mut Vec<Violation>) {
    for node in &result.graph.nodes {
        if node.evidence_refs.iter().all(|e| e.trim().is_empty()) {
            out.push(Violation::new(
                RedLineId::DE4,
                format!("graph node '{}' has no evidence_refs", node.node_id),
                json!({ "node_id": node.node_id }),
            ));
        }
    }
}

fn check_review_routing(result: &DryExecutionResult, out: &mut Vec<Violation>) {
    let stub = &result.review_pack_stub;
    let risk = stub.risk_summary.dominant_risk;
    if risk.requires_approval() && stub.requires_review.is_empty() {
        out.push(Violation::new(
            RedLineId::DE5,
            format!("dominant risk is {risk} but nothing is routed to review"),
            json!({ "dominant_risk": risk }),
        ));
    }
}

fn check_integrity_fields(result: &DryExecutionResult, out: &mut Vec<Violation>) {
    let mut missing = Vec::new();
    if result.checksum.as_deref().is_none_or(str::is_empty) {
        missing.push("checksum");
    }
    if result.lineage.is_none() {
        missing.push("lineage");
    }
    if !missing.is_empty() {
        out.push(Violation::new(
            RedLineId::DE6,
            format!("missing {}", missing.join(" and ")),
            json!({ "missing": missing }),
        ));
    }
}

/// Resolve `.` and `..` without touching the filesystem. `None` when `..`
/// climbs above the root.
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => return None,
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::{GraphNode, Lineage, RiskTier};

    fn valid_result() -> DryExecutionResult {
        let mut result = DryExecutionResult {
            checksum: Some("abc".into()),
            lineage: Some(Lineage {
                intent_id: "i".into(),
                evidence_digest: "d".into(),
                planner_version: "0.1.0".into(),
            }),
            ..Default::default()
        };
        result.graph.nodes.push(GraphNode {
            node_id: "n1".into(),
            node_type: "write_file".into(),
            evidence_refs: vec!["src/a.py".into()],
            attrs: BTreeMap::new(),
        });
        result
    }

    #[test]
    fn clean_result_is_valid() {
        let report = RedLineValidator::new("/out").validate(&valid_result(), None);
        assert!(report.valid, "{:?}", report.violations);
    }

    #[test]
    fn nested_execution_keys_trip_de1() {
        let mut result = valid_result();
        result
            .metadata
            .insert("trace".into(), json!({ "steps": [{ "exit_code": 0 }] }));
        let report = RedLineValidator::new("/out").validate(&result, None);
        assert_eq!(report.ids(), vec![RedLineId::DE1]);
        assert_eq!(report.violations[0].evidence["keys"][0], "trace.steps[0].exit_code");
        assert_eq!(report.violations[0].severity, Severity::Critical);
    }

    #[test]
    fn outputs_outside_or_in_source_trip_de2() {
        let mut result = valid_result();
        result.declared_outputs = vec![
            PathBuf::from("reports/summary.json"),
            PathBuf::from("../escape.json"),
            PathBuf::from("/etc/passwd"),
        ];
        let report = RedLineValidator::new("/work/out").validate(&result, None);
        let de2: Vec<_> = report
            .violations
            .iter()
            .filter(|v| v.id == RedLineId::DE2)
            .collect();
        assert_eq!(de2.len(), 2);

        let mut inside_source = valid_result();
        inside_source.declared_outputs = vec![PathBuf::from("/work/out/a.json")];
        let report = RedLineValidator::new("/work/out")
            .with_source_root("/work")
            .validate(&inside_source, None);
        assert!(report.has(RedLineId::DE2));
    }

    #[test]
    fn suffix_match_respects_component_boundary() {
        assert!(backs_path("src/a.py", "src/a.py"));
        assert!(backs_path("repo_x/src/a.py", "src/a.py"));
        assert!(backs_path("./src/a.py", "src/a.py"));
        assert!(!backs_path("xsrc/a.py", "src/a.py"));
        assert!(!backs_path("a.py", "src/a.py"));
    }

    #[test]
    fn missing_checksum_and_lineage_is_one_de6() {
        let mut result = valid_result();
        result.checksum = None;
        result.lineage = None;
        let report = RedLineValidator::new("/out").validate(&result, None);
        assert_eq!(report.ids(), vec![RedLineId::DE6]);
        assert_eq!(report.violations[0].severity, Severity::Medium);
    }

    #[test]
    fn high_risk_without_review_trips_de5() {
        let mut result = valid_result();
        result.review_pack_stub.risk_summary.dominant_risk = RiskTier::Critical;
        let report = RedLineValidator::new("/out").validate(&result, None);
        assert!(report.has(RedLineId::DE5));

        result.review_pack_stub.requires_review = vec!["n1".into()];
        let report = RedLineValidator::new("/out").validate(&result, None);
        assert!(report.valid);
    }

    #[test]
    fn lexical_normalize_handles_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/a/./b/../c")),
            Some(PathBuf::from("/a/c"))
        );
        assert_eq!(lexical_normalize(Path::new("/..")), None);
    }
}
