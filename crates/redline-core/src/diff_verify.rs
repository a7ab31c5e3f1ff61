//! Structural verification of produced diffs.
//!
//! Accepts bare unified diffs and `git format-patch` mails. Mail headers are
//! stripped before checking, and the fact that they were is reported back in
//! [`DiffVerification::normalized_from_format_patch`] so the audit trail
//! never hides a normalization.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::policy::{normalize_relative, PathMatcher};

const MAIL_HEADER_PATTERNS: &[&str] = &[
    r"^From [0-9a-f]{7,64} (Mon|Tue|Wed|Thu|Fri|Sat|Sun) (Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) ",
    r"^Subject: \[PATCH",
    r"^(From|Date|Subject): ",
];

static MAIL_HEADERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    MAIL_HEADER_PATTERNS
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

/// Outcome of verifying one diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffVerification {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub normalized_from_format_patch: bool,
    /// 0-based index of the first diff line in the submitted text.
    pub normalized_start_line: usize,
    /// The diff with any mail header (and signature trailer) removed.
    pub normalized_diff: String,
    /// Files touched according to the diff headers.
    pub files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiffVerifier {
    allowed: PathMatcher,
    forbidden: PathMatcher,
    strict: bool,
}

impl DiffVerifier {
    pub fn new(allowed: PathMatcher, forbidden: PathMatcher) -> Self {
        Self {
            allowed,
            forbidden,
            strict: false,
        }
    }

    /// Treat "not covered by allowed paths" as an error instead of a warning.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Verify `diff` against the path rules and the caller's declared
    /// `touched_files`.
    pub fn verify(&self, diff: &str, touched_files: &[String]) -> DiffVerification {
        let mut report = DiffVerification::default();

        if diff.trim().is_empty() {
            report.errors.push("diff is empty".to_string());
            return report;
        }

        let lines: Vec<&str> = diff.lines().collect();
        let Some(start) = find_diff_start(&lines) else {
            report
                .errors
                .push("no unified diff markers found (expected `diff --git` or `---`/`+++`)".into());
            return report;
        };

        let preamble = &lines[..start];
        let from_mail = preamble
            .iter()
            .any(|line| MAIL_HEADERS.iter().any(|re| re.is_match(line)));
        if start > 0 && !from_mail {
            report.warnings.push(format!(
                "ignored {start} preamble line(s) that are not patch mail headers"
            ));
        }
        report.normalized_from_format_patch = from_mail;
        report.normalized_start_line = start;

        let mut body = &lines[start..];
        if from_mail {
            body = strip_signature(body);
        }
        report.normalized_diff = join_lines(body, diff.ends_with('\n'));

        let files = extract_files(body);
        if files.is_empty() {
            report
                .errors
                .push("diff names no files in its headers".to_string());
        }

        for file in &files {
            let normalized = match normalize_relative(file) {
                Ok(p) => p,
                Err(reason) => {
                    report.errors.push(format!("{file}: {reason}"));
                    continue;
                }
            };
            if self.forbidden.matches(&normalized) {
                report
                    .errors
                    .push(format!("{normalized}: matches a forbidden path"));
                continue;
            }
            if !self.allowed.is_empty() && !self.allowed.matches(&normalized) {
                let message = format!("{normalized}: not covered by allowed paths");
                if self.strict {
                    report.errors.push(message);
                } else {
                    report.warnings.push(message);
                }
            }
        }

        let declared: BTreeSet<String> = touched_files
            .iter()
            .map(|f| normalize_relative(f).unwrap_or_else(|_| f.clone()))
            .collect();
        let actual: BTreeSet<String> = files
            .iter()
            .map(|f| normalize_relative(f).unwrap_or_else(|_| f.clone()))
            .collect();
        for missing in declared.difference(&actual) {
            report
                .warnings
                .push(format!("{missing}: declared as touched but absent from diff"));
        }
        for extra in actual.difference(&declared) {
            report
                .warnings
                .push(format!("{extra}: present in diff but not declared as touched"));
        }

        report.files = files;
        report.is_valid = report.errors.is_empty();
        report
    }
}

fn find_diff_start(lines: &[&str]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(idx, line)| {
        if line.starts_with("diff --git ") {
            return Some(idx);
        }
        let next_is_plus = lines
            .get(idx + 1)
            .is_some_and(|next| next.starts_with("+++ "));
        (line.starts_with("--- ") && next_is_plus).then_some(idx)
    })
}

/// Drop the `-- ` signature block `git format-patch` appends.
fn strip_signature<'a>(body: &'a [&'a str]) -> &'a [&'a str] {
    let Some(pos) = body.iter().rposition(|line| *line == "-- ") else {
        return body;
    };
    let trailer_is_signature = body[pos + 1..].iter().all(|line| {
        !(line.starts_with(' ')
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with('@')
            || line.starts_with("diff "))
    });
    if trailer_is_signature {
        &body[..pos]
    } else {
        body
    }
}

fn join_lines(lines: &[&str], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Files named by the headers of `diff`, in first-appearance order.
pub fn diff_files(diff: &str) -> Vec<String> {
    let lines: Vec<&str> = diff.lines().collect();
    extract_files(&lines)
}

fn extract_files(body: &[&str]) -> Vec<String> {
    let mut files = Vec::new();

    for line in body {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(idx) = rest.rfind(" b/") {
                push_file(&mut files, rest[..idx].trim_start_matches("a/"));
                push_file(&mut files, &rest[idx + 3..]);
            }
        }
    }
    if body.iter().any(|line| line.starts_with("diff --git ")) {
        return files;
    }

    for line in body {
        let path = line
            .strip_prefix("+++ ")
            .or_else(|| line.strip_prefix("--- "))
            .map(|p| p.split('\t').next().unwrap_or(p));
        if let Some(path) = path {
            let path = path
                .strip_prefix("b/")
                .or_else(|| path.strip_prefix("a/"))
                .unwrap_or(path);
            push_file(&mut files, path);
        }
    }
    files
}

fn push_file(files: &mut Vec<String>, path: &str) {
    if path != "/dev/null" && !files.iter().any(|f| f == path) {
        files.push(path.to_string());
    }
}

/// Render a whole-file replacement as a git-style unified diff.
///
/// `None` on either side means the file is absent. Returns an empty string
/// when both sides are identical.
pub fn render_replacement_diff(path: &str, old: Option<&str>, new: Option<&str>) -> String {
    if old == new {
        return String::new();
    }
    let mut out = format!("diff --git a/{path} b/{path}\n");
    match (old, new) {
        (None, Some(_)) => out.push_str("new file mode 100644\n"),
        (Some(_), None) => out.push_str("deleted file mode 100644\n"),
        _ => {}
    }
    let old_name = old.map_or_else(|| "/dev/null".to_string(), |_| format!("a/{path}"));
    let new_name = new.map_or_else(|| "/dev/null".to_string(), |_| format!("b/{path}"));
    out.push_str(&format!("--- {old_name}\n+++ {new_name}\n"));

    let old_lines: Vec<&str> = old.map(|s| s.lines().collect()).unwrap_or_default();
    let new_lines: Vec<&str> = new.map(|s| s.lines().collect()).unwrap_or_default();
    out.push_str(&format!(
        "@@ -{} +{} @@\n",
        hunk_range(old_lines.len()),
        hunk_range(new_lines.len())
    ));
    push_side(&mut out, '-', &old_lines, old);
    push_side(&mut out, '+', &new_lines, new);
    out
}

fn hunk_range(count: usize) -> String {
    match count {
        0 => "0,0".to_string(),
        1 => "1".to_string(),
        n => format!("1,{n}"),
    }
}

fn push_side(out: &mut String, marker: char, lines: &[&str], source: Option<&str>) {
    for line in lines {
        out.push(marker);
        out.push_str(line);
        out.push('\n');
    }
    if let Some(text) = source {
        if !text.is_empty() && !text.ends_with('\n') {
            out.push_str("\\ No newline at end of file\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE: &str = "diff --git a/src/a.py b/src/a.py\n\
index 0000000..1111111 100644\n\
--- a/src/a.py\n\
+++ b/src/a.py\n\
@@ -1 +1 @@\n\
-x = 1\n\
+x = 2\n";

    const MAIL_HEADER: &str = "From 3f2a1b9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a Mon Sep 17 00:00:00 2001\n\
From: Dev <dev@example.com>\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\n\
Subject: [PATCH] bump x\n\
\n\
---\n\
 src/a.py | 2 +-\n\
 1 file changed, 1 insertion(+), 1 deletion(-)\n\
\n";

    fn verifier(allowed: &[&str], forbidden: &[&str]) -> DiffVerifier {
        DiffVerifier::new(
            PathMatcher::new(allowed.iter().copied()).unwrap(),
            PathMatcher::new(forbidden.iter().copied()).unwrap(),
        )
    }

    fn touched(files: &[&str]) -> Vec<String> {
        files.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn bare_diff_is_valid_and_not_normalized() {
        let report = verifier(&["src/**"], &[]).verify(BARE, &touched(&["src/a.py"]));
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(!report.normalized_from_format_patch);
        assert_eq!(report.normalized_start_line, 0);
        assert_eq!(report.files, vec!["src/a.py"]);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn mail_header_is_detected_and_stripped() {
        let v = verifier(&["src/**"], &[]);
        let bare = v.verify(BARE, &touched(&["src/a.py"]));
        let mail = format!("{MAIL_HEADER}{BARE}-- \n2.43.0\n\n");
        let normalized = v.verify(&mail, &touched(&["src/a.py"]));

        assert!(normalized.is_valid, "{:?}", normalized.errors);
        assert!(normalized.normalized_from_format_patch);
        assert_eq!(normalized.normalized_start_line, 9);
        assert_eq!(normalized.normalized_diff, bare.normalized_diff);
        assert_eq!(normalized.normalized_diff, BARE);
    }

    #[test]
    fn empty_diff_is_rejected() {
        let report = verifier(&[], &[]).verify("  \n", &[]);
        assert!(!report.is_valid);
        assert_eq!(report.errors, vec!["diff is empty"]);
    }

    #[test]
    fn text_without_markers_is_rejected() {
        let report = verifier(&[], &[]).verify("just some prose\n---\nmore prose\n", &[]);
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("no unified diff markers"));
    }

    #[test]
    fn forbidden_path_wins_over_allowed() {
        let report = verifier(&["src/**"], &["src/secrets/**"]).verify(
            &BARE.replace("src/a.py", "src/secrets/key.pem"),
            &touched(&["src/secrets/key.pem"]),
        );
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("forbidden"));
    }

    #[test]
    fn path_outside_allowed_warns_or_errors_by_strictness() {
        let diff = BARE.replace("src/a.py", "docs/a.md");
        let lenient = verifier(&["src/**"], &[]).verify(&diff, &touched(&["docs/a.md"]));
        assert!(lenient.is_valid);
        assert_eq!(lenient.warnings.len(), 1);

        let strict = verifier(&["src/**"], &[])
            .strict(true)
            .verify(&diff, &touched(&["docs/a.md"]));
        assert!(!strict.is_valid);
        assert!(strict.errors[0].contains("not covered"));
    }

    #[test]
    fn declared_file_mismatch_is_a_warning() {
        let report = verifier(&[], &[]).verify(BARE, &touched(&["src/b.py"]));
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn plain_unified_diff_uses_plus_lines() {
        let diff = "--- a/lib/x.rs\t2024-01-01\n+++ b/lib/x.rs\t2024-01-02\n@@ -1 +1 @@\n-a\n+b\n";
        let report = verifier(&[], &[]).verify(diff, &touched(&["lib/x.rs"]));
        assert!(report.is_valid, "{:?}", report.errors);
        assert_eq!(report.files, vec!["lib/x.rs"]);
    }

    #[test]
    fn traversal_in_diff_header_is_an_error() {
        let diff = BARE.replace("src/a.py", "../outside.py");
        let report = verifier(&[], &[]).verify(&diff, &[]);
        assert!(!report.is_valid);
    }

    #[test]
    fn mail_header_patterns_all_compile() {
        assert_eq!(MAIL_HEADERS.len(), MAIL_HEADER_PATTERNS.len());
    }

    #[test]
    fn replacement_diff_for_new_file_verifies() {
        let diff = render_replacement_diff("src/new.py", None, Some("print(1)\n"));
        assert!(diff.contains("new file mode"));
        assert!(diff.contains("--- /dev/null"));
        assert!(diff.contains("@@ -0,0 +1 @@"));
        let report = verifier(&["src/**"], &[]).verify(&diff, &touched(&["src/new.py"]));
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn replacement_diff_marks_missing_newline_and_identity() {
        let diff = render_replacement_diff("a.txt", Some("one\ntwo\n"), Some("one"));
        assert!(diff.contains("@@ -1,2 +1 @@"));
        assert!(diff.ends_with("+one\n\\ No newline at end of file\n"));
        assert!(render_replacement_diff("a.txt", Some("same"), Some("same")).is_empty());
    }
}
