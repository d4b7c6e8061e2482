//! Verdict reconciliation: model free text → a deterministic [`Verdict`].
//!
//! Two response protocols are accepted (see [`ResponseProtocol`]):
//!
//! * **Structured**: a JSON object, possibly inside a fenced block or
//!   surrounded by prose, carrying a `requirements` array and a `summary`.
//!   The array is authoritative. Counts are recomputed from it, and any
//!   summary figure that disagrees is logged and overwritten.
//! * **Legacy**: one status word (GREEN, YELLOW, ORANGE or RED) somewhere in
//!   the text, with the rest of the text as the explanation.
//!
//! [`ResponseProtocol::parse`] tries Structured first. A Legacy prompt falls
//! back to the status word; a Structured prompt never does.
//! Reconciliation is pure apart from logging, and idempotent: feeding
//! [`Verdict::corrected_json`] back through [`reconcile`] yields the same
//! summary and level.

use crate::config::PromptProtocol;
use crate::error::PolicyCheckError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json|JSON)?[ \t]*\r?\n?\s*\{").unwrap());

static RE_LEGACY_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(GREEN|YELLOW|ORANGE|RED)\b").unwrap());

/// Characters stripped from the start of a legacy explanation.
const LEGACY_LEADING_PUNCTUATION: &[char] = &['.', ':', '-', ' ', '\n'];

// ── Verdict levels ───────────────────────────────────────────────────────────

/// Final compliance severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictLevel {
    /// Every requirement fully met.
    Green,
    /// No failures, but at least one requirement only partially met.
    Yellow,
    /// Ambiguous; needs clarification. Legacy protocol only.
    Orange,
    /// At least one requirement not met.
    Red,
}

impl VerdictLevel {
    /// Legacy status words in the order they are searched for.
    pub const LEGACY_ORDER: [VerdictLevel; 4] = [
        VerdictLevel::Green,
        VerdictLevel::Yellow,
        VerdictLevel::Orange,
        VerdictLevel::Red,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VerdictLevel::Green => "GREEN",
            VerdictLevel::Yellow => "YELLOW",
            VerdictLevel::Orange => "ORANGE",
            VerdictLevel::Red => "RED",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        Self::LEGACY_ORDER
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(word))
    }
}

impl std::fmt::Display for VerdictLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Structured schema ────────────────────────────────────────────────────────

/// One compliance line item as reported by the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequirementResult {
    #[serde(default)]
    pub requirement: String,
    /// Missing `pass` counts as not passed.
    #[serde(rename = "pass", default)]
    pub passed: bool,
    #[serde(rename = "pass_status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RequirementResult {
    /// Passed, but tagged `PARTIAL`.
    pub fn is_partial(&self) -> bool {
        self.passed
            && self
                .status
                .as_deref()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case("PARTIAL"))
    }

    pub fn is_full_pass(&self) -> bool {
        self.passed && !self.is_partial()
    }
}

/// The model's self-reported summary. Missing counts default to zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportedSummary {
    #[serde(rename = "totalChecks", default)]
    pub total_checks: usize,
    #[serde(default)]
    pub passed: usize,
    #[serde(default)]
    pub partial: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
}

/// A Structured-protocol response body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredResponse {
    pub requirements: Vec<RequirementResult>,
    #[serde(default)]
    pub summary: ReportedSummary,
}

/// A Legacy-protocol response: the status word and the remaining text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyResponse {
    pub level: VerdictLevel,
    pub explanation: String,
}

/// The two response formats the reconciler understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseProtocol {
    Structured(StructuredResponse),
    Legacy(LegacyResponse),
}

impl ResponseProtocol {
    /// Parse `text` as the response to a prompt that asked for `expected`.
    ///
    /// A JSON object carrying `requirements` is always read as Structured.
    /// Once a JSON object was attempted (a fence or a `{` is present), an
    /// unbalanced or unparsable body is a hard failure and never falls
    /// through to the status-word search, nor does a `requirements` field of
    /// the wrong shape. Only a Legacy prompt accepts a bare status word.
    pub fn parse(text: &str, expected: PromptProtocol) -> Result<Self, PolicyCheckError> {
        let attempted = RE_JSON_FENCE.is_match(text) || text.contains('{');

        let json_problem = match extract_json_object(text) {
            Some(body) => {
                let value = serde_json::from_str::<serde_json::Value>(body).map_err(|e| {
                    PolicyCheckError::malformed(format!("embedded JSON does not parse: {}", e), text)
                })?;
                if value.get("requirements").is_some() {
                    let parsed: StructuredResponse = serde_json::from_value(value).map_err(|e| {
                        PolicyCheckError::malformed(format!("invalid requirements JSON: {}", e), text)
                    })?;
                    return Ok(ResponseProtocol::Structured(parsed));
                }
                "JSON object has no `requirements` field"
            }
            None if attempted => {
                return Err(PolicyCheckError::malformed(
                    "unbalanced braces in embedded JSON",
                    text,
                ));
            }
            None => "no JSON object",
        };

        if expected == PromptProtocol::Structured {
            return Err(PolicyCheckError::malformed(json_problem, text));
        }

        debug!("Structured parse not possible ({}); trying status word", json_problem);
        parse_legacy(text).map(ResponseProtocol::Legacy).ok_or_else(|| {
            PolicyCheckError::malformed(
                format!("{} and no GREEN/YELLOW/ORANGE/RED status word", json_problem),
                text,
            )
        })
    }
}

// ── JSON extraction ──────────────────────────────────────────────────────────

/// Locate the JSON object embedded in `text`.
///
/// A fenced block (optionally tagged `json`) whose body starts with `{` wins;
/// otherwise the first `{` in the text is used. Either way the object ends
/// where brace depth returns to zero, ignoring braces inside string literals.
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(m) = RE_JSON_FENCE.find(text) {
        let start = m.end() - 1;
        if let Some(body) = balanced_object(text, start) {
            return Some(body);
        }
    }
    let start = text.find('{')?;
    balanced_object(text, start)
}

/// The `{…}` starting at byte `start`, string- and escape-aware.
fn balanced_object(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Legacy protocol ──────────────────────────────────────────────────────────

/// Find the status word, checking GREEN, YELLOW, ORANGE, RED in that order
/// (case-insensitive, whole words). The first occurrence of the matched word
/// is removed and leading punctuation trimmed from what remains.
pub fn parse_legacy(text: &str) -> Option<LegacyResponse> {
    let matches: Vec<(VerdictLevel, regex::Match<'_>)> = RE_LEGACY_TOKEN
        .find_iter(text)
        .filter_map(|m| VerdictLevel::from_word(m.as_str()).map(|l| (l, m)))
        .collect();

    VerdictLevel::LEGACY_ORDER.into_iter().find_map(|level| {
        let (_, m) = matches.iter().find(|(l, _)| *l == level)?;
        let mut rest = String::with_capacity(text.len());
        rest.push_str(&text[..m.start()]);
        rest.push_str(&text[m.end()..]);
        let explanation = rest
            .trim()
            .trim_start_matches(LEGACY_LEADING_PUNCTUATION)
            .to_string();
        Some(LegacyResponse { level, explanation })
    })
}

// ── Reconciliation ───────────────────────────────────────────────────────────

/// Counts recomputed from the itemised requirements.
///
/// `passed + partial + failed == total` always holds. `consistent` records
/// whether the model's own summary agreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerdictSummary {
    pub total: usize,
    pub passed: usize,
    pub partial: usize,
    pub failed: usize,
    pub consistent: bool,
}

impl VerdictSummary {
    /// Count the array: full passes, partial passes, failures.
    pub fn from_requirements(requirements: &[RequirementResult]) -> Self {
        let passed = requirements.iter().filter(|r| r.is_full_pass()).count();
        let partial = requirements.iter().filter(|r| r.is_partial()).count();
        let failed = requirements.iter().filter(|r| !r.passed).count();
        Self {
            total: requirements.len(),
            passed,
            partial,
            failed,
            consistent: true,
        }
    }

    /// Level under the precedence rule. An empty array is RED.
    pub fn level(&self) -> VerdictLevel {
        if self.total == 0 || self.failed > 0 {
            VerdictLevel::Red
        } else if self.partial > 0 {
            VerdictLevel::Yellow
        } else {
            VerdictLevel::Green
        }
    }
}

/// Which protocol produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Structured,
    Legacy,
}

/// The reconciled result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub level: VerdictLevel,
    /// Raw explanatory text: the full response for Structured, the text
    /// around the status word for Legacy.
    pub explanation: String,
    pub protocol: ProtocolKind,
    /// Corrected counts; `None` for Legacy verdicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<VerdictSummary>,
    /// The model's one-line overall statement, when it gave one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementResult>,
    /// Informational notes about corrections made during reconciliation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Verdict {
    /// The Structured JSON body with the corrected summary in place of the
    /// model's figures. `None` for Legacy verdicts.
    pub fn corrected_json(&self) -> Option<serde_json::Value> {
        let summary = self.summary?;
        let body = StructuredResponse {
            requirements: self.requirements.clone(),
            summary: ReportedSummary {
                total_checks: summary.total,
                passed: summary.passed,
                partial: summary.partial,
                failed: summary.failed,
                statement: self.statement.clone(),
            },
        };
        serde_json::to_value(body).ok()
    }
}

/// Parse and reconcile a raw model response to a prompt that asked for
/// `expected`.
pub fn reconcile(response: &str, expected: PromptProtocol) -> Result<Verdict, PolicyCheckError> {
    match ResponseProtocol::parse(response, expected)? {
        ResponseProtocol::Structured(parsed) => Ok(reconcile_structured(parsed, response)),
        ResponseProtocol::Legacy(legacy) => Ok(Verdict {
            level: legacy.level,
            explanation: legacy.explanation,
            protocol: ProtocolKind::Legacy,
            summary: None,
            statement: None,
            requirements: Vec::new(),
            notes: Vec::new(),
        }),
    }
}

/// Recompute the summary from the requirements array and derive the level.
pub fn reconcile_structured(parsed: StructuredResponse, raw: &str) -> Verdict {
    let mut summary = VerdictSummary::from_requirements(&parsed.requirements);
    let reported = &parsed.summary;
    let mut notes = Vec::new();

    for (field, reported_value, actual) in [
        ("totalChecks", reported.total_checks, summary.total),
        ("passed", reported.passed, summary.passed),
        ("partial", reported.partial, summary.partial),
        ("failed", reported.failed, summary.failed),
    ] {
        if reported_value != actual {
            warn!(
                "Model summary mismatch: {} reported {} but requirements show {}",
                field, reported_value, actual
            );
            notes.push(format!(
                "summary.{} corrected from {} to {}",
                field, reported_value, actual
            ));
            summary.consistent = false;
        }
    }

    if summary.total == 0 {
        warn!("Model returned no itemised requirements; verdict is RED");
        notes.push("no requirements were itemised; treated as RED".to_string());
    }

    let level = summary.level();
    debug!(
        "Reconciled verdict {} ({} passed, {} partial, {} failed of {})",
        level, summary.passed, summary.partial, summary.failed, summary.total
    );

    Verdict {
        level,
        explanation: raw.trim().to_string(),
        protocol: ProtocolKind::Structured,
        summary: Some(summary),
        statement: parsed.summary.statement,
        requirements: parsed.requirements,
        notes,
    }
}
