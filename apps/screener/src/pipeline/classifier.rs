//! Response Classifier: decides whether a raw analysis response is usable.
//!
//! Pure function over the response text. The verdict distinguishes a usable
//! record, a parsed-but-weak record, an unusable (malformed or placeholder)
//! record, and an empty reply. Routing is the orchestrator's job.

use serde::Serialize;
use serde_json::{Map, Value};

/// Fields every accepted analysis must carry with real content.
pub const REQUIRED_FIELDS: &[&str] = &[
    "nickname",
    "summary",
    "differentiators",
    "reservations",
    "relevant_achievements",
    "wildcard",
];

/// Fallback strings that mean "the model produced nothing useful here".
const PLACEHOLDERS: &[&str] = &[
    "review pending",
    "manual review needed",
    "processing...",
    "anonymous pro",
    "error processing",
    "error processing resume",
    "error in processing",
    "processing error",
    "unique profile details pending analysis",
    "unable to analyze automatically",
    "n/a",
    "tbd",
    "...",
];

/// Phrases that could describe most applicants.
const GENERIC_PHRASES: &[&str] = &[
    "seasoned expert",
    "proven track record",
    "perfect fit",
    "strong background",
    "team player",
    "results-driven",
    "detail-oriented",
    "hard-working",
    "go-getter",
    "excellent communication skills",
];

const MAX_SCORE: f32 = 10.0;
const SHORT_PENALTY: f32 = 3.0;
const SLIGHTLY_SHORT_PENALTY: f32 = 1.0;
const GENERIC_PENALTY: f32 = 1.0;
const GENERIC_PENALTY_CAP: f32 = 4.0;
const EVIDENCE_PENALTY: f32 = 0.5;
const EVIDENCE_PENALTY_CAP: f32 = 2.0;
const COUNT_PENALTY: f32 = 1.0;
const EXPECTED_DIFFERENTIATORS: usize = 3;
const EXPECTED_ACHIEVEMENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// Parsed, complete, score at or above the threshold.
    Accepted,
    /// Parsed and complete but scored below the threshold.
    LowQuality,
    /// Upstream answered but the content is not a usable record.
    FormattingFailure,
    /// Upstream answered with nothing at all.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub quality_score: f32,
    pub issues: Vec<String>,
    /// The parsed record, when parsing succeeded.
    pub record: Option<Value>,
}

impl Verdict {
    #[cfg(test)]
    pub fn ok(&self) -> bool {
        self.kind == VerdictKind::Accepted
    }

    fn unusable(kind: VerdictKind, issue: impl Into<String>) -> Self {
        Self {
            kind,
            quality_score: 0.0,
            issues: vec![issue.into()],
            record: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    min_quality_score: f32,
}

impl ResponseClassifier {
    pub fn new(min_quality_score: f32) -> Self {
        Self {
            min_quality_score: min_quality_score.clamp(0.0, MAX_SCORE),
        }
    }

    pub fn min_quality_score(&self) -> f32 {
        self.min_quality_score
    }

    /// Classifies one raw response. `expected_length_hint` is the number of
    /// characters a complete analysis of this document is expected to span.
    pub fn classify(&self, raw_response: &str, expected_length_hint: usize) -> Verdict {
        let text = strip_json_fences(raw_response);
        if text.is_empty() {
            return Verdict::unusable(VerdictKind::Empty, "response was empty");
        }

        let parsed: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return Verdict::unusable(
                    VerdictKind::FormattingFailure,
                    format!("response is not valid JSON: {e}"),
                )
            }
        };

        // A one-element array is what the batch prompt returns for a single resume.
        let parsed = match parsed {
            Value::Array(items) if items.len() == 1 => {
                items.into_iter().next().unwrap_or(Value::Null)
            }
            other => other,
        };
        let record = match parsed {
            Value::Object(map) => map,
            other => {
                return Verdict::unusable(
                    VerdictKind::FormattingFailure,
                    format!("expected a JSON object, got {}", json_type(&other)),
                )
            }
        };

        let mut issues = Vec::new();
        for field in REQUIRED_FIELDS {
            match record.get(*field) {
                None => issues.push(format!("missing required field '{field}'")),
                Some(v) if !has_content(v) => {
                    issues.push(format!("field '{field}' holds placeholder content"))
                }
                Some(_) => {}
            }
        }
        if !issues.is_empty() {
            return Verdict {
                kind: VerdictKind::FormattingFailure,
                quality_score: 0.0,
                issues,
                record: Some(Value::Object(record)),
            };
        }

        let mut score = MAX_SCORE;
        score -= length_penalty(text.chars().count(), expected_length_hint, &mut issues);
        score -= generic_penalty(&record, &mut issues);
        score -= evidence_penalty(&record, &mut issues);
        score -= count_penalty(&record, "differentiators", EXPECTED_DIFFERENTIATORS, &mut issues);
        score -= count_penalty(
            &record,
            "relevant_achievements",
            EXPECTED_ACHIEVEMENTS,
            &mut issues,
        );
        let quality_score = (score.clamp(0.0, MAX_SCORE) * 10.0).round() / 10.0;

        let kind = if quality_score < self.min_quality_score {
            issues.push(format!(
                "quality score {quality_score} is below the minimum of {}",
                self.min_quality_score
            ));
            VerdictKind::LowQuality
        } else {
            VerdictKind::Accepted
        };

        Verdict {
            kind,
            quality_score,
            issues,
            record: Some(Value::Object(record)),
        }
    }
}

/// Expected analysis length for a document of `payload_len` characters.
pub fn expected_length_hint(payload_len: usize) -> usize {
    (payload_len / 4).clamp(400, 2500)
}

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let inner = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"));
    match inner {
        Some(stripped) => {
            let stripped = stripped.trim_start();
            stripped
                .strip_suffix("```")
                .map(str::trim)
                .unwrap_or(stripped)
        }
        None => text,
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn is_placeholder(s: &str) -> bool {
    let s = s.trim().to_lowercase();
    s.is_empty() || PLACEHOLDERS.iter().any(|p| s == *p)
}

/// Primary text of a claim-like entry: a bare string, or the first of the
/// well-known keys inside an object.
fn claim_text(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s),
        Value::Object(map) => ["claim", "achievement", "fact", "title"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str)),
        _ => None,
    }
}

fn has_content(v: &Value) -> bool {
    match v {
        Value::String(s) => !is_placeholder(s),
        Value::Array(items) => items
            .iter()
            .any(|i| claim_text(i).is_some_and(|t| !is_placeholder(t))),
        Value::Object(_) => claim_text(v).is_some_and(|t| !is_placeholder(t)),
        Value::Number(_) | Value::Bool(_) => true,
        Value::Null => false,
    }
}

fn length_penalty(len: usize, hint: usize, issues: &mut Vec<String>) -> f32 {
    if hint == 0 {
        return 0.0;
    }
    let ratio = len as f32 / hint as f32;
    if ratio < 0.5 {
        issues.push(format!(
            "response is short: {len} chars, expected about {hint}"
        ));
        SHORT_PENALTY
    } else if ratio < 0.8 {
        issues.push(format!(
            "response is somewhat short: {len} chars, expected about {hint}"
        ));
        SLIGHTLY_SHORT_PENALTY
    } else {
        0.0
    }
}

fn collect_strings<'a>(v: &'a Value, out: &mut Vec<&'a str>) {
    match v {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|i| collect_strings(i, out)),
        Value::Object(map) => map.values().for_each(|i| collect_strings(i, out)),
        _ => {}
    }
}

fn generic_penalty(record: &Map<String, Value>, issues: &mut Vec<String>) -> f32 {
    let mut strings = Vec::new();
    for v in record.values() {
        collect_strings(v, &mut strings);
    }
    let haystack = strings.join(" ").to_lowercase();

    let found: Vec<&str> = GENERIC_PHRASES
        .iter()
        .copied()
        .filter(|p| haystack.contains(p))
        .collect();
    for phrase in &found {
        issues.push(format!("generic phrase '{phrase}'"));
    }
    (found.len() as f32 * GENERIC_PENALTY).min(GENERIC_PENALTY_CAP)
}

fn lacks_evidence(v: &Value) -> bool {
    match v {
        Value::Object(map) => map
            .get("evidence")
            .and_then(Value::as_str)
            .map_or(true, |e| e.trim().is_empty()),
        _ => true,
    }
}

fn evidence_penalty(record: &Map<String, Value>, issues: &mut Vec<String>) -> f32 {
    let mut missing = 0usize;
    for field in ["differentiators", "relevant_achievements"] {
        if let Some(Value::Array(items)) = record.get(field) {
            missing += items.iter().filter(|i| lacks_evidence(i)).count();
        }
    }
    if record.get("wildcard").is_some_and(lacks_evidence) {
        missing += 1;
    }
    if missing == 0 {
        return 0.0;
    }
    issues.push(format!("{missing} claim(s) without an evidence quote"));
    (missing as f32 * EVIDENCE_PENALTY).min(EVIDENCE_PENALTY_CAP)
}

fn count_penalty(
    record: &Map<String, Value>,
    field: &str,
    expected: usize,
    issues: &mut Vec<String>,
) -> f32 {
    let got = record
        .get(field)
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if got < expected {
        issues.push(format!("expected {expected} {field}, got {got}"));
        COUNT_PENALTY
    } else {
        0.0
    }
}
