//! Hallucination detection for model outputs.
//!
//! Runs only over model outputs, and only when a grounding context (the
//! records retrieved during the tool-call loop) is supplied. Claims are
//! extracted from the output as (category, value) tuples — identifiers,
//! status words, dates, quantities — and each is verified against the
//! grounding values of the same category: supported when a value matches,
//! contradicted when the grounding speaks to the category with a different
//! value, unverifiable otherwise.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{char_span, Finding, FindingKind, Severity, Span};

/// Subtype strings emitted by this detector.
pub mod kinds {
    pub const CONTRADICTED: &str = "contradicted_claim";
    pub const UNVERIFIABLE: &str = "unverifiable_claim";
}

/// The trusted context assembled during the tool-call loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grounding {
    pub records: Vec<BTreeMap<String, String>>,
}

impl Grounding {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut record = BTreeMap::new();
        for (k, v) in pairs {
            record.insert((*k).to_string(), (*v).to_string());
        }
        Self {
            records: vec![record],
        }
    }

    /// Build grounding from a columnar row set.
    pub fn from_rows(columns: &[String], rows: &[Vec<String>]) -> Self {
        let records = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<BTreeMap<String, String>>()
            })
            .collect();
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|r| r.is_empty())
    }

    /// Merge another grounding's records into this one.
    pub fn extend(&mut self, other: &Grounding) {
        self.records.extend(other.records.iter().cloned());
    }

    fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.records
            .iter()
            .flat_map(|r| r.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Category of an extracted claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimCategory {
    Identifier,
    Status,
    Date,
    Quantity,
}

/// Verification status of a claim against the grounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    Supported,
    Contradicted,
    Unverifiable,
}

/// A claim extracted from the model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub category: ClaimCategory,
    pub value: String,
    pub span: Span,
}

/// A claim plus its verification outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedClaim {
    pub claim: Claim,
    pub status: Verification,
    /// Whether the grounding speaks to this claim's category at all.
    pub grounded: bool,
}

/// Full assessment of a model output against its grounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationAssessment {
    pub claims: Vec<VerifiedClaim>,
    pub findings: Vec<Finding>,
    pub supported: usize,
    pub contradicted: usize,
    pub unverifiable: usize,
    /// supported / total claims; 1.0 when there are no claims.
    pub factual_accuracy: f64,
    /// 0–10; rises with contradicted mass and with unverifiable claims
    /// whose category the grounding covers.
    pub score: f64,
}

impl HallucinationAssessment {
    fn empty() -> Self {
        Self {
            claims: Vec::new(),
            findings: Vec::new(),
            supported: 0,
            contradicted: 0,
            unverifiable: 0,
            factual_accuracy: 1.0,
            score: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Claim extraction patterns
// ---------------------------------------------------------------------------

static RE_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{2,}-?\d+\b|\b\d{6,}\b").unwrap());

static RE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}/\d{1,2}/\d{2,4}\b|\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{1,2},?\s+\d{4}\b|\b(?:yesterday|today|tomorrow)\b",
    )
    .unwrap()
});

static RE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:delivered|in[\s_]transit|out\s+for\s+delivery|pending|processing|shipped|cancelled|canceled|returned)\b",
    )
    .unwrap()
});

static RE_QUANTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());

/// Canonical status groups for synonym-aware comparison.
const STATUS_GROUPS: &[(&str, &[&str])] = &[
    ("in_transit", &["in transit", "in_transit", "shipping", "shipped", "on the way", "en route"]),
    ("delivered", &["delivered", "arrived", "completed", "received"]),
    ("pending", &["pending", "processing", "preparing", "waiting"]),
    ("cancelled", &["cancelled", "canceled"]),
    ("returned", &["returned"]),
    ("out_for_delivery", &["out for delivery"]),
];

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Alphanumeric-only form, for identifier comparison (`ORD-1` == `ord1`).
fn compact(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn is_relative_date(value: &str) -> bool {
    matches!(normalize(value).as_str(), "yesterday" | "today" | "tomorrow")
}

fn status_group(value: &str) -> Option<&'static str> {
    let norm = normalize(value);
    STATUS_GROUPS
        .iter()
        .find(|(_, members)| members.iter().any(|m| *m == norm))
        .map(|(canonical, _)| *canonical)
}

/// Categorize a grounding value by its shape and key name.
fn categorize_value(key: &str, value: &str) -> Option<ClaimCategory> {
    let key_lower = key.to_ascii_lowercase();
    if status_group(value).is_some() || key_lower.contains("status") {
        return Some(ClaimCategory::Status);
    }
    if RE_DATE.is_match(value)
        || key_lower.contains("date")
        || key_lower.contains("eta")
        || key_lower.contains("delivery")
    {
        return Some(ClaimCategory::Date);
    }
    if RE_IDENTIFIER.is_match(value) || key_lower.ends_with("id") || key_lower.contains("number") {
        return Some(ClaimCategory::Identifier);
    }
    if RE_QUANTITY.is_match(value) {
        return Some(ClaimCategory::Quantity);
    }
    None
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Grounding-based hallucination detector.
pub struct HallucinationDetector;

impl HallucinationDetector {
    pub fn new() -> Self {
        Self
    }

    /// Assess a model output against the grounding records.
    pub fn assess(&self, output: &str, grounding: &Grounding) -> HallucinationAssessment {
        if output.is_empty() || grounding.is_empty() {
            return HallucinationAssessment::empty();
        }

        let claims = extract_claims(output);
        if claims.is_empty() {
            return HallucinationAssessment::empty();
        }

        // Grounding values bucketed by category.
        let mut by_category: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for (key, value) in grounding.values() {
            if let Some(category) = categorize_value(key, value) {
                let bucket = match category {
                    ClaimCategory::Identifier => "identifier",
                    ClaimCategory::Status => "status",
                    ClaimCategory::Date => "date",
                    ClaimCategory::Quantity => "quantity",
                };
                by_category
                    .entry(bucket)
                    .or_default()
                    .push(value.to_string());
            }
        }

        let mut verified = Vec::with_capacity(claims.len());
        let mut findings = Vec::new();
        let (mut supported, mut contradicted, mut unverifiable) = (0usize, 0usize, 0usize);
        let mut unverifiable_grounded = 0usize;

        for claim in claims {
            let bucket = match claim.category {
                ClaimCategory::Identifier => "identifier",
                ClaimCategory::Status => "status",
                ClaimCategory::Date => "date",
                ClaimCategory::Quantity => "quantity",
            };
            let candidates = by_category.get(bucket);

            let (status, grounded) = match candidates {
                Some(values) if !values.is_empty() => {
                    if claim.category == ClaimCategory::Date && is_relative_date(&claim.value) {
                        // "yesterday"/"tomorrow" cannot be compared with an
                        // absolute grounding date without a clock reference.
                        (Verification::Unverifiable, true)
                    } else if values.iter().any(|v| claim_matches(&claim, v)) {
                        (Verification::Supported, true)
                    } else {
                        (Verification::Contradicted, true)
                    }
                }
                _ => (Verification::Unverifiable, false),
            };

            match status {
                Verification::Supported => supported += 1,
                Verification::Contradicted => {
                    contradicted += 1;
                    findings.push(Finding {
                        kind: FindingKind::Hallucination,
                        subtype: kinds::CONTRADICTED.to_string(),
                        span: claim.span,
                        original_value: claim.value.clone(),
                        confidence: 0.9,
                        severity: Severity::High,
                        suggested_replacement: String::new(),
                        detector_id: "hallucination.grounding".into(),
                    });
                }
                Verification::Unverifiable => {
                    unverifiable += 1;
                    if grounded {
                        unverifiable_grounded += 1;
                    }
                    findings.push(Finding {
                        kind: FindingKind::Hallucination,
                        subtype: kinds::UNVERIFIABLE.to_string(),
                        span: claim.span,
                        original_value: claim.value.clone(),
                        confidence: 0.6,
                        severity: if grounded {
                            Severity::Medium
                        } else {
                            Severity::Low
                        },
                        suggested_replacement: String::new(),
                        detector_id: "hallucination.grounding".into(),
                    });
                }
            }

            verified.push(VerifiedClaim {
                claim,
                status,
                grounded,
            });
        }

        let total = verified.len() as f64;
        let factual_accuracy = supported as f64 / total;
        let base = if contradicted > 0 { 3.0 } else { 0.0 };
        let score = (base
            + 7.0 * contradicted as f64 / total
            + 3.0 * unverifiable_grounded as f64 / total)
            .min(10.0);
        let score = (score * 100.0).round() / 100.0;

        HallucinationAssessment {
            claims: verified,
            findings,
            supported,
            contradicted,
            unverifiable,
            factual_accuracy: (factual_accuracy * 100.0).round() / 100.0,
            score,
        }
    }
}

impl Default for HallucinationDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity bucket for an overall hallucination score.
pub fn score_severity(score: f64) -> Severity {
    if score >= 8.0 {
        Severity::Critical
    } else if score >= 6.0 {
        Severity::High
    } else if score >= 4.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn claim_matches(claim: &Claim, candidate: &str) -> bool {
    match claim.category {
        ClaimCategory::Status => match (status_group(&claim.value), status_group(candidate)) {
            (Some(a), Some(b)) => a == b,
            _ => normalize(&claim.value) == normalize(candidate),
        },
        ClaimCategory::Identifier => {
            let claim_compact = compact(&claim.value);
            let cand_compact = compact(candidate);
            claim_compact == cand_compact
                || cand_compact.contains(&claim_compact)
                || claim_compact.contains(&cand_compact)
        }
        ClaimCategory::Date | ClaimCategory::Quantity => {
            normalize(&claim.value) == normalize(candidate)
        }
    }
}

fn extract_claims(text: &str) -> Vec<Claim> {
    let mut byte_ranges: Vec<(usize, usize)> = Vec::new();
    let mut claims = Vec::new();

    let mut push = |start: usize, end: usize, category: ClaimCategory, value: &str| {
        if byte_ranges.iter().any(|(s, e)| start < *e && *s < end) {
            return;
        }
        byte_ranges.push((start, end));
        claims.push(Claim {
            category,
            value: value.to_string(),
            span: char_span(text, start, end),
        });
    };

    for m in RE_IDENTIFIER.find_iter(text) {
        push(m.start(), m.end(), ClaimCategory::Identifier, m.as_str());
    }
    for m in RE_DATE.find_iter(text) {
        push(m.start(), m.end(), ClaimCategory::Date, m.as_str());
    }
    for m in RE_STATUS.find_iter(text) {
        push(m.start(), m.end(), ClaimCategory::Status, m.as_str());
    }
    // Bare quantities last; digits inside identifiers and dates are already
    // claimed by the overlap check.
    for m in RE_QUANTITY.find_iter(text) {
        push(m.start(), m.end(), ClaimCategory::Quantity, m.as_str());
    }

    claims.sort_by_key(|c| c.span.start);
    claims
}
