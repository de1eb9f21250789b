//! Risk detectors and their shared types.
//!
//! Each detector is a stateless scanner `text → [Finding]`. The registry is
//! built once at process init and read immutably afterwards; enablement is
//! data, not code. The hallucination detector has a different signature
//! (it needs the grounding assembled during the tool-call loop) and lives in
//! [`hallucination`], dispatched directly by the risk agent on output scans.

pub mod adversarial;
pub mod bias;
pub mod hallucination;
pub mod pii;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Severity of a single finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Detector family a finding belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FindingKind {
    Pii,
    Bias,
    Adversarial,
    Hallucination,
    /// Pipeline degradation markers (detector timeouts, budget exhaustion).
    Operational,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingKind::Pii => write!(f, "pii"),
            FindingKind::Bias => write!(f, "bias"),
            FindingKind::Adversarial => write!(f, "adversarial"),
            FindingKind::Hallucination => write!(f, "hallucination"),
            FindingKind::Operational => write!(f, "operational"),
        }
    }
}

/// Half-open span of code-point offsets into the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns `true` if the two spans share at least one code point.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Smallest span covering both.
    pub fn union(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Convert a byte range (as produced by regex matches) into a code-point
/// span. Offsets beyond the text clamp to the end.
pub fn char_span(text: &str, byte_start: usize, byte_end: usize) -> Span {
    let mut start = 0usize;
    let mut end = 0usize;
    for (chars, (byte_idx, _)) in text.char_indices().enumerate() {
        if byte_idx < byte_start {
            start = chars + 1;
        }
        if byte_idx < byte_end {
            end = chars + 1;
        }
    }
    Span::new(start, end)
}

/// Slice a text by code-point span.
pub fn slice_span(text: &str, span: &Span) -> String {
    text.chars()
        .skip(span.start)
        .take(span.len())
        .collect()
}

/// A single detector observation. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub subtype: String,
    pub span: Span,
    /// The matched text. Never serialized outward without authentication;
    /// the api layer strips it for unauthenticated callers.
    pub original_value: String,
    pub confidence: f64,
    pub severity: Severity,
    pub suggested_replacement: String,
    pub detector_id: std::borrow::Cow<'static, str>,
}

impl Finding {
    /// Dedup key: two findings with the same key describe the same thing.
    pub fn key(&self) -> (FindingKind, &str, Span) {
        (self.kind, self.subtype.as_str(), self.span)
    }

    /// Stable identity string used for fingerprinting.
    pub fn fingerprint_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.kind, self.subtype, self.span.start, self.span.end, self.severity
        )
    }
}

/// A stateless scanner over untrusted text.
pub trait Detector: Send + Sync {
    /// Stable identifier, also recorded on every finding.
    fn id(&self) -> &'static str;

    /// Scan the text and return findings. Must not mutate any shared state.
    fn scan(&self, text: &str) -> Vec<Finding>;
}

/// Immutable detector set built at process init.
#[derive(Clone)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorRegistry {
    /// The standard text-phase detector set: PII, bias, adversarial.
    pub fn standard() -> Self {
        Self {
            detectors: vec![
                Arc::new(pii::PiiDetector::new()),
                Arc::new(bias::BiasDetector::new()),
                Arc::new(adversarial::AdversarialDetector::new()),
            ],
        }
    }

    /// Registry restricted to the named detectors.
    pub fn with_enabled(enabled: &[&str]) -> Self {
        let standard = Self::standard();
        Self {
            detectors: standard
                .detectors
                .into_iter()
                .filter(|d| enabled.contains(&d.id()))
                .collect(),
        }
    }

    pub fn detectors(&self) -> &[Arc<dyn Detector>] {
        &self.detectors
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
