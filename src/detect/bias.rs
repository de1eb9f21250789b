//! Bias detection.
//!
//! Two strategies: a lexicon/pattern matcher for known biased framings, and
//! a heuristic that flags absolute quantifiers bound to demographic terms.
//! Bias findings never mutate the text — mitigation is advisory or blocking.
//! Severity is `critical` for hate, `high` for explicit discrimination,
//! `medium` otherwise.

use std::sync::LazyLock;

use regex::Regex;

use super::{char_span, Detector, Finding, FindingKind, Severity};

/// Subtype strings emitted by this detector.
pub mod kinds {
    pub const GENDER: &str = "gender";
    pub const RACIAL: &str = "racial";
    pub const AGE: &str = "age";
    pub const RELIGIOUS: &str = "religious";
    pub const CULTURAL: &str = "cultural";
    pub const STEREOTYPING: &str = "stereotyping";
    pub const HATE: &str = "hate";
}

/// A lexicon entry: pattern, subtype, severity, confidence.
struct BiasPattern {
    regex: &'static LazyLock<Regex>,
    subtype: &'static str,
    severity: Severity,
    confidence: f64,
}

static RE_HATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:kill|exterminate|eliminate|gas|deport)\s+(?:all|every|the)\s+\w+|\b(?:go back to your country|subhuman|vermin)\b",
    )
    .unwrap()
});

static RE_GENDER_DISCRIMINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:women|men|girls|boys)\s+(?:can't|cannot|shouldn't|should not)\s+(?:be|do|work|drive|vote|lead)\b",
    )
    .unwrap()
});

static RE_GENDER_ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:a woman's place|real men don't|like a girl|man up|belongs? in the kitchen)\b",
    )
    .unwrap()
});

static RE_RACIAL_FRAMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:those people|you people|their kind|that race)\s+(?:are|always|never|can't)\b",
    )
    .unwrap()
});

static RE_AGE_FRAMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:boomers?|millennials?|old people|young people)\s+(?:are|can't|don't understand|ruined?)\b|\btoo old to\b",
    )
    .unwrap()
});

static RE_RELIGIOUS_FRAMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:muslims?|christians?|jews?|hindus?|buddhists?|atheists?)\s+(?:are all|are just|always|never)\b",
    )
    .unwrap()
});

static RE_CULTURAL_FRAMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:immigrants?|foreigners?|refugees?)\s+(?:are stealing|are taking|don't belong|should leave)\b",
    )
    .unwrap()
});

static BIAS_LEXICON: &[BiasPattern] = &[
    BiasPattern {
        regex: &RE_HATE,
        subtype: kinds::HATE,
        severity: Severity::Critical,
        confidence: 0.95,
    },
    BiasPattern {
        regex: &RE_GENDER_DISCRIMINATION,
        subtype: kinds::GENDER,
        severity: Severity::High,
        confidence: 0.9,
    },
    BiasPattern {
        regex: &RE_GENDER_ROLE,
        subtype: kinds::GENDER,
        severity: Severity::Medium,
        confidence: 0.85,
    },
    BiasPattern {
        regex: &RE_RACIAL_FRAMING,
        subtype: kinds::RACIAL,
        severity: Severity::High,
        confidence: 0.9,
    },
    BiasPattern {
        regex: &RE_AGE_FRAMING,
        subtype: kinds::AGE,
        severity: Severity::Medium,
        confidence: 0.8,
    },
    BiasPattern {
        regex: &RE_RELIGIOUS_FRAMING,
        subtype: kinds::RELIGIOUS,
        severity: Severity::High,
        confidence: 0.9,
    },
    BiasPattern {
        regex: &RE_CULTURAL_FRAMING,
        subtype: kinds::CULTURAL,
        severity: Severity::High,
        confidence: 0.9,
    },
];

/// Absolute quantifier bound to a demographic term, e.g. "all women are",
/// "only men should". Flags the stereotype shape regardless of the claim.
static RE_ABSOLUTE_QUANTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(all|every|no|only)\s+(women|men|girls|boys|immigrants?|foreigners?|refugees?|muslims?|christians?|jews?|hindus?|buddhists?|atheists?|asians?|africans?|europeans?|americans?|old people|young people|boomers?|millennials?)\s+(are|is|should|must|will|can)\b",
    )
    .unwrap()
});

/// Pattern-based bias detector.
pub struct BiasDetector;

impl BiasDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BiasDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for BiasDetector {
    fn id(&self) -> &'static str {
        "bias.patterns"
    }

    fn scan(&self, text: &str) -> Vec<Finding> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut findings = Vec::new();

        for entry in BIAS_LEXICON {
            for m in entry.regex.find_iter(text) {
                findings.push(Finding {
                    kind: FindingKind::Bias,
                    subtype: entry.subtype.to_string(),
                    span: char_span(text, m.start(), m.end()),
                    original_value: m.as_str().to_string(),
                    confidence: entry.confidence,
                    severity: entry.severity,
                    // Advisory only: bias mitigation never rewrites text.
                    suggested_replacement: String::new(),
                    detector_id: "bias.patterns".into(),
                });
            }
        }

        for m in RE_ABSOLUTE_QUANTIFIER.find_iter(text) {
            let span = char_span(text, m.start(), m.end());
            if findings.iter().any(|f| f.span.overlaps(&span)) {
                continue;
            }
            findings.push(Finding {
                kind: FindingKind::Bias,
                subtype: kinds::STEREOTYPING.to_string(),
                span,
                original_value: m.as_str().to_string(),
                confidence: 0.8,
                severity: Severity::Medium,
                suggested_replacement: String::new(),
                detector_id: "bias.patterns".into(),
            });
        }

        findings
    }
}
