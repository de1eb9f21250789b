//! Adversarial input detection.
//!
//! Pattern-based detection of prompt injection, jailbreak attempts, role
//! reassignment, system-prompt extraction probes, and unsafe instructional
//! intent. Any `critical` match forces a block decision at the risk agent
//! layer regardless of the aggregate score.

use std::sync::LazyLock;

use regex::Regex;

use super::{char_span, Detector, Finding, FindingKind, Severity};

/// Subtype strings emitted by this detector.
pub mod kinds {
    pub const PROMPT_INJECTION: &str = "prompt_injection";
    pub const JAILBREAK: &str = "jailbreak";
    pub const ROLE_PLAY_OVERRIDE: &str = "role_play_override";
    pub const SYSTEM_PROMPT_LEAK: &str = "system_prompt_leak";
    pub const UNSAFE_INSTRUCTION: &str = "unsafe_instruction";
}

struct AdversarialPattern {
    regex: &'static LazyLock<Regex>,
    subtype: &'static str,
    severity: Severity,
    confidence: f64,
}

/// Directive phrases that countermand prior instructions.
static RE_INJECTION_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:ignore|forget|disregard|skip|bypass|override)\s+(?:all\s+|the\s+)?(?:previous|prior|above|earlier|your|system)\s+(?:instructions?|rules?|guidelines?|prompts?|messages?)\b",
    )
    .unwrap()
});

static RE_INJECTION_RESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:new\s+instructions?\s*:|ignore\s+everything|forget\s+everything|start\s+over\s+with|from\s+now\s+on\s+you\s+(?:are|will))\b",
    )
    .unwrap()
});

/// Jailbreak framings that ask the model to shed its safety layer.
static RE_JAILBREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:ignore\s+(?:your\s+)?safety|bypass\s+(?:your\s+)?(?:restrictions?|filters?|safeguards?)|without\s+(?:any\s+)?(?:restrictions?|limitations?|filters?)|do\s+anything\s+now|developer\s+mode|no\s+ethical\s+guidelines)\b",
    )
    .unwrap()
});

/// Role reassignment attempts.
static RE_ROLE_OVERRIDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:you\s+are\s+now\s+(?:a|an|the)|pretend\s+(?:to\s+be|you\s+are)|act\s+as\s+(?:if\s+you\s+are\s+)?(?:a|an)|roleplay\s+as|imagine\s+you\s+are\s+(?:a|an))\b",
    )
    .unwrap()
});

/// System-prompt extraction probes.
static RE_PROMPT_LEAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:print|show|reveal|repeat|output|display)\s+(?:me\s+)?(?:your|the)\s+(?:system\s+prompt|initial\s+prompt|instructions?|hidden\s+rules?)|what\s+(?:are|is)\s+your\s+(?:instructions?|system\s+(?:prompt|message)|initial\s+prompt))\b",
    )
    .unwrap()
});

/// Unsafe instructional intent.
static RE_UNSAFE_INSTRUCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bhow\s+to\s+(?:hack|break\s+into|steal|make\s+(?:a\s+)?(?:bombs?|explosives?|weapons?)|poison|forge)\b",
    )
    .unwrap()
});

static ADVERSARIAL_PATTERNS: &[AdversarialPattern] = &[
    AdversarialPattern {
        regex: &RE_INJECTION_DIRECTIVE,
        subtype: kinds::PROMPT_INJECTION,
        severity: Severity::Critical,
        confidence: 0.95,
    },
    AdversarialPattern {
        regex: &RE_INJECTION_RESET,
        subtype: kinds::PROMPT_INJECTION,
        severity: Severity::Critical,
        confidence: 0.9,
    },
    AdversarialPattern {
        regex: &RE_JAILBREAK,
        subtype: kinds::JAILBREAK,
        severity: Severity::Critical,
        confidence: 0.9,
    },
    AdversarialPattern {
        regex: &RE_ROLE_OVERRIDE,
        subtype: kinds::ROLE_PLAY_OVERRIDE,
        severity: Severity::High,
        confidence: 0.85,
    },
    AdversarialPattern {
        regex: &RE_PROMPT_LEAK,
        subtype: kinds::SYSTEM_PROMPT_LEAK,
        severity: Severity::High,
        confidence: 0.9,
    },
    AdversarialPattern {
        regex: &RE_UNSAFE_INSTRUCTION,
        subtype: kinds::UNSAFE_INSTRUCTION,
        severity: Severity::High,
        confidence: 0.85,
    },
];

/// Pattern-based adversarial detector.
pub struct AdversarialDetector;

impl AdversarialDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AdversarialDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for AdversarialDetector {
    fn id(&self) -> &'static str {
        "adversarial.patterns"
    }

    fn scan(&self, text: &str) -> Vec<Finding> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut findings = Vec::new();
        for entry in ADVERSARIAL_PATTERNS {
            for m in entry.regex.find_iter(text) {
                findings.push(Finding {
                    kind: FindingKind::Adversarial,
                    subtype: entry.subtype.to_string(),
                    span: char_span(text, m.start(), m.end()),
                    original_value: m.as_str().to_string(),
                    confidence: entry.confidence,
                    severity: entry.severity,
                    // Blocking or advisory, never a replacement.
                    suggested_replacement: String::new(),
                    detector_id: "adversarial.patterns".into(),
                });
            }
        }
        findings
    }
}
