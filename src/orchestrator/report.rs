//! Per-request risk report assembly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{Mitigation, RiskAssessment, RiskLevel};
use crate::config::ProcessingMode;
use crate::detect::Finding;

/// Terminal classification of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportAction {
    Allowed,
    Sanitized,
    Blocked,
    Escalated,
}

impl std::fmt::Display for ReportAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportAction::Allowed => write!(f, "allowed"),
            ReportAction::Sanitized => write!(f, "sanitized"),
            ReportAction::Blocked => write!(f, "blocked"),
            ReportAction::Escalated => write!(f, "escalated"),
        }
    }
}

/// One tool-call loop iteration, as recorded for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTraceEntry {
    pub iteration: u32,
    pub source: String,
    pub plan_summary: String,
    pub elapsed_ms: u64,
    pub rows: usize,
    pub result_level: Option<RiskLevel>,
    pub failure: Option<String>,
}

/// The structured risk report emitted for every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: ProcessingMode,
    pub model: String,
    pub action: ReportAction,
    /// Maximum over every assessment taken during the request.
    pub overall_score: f64,
    pub input_assessment: Option<RiskAssessment>,
    pub output_assessment: Option<RiskAssessment>,
    pub tool_trace: Vec<ToolTraceEntry>,
    pub iterations: u32,
    /// Escalation findings outside any single assessment
    /// (`tool_budget_exhausted`, `deadline_exceeded`, `llm_failure`).
    pub escalations: Vec<Finding>,
    pub hallucination_score: Option<f64>,
    pub factual_accuracy: Option<f64>,
}

impl RiskReport {
    /// Derive the action from the recorded assessments and escalations.
    pub fn derive_action(
        input: Option<&RiskAssessment>,
        output: Option<&RiskAssessment>,
        escalations: &[Finding],
    ) -> ReportAction {
        let assessments = [input, output];
        if assessments
            .iter()
            .flatten()
            .any(|a| a.mitigations_applied.contains(&Mitigation::Block))
        {
            return ReportAction::Blocked;
        }
        if !escalations.is_empty()
            || assessments
                .iter()
                .flatten()
                .any(|a| a.mitigations_applied.contains(&Mitigation::Escalate))
        {
            return ReportAction::Escalated;
        }
        if assessments.iter().flatten().any(|a| a.was_sanitized()) {
            return ReportAction::Sanitized;
        }
        ReportAction::Allowed
    }

    /// Maximum score over the input, output, and data assessments.
    pub fn max_score(
        input: Option<&RiskAssessment>,
        output: Option<&RiskAssessment>,
        data_levels: impl Iterator<Item = f64>,
    ) -> f64 {
        let mut max: f64 = 0.0;
        if let Some(a) = input {
            max = max.max(a.overall_score);
        }
        if let Some(a) = output {
            max = max.max(a.overall_score);
        }
        for score in data_levels {
            max = max.max(score);
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Mitigation;

    fn assessment(mitigations: Vec<Mitigation>, score: f64) -> RiskAssessment {
        RiskAssessment {
            findings: Vec::new(),
            overall_score: score,
            level: RiskLevel::from_score(score),
            sanitized_text: String::new(),
            mitigations_applied: mitigations,
            fingerprint: String::new(),
            hallucination: None,
        }
    }

    #[test]
    fn test_block_wins_over_everything() {
        let input = assessment(vec![Mitigation::Block], 9.0);
        let output = assessment(vec![Mitigation::Sanitize], 3.0);
        assert_eq!(
            RiskReport::derive_action(Some(&input), Some(&output), &[]),
            ReportAction::Blocked
        );
    }

    #[test]
    fn test_escalation_findings_mark_escalated() {
        let input = assessment(vec![Mitigation::Allow], 0.0);
        let escalations = vec![crate::detect::Finding {
            kind: crate::detect::FindingKind::Operational,
            subtype: "tool_budget_exhausted".into(),
            span: crate::detect::Span::new(0, 0),
            original_value: String::new(),
            confidence: 1.0,
            severity: crate::detect::Severity::Low,
            suggested_replacement: String::new(),
            detector_id: "orchestrator".into(),
        }];
        assert_eq!(
            RiskReport::derive_action(Some(&input), None, &escalations),
            ReportAction::Escalated
        );
    }

    #[test]
    fn test_sanitized_and_allowed() {
        let sanitized = assessment(vec![Mitigation::Sanitize], 6.0);
        assert_eq!(
            RiskReport::derive_action(Some(&sanitized), None, &[]),
            ReportAction::Sanitized
        );
        let clean = assessment(vec![Mitigation::Allow], 0.0);
        assert_eq!(
            RiskReport::derive_action(Some(&clean), None, &[]),
            ReportAction::Allowed
        );
    }

    #[test]
    fn test_max_score() {
        let input = assessment(vec![Mitigation::Allow], 2.0);
        let output = assessment(vec![Mitigation::Allow], 6.5);
        let max = RiskReport::max_score(Some(&input), Some(&output), [4.0].into_iter());
        assert!((max - 6.5).abs() < f64::EPSILON);
    }
}
