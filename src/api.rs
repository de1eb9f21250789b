//! External interface types.
//!
//! The serde request/response shapes the surrounding HTTP layer exchanges
//! with the core: chat completion with risk metadata, direct risk analysis,
//! and data-source administration. The HTTP layer itself (routing, auth,
//! status line) is out of scope; the mapping to status codes is data on the
//! response types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{Mitigation, RiskAssessment, RiskLevel};
use crate::config::ProcessingMode;
use crate::connector::SourceStatus;
use crate::detect::{Severity, Span};
use crate::orchestrator::{ChatOutcome, ChatRequest, OutcomeStatus};
use crate::provider::{ChatMessage, ChatRole};

// ---------------------------------------------------------------------------
// Chat completion
// ---------------------------------------------------------------------------

/// A single message in the external chat shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

/// Chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    #[serde(default = "default_true")]
    pub enable_risk_detection: bool,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    #[serde(default)]
    pub max_risk_score: Option<f64>,
    #[serde(default = "default_true")]
    pub sanitize_input: bool,
    #[serde(default = "default_true")]
    pub sanitize_output: bool,
    #[serde(default)]
    pub enable_data_access: bool,
    #[serde(default)]
    pub data_source_name: Option<String>,
    /// Optional natural-language hint used when the model's tool call does
    /// not carry its own question.
    #[serde(default)]
    pub data_query: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChatCompletionRequest {
    /// Lower into the orchestrator's request shape.
    pub fn into_chat_request(self) -> ChatRequest {
        let messages = self
            .messages
            .into_iter()
            .map(|m| ChatMessage {
                role: match m.role.as_str() {
                    "system" => ChatRole::System,
                    "assistant" => ChatRole::Assistant,
                    "tool" => ChatRole::Tool,
                    _ => ChatRole::User,
                },
                content: m.content,
            })
            .collect();

        ChatRequest {
            model: self.model,
            messages,
            mode: self.processing_mode,
            enable_risk_detection: self.enable_risk_detection,
            max_risk_score: self.max_risk_score,
            sanitize_input: self.sanitize_input,
            sanitize_output: self.sanitize_output,
            enable_data_access: self.enable_data_access,
            data_source_name: self.data_source_name,
            data_query_hint: self.data_query,
            budget: None,
            max_iterations: None,
        }
    }
}

/// Hallucination portion of the risk metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationMetadata {
    pub score: f64,
    pub factual_accuracy: f64,
}

/// Risk metadata attached to every chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetadata {
    pub overall_risk_score: f64,
    pub risk_level: RiskLevel,
    pub mitigation_applied: Vec<Mitigation>,
    /// Finding subtype → count over every assessment in the request.
    pub findings_summary: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hallucination: Option<HallucinationMetadata>,
}

/// Chat completion response: the standard shape plus `risk_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ApiChoice>,
    pub risk_metadata: RiskMetadata,
    /// HTTP status the surrounding layer should use.
    #[serde(skip)]
    pub http_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiChoice {
    pub index: u32,
    pub message: ApiMessage,
    pub finish_reason: String,
}

/// Build the external response from an orchestrator outcome.
pub fn chat_response(model: &str, outcome: &ChatOutcome) -> ChatCompletionResponse {
    let report = &outcome.report;

    let mut mitigation_applied: Vec<Mitigation> = Vec::new();
    let mut findings_summary: BTreeMap<String, usize> = BTreeMap::new();
    for assessment in [&report.input_assessment, &report.output_assessment]
        .into_iter()
        .flatten()
    {
        for mitigation in &assessment.mitigations_applied {
            if !mitigation_applied.contains(mitigation) {
                mitigation_applied.push(*mitigation);
            }
        }
        for finding in &assessment.findings {
            *findings_summary.entry(finding.subtype.clone()).or_insert(0) += 1;
        }
    }
    for escalation in &report.escalations {
        *findings_summary
            .entry(escalation.subtype.clone())
            .or_insert(0) += 1;
    }

    let hallucination = report.hallucination_score.map(|score| HallucinationMetadata {
        score,
        factual_accuracy: report.factual_accuracy.unwrap_or(1.0),
    });

    let http_status = match outcome.status {
        OutcomeStatus::Completed => 200,
        OutcomeStatus::BlockedInput => 400,
        OutcomeStatus::BlockedOutput => 422,
        OutcomeStatus::Failed => 500,
    };

    ChatCompletionResponse {
        id: outcome.request_id.clone(),
        model: model.to_string(),
        choices: vec![ApiChoice {
            index: 0,
            message: ApiMessage {
                role: "assistant".to_string(),
                content: outcome.final_answer.clone(),
            },
            finish_reason: "stop".to_string(),
        }],
        risk_metadata: RiskMetadata {
            overall_risk_score: report.overall_score,
            risk_level: RiskLevel::from_score(report.overall_score),
            mitigation_applied,
            findings_summary,
            hallucination,
        },
        http_status,
    }
}

// ---------------------------------------------------------------------------
// Direct risk analysis
// ---------------------------------------------------------------------------

/// Direct risk analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAnalysisRequest {
    pub text: String,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    #[serde(default = "default_true")]
    pub include_sanitized: bool,
    #[serde(default = "default_true")]
    pub include_detections: bool,
}

/// A finding as exposed externally. Original values are only present for
/// callers authenticated for that scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFinding {
    pub kind: String,
    pub subtype: String,
    pub span: Span,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_value: Option<String>,
}

/// Direct risk analysis response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAnalysisResponse {
    pub overall_score: f64,
    pub level: RiskLevel,
    pub mitigations_applied: Vec<Mitigation>,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<ApiFinding>>,
}

/// Serialize an assessment for the analysis endpoint.
///
/// `authorized_for_originals` gates raw matched values; unauthenticated
/// callers only see spans.
pub fn analysis_response(
    assessment: &RiskAssessment,
    request: &RiskAnalysisRequest,
    authorized_for_originals: bool,
) -> RiskAnalysisResponse {
    let findings = request.include_detections.then(|| {
        assessment
            .findings
            .iter()
            .map(|f| ApiFinding {
                kind: f.kind.to_string(),
                subtype: f.subtype.clone(),
                span: f.span,
                severity: f.severity,
                confidence: f.confidence,
                original_value: authorized_for_originals.then(|| f.original_value.clone()),
            })
            .collect()
    });

    RiskAnalysisResponse {
        overall_score: assessment.overall_score,
        level: assessment.level,
        mitigations_applied: assessment.mitigations_applied.clone(),
        fingerprint: assessment.fingerprint.clone(),
        sanitized_text: request
            .include_sanitized
            .then(|| assessment.sanitized_text.clone()),
        findings,
    }
}

// ---------------------------------------------------------------------------
// Data-source administration
// ---------------------------------------------------------------------------

/// Upsert request: the full config record, credentials by handle only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertDataSourceRequest {
    pub config: crate::connector::DataSourceConfig,
    pub schema: crate::query::SchemaCatalog,
}

/// List response: summaries only, never credential material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDataSourcesResponse {
    pub sources: Vec<SourceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: ChatCompletionRequest = serde_json::from_str(
            r#"{"model": "gw-large", "messages": [{"role": "user", "content": "hello"}]}"#,
        )
        .unwrap();
        assert!(request.enable_risk_detection);
        assert!(request.sanitize_input);
        assert!(!request.enable_data_access);
        assert_eq!(request.processing_mode, ProcessingMode::Balanced);
    }

    #[test]
    fn test_into_chat_request_maps_roles() {
        let request: ChatCompletionRequest = serde_json::from_str(
            r#"{"model": "m", "messages": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": "u"}
            ]}"#,
        )
        .unwrap();
        let chat = request.into_chat_request();
        assert_eq!(chat.messages[0].role, ChatRole::System);
        assert_eq!(chat.messages[1].role, ChatRole::User);
    }

    #[test]
    fn test_analysis_response_hides_originals_by_default() {
        let assessment = RiskAssessment {
            findings: vec![crate::detect::Finding {
                kind: crate::detect::FindingKind::Pii,
                subtype: "email".into(),
                span: Span::new(0, 7),
                original_value: "a@x.com".into(),
                confidence: 0.9,
                severity: Severity::High,
                suggested_replacement: "‹EMAIL_1›".into(),
                detector_id: "pii.rules".into(),
            }],
            overall_score: 6.0,
            level: RiskLevel::High,
            sanitized_text: "‹EMAIL_1›".into(),
            mitigations_applied: vec![Mitigation::Sanitize],
            fingerprint: "fp".into(),
            hallucination: None,
        };
        let request = RiskAnalysisRequest {
            text: "a@x.com".into(),
            processing_mode: ProcessingMode::Balanced,
            include_sanitized: true,
            include_detections: true,
        };

        let unauthorized = analysis_response(&assessment, &request, false);
        let serialized = serde_json::to_string(&unauthorized).unwrap();
        assert!(!serialized.contains("a@x.com"));

        let authorized = analysis_response(&assessment, &request, true);
        let findings = authorized.findings.unwrap();
        assert_eq!(findings[0].original_value.as_deref(), Some("a@x.com"));
    }

    #[test]
    fn test_upsert_request_parses_with_defaults() {
        let request: UpsertDataSourceRequest = serde_json::from_str(
            r#"{
                "config": {
                    "name": "orders",
                    "kind": "supabase",
                    "endpoint": "https://db.example",
                    "credentials_ref": "orders-ro",
                    "allow_tables": ["orders"]
                },
                "schema": { "tables": [{ "name": "orders", "columns": ["order_id"] }] }
            }"#,
        )
        .unwrap();
        assert_eq!(request.config.kind, crate::connector::SourceKind::Supabase);
        assert_eq!(request.config.max_rows, 100);
        assert!(request.config.sanitize_results);
        assert_eq!(request.schema.tables[0].name, "orders");
        // The record carries a handle, never secret material.
        assert_eq!(request.config.credentials_ref.as_deref(), Some("orders-ro"));
    }

    #[test]
    fn test_analysis_response_respects_include_flags() {
        let assessment = RiskAssessment {
            findings: Vec::new(),
            overall_score: 0.0,
            level: RiskLevel::Safe,
            sanitized_text: "text".into(),
            mitigations_applied: vec![Mitigation::Allow],
            fingerprint: "fp".into(),
            hallucination: None,
        };
        let request = RiskAnalysisRequest {
            text: "text".into(),
            processing_mode: ProcessingMode::Balanced,
            include_sanitized: false,
            include_detections: false,
        };
        let response = analysis_response(&assessment, &request, false);
        assert!(response.sanitized_text.is_none());
        assert!(response.findings.is_none());
    }
}
