//! The chat orchestrator.
//!
//! Threads one request through the pipeline state machine:
//! `INIT → INPUT_SCAN → {BLOCKED | LLM_CALL} → {tool-call loop} →
//! OUTPUT_SCAN → {BLOCKED | REPORT} → DONE`. Every stage shares the
//! request's overall deadline and observes the cancellation token; on
//! expiry or cancel the machine jumps to REPORT with whatever assessments
//! completed and the caller receives a safe refusal.

pub mod report;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Phase, RiskAgent, RiskAssessment};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::{AgentConfig, ProcessingMode, DEFAULT_BUDGET_MS, DEFAULT_MAX_ITERATIONS};
use crate::connector::{QueryResult, SecureDataConnector};
use crate::detect::hallucination::Grounding;
use crate::detect::{Finding, FindingKind, Severity, Span};
use crate::provider::{
    complete_with_retry, ChatMessage, ChatRole, CompletionRequest, LlmProvider, LlmReply,
};
use crate::query::QueryGenerator;

use self::report::{RiskReport, ToolTraceEntry};

/// Canned refusal for blocked input.
pub const REFUSAL_BLOCKED_INPUT: &str =
    "I can't help with that request as written. Please rephrase and try again.";

/// Canned refusal for blocked output.
pub const REFUSAL_BLOCKED_OUTPUT: &str =
    "I generated a response that did not pass safety checks, so I can't share it.";

/// Canned refusal for terminal failures (deadline, provider, cancel).
pub const REFUSAL_FAILURE: &str =
    "Something went wrong while handling your request. Please try again.";

/// Canned answer when the model keeps asking for tools past the budget.
const TOOL_BUDGET_ANSWER: &str =
    "I wasn't able to complete the data lookup within the allotted attempts.";

/// System note appended when the tool budget runs out.
const TOOL_BUDGET_NOTE: &str =
    "The data-access budget for this conversation is exhausted. Answer with the \
     information you already have.";

/// One gateway-level chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub mode: ProcessingMode,
    pub enable_risk_detection: bool,
    pub max_risk_score: Option<f64>,
    pub sanitize_input: bool,
    pub sanitize_output: bool,
    pub enable_data_access: bool,
    pub data_source_name: Option<String>,
    /// Natural-language hint used when a tool call arrives without its own
    /// question.
    pub data_query_hint: Option<String>,
    pub budget: Option<Duration>,
    pub max_iterations: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            mode: ProcessingMode::default(),
            enable_risk_detection: true,
            max_risk_score: None,
            sanitize_input: true,
            sanitize_output: true,
            enable_data_access: false,
            data_source_name: None,
            data_query_hint: None,
            budget: None,
            max_iterations: None,
        }
    }
}

/// Terminal disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// The pipeline ran to completion (possibly sanitized or escalated).
    Completed,
    /// The input scan blocked the request before any LLM call.
    BlockedInput,
    /// The output scan blocked the model's answer.
    BlockedOutput,
    /// Terminal failure: deadline, cancellation, or provider error.
    Failed,
}

/// What the caller receives.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub request_id: String,
    pub final_answer: String,
    pub status: OutcomeStatus,
    pub report: RiskReport,
}

/// The per-request envelope threaded through the stages.
struct PipelineContext {
    request_id: String,
    deadline: tokio::time::Instant,
    iteration: u32,
    max_iterations: u32,
    messages: Vec<ChatMessage>,
    tool_trace: Vec<ToolTraceEntry>,
    input_assessment: Option<RiskAssessment>,
    output_assessment: Option<RiskAssessment>,
    tokens_minted: Vec<String>,
    data_results: Vec<QueryResult>,
    grounding: Grounding,
    escalations: Vec<Finding>,
    cancel: CancellationToken,
}

impl PipelineContext {
    fn remaining(&self) -> Option<Duration> {
        let now = tokio::time::Instant::now();
        if now >= self.deadline {
            None
        } else {
            Some(self.deadline - now)
        }
    }

    fn escalate(&mut self, subtype: &str) {
        self.escalations.push(Finding {
            kind: FindingKind::Operational,
            subtype: subtype.to_string(),
            span: Span::new(0, 0),
            original_value: String::new(),
            confidence: 1.0,
            severity: Severity::Medium,
            suggested_replacement: String::new(),
            detector_id: "orchestrator".into(),
        });
    }
}

/// The pipeline state machine. Holds only immutable, process-scoped parts;
/// all per-request state lives on the context.
pub struct ChatOrchestrator {
    agent: Arc<RiskAgent>,
    generator: QueryGenerator,
    connector: Arc<SecureDataConnector>,
    provider: Arc<dyn LlmProvider>,
    audit: AuditSink,
    default_budget: Duration,
}

impl ChatOrchestrator {
    pub fn new(
        agent: Arc<RiskAgent>,
        generator: QueryGenerator,
        connector: Arc<SecureDataConnector>,
        provider: Arc<dyn LlmProvider>,
        audit: AuditSink,
    ) -> Self {
        Self {
            agent,
            generator,
            connector,
            provider,
            audit,
            default_budget: Duration::from_millis(DEFAULT_BUDGET_MS),
        }
    }

    /// Assemble a gateway from process configuration: HTTP provider,
    /// standard detector registry over a fresh vault, empty source
    /// registry, and the audit sink. Must run inside a Tokio runtime (the
    /// audit writer spawns a task).
    pub fn from_config(
        config: &crate::config::GatewayConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let api_key = config
            .provider_api_key
            .clone()
            .ok_or("RISKGATE_PROVIDER_API_KEY is not set")?;
        let base_url = config
            .provider_base_url
            .clone()
            .ok_or("RISKGATE_PROVIDER_BASE_URL is not set")?;
        let provider: Arc<dyn LlmProvider> =
            Arc::new(crate::provider::http::HttpProvider::new(api_key, base_url)?);

        let store = Arc::new(crate::vault::memory::MemoryStore::new());
        let vault = match &config.vault_key_hex {
            Some(hex_key) => crate::vault::TokenVault::with_key_hex(hex_key, store)?,
            None => crate::vault::TokenVault::new(
                crate::vault::crypto::VaultKeys::random()?,
                store,
            ),
        };
        let agent = Arc::new(RiskAgent::new(
            crate::detect::DetectorRegistry::standard(),
            Arc::new(vault),
        ));

        let audit = match &config.audit_dir {
            Some(dir) => AuditSink::new(dir.clone())?,
            None => AuditSink::disabled(),
        };

        Ok(Self {
            agent: agent.clone(),
            generator: QueryGenerator::new(
                crate::query::DEFAULT_RISK_GATE,
                config.default_model.clone(),
            ),
            connector: Arc::new(SecureDataConnector::new(agent)),
            provider,
            audit,
            default_budget: config.budget,
        })
    }

    /// Run a request to completion.
    pub async fn run(&self, request: ChatRequest) -> ChatOutcome {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a request under an external cancellation token.
    pub async fn run_with_cancel(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        // INIT
        let budget = request.budget.unwrap_or(self.default_budget);
        let mut ctx = PipelineContext {
            request_id: Uuid::new_v4().to_string(),
            deadline: tokio::time::Instant::now() + budget,
            iteration: 0,
            max_iterations: request.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            messages: request.messages.clone(),
            tool_trace: Vec::new(),
            input_assessment: None,
            output_assessment: None,
            tokens_minted: Vec::new(),
            data_results: Vec::new(),
            grounding: Grounding::default(),
            escalations: Vec::new(),
            cancel,
        };

        let mut agent_config = AgentConfig::for_mode(request.mode);
        if let Some(max_risk) = request.max_risk_score {
            agent_config.max_risk_score = max_risk;
        }

        let (final_answer, status) = self.drive(&mut ctx, &request, &agent_config).await;

        // REPORT
        let action = RiskReport::derive_action(
            ctx.input_assessment.as_ref(),
            ctx.output_assessment.as_ref(),
            &ctx.escalations,
        );
        let overall_score = RiskReport::max_score(
            ctx.input_assessment.as_ref(),
            ctx.output_assessment.as_ref(),
            ctx.data_results
                .iter()
                .filter_map(|r| r.result_assessment.as_ref().map(|a| a.overall_score)),
        );
        let hallucination = ctx
            .output_assessment
            .as_ref()
            .and_then(|a| a.hallucination.as_ref());

        let report = RiskReport {
            request_id: ctx.request_id.clone(),
            timestamp: Utc::now(),
            mode: request.mode,
            model: request.model.clone(),
            action,
            overall_score,
            input_assessment: ctx.input_assessment.clone(),
            output_assessment: ctx.output_assessment.clone(),
            tool_trace: ctx.tool_trace.clone(),
            iterations: ctx.iteration,
            escalations: ctx.escalations.clone(),
            hallucination_score: hallucination.map(|h| h.score),
            factual_accuracy: hallucination.map(|h| h.factual_accuracy),
        };

        tracing::debug!(
            request_id = %ctx.request_id,
            action = %report.action,
            tokens_minted = ctx.tokens_minted.len(),
            iterations = ctx.iteration,
            "pipeline complete"
        );

        self.audit.emit(AuditEvent::RequestCompleted {
            request_id: report.request_id.clone(),
            action: report.action.to_string(),
            overall_risk_score: report.overall_score,
            model: report.model.clone(),
            mode: format!("{:?}", report.mode).to_lowercase(),
            report: serde_json::to_value(&report).unwrap_or(serde_json::Value::Null),
        });

        ChatOutcome {
            request_id: ctx.request_id,
            final_answer,
            status,
            report,
        }
    }

    /// INPUT_SCAN through OUTPUT_SCAN. Returns the caller-visible answer and
    /// the terminal status; assessments and traces accumulate on the context.
    async fn drive(
        &self,
        ctx: &mut PipelineContext,
        request: &ChatRequest,
        agent_config: &AgentConfig,
    ) -> (String, OutcomeStatus) {
        // INPUT_SCAN
        if request.enable_risk_detection {
            let user_text = last_user_text(&ctx.messages);
            let assessment = self
                .agent
                .analyze(&user_text, Phase::Input, agent_config, None, &ctx.request_id)
                .await;
            let blocked = assessment.is_blocked();
            if !blocked && request.sanitize_input && assessment.was_sanitized() {
                collect_placeholders(&assessment.sanitized_text, &mut ctx.tokens_minted);
                replace_last_user_text(&mut ctx.messages, &assessment.sanitized_text);
            }
            ctx.input_assessment = Some(assessment);
            if blocked {
                // No LLM call is ever made for blocked input.
                return (REFUSAL_BLOCKED_INPUT.to_string(), OutcomeStatus::BlockedInput);
            }
        }

        // LLM_CALL ↔ (QUERY_PLAN → QUERY_RUN → DATA_SCAN) loop
        let mut force_final = false;
        loop {
            let Some(remaining) = ctx.remaining() else {
                ctx.escalate("deadline_exceeded");
                return (REFUSAL_FAILURE.to_string(), OutcomeStatus::Failed);
            };

            let completion = CompletionRequest {
                model: request.model.clone(),
                messages: ctx.messages.clone(),
                allow_tool_calls: request.enable_data_access && !force_final,
                max_tokens: 4096,
                temperature: None,
            };

            let cancel = ctx.cancel.clone();
            let reply = tokio::select! {
                _ = cancel.cancelled() => {
                    ctx.escalate("cancelled");
                    return (REFUSAL_FAILURE.to_string(), OutcomeStatus::Failed);
                }
                result = tokio::time::timeout(
                    remaining,
                    complete_with_retry(self.provider.as_ref(), completion, remaining),
                ) => match result {
                    Err(_) => {
                        ctx.escalate("deadline_exceeded");
                        return (REFUSAL_FAILURE.to_string(), OutcomeStatus::Failed);
                    }
                    Ok(Err(err)) => {
                        tracing::error!(request_id = %ctx.request_id, error = %err, "LLM call failed");
                        ctx.escalate("llm_failure");
                        return (REFUSAL_FAILURE.to_string(), OutcomeStatus::Failed);
                    }
                    Ok(Ok(reply)) => reply,
                },
            };

            match reply {
                LlmReply::Answer { text } => {
                    return self.output_scan(ctx, request, agent_config, text).await;
                }
                LlmReply::ToolCall { question, source } => {
                    if force_final || !request.enable_data_access {
                        // The model ignored the budget note (or tools are
                        // off): take the canned answer through the normal
                        // output path.
                        return self
                            .output_scan(ctx, request, agent_config, TOOL_BUDGET_ANSWER.to_string())
                            .await;
                    }

                    self.handle_tool_call(ctx, request, agent_config, question, source)
                        .await;

                    ctx.iteration += 1;
                    if ctx.iteration >= ctx.max_iterations {
                        ctx.messages.push(ChatMessage::system(TOOL_BUDGET_NOTE));
                        ctx.escalate("tool_budget_exhausted");
                        force_final = true;
                    }
                }
            }
        }
    }

    /// QUERY_PLAN → QUERY_RUN → DATA_SCAN for one tool call. Failures become
    /// tool messages the model sees on the next turn; every path records a
    /// trace entry.
    async fn handle_tool_call(
        &self,
        ctx: &mut PipelineContext,
        request: &ChatRequest,
        agent_config: &AgentConfig,
        question: String,
        source: String,
    ) {
        let source_name = if source.is_empty() {
            request.data_source_name.clone().unwrap_or_default()
        } else {
            source
        };
        let question = if question.is_empty() {
            request.data_query_hint.clone().unwrap_or(question)
        } else {
            question
        };

        // QUERY_PLAN
        let (catalog, permissions) = match (
            self.connector.catalog(&source_name),
            self.connector.permissions(&source_name),
        ) {
            (Some(catalog), Some(permissions)) => (catalog.clone(), permissions),
            _ => {
                ctx.messages.push(ChatMessage::tool(format!(
                    "tool error: unknown data source \"{source_name}\""
                )));
                ctx.tool_trace.push(ToolTraceEntry {
                    iteration: ctx.iteration,
                    source: source_name,
                    plan_summary: question,
                    elapsed_ms: 0,
                    rows: 0,
                    result_level: None,
                    failure: Some("unknown_source".to_string()),
                });
                return;
            }
        };

        let plan = self
            .generator
            .plan(
                &question,
                &source_name,
                &catalog,
                &permissions,
                Some(self.provider.as_ref()),
            )
            .await;

        if !plan.executable {
            let summary = plan.violations.join(", ");
            ctx.messages.push(ChatMessage::tool(format!(
                "tool error: query rejected ({summary})"
            )));
            ctx.tool_trace.push(ToolTraceEntry {
                iteration: ctx.iteration,
                source: source_name,
                plan_summary: plan.rationale,
                elapsed_ms: 0,
                rows: 0,
                result_level: None,
                failure: Some(format!("query_plan_violation: {summary}")),
            });
            return;
        }

        // QUERY_RUN
        match self.connector.run(&plan, agent_config, &ctx.request_id).await {
            Ok(result) => {
                // DATA_SCAN already happened inside the connector; fold the
                // sanitized rows into the grounding for the output scan.
                ctx.grounding
                    .extend(&Grounding::from_rows(&result.columns, &result.rows));
                for row in &result.rows {
                    for cell in row {
                        collect_placeholders(cell, &mut ctx.tokens_minted);
                    }
                }

                ctx.tool_trace.push(ToolTraceEntry {
                    iteration: ctx.iteration,
                    source: source_name,
                    plan_summary: plan.rationale.clone(),
                    elapsed_ms: result.elapsed_ms,
                    rows: result.row_count,
                    result_level: result.result_assessment.as_ref().map(|a| a.level),
                    failure: result.failure.clone(),
                });

                let payload = if result.rows.is_empty() {
                    match &result.failure {
                        Some(failure) => format!("tool result: no rows ({failure})"),
                        None => "tool result: no rows".to_string(),
                    }
                } else {
                    serde_json::json!({
                        "columns": result.columns,
                        "rows": result.rows,
                        "row_count": result.row_count,
                    })
                    .to_string()
                };
                ctx.messages.push(ChatMessage::tool(payload));
                ctx.data_results.push(result);
            }
            Err(err) => {
                ctx.messages
                    .push(ChatMessage::tool(format!("tool error: {err}")));
                ctx.tool_trace.push(ToolTraceEntry {
                    iteration: ctx.iteration,
                    source: source_name,
                    plan_summary: plan.rationale,
                    elapsed_ms: 0,
                    rows: 0,
                    result_level: None,
                    failure: Some(err.to_string()),
                });
            }
        }
    }

    /// OUTPUT_SCAN and the terminal decision for a model answer.
    async fn output_scan(
        &self,
        ctx: &mut PipelineContext,
        request: &ChatRequest,
        agent_config: &AgentConfig,
        text: String,
    ) -> (String, OutcomeStatus) {
        if !request.enable_risk_detection {
            return (text, OutcomeStatus::Completed);
        }

        let grounding = if ctx.grounding.is_empty() {
            None
        } else {
            Some(&ctx.grounding)
        };
        let assessment = self
            .agent
            .analyze(&text, Phase::Output, agent_config, grounding, &ctx.request_id)
            .await;

        let blocked = assessment.is_blocked();
        let answer = if blocked {
            REFUSAL_BLOCKED_OUTPUT.to_string()
        } else if request.sanitize_output && assessment.was_sanitized() {
            collect_placeholders(&assessment.sanitized_text, &mut ctx.tokens_minted);
            assessment.sanitized_text.clone()
        } else {
            text
        };
        ctx.output_assessment = Some(assessment);

        if blocked {
            (answer, OutcomeStatus::BlockedOutput)
        } else {
            (answer, OutcomeStatus::Completed)
        }
    }
}

fn last_user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn replace_last_user_text(messages: &mut [ChatMessage], sanitized: &str) {
    if let Some(message) = messages.iter_mut().rev().find(|m| m.role == ChatRole::User) {
        message.content = sanitized.to_string();
    }
}

/// Record any `‹KIND_n›` placeholders appearing in a sanitized text.
fn collect_placeholders(text: &str, minted: &mut Vec<String>) {
    static RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\u{2039}[A-Z_]+_\d+\u{203a}").unwrap());
    for m in RE.find_iter(text) {
        let placeholder = m.as_str().to_string();
        if !minted.contains(&placeholder) {
            minted.push(placeholder);
        }
    }
}
