//! Process and request configuration.
//!
//! Everything here is read once at startup (environment) or carried on the
//! request (processing mode, per-request overrides). Registries built from
//! this configuration are immutable afterwards — no locks on the read path.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detect::Severity;

/// Default overall request budget.
pub const DEFAULT_BUDGET_MS: u64 = 30_000;

/// Default per-detector deadline inside the risk agent fan-out.
pub const DEFAULT_DETECTOR_DEADLINE_MS: u64 = 300;

/// Default tool-call iteration budget per request.
pub const DEFAULT_MAX_ITERATIONS: u32 = 4;

/// Request-scoped severity posture. Shifts detector confidence thresholds
/// and the sanitize policy; passed down by value so the risk agent never
/// calls back into the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Strict,
    #[default]
    Balanced,
    Permissive,
}

impl ProcessingMode {
    /// Minimum confidence for PII findings to count.
    pub fn pii_confidence_threshold(&self) -> f64 {
        match self {
            ProcessingMode::Strict => 0.6,
            ProcessingMode::Balanced => 0.7,
            ProcessingMode::Permissive => 0.85,
        }
    }

    /// Minimum confidence for bias findings to count.
    pub fn bias_confidence_threshold(&self) -> f64 {
        match self {
            ProcessingMode::Strict => 0.6,
            ProcessingMode::Balanced => 0.7,
            ProcessingMode::Permissive => 0.85,
        }
    }

    /// Findings at or above this severity get sanitized (replaced or
    /// escalated); below it they are advisory only.
    pub fn sanitize_threshold(&self) -> Severity {
        match self {
            ProcessingMode::Strict => Severity::Medium,
            ProcessingMode::Balanced => Severity::High,
            ProcessingMode::Permissive => Severity::Critical,
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ProcessingMode::Strict),
            "balanced" => Ok(ProcessingMode::Balanced),
            "permissive" => Ok(ProcessingMode::Permissive),
            other => Err(format!("unknown processing mode: {other}")),
        }
    }
}

/// Risk agent configuration. Defaults shift with the processing mode;
/// explicit fields win over mode-derived values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    #[serde(default)]
    pub mode: ProcessingMode,

    /// Override for the mode's PII confidence threshold.
    #[serde(default)]
    pub pii_confidence_threshold: Option<f64>,

    /// Override for the mode's bias confidence threshold.
    #[serde(default)]
    pub bias_confidence_threshold: Option<f64>,

    /// Run the hallucination detector on output-phase scans with grounding.
    #[serde(default = "default_true")]
    pub enable_hallucination: bool,

    /// Scores at or above this block the text outright.
    #[serde(default = "default_max_risk")]
    pub max_risk_score: f64,

    /// Override for the mode's sanitize-threshold severity.
    #[serde(default)]
    pub sanitize_threshold: Option<Severity>,

    /// Per-detector scan deadline.
    #[serde(default = "default_detector_deadline_ms")]
    pub detector_deadline_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_risk() -> f64 {
    8.0
}

fn default_detector_deadline_ms() -> u64 {
    DEFAULT_DETECTOR_DEADLINE_MS
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::default(),
            pii_confidence_threshold: None,
            bias_confidence_threshold: None,
            enable_hallucination: true,
            max_risk_score: default_max_risk(),
            sanitize_threshold: None,
            detector_deadline_ms: default_detector_deadline_ms(),
        }
    }
}

impl AgentConfig {
    /// Build a config for the given mode with mode-derived thresholds.
    pub fn for_mode(mode: ProcessingMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn pii_confidence(&self) -> f64 {
        self.pii_confidence_threshold
            .unwrap_or_else(|| self.mode.pii_confidence_threshold())
    }

    pub fn bias_confidence(&self) -> f64 {
        self.bias_confidence_threshold
            .unwrap_or_else(|| self.mode.bias_confidence_threshold())
    }

    pub fn sanitize_severity(&self) -> Severity {
        self.sanitize_threshold
            .unwrap_or_else(|| self.mode.sanitize_threshold())
    }

    pub fn detector_deadline(&self) -> Duration {
        Duration::from_millis(self.detector_deadline_ms)
    }
}

/// Process-wide configuration resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// API key for the default LLM provider.
    pub provider_api_key: Option<String>,
    /// Base URL for the default LLM provider.
    pub provider_base_url: Option<String>,
    /// Hex-encoded 32-byte vault master key. Generated when absent.
    pub vault_key_hex: Option<String>,
    /// Model used when a request or internal prompt does not name one.
    pub default_model: String,
    /// Overall request budget.
    pub budget: Duration,
    /// Default processing mode for requests that do not specify one.
    pub default_mode: ProcessingMode,
    /// Default risk gate.
    pub default_max_risk: f64,
    /// Detector confidence overrides.
    pub pii_confidence: Option<f64>,
    pub bias_confidence: Option<f64>,
    /// Directory for the audit JSONL log. `None` disables the sink.
    pub audit_dir: Option<std::path::PathBuf>,
}

impl GatewayConfig {
    /// Read configuration from `RISKGATE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            provider_api_key: env_string("RISKGATE_PROVIDER_API_KEY"),
            provider_base_url: env_string("RISKGATE_PROVIDER_BASE_URL"),
            vault_key_hex: env_string("RISKGATE_VAULT_KEY"),
            default_model: env_string("RISKGATE_MODEL")
                .unwrap_or_else(|| default_model()),
            budget: Duration::from_millis(
                env_parse("RISKGATE_BUDGET_MS").unwrap_or(DEFAULT_BUDGET_MS),
            ),
            default_mode: env_string("RISKGATE_MODE")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            default_max_risk: env_parse("RISKGATE_MAX_RISK").unwrap_or_else(default_max_risk),
            pii_confidence: env_parse("RISKGATE_PII_CONFIDENCE"),
            bias_confidence: env_parse("RISKGATE_BIAS_CONFIDENCE"),
            audit_dir: env_string("RISKGATE_AUDIT_DIR").map(std::path::PathBuf::from),
        }
    }

    /// Agent config seeded from the process defaults.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            mode: self.default_mode,
            pii_confidence_threshold: self.pii_confidence,
            bias_confidence_threshold: self.bias_confidence,
            max_risk_score: self.default_max_risk,
            ..AgentConfig::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider_api_key: None,
            provider_base_url: None,
            vault_key_hex: None,
            default_model: default_model(),
            budget: Duration::from_millis(DEFAULT_BUDGET_MS),
            default_mode: ProcessingMode::default(),
            default_max_risk: default_max_risk(),
            pii_confidence: None,
            bias_confidence: None,
            audit_dir: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
