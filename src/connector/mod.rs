//! The secure data connector.
//!
//! Mediates every tool-call data access: refuses unexecutable plans, gates
//! sources and tables against the registry, bounds concurrency with a
//! per-source pool, executes under the source deadline, then re-scans the
//! result through the risk agent in the data phase and returns the
//! sanitized rows. Source-level failures come back as empty-but-explained
//! results; only plan violations and unknown sources are hard errors.

pub mod adapter;
pub mod memory;
pub mod rest;
pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::agent::{Phase, RiskAgent, RiskAssessment};
use crate::config::AgentConfig;
use crate::detect::{Finding, FindingKind, Severity, Span};
use crate::error::ConnectorError;
use crate::query::{Permissions, QueryPlan, SchemaCatalog};

use self::adapter::{project, unproject, AdapterResult, DataAdapter};
use self::rest::{RestAdapter, RestAuth};
use self::sql::{SqlAdapter, SqlDialect};

/// How long a request may wait for a pool permit before `source_busy`.
const POOL_QUEUE_DEADLINE: Duration = Duration::from_secs(2);

/// Supported data source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Postgres,
    Mysql,
    Supabase,
    Rest,
    Sqlite,
}

/// Declarative configuration for one data source. Credentials are referenced
/// by handle and resolved at registration; secret material is never stored
/// on this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub allow_tables: Vec<String>,
    #[serde(default)]
    pub deny_tables: Vec<String>,
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
    #[serde(default = "default_max_query_ms")]
    pub max_query_ms: u64,
    #[serde(default = "default_true")]
    pub sanitize_results: bool,
    #[serde(default = "default_true")]
    pub risk_scan_results: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_max_rows() -> u32 {
    100
}

fn default_max_query_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    4
}

impl DataSourceConfig {
    pub fn permissions(&self) -> Permissions {
        Permissions {
            allow_tables: self.allow_tables.clone(),
            deny_tables: self.deny_tables.clone(),
        }
    }
}

/// Result of a mediated query. Rows are the sanitized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
    pub elapsed_ms: u64,
    pub result_assessment: Option<RiskAssessment>,
    pub is_safe: bool,
    pub truncated: bool,
    /// Explanation when the source failed (`source_busy`, `source_timeout`,
    /// `source_unavailable`, execution errors).
    pub failure: Option<String>,
    /// Operational findings accumulated for the final report.
    pub findings: Vec<Finding>,
}

impl QueryResult {
    fn failed(subtype: &str, message: String, elapsed_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            elapsed_ms,
            result_assessment: None,
            is_safe: false,
            truncated: false,
            failure: Some(message),
            findings: vec![Finding {
                kind: FindingKind::Operational,
                subtype: subtype.to_string(),
                span: Span::new(0, 0),
                original_value: String::new(),
                confidence: 1.0,
                severity: Severity::Low,
                suggested_replacement: String::new(),
                detector_id: "connector".into(),
            }],
        }
    }
}

/// Status summary for the admin surface. Never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub name: String,
    pub kind: SourceKind,
    pub allow_table_count: usize,
    pub max_rows: u32,
}

struct RegisteredSource {
    config: DataSourceConfig,
    catalog: SchemaCatalog,
    adapter: Arc<dyn DataAdapter>,
    pool: Arc<Semaphore>,
}

/// Registry of sources plus the mediation path. Sources register at process
/// init; the registry is read-only afterwards.
pub struct SecureDataConnector {
    agent: Arc<RiskAgent>,
    sources: HashMap<String, RegisteredSource>,
}

impl SecureDataConnector {
    pub fn new(agent: Arc<RiskAgent>) -> Self {
        Self {
            agent,
            sources: HashMap::new(),
        }
    }

    /// Register a source with an explicit adapter (tests, custom kinds).
    pub fn register(
        &mut self,
        config: DataSourceConfig,
        catalog: SchemaCatalog,
        adapter: Arc<dyn DataAdapter>,
    ) {
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1) as usize));
        self.sources.insert(
            config.name.clone(),
            RegisteredSource {
                config,
                catalog,
                adapter,
                pool,
            },
        );
    }

    /// Build and register the standard adapter for the config's kind.
    /// `credentials` maps credential handles to secret material.
    pub async fn register_standard(
        &mut self,
        config: DataSourceConfig,
        catalog: SchemaCatalog,
        credentials: &HashMap<String, String>,
    ) -> Result<(), ConnectorError> {
        let secret = config
            .credentials_ref
            .as_ref()
            .and_then(|handle| credentials.get(handle))
            .cloned();

        let adapter: Arc<dyn DataAdapter> = match config.kind {
            SourceKind::Postgres => Arc::new(
                SqlAdapter::connect(
                    SqlDialect::Postgres,
                    &config.endpoint,
                    config.pool_size,
                    &config.name,
                )
                .await?,
            ),
            SourceKind::Mysql => Arc::new(
                SqlAdapter::connect(
                    SqlDialect::MySql,
                    &config.endpoint,
                    config.pool_size,
                    &config.name,
                )
                .await?,
            ),
            SourceKind::Sqlite => Arc::new(
                SqlAdapter::connect(
                    SqlDialect::Sqlite,
                    &config.endpoint,
                    config.pool_size,
                    &config.name,
                )
                .await?,
            ),
            SourceKind::Rest => Arc::new(RestAdapter::new(
                &config.endpoint,
                secret,
                RestAuth::Bearer,
                &config.name,
            )?),
            SourceKind::Supabase => Arc::new(RestAdapter::new(
                &config.endpoint,
                secret,
                RestAuth::Supabase,
                &config.name,
            )?),
        };

        adapter.open().await?;
        self.register(config, catalog, adapter);
        Ok(())
    }

    pub fn catalog(&self, source: &str) -> Option<&SchemaCatalog> {
        self.sources.get(source).map(|s| &s.catalog)
    }

    pub fn permissions(&self, source: &str) -> Option<Permissions> {
        self.sources.get(source).map(|s| s.config.permissions())
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Source summaries for the admin surface.
    pub fn list_sources(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<SourceStatus> = self
            .sources
            .values()
            .map(|s| SourceStatus {
                name: s.config.name.clone(),
                kind: s.config.kind,
                allow_table_count: s.config.allow_tables.len(),
                max_rows: s.config.max_rows,
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Execute a plan against its target source.
    ///
    /// Hard errors (`Err`) are plan violations and unknown sources — the
    /// orchestrator turns those into tool errors for the model. Source
    /// failures return `Ok` with an explained empty result.
    pub async fn run(
        &self,
        plan: &QueryPlan,
        agent_config: &AgentConfig,
        request_id: &str,
    ) -> Result<QueryResult, ConnectorError> {
        if !plan.executable {
            return Err(ConnectorError::PlanRejected(format!(
                "plan not executable: {}",
                plan.violations.join(", ")
            )));
        }
        let source = self
            .sources
            .get(&plan.target_source)
            .ok_or_else(|| ConnectorError::UnknownSource(plan.target_source.clone()))?;

        // Defence in depth: the plan was validated against the same
        // permissions, but the registry's deny list is authoritative.
        for table in crate::query::referenced_tables(&plan.generated_query) {
            if source.config.deny_tables.iter().any(|t| *t == table) {
                return Err(ConnectorError::PlanRejected(format!(
                    "deny-listed table: {table}"
                )));
            }
        }

        let started = tokio::time::Instant::now();

        // Bounded, fair pool with a queue deadline.
        let permit =
            match tokio::time::timeout(POOL_QUEUE_DEADLINE, source.pool.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    return Ok(QueryResult::failed(
                        "source_busy",
                        format!("{}: pool exhausted", plan.target_source),
                        started.elapsed().as_millis() as u64,
                    ));
                }
            };

        let deadline = Duration::from_millis(source.config.max_query_ms);
        let executed = source
            .adapter
            .execute(
                &plan.generated_query,
                &plan.parameters,
                deadline,
                source.config.max_rows,
            )
            .await;
        drop(permit);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let raw = match executed {
            Ok(result) => result,
            Err(ConnectorError::SourceTimeout { source_name, elapsed_ms }) => {
                return Ok(QueryResult::failed(
                    "source_timeout",
                    format!("{source_name}: query timed out"),
                    elapsed_ms,
                ));
            }
            Err(ConnectorError::SourceUnavailable(message)) => {
                return Ok(QueryResult::failed("source_unavailable", message, elapsed_ms));
            }
            Err(err) => {
                return Ok(QueryResult::failed(
                    "source_error",
                    err.to_string(),
                    elapsed_ms,
                ));
            }
        };

        self.scan_result(source, raw, agent_config, request_id, elapsed_ms)
            .await
    }

    /// Re-scan the rows in the data phase and rewrite cells to the
    /// sanitized form.
    async fn scan_result(
        &self,
        source: &RegisteredSource,
        raw: AdapterResult,
        agent_config: &AgentConfig,
        request_id: &str,
        elapsed_ms: u64,
    ) -> Result<QueryResult, ConnectorError> {
        if !source.config.risk_scan_results || raw.rows.is_empty() {
            let row_count = raw.rows.len();
            return Ok(QueryResult {
                columns: raw.columns,
                rows: raw.rows,
                row_count,
                elapsed_ms,
                result_assessment: None,
                is_safe: true,
                truncated: raw.truncated,
                failure: None,
                findings: Vec::new(),
            });
        }

        let projection = project(&raw);
        let assessment = self
            .agent
            .analyze(&projection, Phase::Data, agent_config, None, request_id)
            .await;

        let blocked = assessment.is_blocked();
        let mut rows = raw.rows;
        let mut is_safe = !blocked;

        if blocked {
            rows.clear();
        } else if source.config.sanitize_results && assessment.was_sanitized() {
            match unproject(&assessment.sanitized_text, &raw.columns, rows.len()) {
                Some(sanitized_rows) => rows = sanitized_rows,
                None => {
                    // Sanitization broke the cell structure; refuse to guess
                    // which cells changed.
                    tracing::warn!(
                        source = %source.config.name,
                        "sanitized projection no longer maps onto cells, dropping rows"
                    );
                    rows.clear();
                    is_safe = false;
                }
            }
        }

        let row_count = rows.len();
        Ok(QueryResult {
            columns: raw.columns,
            rows,
            row_count,
            elapsed_ms,
            result_assessment: Some(assessment),
            is_safe,
            truncated: raw.truncated,
            failure: None,
            findings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingMode;
    use crate::query::{QueryGenerator, TableSchema, DEFAULT_RISK_GATE};
    use super::memory::MemoryAdapter;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog {
            tables: vec![TableSchema {
                name: "orders".into(),
                columns: vec![
                    "order_id".into(),
                    "status".into(),
                    "eta".into(),
                    "email".into(),
                    "created_at".into(),
                ],
                sensitive_columns: vec!["email".into()],
                key_columns: vec!["order_id".into(), "email".into()],
                large: true,
            }],
        }
    }

    fn config() -> DataSourceConfig {
        DataSourceConfig {
            name: "orders".into(),
            kind: SourceKind::Sqlite,
            endpoint: "memory".into(),
            credentials_ref: None,
            allow_tables: vec!["orders".into()],
            deny_tables: vec!["credentials".into()],
            max_rows: 100,
            max_query_ms: 500,
            sanitize_results: true,
            risk_scan_results: true,
            pool_size: 2,
        }
    }

    fn order_adapter() -> Arc<MemoryAdapter> {
        Arc::new(MemoryAdapter::new(
            vec!["order_id", "status", "eta", "email"],
            vec![vec!["ORD-1", "in_transit", "2024-08-26", "alice@example.com"]],
        ))
    }

    async fn connector_with(adapter: Arc<MemoryAdapter>) -> SecureDataConnector {
        let agent = Arc::new(RiskAgent::ephemeral().unwrap());
        let mut connector = SecureDataConnector::new(agent);
        connector.register(config(), catalog(), adapter);
        connector
    }

    async fn plan_for(question: &str) -> QueryPlan {
        QueryGenerator::new(DEFAULT_RISK_GATE, "gw-large")
            .plan(
                question,
                "orders",
                &catalog(),
                &config().permissions(),
                None,
            )
            .await
    }

    #[tokio::test]
    async fn test_run_sanitizes_email_cell() {
        let connector = connector_with(order_adapter()).await;
        let plan = plan_for("where is the order for alice@example.com?").await;
        let result = connector
            .run(&plan, &AgentConfig::for_mode(ProcessingMode::Balanced), "r1")
            .await
            .unwrap();

        assert!(result.is_safe);
        assert_eq!(result.row_count, 1);
        let email_idx = result.columns.iter().position(|c| c == "email").unwrap();
        assert_eq!(result.rows[0][email_idx], "‹EMAIL_1›");
        // Non-sensitive cells survive untouched.
        let status_idx = result.columns.iter().position(|c| c == "status").unwrap();
        assert_eq!(result.rows[0][status_idx], "in_transit");
    }

    #[tokio::test]
    async fn test_unexecutable_plan_is_hard_error() {
        let connector = connector_with(order_adapter()).await;
        let mut plan = plan_for("where is order 123456?").await;
        plan.executable = false;
        plan.violations.push("deny_listed_table:credentials".into());
        let err = connector
            .run(&plan, &AgentConfig::default(), "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::PlanRejected(_)));
    }

    #[tokio::test]
    async fn test_unknown_source_is_hard_error() {
        let connector = connector_with(order_adapter()).await;
        let mut plan = plan_for("where is order 123456?").await;
        plan.target_source = "nope".into();
        let err = connector
            .run(&plan, &AgentConfig::default(), "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn test_unavailable_source_returns_explained_empty() {
        let adapter = Arc::new(MemoryAdapter::new(vec!["id"], vec![]).unavailable());
        let agent = Arc::new(RiskAgent::ephemeral().unwrap());
        let mut connector = SecureDataConnector::new(agent);
        connector.register(config(), catalog(), adapter);

        let plan = plan_for("where is order 123456?").await;
        let result = connector
            .run(&plan, &AgentConfig::default(), "r1")
            .await
            .unwrap();
        assert!(!result.is_safe);
        assert_eq!(result.row_count, 0);
        assert!(result.failure.is_some());
        assert!(result
            .findings
            .iter()
            .any(|f| f.subtype == "source_unavailable"));
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let adapter = Arc::new(
            MemoryAdapter::new(vec!["id"], vec![vec!["1"]])
                .with_delay(Duration::from_secs(2)),
        );
        let agent = Arc::new(RiskAgent::ephemeral().unwrap());
        let mut connector = SecureDataConnector::new(agent);
        connector.register(config(), catalog(), adapter);

        let plan = plan_for("where is order 123456?").await;
        let result = connector
            .run(&plan, &AgentConfig::default(), "r1")
            .await
            .unwrap();
        assert!(!result.is_safe);
        assert!(result
            .findings
            .iter()
            .any(|f| f.subtype == "source_timeout"));
    }

    #[tokio::test]
    async fn test_list_sources_never_leaks_credentials() {
        let connector = connector_with(order_adapter()).await;
        let statuses = connector.list_sources();
        assert_eq!(statuses.len(), 1);
        let serialized = serde_json::to_string(&statuses).unwrap();
        assert!(!serialized.contains("credentials_ref"));
        assert!(!serialized.contains("endpoint"));
    }
}
