//! riskgate core library
//!
//! Policy-enforcing gateway between chat applications and LLM providers.
//! Every request runs a multi-stage pipeline: risk classification of the
//! user input, redaction or blocking per policy, LLM invocation, mediated
//! data access for tool calls, re-classification of retrieved data, and a
//! final hallucination/PII verification pass before release. Each decision
//! emits a structured risk report to the audit sink.

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod connector;
pub mod detect;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod query;
pub mod sanitize;
pub mod vault;
