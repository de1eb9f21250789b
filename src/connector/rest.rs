//! REST data adapter.
//!
//! Translates a `GET /path` or `POST /path` query expression into an HTTP
//! call: GET sends the declared parameters as a query string (`p1`, `p2`,
//! ...), POST sends them as a JSON body. The supabase kind is this adapter
//! with the `apikey` header convention. Responses are expected to be a JSON
//! array of flat objects; column order is the sorted union of keys.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ConnectorError;

use super::adapter::{AdapterResult, DataAdapter};

/// Header convention for the backing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestAuth {
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// Supabase: `apikey` plus `Authorization: Bearer`.
    Supabase,
    /// No auth header.
    None,
}

/// HTTP-backed adapter.
pub struct RestAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    auth: RestAuth,
    source_name: String,
}

impl RestAdapter {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        auth: RestAuth,
        source_name: &str,
    ) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                ConnectorError::SourceUnavailable(format!("{source_name}: client build: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            auth,
            source_name: source_name.to_string(),
        })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.auth, &self.api_key) {
            (RestAuth::Bearer, Some(key)) => request.bearer_auth(key),
            (RestAuth::Supabase, Some(key)) => {
                request.header("apikey", key).bearer_auth(key)
            }
            _ => request,
        }
    }
}

/// Split a `GET /path` or `POST /path` expression.
fn parse_expression(query: &str) -> Result<(reqwest::Method, String), ConnectorError> {
    let mut parts = query.trim().splitn(2, char::is_whitespace);
    let method = parts.next().unwrap_or_default().to_uppercase();
    let path = parts.next().unwrap_or("").trim();

    let method = match method.as_str() {
        "GET" => reqwest::Method::GET,
        "POST" => reqwest::Method::POST,
        other => {
            return Err(ConnectorError::Execution(format!(
                "unsupported REST method: {other}"
            )))
        }
    };
    if !path.starts_with('/') {
        return Err(ConnectorError::Execution(format!(
            "REST path must be absolute: {path}"
        )));
    }
    Ok((method, path.to_string()))
}

/// Flatten a JSON payload into columnar data.
fn tabulate(payload: &Value, max_rows: u32) -> AdapterResult {
    let objects: Vec<&serde_json::Map<String, Value>> = match payload {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(map) => match map.get("rows").or_else(|| map.get("data")) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
            _ => vec![map],
        },
        _ => Vec::new(),
    };

    let columns: Vec<String> = objects
        .iter()
        .flat_map(|o| o.keys().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    let truncated = objects.len() > max_rows as usize;
    let rows = objects
        .into_iter()
        .take(max_rows as usize)
        .map(|object| {
            columns
                .iter()
                .map(|column| match object.get(column) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                })
                .collect()
        })
        .collect();

    AdapterResult {
        columns,
        rows,
        truncated,
    }
}

#[async_trait]
impl DataAdapter for RestAdapter {
    async fn open(&self) -> Result<(), ConnectorError> {
        // REST sources are probed lazily; a missing endpoint surfaces on the
        // first execute.
        Ok(())
    }

    async fn execute(
        &self,
        query: &str,
        parameters: &[String],
        deadline: Duration,
        max_rows: u32,
    ) -> Result<AdapterResult, ConnectorError> {
        let (method, path) = parse_expression(query)?;
        let url = format!("{}{}", self.base_url, path);
        let started = tokio::time::Instant::now();

        let request = if method == reqwest::Method::GET {
            let pairs: Vec<(String, &String)> = parameters
                .iter()
                .enumerate()
                .map(|(i, p)| (format!("p{}", i + 1), p))
                .collect();
            self.client
                .get(&url)
                .query(&pairs)
                .query(&[("limit", max_rows.to_string())])
        } else {
            self.client
                .post(&url)
                .json(&serde_json::json!({ "parameters": parameters }))
        };

        let response = tokio::time::timeout(deadline, self.apply_auth(request).send())
            .await
            .map_err(|_| ConnectorError::SourceTimeout {
                source_name: self.source_name.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(|e| {
                ConnectorError::SourceUnavailable(format!("{}: {e}", self.source_name))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Execution(format!(
                "{}: HTTP {status}",
                self.source_name
            )));
        }

        let payload: Value = tokio::time::timeout(deadline.saturating_sub(started.elapsed()), response.json())
            .await
            .map_err(|_| ConnectorError::SourceTimeout {
                source_name: self.source_name.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(|e| ConnectorError::Execution(format!("{}: bad JSON: {e}", self.source_name)))?;

        Ok(tabulate(&payload, max_rows))
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_expression() {
        let (method, path) = parse_expression("GET /orders/search").unwrap();
        assert_eq!(method, reqwest::Method::GET);
        assert_eq!(path, "/orders/search");

        let (method, _) = parse_expression("post /lookup").unwrap();
        assert_eq!(method, reqwest::Method::POST);

        assert!(parse_expression("DELETE /orders").is_err());
        assert!(parse_expression("GET orders").is_err());
    }

    #[test]
    fn test_tabulate_array_of_objects() {
        let payload = json!([
            { "id": "ORD-1", "status": "pending" },
            { "id": "ORD-2", "status": "shipped", "eta": "2024-09-01" }
        ]);
        let result = tabulate(&payload, 10);
        assert_eq!(result.columns, vec!["eta", "id", "status"]);
        assert_eq!(result.rows[0], vec!["", "ORD-1", "pending"]);
        assert_eq!(result.rows[1], vec!["2024-09-01", "ORD-2", "shipped"]);
    }

    #[test]
    fn test_tabulate_wrapped_rows() {
        let payload = json!({ "rows": [ { "n": 1 } ] });
        let result = tabulate(&payload, 10);
        assert_eq!(result.columns, vec!["n"]);
        assert_eq!(result.rows, vec![vec!["1"]]);
    }

    #[test]
    fn test_tabulate_truncates() {
        let payload = json!([{ "n": 1 }, { "n": 2 }, { "n": 3 }]);
        let result = tabulate(&payload, 2);
        assert_eq!(result.rows.len(), 2);
        assert!(result.truncated);
    }

    #[test]
    fn test_tabulate_single_object() {
        let payload = json!({ "status": "in_transit", "id": "ORD-1" });
        let result = tabulate(&payload, 10);
        assert_eq!(result.columns, vec!["id", "status"]);
        assert_eq!(result.rows, vec![vec!["ORD-1", "in_transit"]]);
    }
}
