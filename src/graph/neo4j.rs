use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{GraphBackend, Row};
use crate::error::RagError;

/// Neo4j over the HTTP transactional endpoint (`/db/{db}/tx/commit`).
pub struct Neo4jBackend {
    client: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: Option<String>,
}

#[derive(Deserialize)]
struct TxError {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Deserialize)]
struct TxResult {
    columns: Vec<String>,
    data: Vec<TxRow>,
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

impl Neo4jBackend {
    pub fn from_env() -> Result<Self> {
        let base_url =
            dotenv::var("NEO4J_URL").unwrap_or_else(|_| "http://localhost:7474".to_string());
        let username = dotenv::var("NEO4J_USERNAME").unwrap_or_else(|_| "neo4j".to_string());
        let password = dotenv::var("NEO4J_PASSWORD").ok().filter(|p| !p.is_empty());
        let database = dotenv::var("NEO4J_DB").unwrap_or_else(|_| "neo4j".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to create Neo4j HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            database,
            username,
            password,
        })
    }
}

/// Zip each row's values with the column names. Only the first statement's
/// result is used; one statement is sent per request.
fn rows_from_response(resp: TxResponse) -> Result<Vec<Row>> {
    if let Some(err) = resp.errors.first() {
        // Syntax and semantic errors are the model's fault, not the server's
        let what = if err.code.contains("Statement") { "cypher" } else { "graph response" };
        return Err(RagError::malformed(what, format!("{}: {}", err.code, err.message)).into());
    }
    let Some(result) = resp.results.into_iter().next() else {
        return Ok(vec![]);
    };
    Ok(result
        .data
        .into_iter()
        .map(|r| {
            result
                .columns
                .iter()
                .cloned()
                .zip(r.row)
                .collect::<Map<String, Value>>()
        })
        .collect())
}

#[async_trait]
impl GraphBackend for Neo4jBackend {
    async fn run(&self, query: &str) -> Result<Vec<Row>> {
        let body = json!({
            "statements": [{ "statement": query, "resultDataContents": ["row"] }]
        });
        let resp = self
            .client
            .post(format!("{}/db/{}/tx/commit", self.base_url, self.database))
            .basic_auth(&self.username, self.password.as_ref())
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RagError::from_reqwest("graph", e))?;
        let parsed: TxResponse = resp
            .json()
            .await
            .map_err(|e| RagError::from_reqwest("graph", e))?;
        let rows = rows_from_response(parsed)?;
        debug!(database = %self.database, rows = rows.len(), "cypher executed");
        Ok(rows)
    }
}
