use std::{collections::BTreeMap, fmt};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::{
    error::{JobError, Result},
    models::SessionHandle,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHandle(pub String);

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    New,
    Queued,
    Launched,
    Running,
    Executed,
    Successful,
    Failed,
    Canceled,
    Closed,
}

impl QueryState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Canceled | Self::Closed
        )
    }

    pub fn is_successful(self) -> bool {
        matches!(self, Self::Successful)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatus {
    #[serde(rename = "status")]
    pub state: QueryState,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub name: String,
    pub persist_result_set: bool,
    pub persist_result_in_driver: bool,
}

impl QueryOptions {
    /// Orchestrated queries write into tables, so result sets are never persisted.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persist_result_set: false,
            persist_result_in_driver: false,
        }
    }

    pub fn conf(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "lens.query.enable.persistent.resultset".to_string(),
                self.persist_result_set.to_string(),
            ),
            (
                "lens.query.enable.persistent.resultset.indriver".to_string(),
                self.persist_result_in_driver.to_string(),
            ),
        ])
    }
}

/// Query execution service the executors dispatch to.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn submit(
        &self,
        session: &SessionHandle,
        query: &str,
        options: &QueryOptions,
    ) -> Result<QueryHandle>;

    async fn status(&self, session: &SessionHandle, handle: &QueryHandle) -> Result<QueryStatus>;

    async fn cancel(&self, session: &SessionHandle, handle: &QueryHandle) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitQueryRequest<'a> {
    #[serde(rename = "sessionid")]
    session: &'a SessionHandle,
    query: &'a str,
    operation: &'static str,
    query_name: &'a str,
    conf: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitQueryResponse {
    handle_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryStatusResponse {
    status: QueryStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct CancelQueryResponse {
    status: String,
}

/// JSON-over-HTTP client for the query service.
#[derive(Debug, Clone)]
pub struct HttpQueryBackend {
    base_url: String,
}

impl HttpQueryBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn query_url(&self, handle: &QueryHandle) -> String {
        format!("{}/queryapi/queries/{}", self.base_url, handle)
    }

    async fn submit_query(
        &self,
        session: &SessionHandle,
        query: &str,
        options: &QueryOptions,
    ) -> anyhow::Result<QueryHandle> {
        let url = format!("{}/queryapi/queries", self.base_url);
        let payload = SubmitQueryRequest {
            session,
            query,
            operation: "execute",
            query_name: &options.name,
            conf: options.conf(),
        };
        let body = serde_json::to_string(&payload).context("Failed to encode query submission")?;
        let parsed = execute_curl_json("POST", &url, session, Some(body)).await?;
        let response = serde_json::from_value::<SubmitQueryResponse>(parsed)
            .context("Failed to decode query submission response")?;
        Ok(QueryHandle(response.handle_id))
    }

    async fn query_status(
        &self,
        session: &SessionHandle,
        handle: &QueryHandle,
    ) -> anyhow::Result<QueryStatus> {
        let parsed = execute_curl_json("GET", &self.query_url(handle), session, None).await?;
        let response = serde_json::from_value::<QueryStatusResponse>(parsed)
            .context("Failed to decode query status response")?;
        Ok(response.status)
    }

    async fn cancel_query(
        &self,
        session: &SessionHandle,
        handle: &QueryHandle,
    ) -> anyhow::Result<bool> {
        let parsed = execute_curl_json("DELETE", &self.query_url(handle), session, None)
            .await
            .unwrap_or_else(|_| json!({ "status": "FAILED" }));
        let response = serde_json::from_value::<CancelQueryResponse>(parsed)
            .context("Failed to decode query cancel response")?;
        Ok(response.status.eq_ignore_ascii_case("SUCCEEDED"))
    }
}

#[async_trait]
impl QueryBackend for HttpQueryBackend {
    async fn submit(
        &self,
        session: &SessionHandle,
        query: &str,
        options: &QueryOptions,
    ) -> Result<QueryHandle> {
        self.submit_query(session, query, options)
            .await
            .map_err(JobError::backend)
    }

    async fn status(&self, session: &SessionHandle, handle: &QueryHandle) -> Result<QueryStatus> {
        self.query_status(session, handle)
            .await
            .map_err(JobError::backend)
    }

    async fn cancel(&self, session: &SessionHandle, handle: &QueryHandle) -> Result<bool> {
        self.cancel_query(session, handle)
            .await
            .map_err(JobError::backend)
    }
}

async fn execute_curl_json(
    method: &str,
    url: &str,
    session: &SessionHandle,
    body: Option<String>,
) -> anyhow::Result<Value> {
    let mut command = Command::new("curl");
    command
        .arg("-sS")
        .arg("--fail-with-body")
        .arg("-X")
        .arg(method)
        .arg(url)
        .arg("-H")
        .arg(format!("X-Session-Public-Id: {}", session.public_id))
        .arg("-H")
        .arg(format!("X-Session-Secret-Id: {}", session.secret_id))
        .arg("-H")
        .arg("Accept: application/json")
        .arg("-H")
        .arg("Content-Type: application/json");

    if let Some(body) = body {
        command.arg("-d").arg(body);
    }

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute curl for {}", url))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Query service request failed: {}", stderr.trim());
    }

    let stdout =
        String::from_utf8(output.stdout).context("Query service response was not valid UTF-8")?;
    serde_json::from_str::<Value>(&stdout).with_context(|| {
        format!(
            "Failed to parse query service JSON response for {}: {}",
            url,
            stdout.trim()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(QueryState::Successful.is_finished());
        assert!(QueryState::Canceled.is_finished());
        assert!(!QueryState::Executed.is_finished());
        assert!(!QueryState::Failed.is_successful());
    }

    #[test]
    fn status_payload_decodes() {
        let parsed: QueryStatusResponse = serde_json::from_value(json!({
            "status": { "status": "FAILED", "errorMessage": "table not found" }
        }))
        .expect("status payload");
        assert_eq!(parsed.status.state, QueryState::Failed);
        assert_eq!(parsed.status.error_message.as_deref(), Some("table not found"));
        assert_eq!(parsed.status.state.to_string(), "FAILED");
    }

    #[test]
    fn submission_disables_persistent_results() {
        let session = SessionHandle {
            public_id: "pub".to_string(),
            secret_id: "sec".to_string(),
        };
        let options = QueryOptions::named("ml_predict_1");
        let payload = SubmitQueryRequest {
            session: &session,
            query: "SELECT 1",
            operation: "execute",
            query_name: &options.name,
            conf: options.conf(),
        };
        let value = serde_json::to_value(&payload).expect("encode");
        assert_eq!(value["sessionid"]["publicId"], "pub");
        assert_eq!(value["queryName"], "ml_predict_1");
        assert_eq!(value["conf"]["lens.query.enable.persistent.resultset"], "false");
        assert_eq!(value["conf"]["lens.query.enable.persistent.resultset.indriver"], "false");
    }
}
