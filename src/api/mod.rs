//! Task-service HTTP client
//!
//! One client per attempt: every proxy change means a new `reqwest::Client`
//! so the proxy applies to the whole connection pool. Recognized business
//! errors are surfaced as [`crate::error::ApiError`] by inspecting the JSON
//! envelope; transport and server failures map to their own error variants.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ApiError, Error, Result};
use crate::models::Device;

const APP_VERSION: &str = "0.2.5";
const DEVICE_NAME: &str = "windows pc";
const DEVICE_MODEL: &str = "PC x86 - Chrome 142";
const DEVICE_TYPE: &str = "extension";

/// A unit of work handed out by the task service
#[derive(Debug, Clone, Deserialize)]
pub struct TaskAssignment {
    pub id: String,
    #[serde(rename = "ruleCollection")]
    pub rule_collection: RuleCollection,
    #[serde(default)]
    pub vars: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleCollection {
    #[serde(rename = "yamlRules")]
    pub yaml_rules: String,
}

impl TaskAssignment {
    /// Target page URL from the assignment variables.
    pub fn target_url(&self) -> Option<&str> {
        self.vars.get("url").and_then(Value::as_str)
    }

    /// Per-assignment page fetch timeout, if given.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.vars
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
    }
}

/// HTTP client bound to one device identity and one proxy
pub struct TaskServiceClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl TaskServiceClient {
    /// Build a client routed through the given proxy.
    ///
    /// The literal proxy value `direct` disables proxying, for local runs.
    pub fn new(
        base_url: impl Into<String>,
        proxy: Option<&str>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(request_timeout)
            .gzip(true)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(proxy) = proxy.filter(|p| *p != "direct") {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn device_headers(&self, device: &Device) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let mut set = |name: &'static str, value: &str| -> Result<()> {
            headers.insert(
                name,
                HeaderValue::from_str(value)
                    .map_err(|e| Error::with_source("Invalid header value", e))?,
            );
            Ok(())
        };

        set("x-app-version", APP_VERSION)?;
        set("x-device-name", DEVICE_NAME)?;
        set("x-device-model", DEVICE_MODEL)?;
        set("x-device-type", DEVICE_TYPE)?;
        set("x-device-id", &device.device_id)?;
        set("x-device-os", &device.device_os)?;
        set("x-cpu-architecture", &device.cpu_architecture)?;
        set("x-cpu-model", &device.cpu_model)?;
        set("x-cpu-processor-count", &device.cpu_processor_count.to_string())?;

        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&device.user_agent)
                .map_err(|e| Error::with_source("Invalid user agent", e))?,
        );

        if let Some(token) = &self.auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| Error::with_source("Invalid auth token", e))?,
            );
        }

        Ok(headers)
    }

    /// Map status-level failures, then parse the JSON envelope.
    async fn verify_response(&self, response: Response) -> Result<Value> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_secs = response
                .headers()
                .get("ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(Error::RateLimited { reset_secs });
        }

        if status.is_server_error() {
            return Err(Error::ServerError(status.as_u16()));
        }

        if status == StatusCode::FORBIDDEN {
            return Err(Error::Transport(format!("response forbidden: {status}")));
        }

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Value::Null);
        }

        let body: Value = response.json().await?;

        // Error envelope: {"success": false, ...} or {"error": "..."}
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(ApiError::new(body.to_string()).into());
        }
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
                return Err(ApiError::new(message).into());
            }
        }

        Ok(body)
    }

    /// Report device liveness.
    pub async fn send_ping(&self, device: &Device) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/ping", self.base_url))
            .headers(self.device_headers(device)?)
            .send()
            .await?;

        self.verify_response(response).await?;
        debug!(device_id = %device.device_id, "Ping acknowledged");
        Ok(())
    }

    /// Ask for a work assignment. `None` means no task is available.
    pub async fn request_task(&self, device: &Device) -> Result<Option<TaskAssignment>> {
        let response = self
            .client
            .get(format!("{}/api/job", self.base_url))
            .headers(self.device_headers(device)?)
            .send()
            .await?;

        let body = self.verify_response(response).await?;
        if body.is_null() || body == Value::Object(Default::default()) {
            return Ok(None);
        }

        let assignment: TaskAssignment = serde_json::from_value(body)?;
        Ok(Some(assignment))
    }

    /// Submit the extraction payload for a completed assignment.
    pub async fn complete_task(
        &self,
        device: &Device,
        task_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/job/{task_id}", self.base_url))
            .headers(self.device_headers(device)?)
            .json(payload)
            .send()
            .await?;

        self.verify_response(response).await?;
        Ok(())
    }

    /// Fetch the target page for an assignment.
    ///
    /// Absorbs all failures into `None`: a page that cannot be fetched still
    /// produces a (canonical empty) submission, never an aborted unit.
    pub async fn fetch_page(&self, url: &str, timeout: Option<Duration>) -> Option<String> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Referer", url);

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url, error = %e, "Page fetch failed");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            debug!(url, status = %response.status(), "Page fetch returned non-200");
            return None;
        }

        response.text().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment_json() -> Value {
        serde_json::json!({
            "id": "task-1",
            "ruleCollection": { "yamlRules": "- name: extract" },
            "vars": { "url": "https://example.com/page", "timeout": 20 }
        })
    }

    #[test]
    fn test_assignment_deserialization() {
        let assignment: TaskAssignment = serde_json::from_value(assignment_json()).unwrap();
        assert_eq!(assignment.id, "task-1");
        assert_eq!(assignment.target_url(), Some("https://example.com/page"));
        assert_eq!(assignment.fetch_timeout(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_assignment_without_vars() {
        let assignment: TaskAssignment = serde_json::from_value(serde_json::json!({
            "id": "task-2",
            "ruleCollection": { "yamlRules": "" }
        }))
        .unwrap();
        assert!(assignment.target_url().is_none());
        assert!(assignment.fetch_timeout().is_none());
    }
}
