use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP client for the guest agent's JSON API.
///
/// Responses are parsed as JSON regardless of status code — the agent's
/// conflict and validation errors carry their message in the body.
#[derive(Clone)]
pub struct AgentClient {
    base_url: String,
    http: Client,
}

impl AgentClient {
    pub fn new(host: &str, port: u16, timeout_secs: u64) -> Self {
        AgentClient {
            base_url: format!("http://{}:{}", host, port),
            http: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn get(
        &self,
        path: &str,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Agent unreachable at {}: {}", url, e))?;
        Ok(resp.json().await?)
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("Agent unreachable at {}: {}", url, e))?;
        Ok(resp.json().await?)
    }

    pub async fn status(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.get("/api/status").await
    }

    pub async fn collectors(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.get("/api/collectors").await
    }

    pub async fn artifacts(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.get("/api/artifacts").await
    }

    pub async fn execute(
        &self,
        filename: &str,
        timeout: u64,
        screenshot_interval: u64,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.post(
            "/api/execute",
            &json!({
                "filename": filename,
                "timeout": timeout,
                "screenshot_interval": screenshot_interval,
            }),
        )
        .await
    }

    pub async fn cleanup(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.post("/api/cleanup", &json!({})).await
    }
}
