use crate::ai::provider::{ChatMessage, ChatProvider};
use crate::ai::REQUIRED_MODEL;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::error::Error;
use std::time::Duration;

const API_URL: &str = "https://api.githubcopilot.com/chat/completions";

/// Copilot chat-completions provider.
///
/// The model any caller asks for is intentionally ignored; every session
/// uses [`REQUIRED_MODEL`].
pub struct CopilotProvider {
    token: String,
    client: Client,
}

impl CopilotProvider {
    pub fn new(token: String, timeout_secs: u64) -> Self {
        CopilotProvider {
            token,
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ChatProvider for CopilotProvider {
    fn name(&self) -> &str {
        "Copilot"
    }

    fn model(&self) -> &str {
        REQUIRED_MODEL
    }

    async fn ask(
        &self,
        history: Vec<ChatMessage>,
        system_prompt: String,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": system_prompt }));
        }
        for msg in history {
            let role = if msg.role == "model" { "assistant" } else { &msg.role };
            messages.push(json!({ "role": role, "content": msg.content }));
        }

        let payload = json!({
            "model": REQUIRED_MODEL,
            "messages": messages,
            "temperature": 0.1
        });

        let resp = self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", "2023-07-07")
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(format!("Copilot API Error: {}", error_text).into());
        }

        let body: serde_json::Value = resp.json().await?;
        if let Some(choices) = body["choices"].as_array() {
            if let Some(first) = choices.first() {
                if let Some(content) = first["message"]["content"].as_str() {
                    return Ok(content.to_string());
                }
            }
        }

        Err(format!("Failed to parse Copilot response: {:?}", body).into())
    }
}
