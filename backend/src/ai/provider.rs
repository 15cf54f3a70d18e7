use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Opaque chat capability used by the threat analyzer.
///
/// Implementations are injected by constructor; tests supply a stub that
/// returns canned JSON.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logs (e.g. "Copilot").
    fn name(&self) -> &str;

    /// The model every call is pinned to.
    fn model(&self) -> &str;

    async fn ask(
        &self,
        history: Vec<ChatMessage>,
        system_prompt: String,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}
