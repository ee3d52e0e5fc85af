//! Model client abstraction for agent invocations.
//!
//! The [`ModelClient`] trait decouples the agent runner from the actual
//! provider. Tests use scripted clients that return predetermined text
//! without any network traffic.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::ModelProvider;

/// Abstraction over language-model backends.
///
/// One invocation is a single blocking request; transport retry policy is
/// owned by the agent runner, not the client.
pub trait ModelClient {
    /// Send a system/user prompt pair and return the model's text.
    fn invoke(&self, system: &str, user: &str) -> Result<String>;

    /// Short human-readable identity for logs and reports.
    fn describe(&self) -> String;
}

/// Blocking HTTP client speaking the OpenAI-compatible chat-completions wire
/// format, which both the local and the remote provider accept.
pub struct HttpModel {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpModel {
    pub fn new(provider: &ModelProvider, timeout: Duration) -> Result<Self> {
        let (base_url, model, api_key) = match provider {
            ModelProvider::Local { base_url, model } => (base_url.clone(), model.clone(), None),
            ModelProvider::OpenAi {
                base_url,
                model,
                api_key,
            } => (base_url.clone(), model.clone(), Some(api_key.clone())),
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl ModelClient for HttpModel {
    #[instrument(skip_all, fields(model = %self.model))]
    fn invoke(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        info!(url = %url, "model invocation");
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().context("send model request")?;
        let status = response.status();
        if status.is_server_error() {
            return Err(anyhow!("model endpoint returned {status}"));
        }
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(anyhow!(
                "model request rejected ({status}): {}",
                detail.chars().take(200).collect::<String>()
            ));
        }

        let parsed: ChatResponse = response.json().context("parse model response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("model response contained no choices"))?;
        debug!(chars = content.len(), "model responded");
        Ok(content)
    }

    fn describe(&self) -> String {
        format!("{} at {}", self.model, self.base_url)
    }
}
