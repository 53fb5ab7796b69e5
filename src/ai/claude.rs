use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use crate::ai::{ChatMessage, LlmClient, LlmRequest};
use crate::config::LlmConfig;
use crate::data::http::{with_retry, FetchError, HttpTransport, RetryPolicy};
use crate::monitoring::metrics;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Anthropic Messages API client
pub struct ClaudeClient {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    retry: RetryPolicy,
}

impl ClaudeClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        api_key: String,
        endpoint: String,
        config: &LlmConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            api_key,
            endpoint,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            retry,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_once(&self, body: &serde_json::Value) -> Result<String, FetchError> {
        let headers = vec![
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];

        let body = self
            .transport
            .post_json(&self.endpoint, &headers, body)
            .await?
            .into_success_body()?;

        let response: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| {
                FetchError::permanent(None, format!("Failed to parse Claude response: {}", e))
            })?;

        if let Some(usage) = &response.usage {
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = response.stop_reason.as_deref().unwrap_or(""),
                "Claude call complete"
            );
        }

        let text = response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(text)
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let body = serde_json::to_value(MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: request.system.as_deref(),
            messages: &request.messages,
        })
        .map_err(|e| {
            FetchError::permanent(None, format!("Failed to encode Claude request: {}", e))
        })?;
        let body = &body;

        let result = with_retry(&self.retry, cancel, "claude", move || self.send_once(body)).await;
        metrics::record_llm_call(result.is_ok());
        result
    }
}
