//! OpenAI-compatible LLM provider implementation.
//!
//! Talks to any endpoint that implements the OpenAI Chat Completions API:
//! OpenAI itself, local servers (LM Studio, Ollama, vLLM) or proxies.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ResponseFormat,
};
use crate::util::floor_char_boundary;

/// Provider name constant to avoid magic strings.
const PROVIDER_NAME: &str = "openai_compatible";

/// OpenAI-compatible Chat Completions API provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: LlmConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("Failed to build reqwest client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    /// Construct API URL for a given path.
    /// Strips a trailing `/v1` from base_url to avoid doubling it.
    fn api_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{}/v1/{}", base, path.trim_start_matches('/'))
    }

    async fn send_request(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let url = self.api_url("chat/completions");

        tracing::debug!(model = %body.model, messages = body.messages.len(), "Sending chat completion to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let response_text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER_NAME.to_string(),
            reason: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: PROVIDER_NAME.to_string(),
                },
                429 => LlmError::RateLimited {
                    provider: PROVIDER_NAME.to_string(),
                    retry_after,
                },
                _ => LlmError::RequestFailed {
                    provider: PROVIDER_NAME.to_string(),
                    reason: format!("HTTP {}: {}", status, snippet(&response_text)),
                },
            });
        }

        serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER_NAME.to_string(),
            reason: format!("JSON parse error: {}. Raw: {}", e, snippet(&response_text)),
        })
    }
}

fn snippet(text: &str) -> &str {
    &text[..floor_char_boundary(text, 200)]
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: req.messages,
            response_format: match req.response_format {
                ResponseFormat::Text => None,
                ResponseFormat::JsonObject => Some(ApiResponseFormat {
                    format_type: "json_object",
                }),
            },
        };

        let response = self.send_request(&request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: "No choices in response".to_string(),
            })?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
        })
    }
}

// OpenAI-compatible Chat Completions API types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ApiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ApiResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: ChatCompletionUsage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use secrecy::SecretString;

    use super::*;

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            api_key: SecretString::from("sk-test".to_string()),
            base_url: base_url.to_string(),
            model: "gpt-test".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    async fn serve(router: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_api_url_strips_v1() {
        let provider = OpenAiCompatibleProvider::new(config("https://api.openai.com/v1/")).unwrap();
        assert_eq!(
            provider.api_url("chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        let provider = OpenAiCompatibleProvider::new(config("http://localhost:11434")).unwrap();
        assert_eq!(
            provider.api_url("/chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_request_serializes_json_mode() {
        let request = ChatCompletionRequest {
            model: "gpt-test".to_string(),
            messages: vec![ChatMessage::user("hi")],
            response_format: Some(ApiResponseFormat {
                format_type: "json_object",
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn test_complete_against_local_server() {
        let router = axum::Router::new().route(
            "/v1/chat/completions",
            post(
                |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(
                        headers.get("authorization").and_then(|v| v.to_str().ok()),
                        Some("Bearer sk-test")
                    );
                    assert_eq!(body["response_format"]["type"], "json_object");
                    Json(serde_json::json!({
                        "id": "cmpl-1",
                        "choices": [{
                            "message": {"role": "assistant", "content": "{\"tool_name\":\"finish_task\",\"args\":{}}"},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 12, "completion_tokens": 7}
                    }))
                },
            ),
        );
        let addr = serve(router).await;

        let provider = OpenAiCompatibleProvider::new(config(&format!("http://{addr}"))).unwrap();
        let resp = provider
            .complete(CompletionRequest::new(vec![ChatMessage::user("go")]).json())
            .await
            .unwrap();
        assert!(resp.content.contains("finish_task"));
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!((resp.input_tokens, resp.output_tokens), (12, 7));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let router = axum::Router::new()
            .route(
                "/auth/v1/chat/completions",
                post(|| async { (StatusCode::UNAUTHORIZED, "nope") }),
            )
            .route(
                "/limited/v1/chat/completions",
                post(|| async {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("retry-after", "3")],
                        "slow down",
                    )
                }),
            )
            .route(
                "/broken/v1/chat/completions",
                post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
            );
        let addr = serve(router).await;
        let request = || CompletionRequest::new(vec![ChatMessage::user("go")]);

        let provider =
            OpenAiCompatibleProvider::new(config(&format!("http://{addr}/auth"))).unwrap();
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }), "got: {err}");

        let provider =
            OpenAiCompatibleProvider::new(config(&format!("http://{addr}/limited"))).unwrap();
        let err = provider.complete(request()).await.unwrap_err();
        assert!(
            matches!(err, LlmError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(3)),
            "got: {err}"
        );

        let provider =
            OpenAiCompatibleProvider::new(config(&format!("http://{addr}/broken"))).unwrap();
        let err = provider.complete(request()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("upstream down"), "Should include body: {msg}");
    }
}
