use std::time::Duration;

use keel_core::error::AppError;
use keel_core::traits::Inference;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a marketplace listing analyst. Follow the output format requested in each prompt exactly. When asked for JSON, respond with JSON only.";

/// OpenAI-compatible chat completion client.
///
/// Works with any OpenAI-compatible endpoint. Overload responses map to
/// retryable errors: 429 becomes [`AppError::RateLimitExceeded`], 408 and
/// 5xx become retryable [`AppError::InferenceError`]s.
#[derive(Clone)]
pub struct OpenAiInference {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
    temperature: Option<f32>,
}

impl OpenAiInference {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_INFERENCE_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let rebuilt = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        Ok(Self {
            system_prompt: self.system_prompt,
            temperature: self.temperature,
            ..rebuilt
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(api_key: &str, model: &str, base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: None,
        })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl Inference for OpenAiInference {
    async fn infer(&self, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: &self.system_prompt,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                tracing::warn!(model = %self.model, "Inference service rate limited the request");
                return Err(AppError::RateLimitExceeded);
            }

            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::InferenceError {
                message,
                status_code,
                retryable: status_code == 408 || status_code >= 500,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| AppError::InferenceError {
            message: format!("Failed to parse inference response: {e}"),
            status_code: status.as_u16(),
            retryable: true,
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AppError::InferenceError {
                message: "Empty response from inference service".into(),
                status_code: status.as_u16(),
                retryable: true,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::serve_once;

    fn client(base_url: &str) -> OpenAiInference {
        OpenAiInference::with_base_url("sk-test", "gpt-test", base_url).unwrap()
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let (base, server) = serve_once(
            "200 OK",
            &[("content-type", "application/json")],
            r#"{"choices":[{"message":{"role":"assistant","content":"[{\"relevance\":9}]"}}]}"#,
        )
        .await;

        let text = client(&format!("{base}/")).infer("rate these").await.unwrap();
        assert_eq!(text, r#"[{"relevance":9}]"#);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /chat/completions"));
        assert!(raw.to_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw.contains(r#""model":"gpt-test""#));
        assert!(raw.contains(r#""content":"rate these""#));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_rate_limit_error() {
        let (base, _server) = serve_once(
            "429 Too Many Requests",
            &[("content-type", "application/json")],
            r#"{"error":{"message":"slow down"}}"#,
        )
        .await;

        let err = client(&base).infer("x").await.unwrap_err();
        assert!(matches!(err, AppError::RateLimitExceeded));
        assert!(err.is_retryable());
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (base, _server) = serve_once(
            "503 Service Unavailable",
            &[("content-type", "application/json")],
            r#"{"error":{"message":"overloaded"}}"#,
        )
        .await;

        let err = client(&base).infer("x").await.unwrap_err();
        match &err {
            AppError::InferenceError {
                message,
                status_code,
                retryable,
            } => {
                assert_eq!(message, "overloaded");
                assert_eq!(*status_code, 503);
                assert!(*retryable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let (base, _server) = serve_once("401 Unauthorized", &[], "bad key").await;

        let err = client(&base).infer("x").await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("HTTP 401: bad key"));
    }

    #[tokio::test]
    async fn test_empty_content_is_retryable() {
        let (base, _server) = serve_once(
            "200 OK",
            &[("content-type", "application/json")],
            r#"{"choices":[{"message":{"content":null}}]}"#,
        )
        .await;

        let err = client(&base).infer("x").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_with_timeout_keeps_customisation() {
        let inference = OpenAiInference::new("k", "m")
            .unwrap()
            .with_system_prompt("custom")
            .with_temperature(0.2)
            .with_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(inference.system_prompt, "custom");
        assert_eq!(inference.temperature, Some(0.2));
        assert_eq!(inference.timeout_secs, 5);
    }
}
