//! Our OpenAI-compatible backend, which also covers LiteLLM, Ollama and
//! similar gateways that speak the same chat-completions protocol.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::sleep;

use crate::{
    bridge_data::BridgeData,
    job::JobPayload,
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok, retry_result_transient},
};

use super::{Backend, GenerateOutput, GenerateRetryResult, StatusOutcome, classify_status};

/// Model id that needs the `max_completion_tokens`/system-message dance
/// instead of the ordinary chat-completions request shape.
const REASONING_MODEL_NEEDING_MAX_COMPLETION_TOKENS: &str = "o1-mini";

/// Our OpenAI-compatible backend.
#[derive(Debug)]
pub struct OpenAiBackend {
    client: reqwest::Client,
}

impl OpenAiBackend {
    /// Build a new backend on top of a shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    #[instrument(level = "debug", skip_all)]
    async fn validate(&self, bridge_data: &mut BridgeData) -> Result<()> {
        let api_key = bridge_data
            .backend_api_key
            .clone()
            .ok_or_else(|| anyhow!("openai endpoint requires an api_key"))?;
        let url = format!("{}/models", bridge_data.backend_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("could not reach openai-compatible /models endpoint")?;
        if !response.status().is_success() {
            bridge_data.available = false;
            return Err(anyhow!(
                "openai-compatible /models returned {}",
                response.status()
            ));
        }
        let body: Value = response
            .json()
            .await
            .context("could not parse /models response as JSON")?;

        if let Some(model) = &bridge_data.backend_model {
            let known = body
                .get("data")
                .and_then(Value::as_array)
                .map(|models| {
                    models
                        .iter()
                        .any(|m| m.get("id").and_then(Value::as_str) == Some(model.as_str()))
                })
                .unwrap_or(false);
            if !known {
                warn!(
                    model = %model,
                    "configured model not found in /models response; continuing anyway"
                );
            }
        }

        bridge_data.available = true;
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn generate(
        &self,
        bridge_data: &BridgeData,
        payload: &JobPayload,
    ) -> GenerateRetryResult {
        let Some(model) = bridge_data.backend_model.clone() else {
            return retry_result_fatal(anyhow!("no model configured for openai endpoint"));
        };
        let Some(api_key) = bridge_data.backend_api_key.clone() else {
            return retry_result_fatal(anyhow!("no api_key configured for openai endpoint"));
        };
        let is_reasoning_model = model == REASONING_MODEL_NEEDING_MAX_COMPLETION_TOKENS;

        let mut messages = Vec::new();
        if is_reasoning_model {
            messages.push(json!({"role": "system", "content": "You are a helpful assistant."}));
        }
        messages.push(json!({"role": "user", "content": payload.prompt}));

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), Value::String(model));
        body.insert("messages".to_string(), Value::Array(messages));
        if is_reasoning_model {
            body.insert(
                "max_completion_tokens".to_string(),
                Value::from(payload.max_length),
            );
        } else {
            body.insert("max_tokens".to_string(), Value::from(payload.max_length));
        }
        if let Some(temperature) = payload.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = payload.top_p {
            body.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(stop) = &payload.stop_sequence {
            body.insert("stop".to_string(), json!(stop));
        }
        if let Some(frequency_penalty) = payload.frequency_penalty {
            body.insert("frequency_penalty".to_string(), json!(frequency_penalty));
        }
        if let Some(presence_penalty) = payload.presence_penalty {
            body.insert("presence_penalty".to_string(), json!(presence_penalty));
        }

        let url = format!(
            "{}/chat/completions",
            bridge_data.backend_url.trim_end_matches('/')
        );
        let timeout = Duration::from_secs_f64(f64::from(payload.max_length) / 2.0 + 10.0);
        let send_result = self
            .client
            .post(&url)
            .bearer_auth(&api_key)
            .timeout(timeout)
            .json(&Value::Object(body))
            .send()
            .await;

        let response = match send_result {
            Ok(response) => response,
            Err(error) if error.is_timeout() || error.is_connect() => {
                debug!("Transient transport error calling openai backend: {error}");
                sleep(Duration::from_secs(3)).await;
                return retry_result_transient(anyhow::Error::from(error));
            }
            Err(error) => {
                return retry_result_fatal(anyhow::Error::from(error));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match classify_status(status) {
                StatusOutcome::RetryAfter(delay) => {
                    debug!(%status, "Retryable openai backend error: {body}");
                    sleep(delay).await;
                    retry_result_transient(anyhow!("openai backend returned {status}: {body}"))
                }
                StatusOutcome::Fault => {
                    retry_result_fatal(anyhow!("openai backend returned {status}: {body}"))
                }
            };
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                return retry_result_fatal(
                    anyhow::Error::from(error).context("could not parse openai response body"),
                );
            }
        };
        trace!(%body, "openai response");

        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str);
        let Some(content) = content else {
            return retry_result_fatal(anyhow!(
                "openai response missing choices[0].message.content: {body}"
            ));
        };

        retry_result_ok(GenerateOutput {
            text: content.to_string(),
            seed: 0,
            applied_softprompt: None,
        })
    }
}

/// Is this an openai-style auth failure, as opposed to a server error?
pub fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn o1_mini_is_recognized_as_a_reasoning_model() {
        assert_eq!(
            REASONING_MODEL_NEEDING_MAX_COMPLETION_TOKENS,
            "o1-mini"
        );
    }

    #[test]
    fn auth_failure_detection() {
        assert!(is_auth_failure(StatusCode::UNAUTHORIZED));
        assert!(is_auth_failure(StatusCode::FORBIDDEN));
        assert!(!is_auth_failure(StatusCode::BAD_REQUEST));
    }
}
