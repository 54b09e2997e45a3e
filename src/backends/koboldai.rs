//! Our KoboldAI-compatible backend.

use std::time::Duration;

use tokio::time::sleep;

use crate::{
    bridge_data::{BridgeData, normalize_koboldai_model_id},
    job::JobPayload,
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok, retry_result_transient},
};

use super::{Backend, GenerateOutput, GenerateRetryResult, StatusOutcome, classify_status};

/// Our KoboldAI-compatible backend.
#[derive(Debug)]
pub struct KoboldAiBackend {
    client: reqwest::Client,
}

impl KoboldAiBackend {
    /// Build a new backend on top of a shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(&self, bridge_data: &BridgeData, path: &str) -> String {
        format!("{}{path}", bridge_data.backend_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Backend for KoboldAiBackend {
    #[instrument(level = "debug", skip_all)]
    async fn validate(&self, bridge_data: &mut BridgeData) -> Result<()> {
        let model_url = self.url(bridge_data, "/api/latest/model");
        let response = self
            .client
            .get(&model_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("could not reach KoboldAI /api/latest/model")?;
        if !response.status().is_success() {
            bridge_data.available = false;
            return Err(anyhow!(
                "KoboldAI /api/latest/model returned {}",
                response.status()
            ));
        }
        let body: Value = response
            .json()
            .await
            .context("could not parse KoboldAI /api/latest/model response")?;
        let reported = body
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("KoboldAI /api/latest/model response missing `result`"))?;
        let model_id = normalize_koboldai_model_id(reported);

        let soft_prompts_list_url = self.url(bridge_data, "/api/latest/config/soft_prompts_list");
        let soft_prompt_url = self.url(bridge_data, "/api/latest/config/soft_prompt");
        let mut softprompts: Vec<String> = Vec::new();
        if let Ok(response) = self
            .client
            .get(&soft_prompts_list_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            if response.status().is_success() {
                if let Ok(body) = response.json::<Value>().await {
                    softprompts = body
                        .get("values")
                        .and_then(Value::as_array)
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(|v| {
                                    v.get("value").and_then(Value::as_str).map(str::to_string)
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                }
            }
        }
        let mut current_softprompt = None;
        if let Ok(response) = self
            .client
            .get(&soft_prompt_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            if response.status().is_success() {
                if let Ok(body) = response.json::<Value>().await {
                    current_softprompt = body
                        .get("value")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                }
            }
        }

        bridge_data.upstream_model_id = Some(model_id.clone());
        bridge_data
            .softprompts
            .insert(model_id, softprompts);
        bridge_data.current_softprompt = current_softprompt;
        bridge_data.available = true;
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn generate(
        &self,
        bridge_data: &BridgeData,
        payload: &JobPayload,
    ) -> GenerateRetryResult {
        let mut applied_softprompt = None;
        if let Some(softprompt) = &payload.softprompt {
            if bridge_data.current_softprompt.as_deref() != Some(softprompt.as_str()) {
                let put_url = self.url(bridge_data, "/api/latest/config/soft_prompt");
                let result = self
                    .client
                    .put(&put_url)
                    .timeout(Duration::from_secs(10))
                    .json(&json!({"value": softprompt}))
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        sleep(Duration::from_secs(1)).await;
                        applied_softprompt = Some(softprompt.clone());
                    }
                    Ok(response) => {
                        return retry_result_fatal(anyhow!(
                            "could not set KoboldAI softprompt: {}",
                            response.status()
                        ));
                    }
                    Err(error) => {
                        return retry_result_fatal(anyhow::Error::from(error));
                    }
                }
            }
        }

        let generate_url = self.url(bridge_data, "/api/latest/generate");
        let send_result = self
            .client
            .post(&generate_url)
            .timeout(Duration::from_secs_f64(f64::from(payload.max_length) / 2.0 + 10.0))
            .json(&payload.raw)
            .send()
            .await;

        let response = match send_result {
            Ok(response) => response,
            Err(error) if error.is_timeout() || error.is_connect() => {
                debug!("Transient transport error calling koboldai backend: {error}");
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
                    debug!(%status, "Retryable (possibly \"busy\") koboldai backend error: {body}");
                    sleep(delay).await;
                    retry_result_transient(anyhow!("koboldai backend returned {status}: {body}"))
                }
                StatusOutcome::Fault => {
                    retry_result_fatal(anyhow!("koboldai backend returned {status}: {body}"))
                }
            };
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                return retry_result_fatal(
                    anyhow::Error::from(error).context("could not parse koboldai response body"),
                );
            }
        };
        trace!(%body, "koboldai response");

        let text = body
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|result| result.get("text"))
            .and_then(Value::as_str);
        let Some(text) = text else {
            return retry_result_fatal(anyhow!(
                "koboldai response missing results[0].text: {body}"
            ));
        };

        retry_result_ok(GenerateOutput {
            text: text.to_string(),
            seed: 0,
            applied_softprompt,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::bridge_data::normalize_koboldai_model_id;

    #[test]
    fn model_id_normalization_matches_backend_expectations() {
        assert_eq!(normalize_koboldai_model_id("gpt2_large"), "gpt2/large");
        assert_eq!(normalize_koboldai_model_id("org/model"), "org/model");
    }
}
