//! Dispatcher ("horde") HTTP client: pop for jobs, submit completions, and
//! feed pop-latency telemetry into [`Stats`].

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use reqwest::StatusCode;
use tokio::time::sleep;

use crate::{
    bridge_data::BridgeData,
    job::{Job, JobPayload},
    prelude::*,
    stats::Stats,
};

/// Identifies this worker implementation to the dispatcher.
pub const BRIDGE_AGENT: &str = concat!("bridge-worker:", env!("CARGO_PKG_VERSION"), ":unknown");

/// HTTP statuses worth retrying a submit on, beyond transport-level errors.
const RETRYABLE_SUBMIT_STATUSES: [StatusCode; 5] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Why a submit ultimately failed, after exhausting retries.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("dispatcher rejected submit with status {0}")]
    Status(StatusCode),
    #[error("dispatcher submit failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// What a successful submit call tells us.
#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    /// Kudos reward earned (0 for an already-known job).
    pub reward: f64,
    /// The dispatcher username, if this response happened to include one.
    pub username: Option<String>,
}

/// Pull a `username` field out of a pop/submit response body, if present.
fn extract_username(body: &Value) -> Option<String> {
    body.get("username").and_then(Value::as_str).map(str::to_string)
}

/// HTTP client for the dispatcher's pop/submit protocol. Shares one
/// `reqwest::Client` (and its connection pool, and the dispatcher
/// credential) across every worker in the process.
#[derive(Clone, Debug)]
pub struct DispatcherClient {
    client: reqwest::Client,
    horde_url: String,
    api_key: String,
    /// Rate-limits the "no work available" status line. Kept as a field
    /// rather than a module global, so it scopes to one dispatcher client
    /// (and thus, in practice, one process) instead of leaking across tests.
    last_no_work_log: std::sync::Arc<Mutex<Option<Instant>>>,
}

impl DispatcherClient {
    /// Build a new client for a given dispatcher base URL and credential.
    pub fn new(client: reqwest::Client, horde_url: String, api_key: String) -> Self {
        Self {
            client,
            horde_url,
            api_key,
            last_no_work_log: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    fn pop_body(&self, bridge_data: &BridgeData) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("name".to_string(), Value::String(bridge_data.worker_name.clone()));
        body.insert(
            "models".to_string(),
            json!([bridge_data.advertised_model_name()]),
        );
        body.insert("max_length".to_string(), Value::from(bridge_data.max_length));
        body.insert(
            "max_context_length".to_string(),
            Value::from(bridge_data.max_context_length),
        );
        body.insert(
            "priority_usernames".to_string(),
            json!(bridge_data.priority_usernames),
        );
        body.insert("threads".to_string(), Value::from(bridge_data.max_threads));
        body.insert("bridge_agent".to_string(), Value::String(BRIDGE_AGENT.to_string()));
        if let Some(model_id) = &bridge_data.upstream_model_id {
            if let Some(softprompts) = bridge_data.softprompts.get(model_id) {
                if !softprompts.is_empty() {
                    body.insert("softprompts".to_string(), json!(softprompts));
                }
            }
        }
        Value::Object(body)
    }

    /// Poll the dispatcher once. Returns `None` on any error, on "no work
    /// available", or on a malformed response; each case sleeps an
    /// appropriate backoff before returning so callers can just loop. Learns
    /// `bridge_data.username` from the response whenever the dispatcher
    /// includes one.
    #[instrument(level = "debug", skip_all, fields(worker = %bridge_data.worker_name))]
    pub async fn pop(&self, bridge_data: &mut BridgeData, stats: &Stats) -> Option<Job> {
        let body = self.pop_body(bridge_data);
        let started = Instant::now();
        let result = self
            .client
            .post(format!("{}/api/v2/generate/text/pop", self.horde_url))
            .header("apikey", &self.api_key)
            .timeout(Duration::from_secs(40))
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(error) if error.is_connect() => {
                warn!("could not connect to dispatcher: {error}");
                sleep(Duration::from_secs(10)).await;
                return None;
            }
            Err(error) if error.is_timeout() => {
                warn!("dispatcher pop timed out: {error}");
                sleep(Duration::from_secs(2)).await;
                return None;
            }
            Err(error) => {
                warn!("dispatcher pop failed: {error}");
                sleep(Duration::from_secs(10)).await;
                return None;
            }
        };

        let node = response
            .headers()
            .get("horde-node")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        stats.record_pop_latency(node.as_deref(), started.elapsed());

        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                warn!("could not decode dispatcher pop response: {error}");
                sleep(Duration::from_secs(2)).await;
                return None;
            }
        };

        if !status.is_success() {
            let message = body.get("message").and_then(Value::as_str).unwrap_or("");
            let errors = body.get("errors");
            warn!(%status, message, ?errors, "dispatcher pop rejected");
            sleep(Duration::from_secs(2)).await;
            return None;
        }

        if let Some(username) = extract_username(&body) {
            bridge_data.username = Some(username);
        }

        let Some(id) = body.get("id").and_then(Value::as_str) else {
            self.report_no_work(bridge_data, stats);
            return None;
        };

        let Some(raw_payload) = body.get("payload").cloned() else {
            warn!("dispatcher pop response had an id but no payload");
            return None;
        };

        Some(Job::new(id.to_string(), payload_from_json(raw_payload)))
    }

    /// Emit a rate-limited "nothing to do" status line.
    fn report_no_work(&self, bridge_data: &BridgeData, stats: &Stats) {
        let now = Instant::now();
        let mut last = self.last_no_work_log.lock().expect("mutex poisoned");
        if last.is_some_and(|at| now.duration_since(at) < Duration::from_secs(5)) {
            return;
        }
        *last = Some(now);
        drop(last);

        let waiting_since = stats
            .time_since_last_job()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "never".to_string());
        let running_elsewhere: u32 = stats
            .running_models()
            .iter()
            .filter(|(name, _)| **name != bridge_data.worker_name)
            .map(|(_, running)| *running)
            .sum();
        info!(
            worker = %bridge_data.worker_name,
            kudos_per_hour = stats.kudos_per_hour(),
            jobs_per_hour = stats.jobs_per_hour(),
            waiting_since,
            running_elsewhere,
            "no work available from dispatcher"
        );
    }

    /// Submit a finished job's result, retrying transient failures up to 3
    /// times, 1 second apart. A 404 means the dispatcher already knows about
    /// this job, which we treat as success.
    #[instrument(level = "debug", skip_all, fields(id = %job.id))]
    pub async fn submit(&self, job: &Job) -> Result<SubmitOutcome, SubmitError> {
        let payload = job.submit_payload();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(format!("{}/api/v2/generate/text/submit", self.horde_url))
                .header("apikey", &self.api_key)
                .timeout(Duration::from_secs(30))
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        debug!("job already submitted, treating as success");
                        return Ok(SubmitOutcome {
                            reward: 0.0,
                            username: None,
                        });
                    }
                    if status.is_success() {
                        let body: Value = response.json().await.unwrap_or_default();
                        let reward = body.get("reward").and_then(Value::as_f64).unwrap_or(0.0);
                        let username = extract_username(&body);
                        return Ok(SubmitOutcome { reward, username });
                    }
                    if RETRYABLE_SUBMIT_STATUSES.contains(&status) && attempt < 3 {
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return Err(SubmitError::Status(status));
                }
                Err(error) => {
                    if attempt < 3 {
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return Err(SubmitError::Transport(error));
                }
            }
        }
    }
}

fn payload_from_json(raw: Value) -> JobPayload {
    let prompt = raw
        .get("prompt")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let max_length = raw
        .get("max_length")
        .and_then(Value::as_u64)
        .unwrap_or(80) as u32;
    let temperature = raw.get("temperature").and_then(Value::as_f64).map(|v| v as f32);
    let top_p = raw.get("top_p").and_then(Value::as_f64).map(|v| v as f32);
    let stop_sequence = raw.get("stop_sequence").and_then(Value::as_array).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    });
    let frequency_penalty = raw
        .get("frequency_penalty")
        .and_then(Value::as_f64)
        .map(|v| v as f32);
    let presence_penalty = raw
        .get("presence_penalty")
        .and_then(Value::as_f64)
        .map(|v| v as f32);
    let softprompt = raw
        .get("softprompt")
        .and_then(Value::as_str)
        .map(str::to_string);

    JobPayload {
        prompt,
        max_length,
        temperature,
        top_p,
        stop_sequence,
        frequency_penalty,
        presence_penalty,
        softprompt,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_username_reads_the_field_when_present() {
        assert_eq!(
            extract_username(&json!({"id": "abc", "username": "db0#1"})),
            Some("db0#1".to_string())
        );
        assert_eq!(extract_username(&json!({"id": "abc"})), None);
    }

    #[test]
    fn payload_from_json_extracts_known_fields() {
        let raw = json!({
            "prompt": "hi",
            "max_length": 32,
            "temperature": 0.7,
        });
        let payload = payload_from_json(raw);
        assert_eq!(payload.prompt, "hi");
        assert_eq!(payload.max_length, 32);
        assert_eq!(payload.temperature, Some(0.7));
    }

    #[test]
    fn payload_from_json_defaults_missing_max_length() {
        let payload = payload_from_json(json!({"prompt": "hi"}));
        assert_eq!(payload.max_length, 80);
    }

    #[test]
    fn bridge_agent_carries_a_version() {
        assert!(BRIDGE_AGENT.contains("bridge-worker:"));
    }
}
