//! Backend clients: given a generation payload, return text or a classified
//! failure. We support two wire protocols behind one trait: OpenAI-compatible
//! chat completions, and KoboldAI-compatible text generation.

use std::{fmt, time::Duration};

use keen_retry::RetryResult;

use crate::{bridge_data::BridgeData, config::EndpointType, job::JobPayload, prelude::*};

pub mod koboldai;
pub mod openai;

/// A [`RetryResult`] for backend generation calls, distinguishing errors
/// worth retrying from ones that should fault the job immediately.
pub type GenerateRetryResult = RetryResult<(), (), GenerateOutput, anyhow::Error>;

/// Successful generation output.
#[derive(Clone, Debug)]
pub struct GenerateOutput {
    pub text: String,
    pub seed: u64,

    /// If this call swapped in a new KoboldAI softprompt, its id. The worker
    /// is responsible for recording this on `BridgeData` afterward, since
    /// `Backend::generate` only ever sees an immutable snapshot.
    pub applied_softprompt: Option<String>,
}

/// How an HTTP status from a backend should be handled.
#[derive(Clone, Copy, Debug)]
pub enum StatusOutcome {
    /// Retry after sleeping for this long.
    RetryAfter(Duration),
    /// Treat this as an unrecoverable fault.
    Fault,
}

/// Classify a non-2xx backend HTTP status, per our fixed backoff policy:
/// `429` gets a long cooldown (the server is asking us to slow down), `5xx`
/// gets a short one (transient overload), and everything else is a fault
/// (the request itself was wrong, so retrying won't help).
pub fn classify_status(status: reqwest::StatusCode) -> StatusOutcome {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        StatusOutcome::RetryAfter(Duration::from_secs(5))
    } else if status.is_server_error() {
        StatusOutcome::RetryAfter(Duration::from_secs(3))
    } else {
        StatusOutcome::Fault
    }
}

/// Interface shared by both backend implementations.
#[async_trait]
pub trait Backend: fmt::Debug + Send + Sync + 'static {
    /// Probe the backend for availability, updating `bridge_data` in place
    /// (e.g. `available`, `upstream_model_id`, `softprompts`).
    async fn validate(&self, bridge_data: &mut BridgeData) -> Result<()>;

    /// Run one generation attempt.
    async fn generate(
        &self,
        bridge_data: &BridgeData,
        payload: &JobPayload,
    ) -> GenerateRetryResult;
}

/// Instantiate the right [`Backend`] for an endpoint type, sharing one
/// `reqwest::Client` (and its connection pool) across every worker.
pub fn create_backend(client: reqwest::Client, api_type: EndpointType) -> Box<dyn Backend> {
    match api_type {
        EndpointType::Openai => Box::new(openai::OpenAiBackend::new(client)),
        EndpointType::Koboldai => Box::new(koboldai::KoboldAiBackend::new(client)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_backoff_policy() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            StatusOutcome::RetryAfter(d) if d == Duration::from_secs(5)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE),
            StatusOutcome::RetryAfter(d) if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY),
            StatusOutcome::Fault
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED),
            StatusOutcome::Fault
        ));
    }
}
