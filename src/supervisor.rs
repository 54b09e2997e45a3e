//! Fans out one [`Worker`] per `(Endpoint, ModelEntry)` pair from a
//! [`Configuration`], and owns the process-wide shutdown signal.

use std::{sync::Arc, time::Duration};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{
    backends::{self, Backend},
    bridge_data::BridgeData,
    config::{AmbientSettings, Configuration, Endpoint, EndpointType},
    dispatcher::DispatcherClient,
    prelude::*,
    stats::Stats,
    ui::{ProgressConfig, Ui},
    worker::Worker,
};

/// How long we'll wait for a KoboldAI endpoint's TCP connect before treating
/// it as unreachable.
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds and runs every worker described by a [`Configuration`].
pub struct Supervisor {
    config: Configuration,
    client: reqwest::Client,
    cancellation: CancellationToken,
    ui: Ui,
}

impl Supervisor {
    /// Build a supervisor for a loaded configuration.
    pub fn new(config: Configuration, ui: Ui) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("could not construct HTTP client")?;
        Ok(Self {
            config,
            client,
            cancellation: CancellationToken::new(),
            ui,
        })
    }

    /// Start every worker, wait for a shutdown signal or for all workers to
    /// stop on their own, then report whether any worker failed.
    pub async fn run(self) -> Result<()> {
        let dispatcher = DispatcherClient::new(
            self.client.clone(),
            self.config.horde_url.clone(),
            self.config.api_key.clone(),
        );
        let stats = Stats::new();
        let ambient = AmbientSettings::from_env();

        let mut handles = Vec::new();
        for endpoint in &self.config.endpoints {
            if !endpoint_is_reachable(endpoint).await {
                warn!(endpoint = %endpoint.name, "skipping endpoint: not reachable");
                continue;
            }

            let backend: Arc<dyn Backend> =
                Arc::from(backends::create_backend(self.client.clone(), endpoint.r#type));

            for model in &endpoint.models {
                let bridge_data = BridgeData::new(
                    self.config.horde_url.clone(),
                    self.config.api_key.clone(),
                    endpoint,
                    model,
                    self.config.priority_usernames.clone(),
                    &ambient,
                );
                let spinner = self.ui.new_spinner(&ProgressConfig {
                    emoji: "",
                    msg: &model.name,
                    done_msg: "stopped",
                });
                let worker = Worker::new(
                    bridge_data,
                    Arc::clone(&backend),
                    dispatcher.clone(),
                    stats.clone(),
                    self.config.queue_size,
                    self.cancellation.clone(),
                    Some(spinner),
                );
                info!(worker = %model.name, status = "joining horde");
                handles.push(tokio::spawn(worker.run()));
            }
        }

        if handles.is_empty() {
            warn!("no workers started; configuration yielded no reachable endpoints");
        }

        let shutdown_token = self.cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
                shutdown_token.cancel();
            }
        });

        let mut any_failed = false;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    error!("worker exited with failure: {error:#}");
                    any_failed = true;
                }
                Err(join_error) => {
                    error!("worker task panicked: {join_error}");
                    any_failed = true;
                }
            }
        }

        if any_failed {
            Err(anyhow!("one or more workers reported failure"))
        } else {
            Ok(())
        }
    }
}

/// Should we even attempt to start workers for this endpoint?
async fn endpoint_is_reachable(endpoint: &Endpoint) -> bool {
    match endpoint.r#type {
        EndpointType::Openai => endpoint.api_key.as_deref().is_some_and(|key| !key.is_empty()),
        EndpointType::Koboldai => tcp_host_reachable(&endpoint.url).await,
    }
}

async fn tcp_host_reachable(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(80);
    matches!(
        tokio::time::timeout(REACHABILITY_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEntry;

    fn openai_endpoint(api_key: Option<&str>) -> Endpoint {
        Endpoint {
            r#type: EndpointType::Openai,
            name: "main".to_string(),
            url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.map(str::to_string),
            models: vec![ModelEntry {
                name: "worker-1".to_string(),
                model: Some("gpt-3.5-turbo".to_string()),
                max_threads: 1,
                max_length: 80,
                max_context_length: 1024,
            }],
        }
    }

    #[tokio::test]
    async fn openai_endpoint_without_api_key_is_unreachable() {
        assert!(!endpoint_is_reachable(&openai_endpoint(None)).await);
        assert!(endpoint_is_reachable(&openai_endpoint(Some("sk-test"))).await);
    }

    #[tokio::test]
    async fn koboldai_endpoint_on_a_closed_port_is_unreachable() {
        let endpoint = Endpoint {
            r#type: EndpointType::Koboldai,
            name: "local".to_string(),
            url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            models: vec![],
        };
        assert!(!endpoint_is_reachable(&endpoint).await);
    }
}
