//! Configuration ingestion: the modern `endpoints:` schema, legacy-schema
//! upconversion, and the recognized environment-variable overrides.

use serde::Deserialize;

use crate::prelude::*;

/// What kind of server an [`Endpoint`] talks to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// An OpenAI-compatible chat completions API (also LiteLLM, Ollama, etc).
    Openai,
    /// A KoboldAI-compatible text generation API.
    Koboldai,
}

/// One advertised model, worth one [`Worker`](crate::worker::Worker).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelEntry {
    /// Worker name, unique per process.
    pub name: String,

    /// Backend model id. Required for `openai` endpoints.
    #[serde(default)]
    pub model: Option<String>,

    /// How many jobs this worker may run at once.
    pub max_threads: u32,

    /// Maximum generation length, in tokens.
    pub max_length: u32,

    /// Maximum context length, in tokens.
    pub max_context_length: u32,
}

/// A backend language-model server, which may host multiple models.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Endpoint {
    /// What kind of server this is.
    pub r#type: EndpointType,

    /// A short human-readable name for this endpoint.
    pub name: String,

    /// Base URL of the backend server.
    pub url: String,

    /// API key for the backend. Required when `type` is `openai`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Models hosted at this endpoint.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl Endpoint {
    /// Sanity-check this endpoint against the constraints in our data model.
    pub fn validate(&self) -> Result<()> {
        if self.r#type == EndpointType::Openai
            && self.api_key.as_deref().unwrap_or_default().is_empty()
        {
            return Err(anyhow!(
                "endpoint {:?} is type `openai` but has no api_key",
                self.name
            ));
        }
        for model in &self.models {
            if self.r#type == EndpointType::Openai && model.model.is_none() {
                return Err(anyhow!(
                    "model {:?} on endpoint {:?} is type `openai` and requires `model`",
                    model.name,
                    self.name
                ));
            }
            if model.max_threads < 1 {
                return Err(anyhow!(
                    "model {:?} on endpoint {:?} must have max_threads >= 1",
                    model.name,
                    self.name
                ));
            }
            if model.max_length < 1 {
                return Err(anyhow!(
                    "model {:?} on endpoint {:?} must have max_length >= 1",
                    model.name,
                    self.name
                ));
            }
            if model.max_context_length < 1 {
                return Err(anyhow!(
                    "model {:?} on endpoint {:?} must have max_context_length >= 1",
                    model.name,
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// Fully-resolved configuration, ready to hand to the Supervisor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    /// Base URL of the dispatcher.
    pub horde_url: String,

    /// Dispatcher credential, shared by all workers.
    pub api_key: String,

    /// Pre-queue depth. Zero disables pre-queueing; jobs are started
    /// immediately after pop.
    #[serde(default)]
    pub queue_size: u32,

    /// Usernames whose jobs every worker in this process should prioritize.
    /// Sent verbatim in every pop request (§6).
    #[serde(default)]
    pub priority_usernames: Vec<String>,

    /// Backend endpoints, each advertising one or more models.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Configuration {
    /// Load configuration from a YAML file, upconverting legacy schemas and
    /// applying recognized environment-variable overrides.
    pub fn load(path: &Path) -> Result<Configuration> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file {path:?}"))?;
        Self::parse(&raw)
    }

    /// Parse configuration from a YAML string. Exposed separately from
    /// [`Configuration::load`] so tests don't need real files.
    pub fn parse(yaml: &str) -> Result<Configuration> {
        let raw: RawConfig = serde_yaml::from_str(yaml)
            .context("could not parse configuration as YAML")?;
        let mut config = raw.into_configuration()?;
        EnvOverrides::from_env().apply(&mut config);
        for endpoint in &config.endpoints {
            endpoint.validate()?;
        }
        Ok(config)
    }
}

/// The raw, possibly-legacy configuration document as it appears on disk.
#[derive(Clone, Debug, Default, Deserialize)]
struct RawConfig {
    horde_url: Option<String>,
    api_key: Option<String>,
    queue_size: Option<u32>,
    #[serde(default)]
    priority_usernames: Vec<String>,

    /// Modern schema.
    endpoints: Option<Vec<Endpoint>>,

    /// Legacy schema: a flat list of per-model workers, each carrying its own
    /// endpoint details.
    workers: Option<Vec<LegacyWorker>>,

    /// Legacy flat schema: a single implicit endpoint/model described by
    /// top-level fields.
    api_type: Option<String>,
    kai_url: Option<String>,
    openai_url: Option<String>,
    openai_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    max_threads: Option<u32>,
    #[serde(default)]
    max_length: Option<u32>,
    #[serde(default)]
    max_context_length: Option<u32>,
}

/// One entry in the legacy `workers:` list.
#[derive(Clone, Debug, Deserialize)]
struct LegacyWorker {
    name: String,
    #[serde(default)]
    model: Option<String>,
    api_type: String,
    url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    max_threads: Option<u32>,
    #[serde(default)]
    max_length: Option<u32>,
    #[serde(default)]
    max_context_length: Option<u32>,
}

fn parse_endpoint_type(s: &str) -> Result<EndpointType> {
    match s {
        "openai" => Ok(EndpointType::Openai),
        "koboldai" | "kobold_ai" | "kai" => Ok(EndpointType::Koboldai),
        other => Err(anyhow!("unknown endpoint type {other:?}")),
    }
}

impl RawConfig {
    /// Upconvert whichever schema we found into the modern `endpoints:`
    /// shape. We never branch downstream on which schema was used; by the
    /// time this returns, it's all [`Configuration`].
    fn into_configuration(self) -> Result<Configuration> {
        let horde_url = self.horde_url.clone().unwrap_or_default();
        let api_key = self.api_key.clone().unwrap_or_default();
        let queue_size = self.queue_size.unwrap_or(0);
        let priority_usernames = self.priority_usernames.clone();

        if let Some(endpoints) = self.endpoints {
            return Ok(Configuration {
                horde_url,
                api_key,
                queue_size,
                priority_usernames,
                endpoints,
            });
        }

        if let Some(workers) = self.workers {
            // Group legacy workers by (api_type, url, api_key) so that
            // models sharing a backend end up on the same Endpoint.
            let mut grouped: Vec<Endpoint> = vec![];
            for worker in workers {
                let r#type = parse_endpoint_type(&worker.api_type)?;
                let existing = grouped.iter_mut().find(|e| {
                    e.r#type == r#type
                        && e.url == worker.url
                        && e.api_key == worker.api_key
                });
                let model = ModelEntry {
                    name: worker.name,
                    model: worker.model,
                    max_threads: worker.max_threads.unwrap_or(1),
                    max_length: worker.max_length.unwrap_or(80),
                    max_context_length: worker.max_context_length.unwrap_or(1024),
                };
                if let Some(endpoint) = existing {
                    endpoint.models.push(model);
                } else {
                    grouped.push(Endpoint {
                        r#type,
                        name: format!("{}-{}", worker_type_label(r#type), grouped.len()),
                        url: worker.url,
                        api_key: worker.api_key,
                        models: vec![model],
                    });
                }
            }
            return Ok(Configuration {
                horde_url,
                api_key,
                queue_size,
                priority_usernames,
                endpoints: grouped,
            });
        }

        if let Some(api_type) = self.api_type {
            let r#type = parse_endpoint_type(&api_type)?;
            let url = match r#type {
                EndpointType::Openai => self.openai_url.unwrap_or_default(),
                EndpointType::Koboldai => self.kai_url.unwrap_or_default(),
            };
            let backend_api_key = match r#type {
                EndpointType::Openai => self.openai_key,
                EndpointType::Koboldai => None,
            };
            let model = ModelEntry {
                name: self.name.unwrap_or_else(|| "worker-0".to_string()),
                model: self.model,
                max_threads: self.max_threads.unwrap_or(1),
                max_length: self.max_length.unwrap_or(80),
                max_context_length: self.max_context_length.unwrap_or(1024),
            };
            return Ok(Configuration {
                horde_url,
                api_key,
                queue_size,
                priority_usernames,
                endpoints: vec![Endpoint {
                    r#type,
                    name: worker_type_label(r#type).to_string(),
                    url,
                    api_key: backend_api_key,
                    models: vec![model],
                }],
            });
        }

        // No endpoints of any kind: this is a degenerate (but valid)
        // configuration with no workers to run.
        Ok(Configuration {
            horde_url,
            api_key,
            queue_size,
            priority_usernames,
            endpoints: vec![],
        })
    }
}

fn worker_type_label(r#type: EndpointType) -> &'static str {
    match r#type {
        EndpointType::Openai => "openai",
        EndpointType::Koboldai => "koboldai",
    }
}

/// Recognized environment-variable overrides. These are applied uniformly
/// across every model entry that doesn't already set the corresponding
/// field explicitly in the configuration file.
#[derive(Clone, Debug, Default)]
struct EnvOverrides {
    horde_url: Option<String>,
    api_key: Option<String>,
    queue_size: Option<u32>,
    max_length: Option<u32>,
    max_context_length: Option<u32>,
    branded_model: Option<bool>,
    nsfw: Option<bool>,
    blacklist: Option<Vec<String>>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            horde_url: env_string("HORDE_URL"),
            api_key: env_string("API_KEY"),
            queue_size: env_parsed("QUEUE_SIZE"),
            max_length: env_parsed("HORDE_MAX_LENGTH"),
            max_context_length: env_parsed("HORDE_MAX_CONTEXT_LENGTH"),
            branded_model: env_bool("HORDE_BRANDED_MODEL"),
            nsfw: env_bool("HORDE_NSFW"),
            blacklist: env_string("HORDE_BLACKLIST")
                .map(|s| s.split(',').map(str::trim).map(str::to_string).collect()),
        }
    }

    fn apply(&self, config: &mut Configuration) {
        if let Some(horde_url) = &self.horde_url {
            config.horde_url = horde_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api_key = api_key.clone();
        }
        if let Some(queue_size) = self.queue_size {
            config.queue_size = queue_size;
        }
        // `HORDE_MAX_LENGTH`/`HORDE_MAX_CONTEXT_LENGTH` apply uniformly to
        // every model entry, overriding whatever the configuration file said.
        // This matches how the dispatcher-facing environment variables are
        // meant to be used: as a blunt, process-wide override, not a
        // per-model default.
        if let Some(max_length) = self.max_length {
            for endpoint in &mut config.endpoints {
                for model in &mut endpoint.models {
                    model.max_length = max_length;
                }
            }
        }
        if let Some(max_context_length) = self.max_context_length {
            for endpoint in &mut config.endpoints {
                for model in &mut endpoint.models {
                    model.max_context_length = max_context_length;
                }
            }
        }
    }

    /// Is the branded-model flag set?
    pub fn branded_model(&self) -> bool {
        self.branded_model.unwrap_or(false)
    }
}

/// Ambient settings read once at startup, derived from [`EnvOverrides`] but
/// kept separate from [`Configuration`] because they describe *this
/// process's* behavior rather than anything sent to the dispatcher.
#[derive(Clone, Debug)]
pub struct AmbientSettings {
    pub branded_model: bool,
    pub nsfw: bool,
    pub blacklist: Vec<String>,
}

impl AmbientSettings {
    pub fn from_env() -> Self {
        let overrides = EnvOverrides::from_env();
        Self {
            branded_model: overrides.branded_model(),
            nsfw: overrides.nsfw.unwrap_or(false),
            blacklist: overrides.blacklist.clone().unwrap_or_default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_usernames_are_parsed() {
        let yaml = r#"
            horde_url: https://horde.example.com
            api_key: secret
            priority_usernames: ["db0#1", "anon#2"]
            endpoints:
              - type: koboldai
                name: main
                url: http://localhost:5000
        "#;
        let config = Configuration::parse(yaml).unwrap();
        assert_eq!(config.priority_usernames, vec!["db0#1", "anon#2"]);
    }

    #[test]
    fn modern_schema_round_trips() {
        let yaml = r#"
            horde_url: https://horde.example.com
            api_key: secret
            queue_size: 2
            endpoints:
              - type: openai
                name: main
                url: https://api.openai.com/v1
                api_key: sk-test
                models:
                  - name: worker-1
                    model: gpt-3.5-turbo
                    max_threads: 2
                    max_length: 80
                    max_context_length: 1024
        "#;
        let config = Configuration::parse(yaml).unwrap();
        assert_eq!(config.horde_url, "https://horde.example.com");
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].models[0].name, "worker-1");
    }

    #[test]
    fn legacy_workers_list_is_upconverted() {
        let yaml = r#"
            horde_url: https://horde.example.com
            api_key: secret
            workers:
              - name: worker-1
                api_type: koboldai
                url: http://localhost:5000
                max_threads: 1
              - name: worker-2
                api_type: koboldai
                url: http://localhost:5000
                max_threads: 1
        "#;
        let config = Configuration::parse(yaml).unwrap();
        assert_eq!(config.endpoints.len(), 1, "workers sharing a backend should be grouped");
        assert_eq!(config.endpoints[0].models.len(), 2);
    }

    #[test]
    fn legacy_flat_schema_is_upconverted() {
        let yaml = r#"
            horde_url: https://horde.example.com
            api_key: secret
            api_type: koboldai
            kai_url: http://localhost:5000
            name: worker-1
            max_threads: 1
        "#;
        let config = Configuration::parse(yaml).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].r#type, EndpointType::Koboldai);
    }

    #[test]
    fn openai_endpoint_without_api_key_is_rejected() {
        let yaml = r#"
            horde_url: https://horde.example.com
            api_key: secret
            endpoints:
              - type: openai
                name: main
                url: https://api.openai.com/v1
                models:
                  - name: worker-1
                    model: gpt-3.5-turbo
                    max_threads: 1
                    max_length: 80
                    max_context_length: 1024
        "#;
        let err = Configuration::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }
}
