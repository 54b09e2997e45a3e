//! Per-worker runtime snapshot, derived from an (Endpoint, ModelEntry) pair.
//!
//! This is owned by exactly one [`Worker`](crate::worker::Worker); only that
//! worker's reload path mutates it. We model it as a plain value type rather
//! than something shared behind a lock, since nothing else needs to see it.

use std::{collections::HashMap, net::Ipv4Addr, str::FromStr};

use crate::{
    config::{AmbientSettings, Endpoint, EndpointType, ModelEntry},
    prelude::*,
};

/// A per-worker runtime snapshot.
#[derive(Clone, Debug)]
pub struct BridgeData {
    /// Unique worker name, from [`ModelEntry::name`].
    pub worker_name: String,

    /// Which kind of backend this worker talks to.
    pub api_type: EndpointType,

    /// Base URL of the dispatcher.
    pub horde_url: String,

    /// Dispatcher credential, shared by all workers.
    pub horde_api_key: String,

    /// Base URL of the backend.
    pub backend_url: String,

    /// Backend credential, if any.
    pub backend_api_key: Option<String>,

    /// The model id as configured. May be superseded by
    /// [`BridgeData::upstream_model_id`] once validated.
    pub backend_model: Option<String>,

    /// How many jobs this worker may run at once.
    pub max_threads: u32,

    /// Maximum generation length, in tokens.
    pub max_length: u32,

    /// Maximum context length, in tokens.
    pub max_context_length: u32,

    /// Usernames whose jobs this worker should prioritize.
    pub priority_usernames: Vec<String>,

    /// Whether to brand the advertised model name with `::username`.
    pub branded_model: bool,

    /// Whether this worker is willing to generate NSFW content.
    pub nsfw: bool,

    /// Model-family blacklist, rejected before ever reaching the backend.
    pub blacklist: Vec<String>,

    /// Set by the most recent readiness probe.
    pub available: bool,

    /// The upstream model id, as reported by the backend itself. For
    /// KoboldAI, this may differ from `backend_model` (which is unused for
    /// that endpoint type).
    pub upstream_model_id: Option<String>,

    /// KoboldAI softprompts available for the current model, keyed by
    /// upstream model id.
    pub softprompts: HashMap<String, Vec<String>>,

    /// The softprompt currently loaded on the backend, if any.
    pub current_softprompt: Option<String>,

    /// Dispatcher username, learned lazily from pop/submit responses.
    pub username: Option<String>,
}

impl BridgeData {
    /// Build a fresh snapshot from configuration. Call
    /// [`Worker::reload`](crate::worker::Worker) afterward to probe
    /// readiness.
    pub fn new(
        horde_url: String,
        horde_api_key: String,
        endpoint: &Endpoint,
        model: &ModelEntry,
        priority_usernames: Vec<String>,
        ambient: &AmbientSettings,
    ) -> Self {
        Self {
            worker_name: model.name.clone(),
            api_type: endpoint.r#type,
            horde_url,
            horde_api_key,
            backend_url: endpoint.url.clone(),
            backend_api_key: endpoint.api_key.clone(),
            backend_model: model.model.clone(),
            max_threads: model.max_threads,
            max_length: model.max_length,
            max_context_length: model.max_context_length,
            priority_usernames,
            branded_model: ambient.branded_model,
            nsfw: ambient.nsfw,
            blacklist: ambient.blacklist.clone(),
            available: false,
            upstream_model_id: None,
            softprompts: HashMap::new(),
            current_softprompt: None,
            username: None,
        }
    }

    /// The model identifier we actually advertise to the dispatcher.
    pub fn advertised_model_name(&self) -> String {
        let backend_model_id = self
            .upstream_model_id
            .as_deref()
            .or(self.backend_model.as_deref())
            .unwrap_or("unknown");
        let prefix = domain_prefix(&self.backend_url);
        let base = format!("{prefix}/{backend_model_id}");
        match (&self.username, self.branded_model) {
            (Some(username), true) => format!("{base}::{username}"),
            _ => base,
        }
    }
}

/// Derive the domain prefix the dispatcher uses to bucket models by
/// provider.
///
/// Empty input, `localhost`, and bare IPv4 addresses all map to the generic
/// `gridbridge` prefix, since there's no meaningful provider identity to
/// extract. Otherwise we look at the URL's host: strip a leading `www.`,
/// strip a leading `api.` (keeping the next label instead), strip a
/// trailing `.com`, and keep whatever's left of the first label. `openai` is
/// special-cased to stay `openai` rather than being affected by any of the
/// above.
pub fn domain_prefix(url: &str) -> String {
    const FALLBACK: &str = "gridbridge";

    if url.trim().is_empty() {
        return FALLBACK.to_string();
    }
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return FALLBACK.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return FALLBACK.to_string();
    };
    if host == "localhost" || Ipv4Addr::from_str(host).is_ok() {
        return FALLBACK.to_string();
    }

    let mut labels: Vec<&str> = host.split('.').collect();
    if labels.first() == Some(&"api") && labels.len() > 1 {
        labels.remove(0);
    }
    if labels.first() == Some(&"www") && labels.len() > 1 {
        labels.remove(0);
    }
    if labels.last() == Some(&"com") && labels.len() > 1 {
        labels.pop();
    }

    match labels.first() {
        Some(&"openai") => "openai".to_string(),
        Some(prefix) if !prefix.is_empty() => prefix.to_string(),
        _ => FALLBACK.to_string(),
    }
}

/// Normalize a KoboldAI-reported model id. Some KoboldAI forks report model
/// ids as `owner_model` instead of `owner/model`; we replace the first `_`
/// with `/` only when no `/` is already present.
pub fn normalize_koboldai_model_id(reported: &str) -> String {
    if reported.contains('/') {
        return reported.to_string();
    }
    match reported.find('_') {
        Some(index) => {
            let mut normalized = reported.to_string();
            normalized.replace_range(index..=index, "/");
            normalized
        }
        None => reported.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_prefix_scenarios() {
        let cases = [
            ("https://api.groq.com/openai/v1", "groq"),
            ("https://www.example.com/", "example"),
            ("http://127.0.0.1:2242", "gridbridge"),
            ("https://api.openai.com/v1", "openai"),
            ("", "gridbridge"),
            ("http://localhost:5000", "gridbridge"),
        ];
        for (url, expected) in cases {
            assert_eq!(domain_prefix(url), expected, "for url {url:?}");
        }
    }

    #[test]
    fn domain_prefix_is_idempotent_on_its_own_output() {
        // Running our derived prefix back through as if it were a bare host
        // shouldn't change it further.
        for url in ["https://api.groq.com/openai/v1", "https://www.example.com/"] {
            let once = domain_prefix(url);
            let twice = domain_prefix(&format!("https://{once}.com"));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn koboldai_model_id_normalization() {
        assert_eq!(normalize_koboldai_model_id("gpt2_large"), "gpt2/large");
        assert_eq!(normalize_koboldai_model_id("org/model"), "org/model");
        assert_eq!(normalize_koboldai_model_id("nounderscoreormodel"), "nounderscoreormodel");
    }
}
