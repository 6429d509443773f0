use crate::config::BackendConfig;
use crate::llm::LlmError;
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("backend '{0}' is not registered or not enabled")]
    NotFound(String),
}

/// Result of one liveness probe. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    pub key: String,
    pub healthy: bool,
}

/// A backend as shown to callers choosing where to send a question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub key: String,
    pub display_name: String,
    pub model: String,
    pub description: Option<String>,
    /// False for the placeholder listed when no backend is enabled.
    pub registered: bool,
    pub healthy: bool,
}

/// Immutable catalog of configured backends.
pub struct BackendRegistry {
    backends: Vec<BackendConfig>,
    default_key: String,
    probe_client: reqwest::Client,
}

impl BackendRegistry {
    /// Fails when the probe client cannot be built; a client without the
    /// probe timeout is never substituted.
    pub fn new(
        backends: Vec<BackendConfig>,
        default_key: String,
        probe_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let probe_client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            backends,
            default_key,
            probe_client,
        })
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn list_enabled(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.enabled).collect()
    }

    pub fn resolve(&self, key: &str) -> Result<&BackendConfig, RegistryError> {
        self.backends
            .iter()
            .find(|b| b.enabled && b.key == key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Resolves `key`, substituting the default for unknown or disabled keys.
    ///
    /// Callers can only ever reach configured endpoints this way.
    pub fn resolve_or_default(&self, key: &str) -> Result<&BackendConfig, RegistryError> {
        match self.resolve(key) {
            Ok(backend) => Ok(backend),
            Err(_) => {
                if !key.is_empty() {
                    warn!(
                        "Unknown or disabled backend '{}', using default '{}'",
                        key, self.default_key
                    );
                }
                self.resolve(&self.default_key)
            }
        }
    }

    /// Lists the models endpoint; true only on a success status.
    pub async fn probe(&self, backend: &BackendConfig) -> BackendHealth {
        let url = format!("{}/models", backend.endpoint.trim_end_matches('/'));

        let mut request = self.probe_client.get(&url);
        if let Some(api_key) = &backend.api_key {
            request = request.bearer_auth(api_key);
        }

        let healthy = match request.send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    debug!("Probe of {} returned {}", url, response.status());
                }
                ok
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                false
            }
        };

        BackendHealth {
            key: backend.key.clone(),
            healthy,
        }
    }

    /// Enabled backends, each freshly probed.
    ///
    /// With nothing enabled a single unregistered placeholder for the
    /// default key is returned so callers always have something to show.
    pub async fn statuses(&self) -> Vec<BackendStatus> {
        let enabled = self.list_enabled();
        if enabled.is_empty() {
            return vec![BackendStatus {
                key: self.default_key.clone(),
                display_name: self.default_key.clone(),
                model: String::new(),
                description: None,
                registered: false,
                healthy: false,
            }];
        }

        // Probed together so one dead backend does not delay the rest.
        let health = join_all(enabled.iter().map(|backend| self.probe(backend))).await;

        enabled
            .into_iter()
            .zip(health)
            .map(|(backend, health)| BackendStatus {
                key: backend.key.clone(),
                display_name: backend.display_name.clone(),
                model: backend.model.clone(),
                description: backend.description.clone(),
                registered: true,
                healthy: health.healthy,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn backend(key: &str, endpoint: &str, enabled: bool) -> BackendConfig {
        BackendConfig {
            key: key.to_string(),
            display_name: key.to_uppercase(),
            endpoint: endpoint.to_string(),
            model: format!("{key}-model"),
            max_tokens: 4096,
            enabled,
            api_key: None,
            description: None,
        }
    }

    fn registry(backends: Vec<BackendConfig>) -> BackendRegistry {
        BackendRegistry::new(backends, "main".to_string(), Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn test_resolve_only_enabled_backends() {
        let registry = registry(vec![
            backend("main", "http://127.0.0.1:1/v1", true),
            backend("spare", "http://127.0.0.1:1/v1", false),
        ]);

        assert_eq!(registry.resolve("main").unwrap().key, "main");
        assert_eq!(
            registry.resolve("spare"),
            Err(RegistryError::NotFound("spare".to_string()))
        );
        assert_eq!(registry.list_enabled().len(), 1);
    }

    #[test]
    fn test_unknown_key_falls_back_to_default() {
        let registry = registry(vec![
            backend("main", "http://127.0.0.1:1/v1", true),
            backend("spare", "http://127.0.0.1:1/v1", false),
        ]);

        assert_eq!(registry.resolve_or_default("http://evil.example").unwrap().key, "main");
        assert_eq!(registry.resolve_or_default("spare").unwrap().key, "main");
        assert_eq!(registry.resolve_or_default("").unwrap().key, "main");
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint_is_unhealthy() {
        let registry = registry(vec![]);
        let started = Instant::now();

        let health = registry.probe(&backend("down", "http://127.0.0.1:1/v1", true)).await;

        assert!(!health.healthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_silent_server_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let registry = registry(vec![]);
        let started = Instant::now();
        let health = registry
            .probe(&backend("slow", &format!("http://{addr}/v1"), true))
            .await;

        assert!(!health.healthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_statuses_probe_each_enabled_backend() {
        let router = Router::new().route(
            "/v1/models",
            get(|| async { Json(serde_json::json!({"data": []})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let registry = registry(vec![
            backend("main", &format!("http://{addr}/v1/"), true),
            backend("down", "http://127.0.0.1:1/v1", true),
            backend("off", "http://127.0.0.1:1/v1", false),
        ]);
        let statuses = registry.statuses().await;

        let summary: Vec<(&str, bool, bool)> = statuses
            .iter()
            .map(|s| (s.key.as_str(), s.registered, s.healthy))
            .collect();
        assert_eq!(summary, vec![("main", true, true), ("down", true, false)]);
    }

    #[tokio::test]
    async fn test_statuses_placeholder_when_nothing_enabled() {
        let registry = registry(vec![backend("off", "http://127.0.0.1:1/v1", false)]);
        let statuses = registry.statuses().await;

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].key, "main");
        assert!(!statuses[0].registered);
    }
}
