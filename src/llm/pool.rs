use crate::config::{BackendConfig, GatewayConfig};
use crate::llm::providers::openai::OpenAiCompatClient;
use crate::llm::{ChatClient, ClientSettings, LlmError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// What a client is used for. Each purpose gets its own token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Generation,
    Report,
}

/// Builds a client for a backend. Swapped out in tests.
pub type ClientFactory =
    Arc<dyn Fn(&BackendConfig, &ClientSettings) -> Result<Arc<dyn ChatClient>, LlmError> + Send + Sync>;

/// Factory producing HTTP clients for OpenAI-compatible endpoints.
pub fn openai_factory() -> ClientFactory {
    Arc::new(|backend, settings| {
        let client = OpenAiCompatClient::new(backend, settings)?;
        Ok(Arc::new(client) as Arc<dyn ChatClient>)
    })
}

/// Lazily built clients, one per (purpose, backend key) for the process lifetime.
pub struct ClientPool {
    clients: Mutex<HashMap<(Purpose, String), Arc<dyn ChatClient>>>,
    factory: ClientFactory,
    generation_timeout: Duration,
    report_timeout: Duration,
    report_max_tokens: u32,
}

impl ClientPool {
    pub fn new(gateway: &GatewayConfig, factory: ClientFactory) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            factory,
            generation_timeout: gateway.generation_timeout(),
            report_timeout: gateway.report_timeout(),
            report_max_tokens: gateway.report_max_tokens,
        }
    }

    pub fn generation_client(&self, backend: &BackendConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
        self.get_or_create(Purpose::Generation, backend)
    }

    pub fn report_client(&self, backend: &BackendConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
        self.get_or_create(Purpose::Report, backend)
    }

    pub fn settings_for(&self, purpose: Purpose, backend: &BackendConfig) -> ClientSettings {
        match purpose {
            Purpose::Generation => ClientSettings {
                max_tokens: backend.max_tokens,
                timeout: self.generation_timeout,
            },
            Purpose::Report => ClientSettings {
                max_tokens: self.report_max_tokens.min(backend.max_tokens),
                timeout: self.report_timeout,
            },
        }
    }

    fn get_or_create(
        &self,
        purpose: Purpose,
        backend: &BackendConfig,
    ) -> Result<Arc<dyn ChatClient>, LlmError> {
        // Construction happens under the lock so concurrent first requests
        // for a key wait for the one client instead of building their own.
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        let cache_key = (purpose, backend.key.clone());
        if let Some(client) = clients.get(&cache_key) {
            return Ok(Arc::clone(client));
        }

        let settings = self.settings_for(purpose, backend);
        info!(
            "Creating {:?} client for backend '{}' (model {}, max_tokens {})",
            purpose, backend.key, backend.model, settings.max_tokens
        );
        let client = (self.factory)(backend, &settings)?;
        clients.insert(cache_key, Arc::clone(&client));
        Ok(client)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
