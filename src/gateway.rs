//! The generation, validation and execution pipeline behind one object.
//!
//! `Gateway` owns every piece of mutable shared state (client cache, ledger)
//! and bounds how many requests run against the backends and database at
//! once. Each operation returns a classified result; nothing here panics or
//! leaks backend and database error text to callers.

use crate::config::AppConfig;
use crate::db::{BoundedExecutor, ExecutionResult, ResultTable, SchemaContext};
use crate::error::{status_of, ErrorKind};
use crate::ledger::{HistoryEntry, QueryLedger, StatValues};
use crate::llm::models::GenerationResult;
use crate::llm::pool::{ClientFactory, ClientPool};
use crate::llm::prompts::PromptLibrary;
use crate::llm::registry::{BackendRegistry, BackendStatus};
use crate::llm::LlmError;
use crate::report::{self, NarrativeReport, ReportRequest};
use crate::sql::{extract_sql, statement_region, validate, Rejection};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

/// Question recorded for SQL run without a generating question.
pub const DIRECT_EXECUTION: &str = "(direct execution)";

/// Startup failures while assembling a gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("prompt template error: {0}")]
    Prompt(#[from] minijinja::Error),
    #[error("backend setup failed: {0}")]
    Backend(#[from] LlmError),
}

/// Everything produced by a one-shot `ask`.
#[derive(Debug, Clone, Serialize)]
pub struct AskOutcome {
    pub backend_key: String,
    pub generation: GenerationResult,
    pub execution: Option<ExecutionResult>,
    pub report: Option<NarrativeReport>,
}

impl AskOutcome {
    /// First unrecoverable error along the pipeline.
    pub fn error(&self) -> Option<ErrorKind> {
        self.generation
            .error
            .or_else(|| self.execution.as_ref().and_then(|e| e.error))
    }

    pub fn status(&self) -> &'static str {
        status_of(self.error())
    }

    pub fn message(&self) -> String {
        match (self.error(), &self.execution) {
            (Some(kind), _) => kind.to_string(),
            (None, Some(execution)) => execution.message(),
            (None, None) => self.generation.message(),
        }
    }
}

pub struct Gateway {
    registry: BackendRegistry,
    clients: ClientPool,
    executor: BoundedExecutor,
    prompts: PromptLibrary,
    generation_prompt: String,
    ledger: QueryLedger,
    permits: Semaphore,
}

impl Gateway {
    pub fn new(
        config: &AppConfig,
        executor: BoundedExecutor,
        schema: SchemaContext,
        factory: ClientFactory,
    ) -> Result<Self, GatewayError> {
        let prompts = PromptLibrary::new()?;
        // Schema and rules are fixed for the process lifetime.
        let generation_prompt =
            prompts.generation_system(schema.as_str(), &config.gateway.extra_rules)?;
        debug!("Generation system prompt is {} chars", generation_prompt.len());

        let registry = BackendRegistry::new(
            config.backends.clone(),
            config.gateway.default_backend.clone(),
            config.gateway.probe_timeout(),
        )?;
        info!(
            "Gateway ready with {} enabled backends (default '{}')",
            registry.list_enabled().len(),
            registry.default_key()
        );

        Ok(Self {
            registry,
            clients: ClientPool::new(&config.gateway, factory),
            executor,
            prompts,
            generation_prompt,
            ledger: QueryLedger::new(),
            permits: Semaphore::new(config.gateway.concurrency_limit),
        })
    }

    async fn permit(&self) -> Option<SemaphorePermit<'_>> {
        // The semaphore is never closed.
        self.permits.acquire().await.ok()
    }

    /// The key a request will actually use. Unknown or disabled keys map
    /// to the configured default.
    pub fn resolve_key(&self, key: &str) -> String {
        self.registry
            .resolve_or_default(key)
            .map(|backend| backend.key.clone())
            .unwrap_or_else(|_| self.registry.default_key().to_string())
    }

    pub async fn generate(&self, question: &str, backend_key: &str) -> GenerationResult {
        let _permit = self.permit().await;
        self.generate_sql(question, backend_key).await
    }

    /// Runs `sql` (validated again first) and records the outcome.
    pub async fn execute(&self, sql: &str, question: &str, backend_key: &str) -> ExecutionResult {
        let _permit = self.permit().await;
        self.execute_sql(sql, question, backend_key).await
    }

    pub async fn summarize(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
        reasoning: &str,
        backend_key: &str,
    ) -> NarrativeReport {
        let _permit = self.permit().await;
        self.write_report(question, sql, table, reasoning, backend_key)
            .await
    }

    /// Generate, execute and summarize in one request.
    pub async fn ask(&self, question: &str, backend_key: &str) -> AskOutcome {
        let _permit = self.permit().await;
        let key = self.resolve_key(backend_key);

        let generation = self.generate_sql(question, &key).await;
        if !generation.is_success() {
            return AskOutcome {
                backend_key: key,
                generation,
                execution: None,
                report: None,
            };
        }

        let execution = self.execute_sql(&generation.sql, question, &key).await;
        let report = if execution.is_success() {
            Some(
                self.write_report(
                    question,
                    &generation.sql,
                    &execution.table,
                    &generation.reasoning,
                    &key,
                )
                .await,
            )
        } else {
            None
        };

        AskOutcome {
            backend_key: key,
            generation,
            execution: Some(execution),
            report,
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.ledger.history()
    }

    pub fn history_sqls(&self) -> Vec<String> {
        self.ledger.history_sqls()
    }

    pub fn stats(&self) -> StatValues {
        self.ledger.stat_values()
    }

    pub fn clear_history(&self) {
        self.ledger.clear();
        info!("Query history cleared");
    }

    /// Enabled backends with a fresh liveness probe each.
    pub async fn backends(&self) -> Vec<BackendStatus> {
        self.registry.statuses().await
    }

    pub fn default_backend(&self) -> &str {
        self.registry.default_key()
    }

    /// Database pool occupancy as (open connections, idle connections).
    pub fn pool_state(&self) -> (u32, u32) {
        let state = self.executor.pool().state();
        (state.connections, state.idle_connections)
    }

    async fn generate_sql(&self, question: &str, backend_key: &str) -> GenerationResult {
        let question = question.trim();
        if question.is_empty() {
            return GenerationResult::failure(ErrorKind::EmptyInput, String::new(), String::new());
        }

        let backend = match self.registry.resolve_or_default(backend_key) {
            Ok(backend) => backend,
            Err(e) => {
                error!("No backend available for generation: {}", e);
                return GenerationResult::failure(
                    ErrorKind::BackendUnavailable,
                    String::new(),
                    String::new(),
                );
            }
        };

        let reply = match self.clients.generation_client(backend) {
            Ok(client) => client.complete(&self.generation_prompt, question).await,
            Err(e) => Err(e),
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                error!("Generation via backend '{}' failed: {}", backend.key, e);
                return GenerationResult::failure(
                    ErrorKind::BackendUnavailable,
                    String::new(),
                    String::new(),
                );
            }
        };

        let Some(sql) = extract_sql(&reply.content) else {
            // A fenced mutating statement has no read opener to extract from,
            // but it is still an unsafe answer rather than a missing one.
            let region = statement_region(&reply.content);
            if let Err(Rejection::DeniedKeyword(keyword)) = validate(region) {
                warn!("Backend '{}' produced a statement using {}", backend.key, keyword);
                return GenerationResult::failure(
                    ErrorKind::UnsafeStatement,
                    region.to_string(),
                    reply.reasoning,
                );
            }
            warn!("Backend '{}' produced no SQL statement", backend.key);
            debug!("Unusable backend output: {}", reply.content);
            return GenerationResult::failure(
                ErrorKind::GenerationFailed,
                String::new(),
                reply.reasoning,
            );
        };

        if let Err(rejection) = validate(&sql) {
            warn!("Generated SQL rejected: {}", rejection);
            return GenerationResult::failure(ErrorKind::UnsafeStatement, sql, reply.reasoning);
        }

        debug!("Generated SQL: {}", sql);
        GenerationResult::success(sql, reply.reasoning)
    }

    async fn execute_sql(&self, sql: &str, question: &str, backend_key: &str) -> ExecutionResult {
        let sql = sql.trim();
        if sql.is_empty() {
            return ExecutionResult::failure(ErrorKind::EmptyInput);
        }

        let key = self.resolve_key(backend_key);
        let result = self.executor.execute(sql).await;

        let question = question.trim();
        let question = if question.is_empty() {
            DIRECT_EXECUTION
        } else {
            question
        };
        self.ledger.record_outcome(HistoryEntry::new(
            &key,
            question,
            result.is_success(),
            result.table.row_count(),
            sql,
        ));

        result
    }

    async fn write_report(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
        reasoning: &str,
        backend_key: &str,
    ) -> NarrativeReport {
        let client = self
            .registry
            .resolve_or_default(backend_key)
            .map_err(|e| LlmError::ConfigError(e.to_string()))
            .and_then(|backend| self.clients.report_client(backend));

        let request = ReportRequest {
            question,
            sql,
            table,
            reasoning,
        };
        report::summarize(client, &self.prompts, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::db::{build_pool, DuckDBConnectionManager};
    use crate::ledger::EntryStatus;
    use crate::llm::{ChatClient, ChatReply, ClientSettings};
    use async_trait::async_trait;
    use duckdb::Connection;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replies with canned text; an empty script means transport failure.
    struct Scripted {
        reply: Option<String>,
    }

    #[async_trait]
    impl ChatClient for Scripted {
        async fn complete(&self, _system: &str, _user: &str) -> Result<ChatReply, LlmError> {
            match &self.reply {
                Some(text) => Ok(ChatReply {
                    content: text.clone(),
                    reasoning: "scripted reasoning".to_string(),
                }),
                None => Err(LlmError::ConnectionError(
                    "connect 10.0.0.7:8000 refused".to_string(),
                )),
            }
        }
    }

    struct Harness {
        gateway: Gateway,
        built: Arc<Mutex<Vec<(String, u32)>>>,
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.gateway.default_backend = "main".to_string();
        config.backends = vec![
            BackendConfig {
                key: "main".to_string(),
                display_name: "Main".to_string(),
                endpoint: "http://127.0.0.1:1/v1".to_string(),
                model: "main-model".to_string(),
                max_tokens: 4096,
                enabled: true,
                api_key: None,
                description: None,
            },
            BackendConfig {
                key: "spare".to_string(),
                display_name: "Spare".to_string(),
                endpoint: "http://127.0.0.1:1/v1".to_string(),
                model: "spare-model".to_string(),
                max_tokens: 512,
                enabled: true,
                api_key: None,
                description: None,
            },
        ];
        config
    }

    fn gateway_with(config: &AppConfig, factory: ClientFactory) -> Gateway {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE emp (id INTEGER, name VARCHAR, dept VARCHAR);
             INSERT INTO emp VALUES (1, 'Kim', 'HR'), (2, 'Lee', 'IT'), (3, 'Park', 'IT');",
        )
        .unwrap();
        let pool = build_pool(&config.database, DuckDBConnectionManager::from_connection(conn))
            .unwrap();
        let executor = BoundedExecutor::new(pool, 1000, Duration::from_secs(30));

        Gateway::new(
            config,
            executor,
            SchemaContext::from_text("### Table: emp"),
            factory,
        )
        .unwrap()
    }

    /// `generation` and `report` script the two client purposes.
    fn harness(generation: Option<&str>, report: Option<&str>) -> Harness {
        let config = config();

        let built = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&built);
        let report_tokens = config.gateway.report_max_tokens;
        let generation = generation.map(str::to_string);
        let report = report.map(str::to_string);
        let factory: ClientFactory = Arc::new(move |backend: &BackendConfig, settings: &ClientSettings| {
            seen.lock()
                .unwrap()
                .push((backend.key.clone(), settings.max_tokens));
            let reply = if settings.max_tokens <= report_tokens && backend.key == "main" {
                report.clone()
            } else {
                generation.clone()
            };
            Ok(Arc::new(Scripted { reply }) as Arc<dyn ChatClient>)
        });

        Harness {
            gateway: gateway_with(&config, factory),
            built,
        }
    }

    /// Holds each call open for a while and records the most calls seen at once.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChatClient for InFlight {
        async fn complete(&self, _system: &str, _user: &str) -> Result<ChatReply, LlmError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ChatReply {
                content: "SELECT 1".to_string(),
                reasoning: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_generate_extracts_fenced_sql() {
        let h = harness(Some("Sure! ```sql\nSELECT 1 FROM dual\n```"), None);
        let result = h.gateway.generate("anything", "main").await;

        assert_eq!(result.error, None);
        assert_eq!(result.sql, "SELECT 1 FROM dual");
        assert_eq!(result.reasoning, "scripted reasoning");
        assert_eq!(result.status(), "ok");
    }

    #[tokio::test]
    async fn test_generate_fenced_delete_is_unsafe() {
        let h = harness(Some("```sql\nDELETE FROM t\n```"), None);
        let result = h.gateway.generate("remove everything", "main").await;

        assert_eq!(result.error, Some(ErrorKind::UnsafeStatement));
        assert_eq!(result.sql, "DELETE FROM t");
    }

    #[tokio::test]
    async fn test_generate_stacked_statement_is_unsafe() {
        let h = harness(Some("SELECT 1; DROP TABLE t"), None);
        let result = h.gateway.generate("q", "main").await;
        assert_eq!(result.error, Some(ErrorKind::UnsafeStatement));
    }

    #[tokio::test]
    async fn test_generate_without_statement_fails() {
        let h = harness(Some("I'm sorry, I can't help with that."), None);
        let result = h.gateway.generate("q", "main").await;

        assert_eq!(result.error, Some(ErrorKind::GenerationFailed));
        assert!(result.sql.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_backend_unavailable() {
        let h = harness(None, None);
        let result = h.gateway.generate("q", "main").await;

        assert_eq!(result.error, Some(ErrorKind::BackendUnavailable));
        assert!(!result.message().contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_empty_question_never_reaches_backend() {
        let h = harness(Some("SELECT 1"), None);
        let result = h.gateway.generate("   ", "main").await;

        assert_eq!(result.error, Some(ErrorKind::EmptyInput));
        assert!(h.built.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key_uses_default_backend() {
        let h = harness(Some("SELECT 1"), None);
        h.gateway.generate("q", "http://attacker.example/v1").await;

        assert_eq!(h.gateway.resolve_key("nope"), "main");
        assert_eq!(h.gateway.resolve_key("spare"), "spare");
        assert_eq!(*h.built.lock().unwrap(), vec![("main".to_string(), 4096)]);
    }

    #[tokio::test]
    async fn test_clients_are_reused_across_requests() {
        let h = harness(Some("SELECT 1"), None);
        for _ in 0..3 {
            h.gateway.generate("q", "main").await;
        }
        assert_eq!(h.built.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_records_history_and_stats() {
        let h = harness(None, None);

        let ok = h
            .gateway
            .execute("SELECT name FROM emp WHERE dept = 'IT'", "", "spare")
            .await;
        assert_eq!(ok.table.row_count(), 2);

        let failed = h
            .gateway
            .execute("SELECT nope FROM emp", "which column?", "main")
            .await;
        assert_eq!(failed.error, Some(ErrorKind::ExecutionFailed));

        let history = h.gateway.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, EntryStatus::Error);
        assert_eq!(history[0].question_preview, "which column?");
        assert_eq!(history[1].question_preview, DIRECT_EXECUTION);
        assert_eq!(history[1].backend_key, "spare");
        assert_eq!(history[1].row_count, 2);
        assert_eq!(
            h.gateway.history_sqls(),
            vec!["SELECT nope FROM emp", "SELECT name FROM emp WHERE dept = 'IT'"]
        );

        let stats = h.gateway.stats();
        assert_eq!(
            (stats.total, stats.success_rate_percent, stats.average_rows),
            (2, 50, 1)
        );

        h.gateway.clear_history();
        assert!(h.gateway.history().is_empty());
        assert!(h.gateway.history_sqls().is_empty());
    }

    #[tokio::test]
    async fn test_edited_sql_is_revalidated() {
        let h = harness(None, None);
        let result = h
            .gateway
            .execute("SELECT * FROM emp WHERE id IN (DELETE FROM emp)", "q", "main")
            .await;

        assert_eq!(result.error, Some(ErrorKind::UnsafeStatement));
        assert_eq!(h.gateway.history()[0].status, EntryStatus::Error);
    }

    #[tokio::test]
    async fn test_empty_sql_is_not_recorded() {
        let h = harness(None, None);
        let result = h.gateway.execute("  ", "q", "main").await;

        assert_eq!(result.error, Some(ErrorKind::EmptyInput));
        assert_eq!(h.gateway.stats().total, 0);
    }

    #[tokio::test]
    async fn test_ask_runs_whole_pipeline() {
        let h = harness(
            Some("```sql\nSELECT dept, COUNT(*) AS headcount FROM emp GROUP BY dept ORDER BY dept;\n```"),
            Some("IT has the most people."),
        );
        let outcome = h.gateway.ask("Headcount per dept?", "main").await;

        assert_eq!(outcome.status(), "ok");
        assert_eq!(outcome.message(), "2 rows returned.");
        let execution = outcome.execution.as_ref().unwrap();
        assert_eq!(execution.table.columns, vec!["dept", "headcount"]);

        let report = outcome.report.as_ref().unwrap();
        assert_eq!(report.error, None);
        assert!(report.text.contains("- **Tables used**: emp"));
        assert!(report.text.ends_with("IT has the most people."));

        assert_eq!(h.gateway.history().len(), 1);
        let built = h.built.lock().unwrap();
        assert!(built.contains(&("main".to_string(), 4096)));
        assert!(built.contains(&("main".to_string(), 1024)));
    }

    #[tokio::test]
    async fn test_ask_survives_report_failure() {
        let h = harness(Some("SELECT name FROM emp"), None);
        let outcome = h.gateway.ask("Who works here?", "main").await;

        assert_eq!(outcome.status(), "ok");
        let report = outcome.report.unwrap();
        assert_eq!(report.error, Some(ErrorKind::ReportUnavailable));
        assert!(report.text.contains("3 rows across 1 columns"));
    }

    #[tokio::test]
    async fn test_ask_stops_at_generation_failure() {
        let h = harness(Some("DROP TABLE emp"), None);
        let outcome = h.gateway.ask("drop it", "main").await;

        assert_eq!(outcome.error(), Some(ErrorKind::UnsafeStatement));
        assert!(outcome.execution.is_none());
        assert_eq!(h.gateway.stats().total, 0);
    }

    #[tokio::test]
    async fn test_report_budget_follows_backend_limit() {
        let h = harness(None, Some("unused"));
        let table = ResultTable {
            columns: vec!["a".to_string()],
            rows: vec![vec![serde_json::json!("1")]],
        };
        h.gateway
            .summarize("q", "SELECT a FROM t", &table, "", "spare")
            .await;

        assert_eq!(*h.built.lock().unwrap(), vec![("spare".to_string(), 512)]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_client() {
        let h = Arc::new(harness(Some("SELECT 1"), None));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move { h.gateway.generate("q", "main").await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }
        assert_eq!(h.built.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_bounded_by_limit() {
        let config = config();
        let limit = config.gateway.concurrency_limit;
        let client = Arc::new(InFlight::default());
        let shared = Arc::clone(&client);
        let factory: ClientFactory =
            Arc::new(move |_, _| Ok(Arc::clone(&shared) as Arc<dyn ChatClient>));
        let gateway = Arc::new(gateway_with(&config, factory));

        let handles: Vec<_> = (0..limit + 2)
            .map(|i| {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move { gateway.generate(&format!("question {i}"), "main").await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }

        assert_eq!(limit, 3);
        assert_eq!(client.peak.load(Ordering::SeqCst), limit);
        assert_eq!(client.current.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backend_setup_error_is_reported() {
        let err = GatewayError::from(LlmError::ConfigError("tls backend missing".to_string()));
        assert!(matches!(err, GatewayError::Backend(_)));
        assert_eq!(
            err.to_string(),
            "backend setup failed: LLM configuration error: tls backend missing"
        );
    }

    #[test]
    fn test_gateway_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Gateway>();
    }
}
