use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::ResultTable;
use crate::error::{ErrorKind, STATUS_OK};
use crate::ledger::HistoryEntry;
use crate::llm::registry::BackendStatus;
use crate::web::state::AppState;

// Request types

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub question: String,
    #[serde(default)]
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub sql: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    #[serde(default)]
    pub question: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub backend: String,
}

// Response types

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub status: &'static str,
    pub message: String,
    pub backend: String,
    pub sql: String,
    pub reasoning: String,
}

#[derive(Debug, Serialize)]
pub struct QueryMetadata {
    pub columns: Vec<String>,
    pub row_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub status: &'static str,
    pub message: String,
    pub metadata: QueryMetadata,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize)]
pub struct SummarizeResponse {
    pub status: &'static str,
    pub message: String,
    pub report: String,
    /// Set when the templated fallback replaced the model's summary.
    pub fallback: bool,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub status: &'static str,
    pub message: String,
    pub backend: String,
    pub sql: String,
    pub reasoning: String,
    pub metadata: Option<QueryMetadata>,
    pub rows: Vec<Vec<Value>>,
    pub report: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub status: &'static str,
    pub message: String,
    pub entries: Vec<HistoryEntry>,
    /// Full SQL of each entry, same order as `entries`.
    pub sqls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub status: &'static str,
    pub message: String,
    pub total: u64,
    pub success_rate_percent: u64,
    pub average_rows: u64,
}

#[derive(Debug, Serialize)]
pub struct BackendsResponse {
    pub status: &'static str,
    pub message: String,
    pub default_backend: String,
    pub backends: Vec<BackendStatus>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub db_connections: u32,
    pub db_idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
    pub message: String,
}

type ApiResult<T> = (StatusCode, Json<T>);

/// HTTP status for a classified outcome.
fn http_status(error: Option<ErrorKind>) -> StatusCode {
    match error {
        None => StatusCode::OK,
        Some(kind) if kind.is_recoverable() => StatusCode::OK,
        Some(ErrorKind::EmptyInput) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::BackendUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn metadata(table: &ResultTable) -> QueryMetadata {
    QueryMetadata {
        columns: table.columns.clone(),
        row_count: table.row_count(),
    }
}

// API Implementations

pub async fn generate(
    state: State<Arc<AppState>>,
    Json(payload): Json<GenerateRequest>,
) -> ApiResult<GenerateResponse> {
    let backend = state.gateway.resolve_key(&payload.backend);
    info!("Generating SQL with backend {}", backend);

    let result = state.gateway.generate(&payload.question, &backend).await;
    (
        http_status(result.error),
        Json(GenerateResponse {
            status: result.status(),
            message: result.message(),
            backend,
            sql: result.sql,
            reasoning: result.reasoning,
        }),
    )
}

pub async fn execute(
    state: State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> ApiResult<ExecuteResponse> {
    debug!("Executing SQL: {}", payload.sql);

    let result = state
        .gateway
        .execute(&payload.sql, &payload.question, &payload.backend)
        .await;
    (
        http_status(result.error),
        Json(ExecuteResponse {
            status: result.status(),
            message: result.message(),
            metadata: metadata(&result.table),
            rows: result.table.rows,
        }),
    )
}

pub async fn summarize(
    state: State<Arc<AppState>>,
    Json(payload): Json<SummarizeRequest>,
) -> ApiResult<SummarizeResponse> {
    let table = ResultTable {
        columns: payload.columns,
        rows: payload.rows,
    };
    let report = state
        .gateway
        .summarize(
            &payload.question,
            &payload.sql,
            &table,
            &payload.reasoning,
            &payload.backend,
        )
        .await;

    let message = match report.error {
        Some(kind) => kind.to_string(),
        None if report.text.is_empty() => "No rows to summarize.".to_string(),
        None => "Report generated.".to_string(),
    };
    (
        StatusCode::OK,
        Json(SummarizeResponse {
            status: STATUS_OK,
            message,
            fallback: report.error.is_some(),
            report: report.text,
        }),
    )
}

pub async fn ask(
    state: State<Arc<AppState>>,
    Json(payload): Json<GenerateRequest>,
) -> ApiResult<AskResponse> {
    let outcome = state.gateway.ask(&payload.question, &payload.backend).await;
    info!(
        "Ask via {} finished with status {}",
        outcome.backend_key,
        outcome.status()
    );

    let status = outcome.status();
    let message = outcome.message();
    let code = http_status(outcome.error());
    let (metadata, rows) = match outcome.execution {
        Some(execution) => (Some(metadata(&execution.table)), execution.table.rows),
        None => (None, Vec::new()),
    };

    (
        code,
        Json(AskResponse {
            status,
            message,
            backend: outcome.backend_key,
            sql: outcome.generation.sql,
            reasoning: outcome.generation.reasoning,
            metadata,
            rows,
            report: outcome.report.map(|r| r.text).unwrap_or_default(),
        }),
    )
}

pub async fn history(state: State<Arc<AppState>>) -> Json<HistoryResponse> {
    let entries = state.gateway.history();
    let sqls = state.gateway.history_sqls();
    Json(HistoryResponse {
        status: STATUS_OK,
        message: format!("{} entries", entries.len()),
        entries,
        sqls,
    })
}

pub async fn clear_history(state: State<Arc<AppState>>) -> Json<AckResponse> {
    state.gateway.clear_history();
    Json(AckResponse {
        status: STATUS_OK,
        message: "History cleared.".to_string(),
    })
}

pub async fn stats(state: State<Arc<AppState>>) -> Json<StatsResponse> {
    let values = state.gateway.stats();
    Json(StatsResponse {
        status: STATUS_OK,
        message: format!("{} requests recorded", values.total),
        total: values.total,
        success_rate_percent: values.success_rate_percent,
        average_rows: values.average_rows,
    })
}

pub async fn backends(state: State<Arc<AppState>>) -> Json<BackendsResponse> {
    let backends = state.gateway.backends().await;
    let healthy = backends.iter().filter(|b| b.healthy).count();
    Json(BackendsResponse {
        status: STATUS_OK,
        message: format!("{} of {} backends responding", healthy, backends.len()),
        default_backend: state.gateway.default_backend().to_string(),
        backends,
    })
}

pub async fn system_status(state: State<Arc<AppState>>) -> Json<StatusResponse> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();
    let (connections, idle) = state.gateway.pool_state();

    Json(StatusResponse {
        status: STATUS_OK,
        message: format!("Serving on {}:{}", state.config.web.host, state.config.web.port),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        db_connections: connections,
        db_idle_connections: idle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BackendConfig};
    use crate::db::{build_pool, BoundedExecutor, DuckDBConnectionManager, SchemaContext};
    use crate::gateway::Gateway;
    use crate::llm::pool::ClientFactory;
    use crate::llm::{ChatClient, ChatReply, LlmError};
    use crate::web::app;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use duckdb::Connection;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixed(&'static str);

    #[async_trait]
    impl ChatClient for Fixed {
        async fn complete(&self, _: &str, _: &str) -> Result<ChatReply, LlmError> {
            Ok(ChatReply {
                content: self.0.to_string(),
                reasoning: String::new(),
            })
        }
    }

    fn router(reply: &'static str) -> axum::Router {
        let mut config = AppConfig::default();
        config.backends = vec![BackendConfig {
            key: "local".to_string(),
            display_name: "Local".to_string(),
            endpoint: "http://127.0.0.1:1/v1".to_string(),
            model: "m".to_string(),
            max_tokens: 2048,
            enabled: true,
            api_key: None,
            description: None,
        }];

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t AS SELECT range AS n FROM range(10)")
            .unwrap();
        let pool = build_pool(&config.database, DuckDBConnectionManager::from_connection(conn))
            .unwrap();
        let executor = BoundedExecutor::new(pool, 1000, Duration::from_secs(10));
        let factory: ClientFactory =
            Arc::new(move |_, _| Ok(Arc::new(Fixed(reply)) as Arc<dyn ChatClient>));
        let gateway =
            Gateway::new(&config, executor, SchemaContext::from_text("t(n)"), factory).unwrap();

        app(Arc::new(AppState::new(config, gateway)))
    }

    async fn call(router: &axum::Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_generate_endpoint() {
        let router = router("```sql\nSELECT n FROM t\n```");
        let (code, body) = call(
            &router,
            Method::POST,
            "/api/generate",
            serde_json::json!({"question": "all numbers", "backend": "unknown"}),
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "local");
        assert_eq!(body["sql"], "SELECT n FROM t");
    }

    #[tokio::test]
    async fn test_execute_endpoint_rejects_unsafe_sql() {
        let router = router("unused");
        let (code, body) = call(
            &router,
            Method::POST,
            "/api/execute",
            serde_json::json!({"sql": "DROP TABLE t"}),
        )
        .await;

        assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "unsafe_statement");
        assert!(body["message"].as_str().unwrap().contains("Unsafe SQL"));
    }

    #[tokio::test]
    async fn test_empty_question_is_bad_request() {
        let router = router("SELECT 1");
        let (code, body) = call(
            &router,
            Method::POST,
            "/api/ask",
            serde_json::json!({"question": ""}),
        )
        .await;

        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "empty_input");
    }

    #[tokio::test]
    async fn test_ask_then_history_and_stats() {
        let router = router("SELECT n FROM t WHERE n < 3");
        let (code, body) = call(
            &router,
            Method::POST,
            "/api/ask",
            serde_json::json!({"question": "small numbers"}),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["metadata"]["row_count"], 3);
        assert!(body["report"].as_str().unwrap().contains("## Summary"));

        let (_, history) = call(&router, Method::GET, "/api/history", Value::Null).await;
        assert_eq!(history["entries"][0]["question_preview"], "small numbers");
        assert_eq!(history["sqls"][0], "SELECT n FROM t WHERE n < 3");

        let (_, stats) = call(&router, Method::GET, "/api/stats", Value::Null).await;
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["success_rate_percent"], 100);
        assert_eq!(stats["average_rows"], 3);

        let (_, cleared) = call(&router, Method::DELETE, "/api/history", Value::Null).await;
        assert_eq!(cleared["status"], "ok");
        let (_, history) = call(&router, Method::GET, "/api/history", Value::Null).await;
        assert_eq!(history["entries"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_summarize_endpoint() {
        let router = router("Three small numbers.");
        let (code, body) = call(
            &router,
            Method::POST,
            "/api/summarize",
            serde_json::json!({
                "question": "small numbers",
                "sql": "SELECT n FROM t",
                "columns": ["n"],
                "rows": [["0"], ["1"], ["2"]]
            }),
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["fallback"], false);
        assert!(body["report"].as_str().unwrap().ends_with("Three small numbers."));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let router = router("unused");
        let (code, body) = call(&router, Method::GET, "/api/status", Value::Null).await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
