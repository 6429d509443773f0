use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use sqlgate::config::{AppConfig, CliArgs};
use sqlgate::db::{build_pool, BoundedExecutor, DuckDBConnectionManager, SchemaContext};
use sqlgate::gateway::Gateway;
use sqlgate::llm::pool::openai_factory;
use sqlgate::util::logging::init_tracing;
use sqlgate::web::{self, state::AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    init_tracing(config.logging.json);

    info!(
        "Opening DuckDB database {} (read_only: {})",
        config.database.connection_string, config.database.read_only
    );
    let manager = DuckDBConnectionManager::open(&config.database)?;
    let pool = build_pool(&config.database, manager)?;

    // The schema is described once; restart to pick up new tables.
    info!("Loading schema context");
    let schema = SchemaContext::load(&pool, &config.gateway.target_tables).await?;

    let executor = BoundedExecutor::new(
        pool,
        config.gateway.max_rows,
        config.gateway.execution_timeout(),
    );
    let gateway = Gateway::new(&config, executor, schema, openai_factory())?;

    let web_config = config.web.clone();
    let app_state = Arc::new(AppState::new(config, gateway));

    // Start the web server
    info!("Starting sqlgate on {}:{}", web_config.host, web_config.port);
    match web::run_server(web_config, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
