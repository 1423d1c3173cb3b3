use fintelligence_router::{
    api::start_server,
    audit::{AuditLog, TracingObserver},
    create_default_registry, Orchestrator, OrchestratorConfig,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Fintelligence Query Router - API Server");
    info!("📍 Port: {}", api_port);

    let config = OrchestratorConfig::from_env()?;
    info!(
        stream_mode = ?config.stream_mode,
        query_timeout_ms = config.query_timeout.as_millis() as u64,
        tool_timeout_ms = config.tool_timeout.as_millis() as u64,
        audit_capacity = config.audit_capacity,
        "Configuration loaded"
    );

    let registry = create_default_registry()?;
    let audit_log = Arc::new(AuditLog::with_capacity(config.audit_capacity));

    let orchestrator = Arc::new(
        Orchestrator::new(registry, config)?
            .with_observer(Arc::new(TracingObserver))
            .with_observer(audit_log.clone()),
    );

    info!(
        handlers = orchestrator.registry().len(),
        "✅ Orchestrator initialized"
    );
    info!("📡 Starting API server...");

    start_server(orchestrator, audit_log, api_port).await?;

    Ok(())
}
