use fintelligence_router::{
    audit::TracingObserver, create_default_registry, Orchestrator, OrchestratorConfig, Query,
};
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SAMPLE_QUERY: &str = "What is the current price and analyst outlook for NVDA?";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Logs go to stderr so the streamed answer stays clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let text = if args.is_empty() {
        SAMPLE_QUERY.to_string()
    } else {
        args.join(" ")
    };

    let config = OrchestratorConfig::from_env()?;
    let registry = create_default_registry()?;
    let orchestrator = Arc::new(
        Orchestrator::new(registry, config)?.with_observer(Arc::new(TracingObserver)),
    );

    let query = Query::new(text);
    info!(query_id = %query.query_id, text = %query.text, "Running query");

    let mut stream = orchestrator.ask(query);
    let mut stdout = std::io::stdout();

    while let Some(chunk) = stream.next().await {
        write!(stdout, "{}", chunk.text)?;
        stdout.flush()?;

        if let Some(error) = chunk.error {
            eprintln!("\nQuery failed ({}): {}", error.kind, error.message);
            std::process::exit(1);
        }
    }

    println!();
    Ok(())
}
