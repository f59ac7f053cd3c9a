//! HTTP server for the text-to-SQL pipeline.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use text2sql_rag::api;
use text2sql_rag::observability::init_logging;
use text2sql_rag::schema_rag::ModelStatus;
use text2sql_rag::{AppConfig, Text2SqlPipeline};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "text2sql-server", about = "HTTP API for natural-language SQL queries")]
struct ServerCli {
    /// Address to bind (host:port); defaults to TEXT2SQL_BIND
    #[arg(long)]
    bind: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "TEXT2SQL_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = ServerCli::parse();
    init_logging(&cli.log_level);

    let config = AppConfig::from_env().context("invalid configuration")?;
    let status = ModelStatus::initializing();
    let pipeline = Arc::new(
        Text2SqlPipeline::from_config(&config, status).context("failed to initialize pipeline")?,
    );
    info!(
        "Loaded {} database(s) and {} LLM profile(s)",
        pipeline.databases().len(),
        pipeline.llm_profiles().len()
    );

    // queries are refused with an embedding error until this settles
    let retrieval = pipeline.retrieval().clone();
    tokio::spawn(async move {
        let state = retrieval.warm_up().await;
        if !retrieval.status().is_ready() {
            warn!("Embedding model unavailable: {:?}", state);
        }
    });

    let bind = cli.bind.unwrap_or(config.bind);
    let addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {}", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("text2sql-server listening on http://{}", addr);

    axum::serve(listener, api::router(pipeline))
        .await
        .context("server shutdown")?;
    Ok(())
}
