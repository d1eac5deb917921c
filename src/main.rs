use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fieldsync::{
    CommandDispatcher, ExecutorPolicy, HandlerRegistry, IdempotentExecutor, ServerState,
    StateLedger, StatusFlow, build_router, register_workflow,
};

/// Fieldsync command server: accepts offline-queued commands, executes them
/// idempotently, and serves entity and audit reads.
#[derive(Debug, Parser)]
#[command(name = "fieldsync-server", version)]
struct ServerArgs {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory for the durable state ledger.
    #[arg(long, default_value = "./fieldsync-data")]
    data_dir: PathBuf,

    /// Record modules to serve; each gets the standard workflow lifecycle.
    #[arg(long = "module", value_name = "NAME", default_values_t = default_modules())]
    modules: Vec<String>,
}

fn default_modules() -> Vec<String> {
    vec!["rfi".to_string(), "nc".to_string(), "wmc".to_string()]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();

    let ledger = Arc::new(
        StateLedger::open(&args.data_dir, ExecutorPolicy::default())
            .await
            .context("failed to open state ledger")?,
    );
    let executor = Arc::new(IdempotentExecutor::new(
        ledger.clone(),
        ExecutorPolicy::default(),
    ));

    let mut registry = HandlerRegistry::new();
    for module in &args.modules {
        register_workflow(&mut registry, module, StatusFlow::standard());
    }
    tracing::info!(modules = ?args.modules, "registered workflow handlers");

    let dispatcher = Arc::new(CommandDispatcher::new(registry, executor));
    let router = build_router(ServerState {
        dispatcher,
        ledger: ledger.clone(),
    });

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "fieldsync server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum serve error")?;

    ledger.close().await.context("failed to close ledger")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
