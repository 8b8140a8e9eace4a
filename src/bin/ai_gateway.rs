//! ai-gateway：OpenAI 兼容网关服务进程
//!
//! Usage:
//!   ai-gateway [<config.yaml>]
//!
//! Without an argument the file named by `AI_GATEWAY_CONFIG` is used; when
//! neither is set the defaults plus environment overrides apply.

use ai_gateway_rust::auth::{AuthorizationService, StaticAuthorizationService};
use ai_gateway_rust::registry::{FileModelRepository, ModelRepository, ModelResolver};
use ai_gateway_rust::telemetry::TracingMetricsSink;
use ai_gateway_rust::{server, Gateway, GatewayConfig};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn print_usage() {
    println!(
        r#"ai-gateway: OpenAI-compatible LLM gateway

USAGE:
    ai-gateway [<config.yaml>]

ENVIRONMENT:
    AI_GATEWAY_CONFIG           Configuration file when no argument is given
    AI_GATEWAY_BIND             Listen address (default 0.0.0.0:8080)
    AI_GATEWAY_CATALOG          Model catalog YAML file
    RUST_LOG                    Log filter (default info)"#
    );
}

fn load_config() -> anyhow::Result<GatewayConfig> {
    let arg = std::env::args().nth(1);
    if matches!(arg.as_deref(), Some("-h" | "--help" | "help")) {
        print_usage();
        std::process::exit(0);
    }
    let path = arg.or_else(|| std::env::var("AI_GATEWAY_CONFIG").ok());
    let config = match path {
        Some(path) => GatewayConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => {
            let config = GatewayConfig::default().with_env_overrides()?;
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn auth_service(config: &GatewayConfig) -> Arc<dyn AuthorizationService> {
    let mut service = StaticAuthorizationService::new(config.auth.tokens.clone());
    if let Some(groups) = &config.auth.anonymous_groups {
        service = service.with_anonymous_groups(groups.iter().cloned());
    }
    Arc::new(service)
}

/// Refresh the catalog every `every` until `stop` fires. Failed refreshes keep
/// the previous snapshot.
async fn refresh_loop(
    resolver: Arc<ModelResolver>,
    repository: Arc<dyn ModelRepository>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = resolver.refresh(repository.as_ref()).await {
                    tracing::warn!(error = %e, "model catalog refresh failed");
                }
            }
        }
    }
}

async fn shutdown_signal(stop: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
    stop.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(config.server.json_logs);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ai-gateway starting");

    let resolver = Arc::new(ModelResolver::new().with_strict(config.catalog.strict));
    let stop = CancellationToken::new();

    let mut refresher = None;
    if let Some(path) = &config.catalog.path {
        let repository: Arc<dyn ModelRepository> = Arc::new(FileModelRepository::new(path));
        let report = resolver
            .refresh(repository.as_ref())
            .await
            .context("initial model catalog load failed")?;
        if !report.is_clean() {
            tracing::warn!(
                rejected = report.rejected.len(),
                "model catalog loaded with rejected records"
            );
        }
        if config.catalog.refresh_secs > 0 {
            refresher = Some(tokio::spawn(refresh_loop(
                resolver.clone(),
                repository,
                Duration::from_secs(config.catalog.refresh_secs),
                stop.clone(),
            )));
        }
    } else {
        tracing::warn!("no model catalog configured; every request will get model_not_found");
    }

    let gateway = Gateway::from_config(&config, resolver)?.with_metrics(Arc::new(TracingMetricsSink));
    let state = server::AppState::new(Arc::new(gateway), auth_service(&config));

    let listener = TcpListener::bind(config.server.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    server::serve(listener, server::router(state), shutdown_signal(stop.clone())).await?;

    stop.cancel();
    if let Some(task) = refresher {
        let _ = task.await;
    }
    tracing::info!("ai-gateway shut down cleanly");
    Ok(())
}
