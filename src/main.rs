//! Sustainability news ingestion service: binary entrypoint.
//! Boots the scheduler and the Axum admin/metrics server.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sustainability_ingest::api::{create_router, AppState};
use sustainability_ingest::bootstrap::Runtime;
use sustainability_ingest::config::PipelineConfig;
use sustainability_ingest::metrics::Metrics;
use sustainability_ingest::scheduler::{spawn_scheduler, SchedulerCfg};

/// Compact logs by default; `LOG_FORMAT=json` for structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sustainability_ingest=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    let metrics = Metrics::init(cfg.pipeline.classification_window).context("installing metrics recorder")?;

    let runtime = Runtime::from_config(cfg)?;
    let bind = runtime.cfg.http.bind.clone();
    let shutdown = CancellationToken::new();

    let scheduler = spawn_scheduler(
        runtime.pipeline.clone(),
        SchedulerCfg {
            interval: runtime.pipeline.settings().interval,
            run_on_start: true,
        },
        shutdown.clone(),
    );

    let router = create_router(AppState::new(runtime.pipeline.clone()))
        .merge(metrics.router())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %bind, "listening");

    let stop = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            stop.cancel();
        })
        .await
        .context("http server")?;

    shutdown.cancel();
    let _ = scheduler.await;
    Ok(())
}
