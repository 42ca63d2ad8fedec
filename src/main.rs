//! Emcee 网关入口
//!
//! 加载配置并校验 → 启动调度器线程 → 启动 TCP 接入层；Ctrl+C 触发停机。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin emcee-gateway -- [config.toml]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use emcee::config::load_config;
use emcee::gateway::{spawn_scheduler, GatewayRuntime, Hub, HubConfig, ServerStats};
use emcee::llm::OpenAiClient;
use emcee::tools::McpStdioConnector;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    emcee::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    if let Err(e) = cfg.validate() {
        tracing::error!(error = %e, "Refusing to start");
        std::process::exit(1);
    }

    let base_url = cfg.llm.resolved_base_url();
    let api_key = cfg.llm.resolved_api_key().unwrap_or_default();
    let llm = Arc::new(OpenAiClient::new(base_url.as_deref(), &cfg.llm.model, &api_key));
    let connector = Arc::new(McpStdioConnector::new(cfg.provider.clone()));
    let stats = Arc::new(ServerStats::new());

    let shutdown = CancellationToken::new();
    let runtime = GatewayRuntime::new(&cfg, llm, connector, Arc::clone(&stats));
    let (bridge, scheduler) = spawn_scheduler(runtime, cfg.session.queue_capacity, shutdown.clone())
        .context("Failed to start scheduler thread")?;

    let hub = Hub::bind(HubConfig::from_config(&cfg.server), bridge, stats, shutdown.clone())
        .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr()))?;

    tracing::info!(model = %cfg.llm.model, "Press Ctrl+C to stop");
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down gateway...");
            signal.cancel();
        }
    });

    tokio::task::spawn_blocking(move || hub.serve())
        .await
        .context("Accept loop panicked")?;

    shutdown.cancel();
    tokio::task::spawn_blocking(move || scheduler.join())
        .await
        .context("Failed to join scheduler")?
        .map_err(|_| anyhow::anyhow!("Scheduler thread panicked"))?;

    tracing::info!("Gateway stopped");
    Ok(())
}
