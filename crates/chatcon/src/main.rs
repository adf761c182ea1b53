use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use chatcon_core::{
    client::{timeout::TimeoutJoinClient, JoinClient},
    config::Config,
    orchestrator::{Orchestrator, OrchestratorConfig},
    service::JoinService,
    store::AccountStore,
};
use chatcon_helper::{HelperConfig, HelperJoinClient};
use chatcon_sqlite::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::load()?);
    chatcon_core::logging::init("chatcon", &cfg.log_level, cfg.log_dir.as_deref())?;

    let store: Arc<dyn AccountStore> = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .with_context(|| format!("opening {}", cfg.database_path.display()))?,
    );

    let helper: Arc<dyn JoinClient> =
        Arc::new(HelperJoinClient::new(HelperConfig::from_config(&cfg)));
    let client: Arc<dyn JoinClient> = match cfg.join_attempt_timeout {
        Some(timeout) => Arc::new(TimeoutJoinClient::new(helper, timeout)),
        None => helper,
    };
    info!(
        helper = %cfg.join_helper_path.display(),
        min_delay_secs = cfg.min_join_delay.as_secs(),
        max_delay_secs = cfg.max_join_delay.as_secs(),
        flood_policy = ?cfg.flood_policy,
        "join client ready"
    );

    let orchestrator = Orchestrator::new(
        store.clone(),
        client.clone(),
        OrchestratorConfig {
            throttle: cfg.throttle(),
            flood_policy: cfg.flood_policy,
        },
    );
    let service = Arc::new(JoinService::new(
        store,
        client,
        orchestrator.clone(),
        cfg.session_dir.clone(),
    ));

    let bot = chatcon_telegram::router::run_polling(cfg, service);
    tokio::select! {
        res = bot => res.context("telegram bot failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    let stopped = orchestrator.shutdown().await;
    if stopped > 0 {
        warn!(stopped, "cancelled running join jobs on exit");
    }
    Ok(())
}
