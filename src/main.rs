//! potline - service entry point
//!
//! Builds the backend stack from configuration (Redis + Postgres when
//! configured, in-memory dev backends otherwise), wires the table
//! service and runs until SIGINT.

use std::sync::Arc;

use anyhow::Result;

use potline::config::AppConfig;
use potline::engine::EngineFactory;
use potline::logging;
use potline::service::{self, TableService};

#[cfg(feature = "sim-engine")]
fn engine_factory() -> Result<Arc<dyn EngineFactory>> {
    Ok(Arc::new(potline::testkit::SimEngineFactory))
}

#[cfg(not(feature = "sim-engine"))]
fn engine_factory() -> Result<Arc<dyn EngineFactory>> {
    anyhow::bail!("no rules engine compiled in; build with the sim-engine feature or link one")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    let _guard = logging::init_logging(&config.log);
    tracing::info!(git_hash = env!("GIT_HASH"), "potline starting");

    let backends = match (&config.redis_url, &config.database_url) {
        (Some(redis_url), Some(database_url)) => {
            tracing::info!("using redis + postgres backends");
            service::network_backends(redis_url, database_url, &config).await?
        }
        _ => {
            tracing::warn!("redis/database not configured; using in-memory dev backends");
            service::memory_backends(&config)
        }
    };

    let service = TableService::start(backends, engine_factory()?, &config);
    tracing::info!("ready; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    service.shutdown().await;
    Ok(())
}
