use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use benang_domain::jobs::now_ms;
use benang_domain::message::InMemoryMessageStore;
use benang_domain::ports::db::DbAdapter;
use benang_domain::ports::messages::MessageStore;
use benang_domain::threading::ThreadingService;
use benang_infra::config::AppConfig;
use benang_infra::db::{DbConfig, SurrealAdapter};
use benang_infra::jobs::RedisLinkQueue;
use benang_infra::logging::init_tracing;
use benang_infra::repositories::SurrealMessageStore;
use tracing::{info, warn};

mod observability;
mod runner;

use runner::{LinkWorker, WorkerConfig};

const QUEUE_GAUGE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let store = build_store(&config).await?;
    let queue = RedisLinkQueue::connect_with_prefix(
        &config.redis_url,
        &config.worker_queue_prefix,
        config.link_dedupe_ttl_ms,
    )
    .await
    .context("failed to connect to redis link queue")?;

    let worker = LinkWorker::new(
        Arc::new(queue.clone()),
        ThreadingService::new(store),
        WorkerConfig {
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            promote_batch: config.worker_promote_batch,
            link_timeout: Duration::from_millis(config.link_timeout_ms),
            link_concurrency: config.link_concurrency,
        },
    );

    tokio::spawn(report_queue_depth(queue));

    info!(
        backend = config.data_backend,
        queue_prefix = config.worker_queue_prefix,
        concurrency = config.link_concurrency,
        "link worker starting"
    );

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("link worker shutdown");
        }
    }

    Ok(())
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
    match config.data_backend.as_str() {
        "surreal" => {
            let db_config = DbConfig::from_app_config(config);
            let adapter = SurrealAdapter::new(db_config.clone());
            adapter
                .health_check()
                .await
                .context("surreal health check failed")?;
            let store = SurrealMessageStore::new(&db_config).await?;
            Ok(Arc::new(store))
        }
        other => {
            if other != "memory" {
                warn!(backend = other, "unknown data backend, using memory store");
            }
            Ok(Arc::new(InMemoryMessageStore::new()))
        }
    }
}

async fn report_queue_depth(queue: RedisLinkQueue) {
    loop {
        match queue.metrics_snapshot().await {
            Ok(snapshot) => {
                observability::set_queue_depth_gauge(
                    snapshot.ready,
                    snapshot.delayed,
                    snapshot.processing,
                );
                let lag_ms = snapshot
                    .oldest_delayed_ms
                    .map(|oldest| now_ms() - oldest)
                    .unwrap_or(0);
                observability::set_queue_lag_ms(lag_ms);
            }
            Err(err) => warn!(error = %err, "failed to read queue metrics"),
        }
        tokio::time::sleep(QUEUE_GAUGE_INTERVAL).await;
    }
}
