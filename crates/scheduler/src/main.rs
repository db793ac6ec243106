//! Background driver process: promotes delayed jobs and reaps expired
//! reservations on every queue under the configured key prefix.
//!
//! Several instances may run side by side; every move is claimed in the store.

use std::sync::Arc;

use anyhow::Context;

use kvcoord_coordination::{CoordConfig, JobQueue, KeySpace, Scheduler, SchedulerConfig};
use kvcoord_store::RedisStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    kvcoord_observability::init();

    let config = CoordConfig::from_env().context("invalid configuration")?;

    let store = RedisStore::open(&config.redis_url)
        .with_context(|| format!("invalid REDIS_URL {}", config.redis_url))?;
    store
        .ping()
        .with_context(|| format!("redis unreachable at {}", config.redis_url))?;

    let queue = JobQueue::new(
        Arc::new(store),
        KeySpace::new(config.key_prefix.clone()),
        config.jobs.clone(),
    );

    let handle = Scheduler::new(queue)
        .spawn(
            SchedulerConfig::default()
                .with_name("kvcoord-scheduler")
                .with_interval(config.scheduler_interval),
        )
        .context("failed to spawn scheduler thread")?;

    tracing::info!(
        prefix = %config.key_prefix,
        interval_ms = config.scheduler_interval.as_millis() as u64,
        "scheduler running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    let stats = tokio::task::spawn_blocking(move || {
        let stats = handle.stats();
        handle.shutdown();
        stats
    })
    .await?;

    tracing::info!(
        ticks = stats.ticks,
        promoted = stats.promoted,
        requeued = stats.requeued,
        failed = stats.failed,
        errors = stats.errors,
        "scheduler stopped"
    );
    Ok(())
}
