//! Run one coordinating instance against Postgres.
//!
//! Events are delivered to a runtime that only logs them, which is enough to
//! watch ownership handover and deferred event delivery across processes.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use chartfleet::config::Config;
use chartfleet::host::{ChartRuntime, DeliveryError};
use chartfleet::model::ChartRef;
use chartfleet::{Instance, PostgresBackend, db, observability};

const POOL_CONNECTIONS: u32 = 8;

struct LoggingRuntime;

#[async_trait]
impl ChartRuntime for LoggingRuntime {
    async fn send_event(
        &self,
        chart: &ChartRef,
        event: Value,
        activity_id: Option<&str>,
        correlation_id: &str,
    ) -> Result<(), DeliveryError> {
        info!(
            machine_id = %chart.machine_id,
            chart_id = %chart.chart_id,
            activity_id = ?activity_id,
            correlation_id,
            %event,
            "event delivered"
        );
        Ok(())
    }

    async fn resume_charts(&self, charts: &[ChartRef]) -> Result<(), DeliveryError> {
        info!(count = charts.len(), "resuming adopted charts");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();

    let config = Config::from_env()?;
    info!(
        instance_id = %config.engine.instance_id,
        grace_period_ms = config.engine.startup.grace_period.as_millis(),
        adoption_frequency_ms = config.engine.startup.adoption_frequency.as_millis(),
        batch_size = config.engine.deferred_events.batch_size,
        look_ahead_ms = config.engine.deferred_events.look_ahead.as_millis(),
        interval_ms = config.engine.deferred_events.interval.as_millis(),
        "starting chartfleet instance"
    );

    let pool = db::connect_pool(&config.database_url, POOL_CONNECTIONS).await?;
    db::run_migrations(&pool).await?;
    let backend = PostgresBackend::new(pool);

    let instance = Instance::new(backend, Arc::new(LoggingRuntime), config.engine)?;
    instance.start().await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("ctrl-c received");
        }
        _ = instance.dying() => {
            info!("instance overthrown");
        }
    }

    instance.shutdown().await?;
    info!("chartfleet instance stopped");
    Ok(())
}
