//! Postgres backend shared by every instance in the cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::base::{
    ActivityBackend, BackendResult, ChartBackend, DeferredEventBackend, InstanceBackend,
    OverthrowBackend,
};
use crate::db;
use crate::model::{
    ChartRecord, ChartRef, DeferredEvent, DeferredEventId, InstanceId, NewChart, NewDeferredEvent,
    duration_millis,
};

const DEFERRED_EVENT_COLUMNS: &str =
    "id, machine_id, chart_id, event_id, event_to, event, created_at, delay_ms, due, lock_owner";

/// Coordination tables stored in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    query_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every coordination row. Test helper.
    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    pub async fn clear_all(&self) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "truncate:all");
        sqlx::query(
            "TRUNCATE instances, charts, deferred_events, ongoing_activities RESTART IDENTITY",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn query_counts(&self) -> HashMap<String, usize> {
        self.query_counts
            .lock()
            .expect("query counts poisoned")
            .clone()
    }

    fn count_query(counts: &Arc<Mutex<HashMap<String, usize>>>, label: &str) {
        let mut guard = counts.lock().expect("query counts poisoned");
        *guard.entry(label.to_string()).or_insert(0) += 1;
    }

    fn chart_ref_columns(charts: &[ChartRef]) -> (Vec<String>, Vec<String>) {
        charts
            .iter()
            .map(|chart| (chart.machine_id.clone(), chart.chart_id.clone()))
            .unzip()
    }
}

fn chart_ref_from_row(row: &PgRow) -> BackendResult<ChartRef> {
    Ok(ChartRef {
        machine_id: row.try_get("machine_id")?,
        chart_id: row.try_get("chart_id")?,
    })
}

fn chart_record_from_row(row: &PgRow) -> BackendResult<ChartRecord> {
    let parent_machine_id: Option<String> = row.try_get("parent_machine_id")?;
    let parent_chart_id: Option<String> = row.try_get("parent_chart_id")?;
    let parent = match (parent_machine_id, parent_chart_id) {
        (Some(machine_id), Some(chart_id)) => Some(ChartRef::new(machine_id, chart_id)),
        _ => None,
    };
    Ok(ChartRecord {
        chart: chart_ref_from_row(row)?,
        owner_id: InstanceId(row.try_get("owner_id")?),
        parent,
        state: row.try_get("state")?,
        paused: row.try_get("paused")?,
        timestamp: row.try_get("updated_at")?,
    })
}

fn deferred_event_from_row(row: &PgRow) -> BackendResult<DeferredEvent> {
    let lock: Option<Uuid> = row.try_get("lock_owner")?;
    Ok(DeferredEvent {
        id: DeferredEventId(row.try_get("id")?),
        chart: chart_ref_from_row(row)?,
        event_id: row.try_get("event_id")?,
        event_to: row.try_get("event_to")?,
        event: row.try_get("event")?,
        timestamp: row.try_get("created_at")?,
        delay_ms: row.try_get("delay_ms")?,
        due: row.try_get("due")?,
        lock: lock.map(InstanceId),
    })
}

#[async_trait]
impl InstanceBackend for PostgresBackend {
    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn insert_instance(&self, instance_id: InstanceId) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "insert:instances");
        sqlx::query(
            "INSERT INTO instances (instance_id, dying) VALUES ($1, FALSE) ON CONFLICT (instance_id) DO NOTHING",
        )
        .bind(instance_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn mark_other_instances_dying(&self, instance_id: InstanceId) -> BackendResult<u64> {
        Self::count_query(&self.query_counts, "update:instances_dying_others");
        let result = sqlx::query(
            "UPDATE instances SET dying = TRUE WHERE instance_id <> $1 AND NOT dying",
        )
        .bind(instance_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn mark_instance_dying(&self, instance_id: InstanceId) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "update:instances_dying_self");
        sqlx::query("UPDATE instances SET dying = TRUE WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn is_instance_dying(&self, instance_id: InstanceId) -> BackendResult<bool> {
        Self::count_query(&self.query_counts, "select:instances_dying");
        let dying: Option<bool> =
            sqlx::query_scalar("SELECT dying FROM instances WHERE instance_id = $1")
                .bind(instance_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dying.unwrap_or(false))
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn count_alive_instances(&self) -> BackendResult<i64> {
        Self::count_query(&self.query_counts, "select:instances_alive_count");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE NOT dying")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ChartBackend for PostgresBackend {
    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn insert_chart(&self, owner_id: InstanceId, chart: &NewChart) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "insert:charts");
        sqlx::query(
            r#"
            INSERT INTO charts (
                machine_id, chart_id, owner_id, parent_machine_id, parent_chart_id, state, paused
            )
            VALUES ($1, $2, $3, $4, $5, $6, FALSE)
            "#,
        )
        .bind(&chart.chart.machine_id)
        .bind(&chart.chart.chart_id)
        .bind(owner_id.0)
        .bind(chart.parent.as_ref().map(|parent| parent.machine_id.as_str()))
        .bind(chart.parent.as_ref().map(|parent| parent.chart_id.as_str()))
        .bind(&chart.state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn read_chart(&self, chart: &ChartRef) -> BackendResult<Option<ChartRecord>> {
        Self::count_query(&self.query_counts, "select:charts_by_id");
        let row = sqlx::query(
            r#"
            SELECT machine_id, chart_id, owner_id, parent_machine_id, parent_chart_id,
                   state, paused, updated_at
            FROM charts
            WHERE machine_id = $1 AND chart_id = $2
            "#,
        )
        .bind(&chart.machine_id)
        .bind(&chart.chart_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chart_record_from_row).transpose()
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn update_chart_state(&self, chart: &ChartRef, state: &Value) -> BackendResult<bool> {
        Self::count_query(&self.query_counts, "update:charts_state");
        let result = sqlx::query(
            "UPDATE charts SET state = $3, updated_at = NOW() WHERE machine_id = $1 AND chart_id = $2",
        )
        .bind(&chart.machine_id)
        .bind(&chart.chart_id)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn destroy_chart(&self, chart: &ChartRef) -> BackendResult<bool> {
        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "delete:deferred_events_by_chart");
        sqlx::query("DELETE FROM deferred_events WHERE machine_id = $1 AND chart_id = $2")
            .bind(&chart.machine_id)
            .bind(&chart.chart_id)
            .execute(&mut *tx)
            .await?;
        Self::count_query(&self.query_counts, "delete:ongoing_activities_by_chart");
        sqlx::query("DELETE FROM ongoing_activities WHERE machine_id = $1 AND chart_id = $2")
            .bind(&chart.machine_id)
            .bind(&chart.chart_id)
            .execute(&mut *tx)
            .await?;
        Self::count_query(&self.query_counts, "delete:charts");
        let result = sqlx::query("DELETE FROM charts WHERE machine_id = $1 AND chart_id = $2")
            .bind(&chart.machine_id)
            .bind(&chart.chart_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn count_own_charts(&self, owner_id: InstanceId) -> BackendResult<i64> {
        Self::count_query(&self.query_counts, "select:charts_own_count");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM charts WHERE owner_id = $1")
            .bind(owner_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn mark_all_charts_paused(&self) -> BackendResult<u64> {
        Self::count_query(&self.query_counts, "update:charts_pause_all");
        let result = sqlx::query("UPDATE charts SET paused = TRUE")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn count_paused_charts(&self) -> BackendResult<i64> {
        Self::count_query(&self.query_counts, "select:charts_paused_count");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM charts WHERE paused")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn pause_owned_charts(
        &self,
        owner_id: InstanceId,
        charts: &[ChartRef],
    ) -> BackendResult<u64> {
        if charts.is_empty() {
            return Ok(0);
        }
        let (machine_ids, chart_ids) = Self::chart_ref_columns(charts);
        Self::count_query(&self.query_counts, "update:charts_pause_owned");
        let result = sqlx::query(
            r#"
            UPDATE charts AS c
            SET paused = TRUE
            FROM UNNEST($1::text[], $2::text[]) AS target(machine_id, chart_id)
            WHERE c.machine_id = target.machine_id
              AND c.chart_id = target.chart_id
              AND c.owner_id = $3
              AND NOT c.paused
            "#,
        )
        .bind(&machine_ids)
        .bind(&chart_ids)
        .bind(owner_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn get_paused_chart_ids(&self) -> BackendResult<Vec<ChartRef>> {
        Self::count_query(&self.query_counts, "select:charts_paused");
        let rows = sqlx::query(
            "SELECT machine_id, chart_id FROM charts WHERE paused ORDER BY machine_id, chart_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chart_ref_from_row).collect()
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn get_paused_charts_with_no_ongoing_activities(&self) -> BackendResult<Vec<ChartRef>> {
        Self::count_query(&self.query_counts, "select:charts_adoptable");
        let rows = sqlx::query(
            r#"
            SELECT c.machine_id, c.chart_id
            FROM charts c
            WHERE c.paused
              AND NOT EXISTS (
                SELECT 1 FROM ongoing_activities oa
                WHERE oa.machine_id = c.machine_id AND oa.chart_id = c.chart_id
              )
            ORDER BY c.machine_id, c.chart_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chart_ref_from_row).collect()
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn change_owner_and_resume_charts(
        &self,
        owner_id: InstanceId,
        charts: &[ChartRef],
    ) -> BackendResult<Vec<ChartRef>> {
        if charts.is_empty() {
            return Ok(Vec::new());
        }
        let (machine_ids, chart_ids) = Self::chart_ref_columns(charts);
        Self::count_query(&self.query_counts, "update:charts_adopt");
        let rows = sqlx::query(
            r#"
            UPDATE charts AS c
            SET owner_id = $1, paused = FALSE, updated_at = NOW()
            FROM UNNEST($2::text[], $3::text[]) AS target(machine_id, chart_id)
            WHERE c.machine_id = target.machine_id
              AND c.chart_id = target.chart_id
              AND c.paused
              AND NOT EXISTS (
                SELECT 1 FROM ongoing_activities oa
                WHERE oa.machine_id = c.machine_id AND oa.chart_id = c.chart_id
              )
            RETURNING c.machine_id, c.chart_id
            "#,
        )
        .bind(owner_id.0)
        .bind(&machine_ids)
        .bind(&chart_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut adopted = rows
            .iter()
            .map(chart_ref_from_row)
            .collect::<BackendResult<Vec<_>>>()?;
        adopted.sort();
        Ok(adopted)
    }
}

#[async_trait]
impl OverthrowBackend for PostgresBackend {
    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn overthrow_other_instances(&self, instance_id: InstanceId) -> BackendResult<u64> {
        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "update:instances_dying_others");
        let overthrown = sqlx::query(
            "UPDATE instances SET dying = TRUE WHERE instance_id <> $1 AND NOT dying",
        )
        .bind(instance_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        Self::count_query(&self.query_counts, "update:charts_pause_all");
        sqlx::query("UPDATE charts SET paused = TRUE")
            .execute(&mut *tx)
            .await?;
        Self::count_query(&self.query_counts, "update:deferred_events_release_others");
        sqlx::query("UPDATE deferred_events SET lock_owner = NULL WHERE lock_owner <> $1")
            .bind(instance_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(overthrown)
    }
}

#[async_trait]
impl DeferredEventBackend for PostgresBackend {
    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn defer_event(&self, event: &NewDeferredEvent) -> BackendResult<DeferredEvent> {
        Self::count_query(&self.query_counts, "insert:deferred_events");
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO deferred_events (
                machine_id, chart_id, event_id, event_to, event, delay_ms, due
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW() + ($6::bigint * INTERVAL '1 millisecond'))
            RETURNING {DEFERRED_EVENT_COLUMNS}
            "#
        ))
        .bind(&event.chart.machine_id)
        .bind(&event.chart.chart_id)
        .bind(&event.event_id)
        .bind(event.event_to.as_deref())
        .bind(&event.event)
        .bind(duration_millis(event.delay))
        .fetch_one(&self.pool)
        .await?;
        deferred_event_from_row(&row)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn take_upcoming_deferred_events(
        &self,
        instance_id: InstanceId,
        look_ahead: Duration,
        batch_size: usize,
    ) -> BackendResult<Vec<DeferredEvent>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        Self::count_query(&self.query_counts, "update:deferred_events_claim");
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id
                FROM deferred_events
                WHERE lock_owner IS NULL
                  AND due < NOW() + ($1::bigint * INTERVAL '1 millisecond')
                ORDER BY due, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE deferred_events AS de
            SET lock_owner = $3
            FROM claimed
            WHERE de.id = claimed.id
            RETURNING de.id, de.machine_id, de.chart_id, de.event_id, de.event_to, de.event,
                      de.created_at, de.delay_ms, de.due, de.lock_owner
            "#,
        )
        .bind(duration_millis(look_ahead))
        .bind(batch_size as i64)
        .bind(instance_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows
            .iter()
            .map(deferred_event_from_row)
            .collect::<BackendResult<Vec<_>>>()?;
        events.sort_by(|left, right| (left.due, left.id).cmp(&(right.due, right.id)));
        Ok(events)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn remove_deferred_event(&self, id: DeferredEventId) -> BackendResult<bool> {
        Self::count_query(&self.query_counts, "delete:deferred_events_by_id");
        let result = sqlx::query("DELETE FROM deferred_events WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn cancel_deferred_event(&self, chart: &ChartRef, event_id: &str) -> BackendResult<u64> {
        Self::count_query(&self.query_counts, "delete:deferred_events_by_event_id");
        let result = sqlx::query(
            "DELETE FROM deferred_events WHERE machine_id = $1 AND chart_id = $2 AND event_id = $3",
        )
        .bind(&chart.machine_id)
        .bind(&chart.chart_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn release_deferred_event(
        &self,
        id: DeferredEventId,
        instance_id: InstanceId,
    ) -> BackendResult<bool> {
        Self::count_query(&self.query_counts, "update:deferred_events_release");
        let result = sqlx::query(
            "UPDATE deferred_events SET lock_owner = NULL WHERE id = $1 AND lock_owner = $2",
        )
        .bind(id.0)
        .bind(instance_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn release_deferred_events_locked_by(
        &self,
        instance_id: InstanceId,
    ) -> BackendResult<u64> {
        Self::count_query(&self.query_counts, "update:deferred_events_release_owner");
        let result = sqlx::query("UPDATE deferred_events SET lock_owner = NULL WHERE lock_owner = $1")
            .bind(instance_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn release_deferred_events_not_locked_by(
        &self,
        instance_id: InstanceId,
    ) -> BackendResult<u64> {
        Self::count_query(&self.query_counts, "update:deferred_events_release_others");
        let result =
            sqlx::query("UPDATE deferred_events SET lock_owner = NULL WHERE lock_owner <> $1")
                .bind(instance_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn read_deferred_event(
        &self,
        id: DeferredEventId,
    ) -> BackendResult<Option<DeferredEvent>> {
        Self::count_query(&self.query_counts, "select:deferred_events_by_id");
        let row = sqlx::query(&format!(
            "SELECT {DEFERRED_EVENT_COLUMNS} FROM deferred_events WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(deferred_event_from_row).transpose()
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn count_deferred_events(&self) -> BackendResult<i64> {
        Self::count_query(&self.query_counts, "select:deferred_events_count");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deferred_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ActivityBackend for PostgresBackend {
    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn register_activity(&self, chart: &ChartRef, activity_id: &str) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "insert:ongoing_activities");
        sqlx::query(
            r#"
            INSERT INTO ongoing_activities (machine_id, chart_id, activity_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&chart.machine_id)
        .bind(&chart.chart_id)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn unregister_activity(&self, chart: &ChartRef, activity_id: &str) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "delete:ongoing_activities");
        sqlx::query(
            "DELETE FROM ongoing_activities WHERE machine_id = $1 AND chart_id = $2 AND activity_id = $3",
        )
        .bind(&chart.machine_id)
        .bind(&chart.chart_id)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg_attr(feature = "observability", tracing::instrument(skip_all))]
    async fn is_activity_registered(
        &self,
        chart: &ChartRef,
        activity_id: &str,
    ) -> BackendResult<bool> {
        Self::count_query(&self.query_counts, "select:ongoing_activities_exists");
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ongoing_activities
                WHERE machine_id = $1 AND chart_id = $2 AND activity_id = $3
            )
            "#,
        )
        .bind(&chart.machine_id)
        .bind(&chart.chart_id)
        .bind(activity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
