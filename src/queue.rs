//! Durable job queue on SQLite.
//!
//! Jobs are appended durably and claimed with a lease: a claim atomically
//! stamps `leased_by` and a lease deadline, so each job is held by exactly one
//! consumer at a time, and a job whose claimant died is redelivered once the
//! lease expires. Acknowledging deletes the row; a handler error re-schedules
//! it with capped exponential backoff. Delivery is therefore at-least-once and
//! handlers must be idempotent for their durable side effects.

use crate::db::Pool;
use crate::model::RecipientJob;
use anyhow::Result;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use tracing::instrument;

/// A claimed job, carried with its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: i64,
    pub attempt: i64,
    pub job: RecipientJob,
}

#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, job: &RecipientJob) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_tx(&mut tx, job).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn enqueue_tx(tx: &mut Transaction<'_, Sqlite>, job: &RecipientJob) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO jobs (campaign_id, recipient_id, org_id, phone, display_name, params, attempt, due_at) \
         VALUES (?, ?, ?, ?, ?, ?, 0, CURRENT_TIMESTAMP) RETURNING id",
    )
    .bind(&job.campaign_id)
    .bind(&job.recipient_id)
    .bind(&job.org_id)
    .bind(&job.phone)
    .bind(&job.display_name)
    .bind(serde_json::to_string(&job.params)?)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

fn map_claimed(row: &SqliteRow) -> Result<QueuedJob> {
    let params: String = row.get("params");
    let params: BTreeMap<String, String> = if params.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_str(&params)?
    };
    Ok(QueuedJob {
        id: row.get("id"),
        attempt: row.get("attempt"),
        job: RecipientJob {
            campaign_id: row.get("campaign_id"),
            recipient_id: row.get("recipient_id"),
            org_id: row.get("org_id"),
            phone: row.get("phone"),
            display_name: row.get("display_name"),
            params,
        },
    })
}

/// Atomically claim the oldest due job whose lease is absent or expired.
/// FIFO by insertion order. Returns `None` when nothing is due.
#[instrument(skip_all)]
pub async fn claim_next(pool: &Pool, worker_id: &str, lease_secs: i64) -> Result<Option<QueuedJob>> {
    let row = sqlx::query(
        "UPDATE jobs SET leased_by = ?, lease_expires_at = datetime('now', ? || ' seconds') \
         WHERE id IN ( \
             SELECT id FROM jobs \
             WHERE datetime(due_at) <= CURRENT_TIMESTAMP \
               AND (leased_by IS NULL OR datetime(lease_expires_at) <= CURRENT_TIMESTAMP) \
             ORDER BY id ASC LIMIT 1 \
         ) \
         RETURNING id, campaign_id, recipient_id, org_id, phone, display_name, params, attempt",
    )
    .bind(worker_id)
    .bind(lease_secs)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_claimed).transpose()
}

/// Acknowledge (delete) a processed job.
#[instrument(skip_all)]
pub async fn ack(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Re-schedule a failed job: exponential backoff 5s * 2^attempt, capped at
/// `max_cap_secs` (or 3600s when the cap is unset), lease cleared so any
/// consumer may pick it up once due.
#[instrument(skip_all)]
pub async fn backoff(pool: &Pool, id: i64, attempt: i64, max_cap_secs: i64) -> Result<()> {
    let secs = 5_i64 * (1_i64 << attempt.min(10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE jobs SET attempt = ?, due_at = datetime('now', ? || ' seconds'), \
                         leased_by = NULL, lease_expires_at = NULL \
         WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn depth(pool: &Pool) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

#[instrument(skip_all)]
pub async fn depth_for_campaign(pool: &Pool, campaign_id: &str) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE campaign_id = ?")
        .bind(campaign_id)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_job(n: u32) -> RecipientJob {
        RecipientJob {
            campaign_id: "camp-1".into(),
            recipient_id: format!("rec-{n}"),
            org_id: "org-1".into(),
            phone: format!("+155500{n}"),
            display_name: Some("Tester".into()),
            params: BTreeMap::from([("name".to_string(), "Tester".to_string())]),
        }
    }

    #[tokio::test]
    async fn enqueue_claim_ack_roundtrip() {
        let pool = setup_pool().await;
        enqueue(&pool, &sample_job(1)).await.unwrap();
        enqueue(&pool, &sample_job(2)).await.unwrap();
        assert_eq!(depth(&pool).await.unwrap(), 2);

        // FIFO: first enqueued comes out first
        let first = claim_next(&pool, "w1", 60).await.unwrap().unwrap();
        assert_eq!(first.job.recipient_id, "rec-1");
        assert_eq!(first.attempt, 0);
        assert_eq!(first.job.params.get("name").map(String::as_str), Some("Tester"));

        ack(&pool, first.id).await.unwrap();
        assert_eq!(depth(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn leased_job_is_invisible_to_other_consumers() {
        let pool = setup_pool().await;
        enqueue(&pool, &sample_job(1)).await.unwrap();

        let claimed = claim_next(&pool, "w1", 60).await.unwrap();
        assert!(claimed.is_some());
        // Same job must not be handed to a second consumer while leased.
        assert!(claim_next(&pool, "w2", 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let pool = setup_pool().await;
        enqueue(&pool, &sample_job(1)).await.unwrap();

        // Zero-second lease expires immediately: simulates a crashed claimant.
        let first = claim_next(&pool, "w1", 0).await.unwrap().unwrap();
        let second = claim_next(&pool, "w2", 60).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn backoff_defers_and_clears_lease() {
        let pool = setup_pool().await;
        enqueue(&pool, &sample_job(1)).await.unwrap();

        let claimed = claim_next(&pool, "w1", 60).await.unwrap().unwrap();
        backoff(&pool, claimed.id, claimed.attempt, 3600).await.unwrap();

        // Still queued but not due yet.
        assert_eq!(depth(&pool).await.unwrap(), 1);
        assert!(claim_next(&pool, "w1", 60).await.unwrap().is_none());

        let attempt: i64 = sqlx::query_scalar("SELECT attempt FROM jobs WHERE id = ?")
            .bind(claimed.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(attempt, 1);
    }
}
