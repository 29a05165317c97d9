//! Worker pool: pulls recipient jobs from the durable queue, performs the
//! outbound send, and records the terminal outcome.
//!
//! The handler never returns an error for a business-level failure (missing
//! account, send rejection): those are recorded as terminal recipient state
//! and the job is acknowledged, so the queue cannot requeue them forever.
//! Only integrity errors (campaign or template row gone) propagate, which
//! sends the job back through the queue's backoff policy.

use crate::campaign;
use crate::db::{self, Pool};
use crate::model::{CampaignStatus, MessageStatus, RecipientJob};
use crate::queue;
use crate::realtime::{publish_best_effort, RealtimeSink};
use crate::template;
use crate::whatsapp::WhatsAppService;
use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Why a job was consumed without executing a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Campaign is paused, cancelled or otherwise not processing; resume
    /// re-dispatches, so the job is dropped without touching state.
    CampaignInactive,
    /// Recipient already holds a terminal status — a redelivered job.
    AlreadyTerminal,
}

/// Tagged outcome of one job attempt, consumed by a single state-transition
/// function. Integrity failures are not an outcome; they propagate as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Skipped(SkipReason),
    Sent {
        wa_message_id: String,
        contact_id: String,
        body: String,
    },
    Failed {
        reason: String,
        // Populated only when the failure happened at the send step; a
        // configuration failure (missing account) leaves no message record.
        contact_id: Option<String>,
        body: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub lease_secs: i64,
    pub max_backoff_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            job_timeout: Duration::from_secs(30),
            lease_secs: 60,
            max_backoff_secs: 3600,
        }
    }
}

/// Decide the outcome of one job. Pure with respect to campaign counters:
/// all campaign/recipient mutations happen in [`apply_outcome`].
#[instrument(skip_all, fields(campaign_id = %job.campaign_id, recipient_id = %job.recipient_id))]
pub async fn handle_job(
    pool: &Pool,
    sender: &dyn WhatsAppService,
    job: &RecipientJob,
) -> Result<JobOutcome> {
    let campaign = db::get_campaign_for_send(pool, &job.campaign_id)
        .await?
        .ok_or_else(|| anyhow!("campaign or template missing: {}", job.campaign_id))?;

    // Paused/cancelled campaigns consume their queued jobs as no-ops; resume
    // re-enqueues whatever is still pending.
    if campaign.status != CampaignStatus::Processing {
        return Ok(JobOutcome::Skipped(SkipReason::CampaignInactive));
    }

    let recipient = db::get_recipient(pool, &job.recipient_id)
        .await?
        .ok_or_else(|| anyhow!("recipient missing: {}", job.recipient_id))?;

    // Redelivery guard: a recipient already in a terminal status must not be
    // sent to again.
    if recipient.status.is_terminal() {
        return Ok(JobOutcome::Skipped(SkipReason::AlreadyTerminal));
    }

    let account = match &campaign.account_id {
        Some(account_id) => db::get_account(pool, account_id).await?,
        None => None,
    };
    let Some(account) = account else {
        return Ok(JobOutcome::Failed {
            reason: "whatsapp account missing for campaign".to_string(),
            contact_id: None,
            body: None,
        });
    };

    let contact = db::get_or_create_contact(
        pool,
        &job.org_id,
        &job.phone,
        job.display_name.as_deref(),
    )
    .await?;

    let values = template::resolve(&campaign.template_body, &job.params);
    let body = template::render(&campaign.template_body, &values);
    let sent = sender
        .send_template(
            &account,
            &job.phone,
            &campaign.template_name,
            &campaign.template_language,
            &values,
        )
        .await;

    match sent {
        Ok(wa_message_id) => {
            touch_last_used(pool.clone(), account.id.clone());
            Ok(JobOutcome::Sent {
                wa_message_id,
                contact_id: contact.id,
                body,
            })
        }
        Err(err) => Ok(JobOutcome::Failed {
            reason: format!("{err:#}"),
            contact_id: Some(contact.id),
            body: Some(body),
        }),
    }
}

/// Best-effort `last_used_at` refresh: an explicit spawned task with its own
/// timeout, never awaited by the send path.
fn touch_last_used(pool: Pool, account_id: String) {
    tokio::spawn(async move {
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            db::touch_account_last_used(&pool, &account_id, Utc::now()),
        )
        .await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(?err, account_id, "failed to update account last_used_at"),
            Err(_) => debug!(account_id, "account last_used_at update timed out"),
        }
    });
}

/// Apply a decided outcome: recipient status first, then counters, then the
/// message history record. Each write is idempotent under redelivery (the
/// recipient flip is guarded on `pending`, and counters only move when the
/// flip happened in this call).
#[instrument(skip_all, fields(campaign_id = %job.campaign_id, recipient_id = %job.recipient_id))]
pub async fn apply_outcome(pool: &Pool, job: &RecipientJob, outcome: &JobOutcome) -> Result<()> {
    match outcome {
        JobOutcome::Skipped(_) => Ok(()),
        JobOutcome::Sent {
            wa_message_id,
            contact_id,
            body,
        } => {
            let flipped =
                db::mark_recipient_sent(pool, &job.recipient_id, wa_message_id, Utc::now()).await?;
            if flipped {
                db::increment_sent(pool, &job.campaign_id).await?;
                db::insert_message(
                    pool,
                    &job.org_id,
                    &job.campaign_id,
                    &job.recipient_id,
                    Some(contact_id),
                    Some(wa_message_id),
                    body,
                    MessageStatus::Sent,
                    None,
                )
                .await?;
            }
            Ok(())
        }
        JobOutcome::Failed {
            reason,
            contact_id,
            body,
        } => {
            let flipped = db::mark_recipient_failed(pool, &job.recipient_id, reason).await?;
            if flipped {
                db::increment_failed(pool, &job.campaign_id).await?;
                if let Some(body) = body {
                    db::insert_message(
                        pool,
                        &job.org_id,
                        &job.campaign_id,
                        &job.recipient_id,
                        contact_id.as_deref(),
                        None,
                        body,
                        MessageStatus::Failed,
                        Some(reason),
                    )
                    .await?;
                }
            }
            Ok(())
        }
    }
}

/// Handle one job end to end: decide, apply, detect completion, publish.
/// Returns the outcome for logging.
pub async fn execute_job(
    pool: &Pool,
    sender: &dyn WhatsAppService,
    sink: &dyn RealtimeSink,
    job: &RecipientJob,
) -> Result<JobOutcome> {
    let outcome = handle_job(pool, sender, job).await?;
    apply_outcome(pool, job, &outcome).await?;

    match &outcome {
        // Nothing changed and nothing can have completed meanwhile that this
        // job would be responsible for reporting.
        JobOutcome::Skipped(SkipReason::CampaignInactive) => {}
        // A redelivered terminal job still runs the detector: it heals a
        // crash that landed between the status write and the detector. When
        // this call wins the flip there is no later executed outcome to
        // report it, so the winner publishes the terminal snapshot here.
        JobOutcome::Skipped(SkipReason::AlreadyTerminal) => {
            if campaign::check_completion(pool, &job.campaign_id).await? {
                if let Some(snapshot) = db::stats_snapshot(pool, &job.campaign_id).await? {
                    publish_best_effort(sink, &snapshot).await;
                }
            }
        }
        JobOutcome::Sent { .. } | JobOutcome::Failed { .. } => {
            campaign::check_completion(pool, &job.campaign_id).await?;
            if let Some(snapshot) = db::stats_snapshot(pool, &job.campaign_id).await? {
                publish_best_effort(sink, &snapshot).await;
            }
        }
    }

    Ok(outcome)
}

/// Claim and process at most one due job. Returns whether a job was claimed.
#[instrument(skip_all, fields(worker_id = %worker_id))]
pub async fn process_next_job(
    pool: &Pool,
    sender: &dyn WhatsAppService,
    sink: &dyn RealtimeSink,
    worker_id: &str,
    cfg: &WorkerConfig,
) -> Result<bool> {
    let Some(claimed) = queue::claim_next(pool, worker_id, cfg.lease_secs).await? else {
        return Ok(false);
    };

    let res = tokio::time::timeout(
        cfg.job_timeout,
        execute_job(pool, sender, sink, &claimed.job),
    )
    .await;

    match res {
        Ok(Ok(outcome)) => {
            queue::ack(pool, claimed.id).await?;
            info!(
                job_id = claimed.id,
                recipient_id = %claimed.job.recipient_id,
                ?outcome,
                "job processed"
            );
        }
        Ok(Err(err)) => {
            warn!(
                ?err,
                job_id = claimed.id,
                attempt = claimed.attempt,
                "job failed; backoff"
            );
            queue::backoff(pool, claimed.id, claimed.attempt, cfg.max_backoff_secs).await?;
        }
        Err(_) => {
            warn!(
                job_id = claimed.id,
                attempt = claimed.attempt,
                timeout_secs = cfg.job_timeout.as_secs(),
                "job timed out; backoff"
            );
            queue::backoff(pool, claimed.id, claimed.attempt, cfg.max_backoff_secs).await?;
        }
    }
    Ok(true)
}

/// One worker's consume loop. Stops claiming when the shutdown signal fires;
/// an in-flight job always finishes.
pub async fn run_worker(
    pool: Pool,
    sender: Arc<dyn WhatsAppService>,
    sink: Arc<dyn RealtimeSink>,
    worker_id: String,
    cfg: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match process_next_job(&pool, sender.as_ref(), sink.as_ref(), &worker_id, &cfg).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                error!(?err, worker_id, "worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!(worker_id, "worker stopped");
}

/// Run N independent consume loops sharing one pool. Returns once every
/// worker has observed the shutdown signal and finished its in-flight job.
pub async fn run_pool(
    pool: Pool,
    sender: Arc<dyn WhatsAppService>,
    sink: Arc<dyn RealtimeSink>,
    cfg: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let mut handles = Vec::with_capacity(cfg.workers);
    for n in 0..cfg.workers {
        let worker_id = format!("worker-{n}");
        handles.push(tokio::spawn(run_worker(
            pool.clone(),
            Arc::clone(&sender),
            Arc::clone(&sink),
            worker_id,
            cfg.clone(),
            shutdown.clone(),
        )));
    }
    join_all(handles).await;
}
