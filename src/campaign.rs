//! Campaign state machine, dispatcher and completion detection.
//!
//! Transitions: draft → processing → {paused, cancelled, completed};
//! paused → processing (resume) and paused → cancelled. Cancelled and
//! completed are terminal. Every transition is a guarded conditional UPDATE,
//! so concurrent control actions and racing workers cannot double-apply one.
//! Only the completion detector may perform processing → completed.

use crate::db::{self, Pool};
use crate::model::{CampaignStatus, RecipientJob};
use crate::queue;
use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign not found: {0}")]
    NotFound(String),
    #[error("invalid campaign transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

async fn current_status(pool: &Pool, id: &str) -> Result<CampaignStatus, CampaignError> {
    db::get_campaign(pool, id)
        .await?
        .map(|c| c.status)
        .ok_or_else(|| CampaignError::NotFound(id.to_string()))
}

fn invalid(from: CampaignStatus, to: CampaignStatus) -> CampaignError {
    CampaignError::InvalidTransition {
        from: from.as_str(),
        to: to.as_str(),
    }
}

/// Move a draft campaign to `processing` and enqueue one job per pending
/// recipient. Returns the number of jobs dispatched.
#[instrument(skip_all, fields(campaign_id = %id))]
pub async fn start_campaign(pool: &Pool, id: &str) -> Result<usize, CampaignError> {
    dispatch(pool, id, &[CampaignStatus::Draft]).await
}

/// Resume a paused campaign: flip back to `processing` and re-enqueue exactly
/// the recipients still pending. Recipients already sent or failed are not
/// re-dispatched.
#[instrument(skip_all, fields(campaign_id = %id))]
pub async fn resume_campaign(pool: &Pool, id: &str) -> Result<usize, CampaignError> {
    dispatch(pool, id, &[CampaignStatus::Paused]).await
}

async fn dispatch(pool: &Pool, id: &str, from: &[CampaignStatus]) -> Result<usize, CampaignError> {
    // Existence check up front so a missing campaign is NotFound, not an
    // invalid transition.
    let status = current_status(pool, id).await?;

    if !db::transition_campaign(pool, id, CampaignStatus::Processing, from).await? {
        return Err(invalid(status, CampaignStatus::Processing));
    }

    // Re-stamp the total on every dispatch, not just the first: recipients
    // imported during a paused window would otherwise push sent + failed
    // past a stale total.
    let total = db::count_recipients(pool, id).await?;
    sqlx::query("UPDATE campaigns SET total_recipients = ? WHERE id = ?")
        .bind(total)
        .bind(id)
        .execute(pool)
        .await
        .map_err(anyhow::Error::from)?;

    let campaign = db::get_campaign(pool, id)
        .await?
        .ok_or_else(|| CampaignError::NotFound(id.to_string()))?;

    // All jobs land in one transaction so a crash mid-dispatch leaves either
    // the full batch or (after redelivery of the control action) a clean
    // retry; pending-only selection makes dispatch re-runnable.
    let pending = db::pending_recipients(pool, id).await?;
    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;
    for recipient in &pending {
        let job = RecipientJob {
            campaign_id: campaign.id.clone(),
            recipient_id: recipient.id.clone(),
            org_id: campaign.org_id.clone(),
            phone: recipient.phone.clone(),
            display_name: recipient.display_name.clone(),
            params: recipient.params.clone(),
        };
        queue::enqueue_tx(&mut tx, &job).await?;
    }
    tx.commit().await.map_err(anyhow::Error::from)?;

    info!(dispatched = pending.len(), "campaign dispatched");
    Ok(pending.len())
}

/// `processing -> paused`. Workers consume jobs for a paused campaign without
/// touching recipient state; resume re-dispatches whatever is still pending.
#[instrument(skip_all, fields(campaign_id = %id))]
pub async fn pause_campaign(pool: &Pool, id: &str) -> Result<(), CampaignError> {
    let status = current_status(pool, id).await?;
    if !db::transition_campaign(pool, id, CampaignStatus::Paused, &[CampaignStatus::Processing])
        .await?
    {
        return Err(invalid(status, CampaignStatus::Paused));
    }
    info!("campaign paused");
    Ok(())
}

/// Terminal cancel from any non-terminal state. Jobs already in the queue are
/// not revoked; workers consume them as no-ops.
#[instrument(skip_all, fields(campaign_id = %id))]
pub async fn cancel_campaign(pool: &Pool, id: &str) -> Result<(), CampaignError> {
    let status = current_status(pool, id).await?;
    let from = [
        CampaignStatus::Draft,
        CampaignStatus::Processing,
        CampaignStatus::Paused,
    ];
    if !db::transition_campaign(pool, id, CampaignStatus::Cancelled, &from).await? {
        return Err(invalid(status, CampaignStatus::Cancelled));
    }
    info!("campaign cancelled");
    Ok(())
}

/// Completion detector, run after every executed job outcome. Flips the
/// campaign to `completed` iff no recipient remains pending AND the status is
/// still `processing`; the guarded UPDATE makes the flip happen exactly once
/// under concurrent workers. Returns true iff this call won the flip.
#[instrument(skip_all, fields(campaign_id = %id))]
pub async fn check_completion(pool: &Pool, id: &str) -> Result<bool> {
    if db::count_pending(pool, id).await? > 0 {
        return Ok(false);
    }
    let completed = db::complete_campaign(pool, id, Utc::now()).await?;
    if completed {
        info!("campaign completed");
    }
    Ok(completed)
}
