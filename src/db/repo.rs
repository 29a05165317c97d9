use super::model::CampaignForSend;
use crate::model::{
    Campaign, CampaignStatus, Contact, MessageStatus, Recipient, RecipientStatus, StatsSnapshot,
    Template, WhatsAppAccount,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    // Expand leading ~/ to HOME
    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_params(raw: &str) -> Result<BTreeMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw).map_err(|e| anyhow!("invalid params JSON: {e}"))
}

fn campaign_status(raw: &str) -> Result<CampaignStatus> {
    CampaignStatus::parse(raw).ok_or_else(|| anyhow!("unknown campaign status: {raw}"))
}

fn recipient_status(raw: &str) -> Result<RecipientStatus> {
    RecipientStatus::parse(raw).ok_or_else(|| anyhow!("unknown recipient status: {raw}"))
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_account(
    pool: &Pool,
    org_id: &str,
    phone_number_id: &str,
    access_token: &str,
    display_name: Option<&str>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO accounts (id, org_id, phone_number_id, access_token, display_name) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(org_id)
    .bind(phone_number_id)
    .bind(access_token)
    .bind(display_name)
    .execute(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_account(pool: &Pool, id: &str) -> Result<Option<WhatsAppAccount>> {
    let row = sqlx::query(
        "SELECT id, org_id, phone_number_id, access_token, display_name, last_used_at FROM accounts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => Ok(Some(WhatsAppAccount {
            id: row.get("id"),
            org_id: row.get("org_id"),
            phone_number_id: row.get("phone_number_id"),
            access_token: row.get("access_token"),
            display_name: row.get("display_name"),
            last_used_at: row.get("last_used_at"),
        })),
        None => Ok(None),
    }
}

#[instrument(skip_all)]
pub async fn touch_account_last_used(pool: &Pool, id: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE accounts SET last_used_at = ? WHERE id = ?")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_template(
    pool: &Pool,
    org_id: &str,
    name: &str,
    language: &str,
    body: &str,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO templates (id, org_id, name, language, body) VALUES (?, ?, ?, ?, ?)")
        .bind(&id)
        .bind(org_id)
        .bind(name)
        .bind(language)
        .bind(body)
        .execute(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_template(pool: &Pool, id: &str) -> Result<Option<Template>> {
    let row = sqlx::query("SELECT id, org_id, name, language, body FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(Template {
            id: row.get("id"),
            org_id: row.get("org_id"),
            name: row.get("name"),
            language: row.get("language"),
            body: row.get("body"),
        })),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_campaign(
    pool: &Pool,
    org_id: &str,
    account_id: Option<&str>,
    template_id: &str,
    name: Option<&str>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO campaigns (id, org_id, account_id, template_id, name, status) VALUES (?, ?, ?, ?, ?, 'draft')",
    )
    .bind(&id)
    .bind(org_id)
    .bind(account_id)
    .bind(template_id)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(id)
}

fn map_campaign(row: &SqliteRow) -> Result<Campaign> {
    let status: String = row.get("status");
    Ok(Campaign {
        id: row.get("id"),
        org_id: row.get("org_id"),
        account_id: row.get("account_id"),
        template_id: row.get("template_id"),
        name: row.get("name"),
        total_recipients: row.get("total_recipients"),
        sent_count: row.get("sent_count"),
        delivered_count: row.get("delivered_count"),
        read_count: row.get("read_count"),
        failed_count: row.get("failed_count"),
        status: campaign_status(&status)?,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

#[instrument(skip_all)]
pub async fn get_campaign(pool: &Pool, id: &str) -> Result<Option<Campaign>> {
    let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_campaign).transpose()
}

/// Campaign joined with its template, the shape the job handler consumes.
/// `None` when the campaign does not exist; a campaign whose template row is
/// gone also yields `None` (both are integrity errors upstream).
#[instrument(skip_all)]
pub async fn get_campaign_for_send(pool: &Pool, id: &str) -> Result<Option<CampaignForSend>> {
    let row = sqlx::query(
        "SELECT c.id AS campaign_id, c.org_id, c.account_id, c.status, \
                t.name AS template_name, t.language AS template_language, t.body AS template_body \
         FROM campaigns c JOIN templates t ON t.id = c.template_id \
         WHERE c.id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => {
            let status: String = row.get("status");
            Ok(Some(CampaignForSend {
                campaign_id: row.get("campaign_id"),
                org_id: row.get("org_id"),
                account_id: row.get("account_id"),
                status: campaign_status(&status)?,
                template_name: row.get("template_name"),
                template_language: row.get("template_language"),
                template_body: row.get("template_body"),
            }))
        }
        None => Ok(None),
    }
}

/// Guarded status transition. Returns true iff this call performed the flip
/// (the row was in one of `from` at update time).
#[instrument(skip_all)]
pub async fn transition_campaign(
    pool: &Pool,
    id: &str,
    to: CampaignStatus,
    from: &[CampaignStatus],
) -> Result<bool> {
    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        "UPDATE campaigns SET status = ? WHERE id = ? AND status IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql).bind(to.as_str()).bind(id);
    for f in from {
        query = query.bind(f.as_str());
    }
    let res = query.execute(pool).await?;
    Ok(res.rows_affected() == 1)
}

/// Conditional completion flip: `set completed where status = processing`.
/// Safe under N workers racing on the last recipients; exactly one wins.
#[instrument(skip_all)]
pub async fn complete_campaign(pool: &Pool, id: &str, at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET status = 'completed', completed_at = ? WHERE id = ? AND status = 'processing'",
    )
    .bind(at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn increment_sent(pool: &Pool, campaign_id: &str) -> Result<()> {
    sqlx::query("UPDATE campaigns SET sent_count = sent_count + 1 WHERE id = ?")
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn increment_failed(pool: &Pool, campaign_id: &str) -> Result<()> {
    sqlx::query("UPDATE campaigns SET failed_count = failed_count + 1 WHERE id = ?")
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn stats_snapshot(pool: &Pool, campaign_id: &str) -> Result<Option<StatsSnapshot>> {
    let row = sqlx::query(
        "SELECT id, org_id, status, total_recipients, sent_count, delivered_count, read_count, failed_count \
         FROM campaigns WHERE id = ?",
    )
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => {
            let status: String = row.get("status");
            Ok(Some(StatsSnapshot {
                campaign_id: row.get("id"),
                org_id: row.get("org_id"),
                status: campaign_status(&status)?,
                total_recipients: row.get("total_recipients"),
                sent_count: row.get("sent_count"),
                delivered_count: row.get("delivered_count"),
                read_count: row.get("read_count"),
                failed_count: row.get("failed_count"),
            }))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Recipients
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn add_recipient(
    pool: &Pool,
    campaign_id: &str,
    phone: &str,
    display_name: Option<&str>,
    params: &BTreeMap<String, String>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO recipients (id, campaign_id, phone, display_name, params, status) VALUES (?, ?, ?, ?, ?, 'pending')",
    )
    .bind(&id)
    .bind(campaign_id)
    .bind(phone)
    .bind(display_name)
    .bind(serde_json::to_string(params)?)
    .execute(pool)
    .await?;
    Ok(id)
}

fn map_recipient(row: &SqliteRow) -> Result<Recipient> {
    let status: String = row.get("status");
    let params: String = row.get("params");
    Ok(Recipient {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        phone: row.get("phone"),
        display_name: row.get("display_name"),
        params: parse_params(&params)?,
        status: recipient_status(&status)?,
        wa_message_id: row.get("wa_message_id"),
        error: row.get("error"),
        sent_at: row.get("sent_at"),
    })
}

#[instrument(skip_all)]
pub async fn get_recipient(pool: &Pool, id: &str) -> Result<Option<Recipient>> {
    let row = sqlx::query("SELECT * FROM recipients WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_recipient).transpose()
}

#[instrument(skip_all)]
pub async fn pending_recipients(pool: &Pool, campaign_id: &str) -> Result<Vec<Recipient>> {
    let rows = sqlx::query(
        "SELECT * FROM recipients WHERE campaign_id = ? AND status = 'pending' ORDER BY rowid ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_recipient).collect()
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool, campaign_id: &str) -> Result<i64> {
    let cnt: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM recipients WHERE campaign_id = ? AND status = 'pending'")
            .bind(campaign_id)
            .fetch_one(pool)
            .await?;
    Ok(cnt)
}

#[instrument(skip_all)]
pub async fn count_recipients(pool: &Pool, campaign_id: &str) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recipients WHERE campaign_id = ?")
        .bind(campaign_id)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

/// Flip a pending recipient to `sent`. Guarded on the pending status so a
/// redelivered job can never overwrite a terminal row. Returns true iff this
/// call performed the flip.
#[instrument(skip_all)]
pub async fn mark_recipient_sent(
    pool: &Pool,
    id: &str,
    wa_message_id: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE recipients SET status = 'sent', wa_message_id = ?, sent_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(wa_message_id)
    .bind(at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Flip a pending recipient to `failed`, recording the error text.
#[instrument(skip_all)]
pub async fn mark_recipient_failed(pool: &Pool, id: &str, error: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE recipients SET status = 'failed', error = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

/// Get-or-create keyed on (org_id, normalized phone). Concurrent-safe: the
/// insert ignores the unique-constraint conflict and we re-query, so two
/// workers racing on the same new phone resolve to one row.
#[instrument(skip_all)]
pub async fn get_or_create_contact(
    pool: &Pool,
    org_id: &str,
    phone: &str,
    display_name: Option<&str>,
) -> Result<Contact> {
    let phone = normalize_phone(phone);
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO contacts (id, org_id, phone, display_name) VALUES (?, ?, ?, ?) \
         ON CONFLICT (org_id, phone) DO NOTHING",
    )
    .bind(&id)
    .bind(org_id)
    .bind(&phone)
    .bind(display_name)
    .execute(pool)
    .await?;

    let row = sqlx::query(
        "SELECT id, org_id, phone, display_name, created_at FROM contacts WHERE org_id = ? AND phone = ?",
    )
    .bind(org_id)
    .bind(&phone)
    .fetch_one(pool)
    .await?;
    Ok(Contact {
        id: row.get("id"),
        org_id: row.get("org_id"),
        phone: row.get("phone"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    })
}

/// Keep digits and a single leading `+`.
pub fn normalize_phone(phone: &str) -> String {
    let mut out = String::with_capacity(phone.len());
    for (i, c) in phone.trim().chars().enumerate() {
        if c.is_ascii_digit() || (c == '+' && i == 0) {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub async fn insert_message(
    pool: &Pool,
    org_id: &str,
    campaign_id: &str,
    recipient_id: &str,
    contact_id: Option<&str>,
    wa_message_id: Option<&str>,
    body: &str,
    status: MessageStatus,
    error: Option<&str>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO messages (id, org_id, campaign_id, recipient_id, contact_id, wa_message_id, body, status, error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(org_id)
    .bind(campaign_id)
    .bind(recipient_id)
    .bind(contact_id)
    .bind(wa_message_id)
    .bind(body)
    .bind(status.as_str())
    .bind(error)
    .execute(pool)
    .await?;
    Ok(id)
}
