use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use wadispatch::db;
use wadispatch::model::{
    CampaignStatus, MessageStatus, RecipientJob, RecipientStatus, StatsSnapshot, WhatsAppAccount,
};
use wadispatch::realtime::RealtimeSink;
use wadispatch::whatsapp::WhatsAppService;
use wadispatch::worker::{process_next_job, WorkerConfig};
use wadispatch::{campaign, queue};

/// Pooled in-memory SQLite connections do not share state, so integration
/// tests run against a file-backed database in a temp dir.
async fn setup_pool() -> (db::Pool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/test.db?mode=rwc", dir.path().display());
    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    (pool, dir)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SendCall {
    to: String,
    template_name: String,
    language: String,
    params: Vec<String>,
}

#[derive(Clone, Default)]
struct RecordingWhatsApp {
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    calls: Arc<Mutex<Vec<SendCall>>>,
}

impl RecordingWhatsApp {
    fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl WhatsAppService for RecordingWhatsApp {
    async fn send_template(
        &self,
        _account: &WhatsAppAccount,
        to: &str,
        template_name: &str,
        language: &str,
        body_params: &[String],
    ) -> Result<String> {
        self.calls.lock().await.push(SendCall {
            to: to.to_string(),
            template_name: template_name.to_string(),
            language: language.to_string(),
            params: body_params.to_vec(),
        });
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok("wamid.test".into()))
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    snapshots: Arc<Mutex<Vec<StatsSnapshot>>>,
}

impl RecordingSink {
    async fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl RealtimeSink for RecordingSink {
    async fn publish(&self, snapshot: &StatsSnapshot) -> Result<()> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(())
    }
}

async fn seed_campaign(
    pool: &db::Pool,
    with_account: bool,
    recipients: &[(&str, &[(&str, &str)])],
) -> String {
    let account_id = if with_account {
        Some(
            db::create_account(pool, "org-1", "1050123", "token", Some("Main line"))
                .await
                .unwrap(),
        )
    } else {
        None
    };
    let tpl = db::create_template(
        pool,
        "org-1",
        "order_ready",
        "en",
        "Hello {{name}}, order {{order_id}} ready",
    )
    .await
    .unwrap();
    let cid = db::create_campaign(pool, "org-1", account_id.as_deref(), &tpl, Some("Launch"))
        .await
        .unwrap();
    for (phone, params) in recipients {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        db::add_recipient(pool, &cid, phone, Some("Tester"), &params)
            .await
            .unwrap();
    }
    cid
}

async fn drain(
    pool: &db::Pool,
    wa: &RecordingWhatsApp,
    sink: &RecordingSink,
    cfg: &WorkerConfig,
) {
    while process_next_job(pool, wa, sink, "w1", cfg).await.unwrap() {}
}

#[tokio::test]
async fn campaign_completes_end_to_end() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(
        &pool,
        true,
        &[
            ("+15550001", &[("name", "John"), ("order_id", "ORD-1")]),
            ("+15550002", &[("name", "Ana"), ("order_id", "ORD-2")]),
        ],
    )
    .await;

    let wa = RecordingWhatsApp::with_responses(vec![
        Ok("wamid.1".into()),
        Err(anyhow!("whatsapp error 400: invalid number")),
    ]);
    let sink = RecordingSink::default();
    let cfg = WorkerConfig::default();

    assert_eq!(campaign::start_campaign(&pool, &cid).await.unwrap(), 2);
    drain(&pool, &wa, &sink, &cfg).await;

    // Queue fully acknowledged.
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);

    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert!(c.completed_at.is_some());
    assert_eq!(c.sent_count, 1);
    assert_eq!(c.failed_count, 1);
    assert!(c.sent_count + c.failed_count <= c.total_recipients);

    let recipients = sqlx::query_as::<_, (String, String, Option<String>, Option<String>)>(
        "SELECT phone, status, wa_message_id, error FROM recipients WHERE campaign_id = ? ORDER BY phone",
    )
    .bind(&cid)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(recipients[0].1, "sent");
    assert_eq!(recipients[0].2.as_deref(), Some("wamid.1"));
    assert_eq!(recipients[1].1, "failed");
    assert!(recipients[1].3.as_deref().unwrap().contains("invalid number"));

    // One history row per executed send, with the rendered body.
    let messages = sqlx::query_as::<_, (String, String)>(
        "SELECT status, body FROM messages WHERE campaign_id = ? ORDER BY status DESC",
    )
    .bind(&cid)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].0, MessageStatus::Sent.as_str());
    assert_eq!(messages[0].1, "Hello John, order ORD-1 ready");
    assert_eq!(messages[1].0, MessageStatus::Failed.as_str());

    // Send calls carried the resolved parameters in body order.
    let calls = wa.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].template_name, "order_ready");
    assert_eq!(calls[0].params, vec!["John", "ORD-1"]);

    // A snapshot per executed outcome; the last one is terminal.
    let snapshots = sink.snapshots().await;
    assert_eq!(snapshots.len(), 2);
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, CampaignStatus::Completed);
    assert_eq!(last.sent_count + last.failed_count, 2);

    // Contacts were resolved for both recipients.
    let contacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(contacts, 2);
}

#[tokio::test]
async fn paused_campaign_jobs_are_consumed_without_mutation() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(
        &pool,
        true,
        &[("+15550001", &[("1", "A")]), ("+15550002", &[("1", "B")])],
    )
    .await;
    campaign::start_campaign(&pool, &cid).await.unwrap();
    campaign::pause_campaign(&pool, &cid).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    let cfg = WorkerConfig::default();
    drain(&pool, &wa, &sink, &cfg).await;

    // Jobs acknowledged, not redelivered; nothing executed or mutated.
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);
    assert!(wa.calls().await.is_empty());
    assert!(sink.snapshots().await.is_empty());

    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Paused);
    assert_eq!(c.sent_count, 0);
    assert_eq!(c.failed_count, 0);
    assert_eq!(db::count_pending(&pool, &cid).await.unwrap(), 2);
}

#[tokio::test]
async fn resume_redispatches_only_pending_recipients() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(
        &pool,
        true,
        &[("+15550001", &[("1", "A")]), ("+15550002", &[("1", "B")])],
    )
    .await;
    campaign::start_campaign(&pool, &cid).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    let cfg = WorkerConfig::default();

    // First recipient goes out, then the campaign is paused and the second
    // job is consumed as a no-op.
    process_next_job(&pool, &wa, &sink, "w1", &cfg).await.unwrap();
    campaign::pause_campaign(&pool, &cid).await.unwrap();
    drain(&pool, &wa, &sink, &cfg).await;
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);
    assert_eq!(db::count_pending(&pool, &cid).await.unwrap(), 1);

    // Resume re-enqueues exactly the still-pending recipient.
    assert_eq!(campaign::resume_campaign(&pool, &cid).await.unwrap(), 1);
    drain(&pool, &wa, &sink, &cfg).await;

    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert_eq!(c.sent_count, 2);
    assert_eq!(wa.calls().await.len(), 2);
}

#[tokio::test]
async fn recipients_imported_while_paused_keep_counter_invariant() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(&pool, true, &[("+15550001", &[("1", "A")])]).await;
    campaign::start_campaign(&pool, &cid).await.unwrap();
    campaign::pause_campaign(&pool, &cid).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    let cfg = WorkerConfig::default();
    // The queued job is consumed as a no-op while paused.
    drain(&pool, &wa, &sink, &cfg).await;

    // Import lands during the paused window.
    db::add_recipient(&pool, &cid, "+15550002", Some("Late"), &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(campaign::resume_campaign(&pool, &cid).await.unwrap(), 2);
    drain(&pool, &wa, &sink, &cfg).await;

    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.total_recipients, 2);
    assert_eq!(c.sent_count, 2);
    assert!(c.sent_count + c.failed_count <= c.total_recipients);
    assert_eq!(c.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn healed_completion_publishes_terminal_snapshot() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(&pool, true, &[("+15550001", &[("1", "A")])]).await;
    campaign::start_campaign(&pool, &cid).await.unwrap();

    // Simulate a crash between the recipient flip and the completion check:
    // the recipient is terminal and counted, but the job is still queued and
    // will be redelivered.
    let rec_id = sqlx::query_scalar::<_, String>("SELECT id FROM recipients WHERE campaign_id = ?")
        .bind(&cid)
        .fetch_one(&pool)
        .await
        .unwrap();
    db::mark_recipient_sent(&pool, &rec_id, "wamid.1", Utc::now())
        .await
        .unwrap();
    db::increment_sent(&pool, &cid).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    drain(&pool, &wa, &sink, &WorkerConfig::default()).await;

    // No duplicate send, but the redelivered job completes the campaign and
    // observers see the terminal snapshot.
    assert!(wa.calls().await.is_empty());
    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);

    let snapshots = sink.snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, CampaignStatus::Completed);
    assert_eq!(snapshots[0].sent_count, 1);
}

#[tokio::test]
async fn missing_account_is_terminal_not_requeued() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(&pool, false, &[("+15550001", &[("1", "A")])]).await;
    campaign::start_campaign(&pool, &cid).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    drain(&pool, &wa, &sink, &WorkerConfig::default()).await;

    assert_eq!(queue::depth(&pool).await.unwrap(), 0);
    assert!(wa.calls().await.is_empty());

    let rec = db::pending_recipients(&pool, &cid).await.unwrap();
    assert!(rec.is_empty());
    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.failed_count, 1);
    // All recipients terminal, so the detector completes the campaign.
    assert_eq!(c.status, CampaignStatus::Completed);

    let row = sqlx::query_as::<_, (String, Option<String>)>(
        "SELECT status, error FROM recipients WHERE campaign_id = ?",
    )
    .bind(&cid)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.0, RecipientStatus::Failed.as_str());
    assert!(row.1.unwrap().contains("account missing"));

    // Configuration failures leave no message history row.
    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE campaign_id = ?")
        .bind(&cid)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(messages, 0);
}

#[tokio::test]
async fn integrity_error_backs_off_for_redelivery() {
    let (pool, _dir) = setup_pool().await;

    // Job that references no campaign at all.
    let job = RecipientJob {
        campaign_id: "ghost".into(),
        recipient_id: "ghost-rec".into(),
        org_id: "org-1".into(),
        phone: "+15550001".into(),
        display_name: None,
        params: BTreeMap::new(),
    };
    queue::enqueue(&pool, &job).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    let claimed = process_next_job(&pool, &wa, &sink, "w1", &WorkerConfig::default())
        .await
        .unwrap();
    assert!(claimed);

    // Not acknowledged: still queued with a bumped attempt, deferred.
    assert_eq!(queue::depth(&pool).await.unwrap(), 1);
    let attempt: i64 = sqlx::query_scalar("SELECT attempt FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(attempt, 1);
}

#[tokio::test]
async fn redelivered_job_for_terminal_recipient_sends_nothing() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(&pool, true, &[("+15550001", &[("1", "A")])]).await;
    campaign::start_campaign(&pool, &cid).await.unwrap();

    let wa = RecordingWhatsApp::default();
    let sink = RecordingSink::default();
    let cfg = WorkerConfig::default();
    drain(&pool, &wa, &sink, &cfg).await;
    assert_eq!(wa.calls().await.len(), 1);

    // Simulate at-least-once redelivery of the same job.
    let rec_id = sqlx::query_scalar::<_, String>("SELECT id FROM recipients WHERE campaign_id = ?")
        .bind(&cid)
        .fetch_one(&pool)
        .await
        .unwrap();
    let recipient = db::get_recipient(&pool, &rec_id).await.unwrap().unwrap();
    queue::enqueue(
        &pool,
        &RecipientJob {
            campaign_id: cid.clone(),
            recipient_id: recipient.id,
            org_id: "org-1".into(),
            phone: recipient.phone,
            display_name: recipient.display_name,
            params: recipient.params,
        },
    )
    .await
    .unwrap();
    drain(&pool, &wa, &sink, &cfg).await;

    // No duplicate send, no double count.
    assert_eq!(wa.calls().await.len(), 1);
    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.sent_count, 1);
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_flips_exactly_once_under_concurrency() {
    let (pool, _dir) = setup_pool().await;
    let cid = seed_campaign(
        &pool,
        true,
        &[
            ("+15550001", &[("1", "A")]),
            ("+15550002", &[("1", "B")]),
            ("+15550003", &[("1", "C")]),
            ("+15550004", &[("1", "D")]),
        ],
    )
    .await;
    campaign::start_campaign(&pool, &cid).await.unwrap();
    for rec in db::pending_recipients(&pool, &cid).await.unwrap() {
        db::mark_recipient_sent(&pool, &rec.id, "wamid.x", Utc::now())
            .await
            .unwrap();
    }

    // Many workers finish the last recipients simultaneously; the guarded
    // conditional update lets exactly one perform the transition.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let cid = cid.clone();
        handles.push(tokio::spawn(async move {
            campaign::check_completion(&pool, &cid).await.unwrap()
        }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let c = db::get_campaign(&pool, &cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert!(c.completed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_contact_resolution_creates_one_row() {
    let (pool, _dir) = setup_pool().await;

    let a = {
        let pool = pool.clone();
        tokio::spawn(async move {
            db::get_or_create_contact(&pool, "org-1", "+1 555 010 2030", Some("A")).await
        })
    };
    let b = {
        let pool = pool.clone();
        tokio::spawn(
            async move { db::get_or_create_contact(&pool, "org-1", "+15550102030", None).await },
        )
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a.id, b.id);

    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(cnt, 1);
}
