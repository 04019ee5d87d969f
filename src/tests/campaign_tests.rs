//! tests/campaign_tests.rs
//! Claim exclusivo, transiciones de control y el dispatcher completo contra
//! un proveedor guionado.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::time::Instant;

use crate::errors::{DispatchError, ErrorKind};
use crate::models::campaign_model::{Campaign, CampaignStatus, ControlAction};
use crate::models::now_timestamp;
use crate::models::recipient_job_model::JobStatus;
use crate::services::campaign_service::CampaignService;
use crate::services::message_sender::TemplateState;
use crate::tests::support::{
    add_contact, add_list, create_campaign, file_pool, memory_pool, new_campaign, scripted,
    test_config, Harness, ScriptedProvider, OWNER,
};

const LEASE: Duration = Duration::from_secs(30);
const WITHIN: Duration = Duration::from_secs(10);

async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + within;
    while !cond() {
        assert!(Instant::now() < deadline, "condición no alcanzada a tiempo");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[actix_rt::test]
async fn only_one_concurrent_claim_wins() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir).await;
    add_list(&pool, OWNER, "list-1").await;
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let claims = (0..8).map(|n| {
        let service = CampaignService::new(pool.clone());
        let id = campaign.id.clone();
        async move { service.claim(&id, &format!("instance-{n}:token"), LEASE).await }
    });
    let results = join_all(claims).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(DispatchError::ClaimConflict(_))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);

    let claimed = CampaignService::new(pool.clone()).get_campaign(&campaign.id).await.unwrap();
    assert_eq!(claimed.status, CampaignStatus::Running);
    assert!(claimed.lease_owner.unwrap().starts_with("instance-"));
}

#[actix_rt::test]
async fn lease_lifecycle_controls_dispatchability() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    let service = CampaignService::new(pool.clone());

    let due = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;
    let mut later = new_campaign(&["list-1"], CampaignStatus::Scheduled);
    later.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    let later = create_campaign(&pool, later).await;
    let orphan = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Running)).await;
    create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Draft)).await;
    create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Paused)).await;

    let ids = |campaigns: Vec<Campaign>| {
        let mut ids: Vec<String> = campaigns.into_iter().map(|c| c.id).collect();
        ids.sort();
        ids
    };
    let mut expected = vec![due.id.clone(), orphan.id.clone()];
    expected.sort();
    assert_eq!(ids(service.find_dispatchable(Utc::now(), 10).await.unwrap()), expected);

    // lease vigente: deja de ser despachable
    service.claim(&due.id, "a:1", LEASE).await.unwrap();
    assert_eq!(
        ids(service.find_dispatchable(Utc::now(), 10).await.unwrap()),
        vec![orphan.id.clone()]
    );
    assert!(matches!(
        service.claim(&due.id, "b:1", LEASE).await,
        Err(DispatchError::ClaimConflict(_))
    ));
    assert!(matches!(
        service.claim(&later.id, "b:1", LEASE).await,
        Err(DispatchError::ClaimConflict(_))
    ));

    assert!(service.renew_lease(&due.id, "a:1", LEASE).await.unwrap());
    assert!(!service.renew_lease(&due.id, "b:1", LEASE).await.unwrap());

    assert!(service.release_lease(&due.id, "a:1").await.unwrap());
    assert!(!service.release_lease(&due.id, "a:1").await.unwrap());
    assert!(ids(service.find_dispatchable(Utc::now(), 10).await.unwrap()).contains(&due.id));

    let reclaimed = service.claim(&due.id, "b:2", LEASE).await.unwrap();
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("b:2"));

    assert!(!service
        .finish(&due.id, "a:1", CampaignStatus::Completed, None)
        .await
        .unwrap());
    assert!(matches!(
        service.finish(&due.id, "b:2", CampaignStatus::Scheduled, None).await,
        Err(DispatchError::InvalidTransition { .. })
    ));
    assert!(service
        .finish(&due.id, "b:2", CampaignStatus::Completed, None)
        .await
        .unwrap());

    let done = service.get_campaign(&due.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.lease_owner, None);
    assert!(!service.renew_lease(&due.id, "b:2", LEASE).await.unwrap());
}

#[actix_rt::test]
async fn control_actions_follow_the_state_machine() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    let service = CampaignService::new(pool.clone());

    let draft = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Draft)).await;
    for action in [ControlAction::Pause, ControlAction::Resume] {
        assert!(matches!(
            service.apply_control(&draft.id, action).await,
            Err(DispatchError::InvalidTransition { .. })
        ));
    }
    let cancelled = service.apply_control(&draft.id, ControlAction::Cancel).await.unwrap();
    assert_eq!(cancelled.status, CampaignStatus::Cancelled);
    assert!(matches!(
        service.apply_control(&draft.id, ControlAction::Cancel).await,
        Err(DispatchError::InvalidTransition { .. })
    ));

    let running = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;
    service.claim(&running.id, "a:1", LEASE).await.unwrap();
    let paused = service.apply_control(&running.id, ControlAction::Pause).await.unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert!(!service.renew_lease(&running.id, "a:1", LEASE).await.unwrap());

    let resumed = service.apply_control(&running.id, ControlAction::Resume).await.unwrap();
    assert_eq!(resumed.status, CampaignStatus::Running);

    assert!(matches!(
        service.apply_control("missing", ControlAction::Cancel).await,
        Err(DispatchError::NotFound(_))
    ));
}

#[actix_rt::test]
async fn pause_and_resume_keep_the_lease_with_its_owner() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    let service = CampaignService::new(pool.clone());
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    service.claim(&campaign.id, "proc-b:1", Duration::from_secs(60)).await.unwrap();
    let paused = service.apply_control(&campaign.id, ControlAction::Pause).await.unwrap();
    assert_eq!(paused.lease_owner.as_deref(), Some("proc-b:1"));
    let resumed = service.apply_control(&campaign.id, ControlAction::Resume).await.unwrap();
    assert_eq!(resumed.status, CampaignStatus::Running);
    assert_eq!(resumed.lease_owner.as_deref(), Some("proc-b:1"));

    // mientras el dueño anterior no suelte su lease nadie más la toma
    let due = service.find_dispatchable(Utc::now(), 10).await.unwrap();
    assert!(due.iter().all(|c| c.id != campaign.id));
    assert!(matches!(
        service.claim(&campaign.id, "proc-a:1", LEASE).await,
        Err(DispatchError::ClaimConflict(_))
    ));

    assert!(service.release_lease(&campaign.id, "proc-b:1").await.unwrap());
    let reclaimed = service.claim(&campaign.id, "proc-a:1", LEASE).await.unwrap();
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("proc-a:1"));

    let cancelled = service.apply_control(&campaign.id, ControlAction::Cancel).await.unwrap();
    assert_eq!(cancelled.status, CampaignStatus::Cancelled);
    assert_eq!(cancelled.lease_owner.as_deref(), Some("proc-a:1"));
    assert!(service.release_lease(&campaign.id, "proc-a:1").await.unwrap());
}

#[actix_rt::test]
async fn dispatches_with_rate_limit_retries_and_permanent_failures() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    add_contact(&pool, "list-1", "c-a", "15550001").await;
    add_contact(&pool, "list-1", "c-b", "15550002").await;
    add_contact(&pool, "list-1", "c-c", "15550003").await;
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.fail_with("15550002", vec![scripted(ErrorKind::InvalidRecipient)]);
    provider.fail_with(
        "15550003",
        vec![scripted(ErrorKind::ServerError), scripted(ErrorKind::ServerError)],
    );

    let started = Instant::now();
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(2.0));
    harness
        .wait_for_status(&campaign.id, CampaignStatus::Completed, WITHIN)
        .await;
    // 5 envíos a 2/s con el bucket arrancando vacío
    assert!(started.elapsed() >= Duration::from_secs(2));

    let tracker = &harness.services.tracker;
    let a = tracker.get_job(&campaign.id, "c-a").await.unwrap();
    let b = tracker.get_job(&campaign.id, "c-b").await.unwrap();
    let c = tracker.get_job(&campaign.id, "c-c").await.unwrap();
    assert_eq!((a.status, a.attempt_count), (JobStatus::Sent, 1));
    assert_eq!((b.status, b.attempt_count), (JobStatus::Failed, 1));
    assert_eq!(b.last_error_kind, Some(ErrorKind::InvalidRecipient));
    assert_eq!((c.status, c.attempt_count), (JobStatus::Sent, 3));
    assert!(c.provider_message_id.is_some());
    assert_eq!(provider.total_calls(), 5);

    let (progress, statuses) = harness.stop().await;
    assert_eq!(progress.len(), 5);
    let attempts: Vec<i64> = progress.iter().map(|e| e.counters.attempts).collect();
    assert!(attempts.windows(2).all(|w| w[0] < w[1]), "{attempts:?}");
    let last = progress.last().unwrap().counters;
    assert_eq!((last.sent, last.failed, last.pending), (2, 1, 0));

    let states: Vec<CampaignStatus> = statuses.iter().map(|e| e.status).collect();
    assert_eq!(states, vec![CampaignStatus::Running, CampaignStatus::Completed]);
    assert!(statuses.iter().all(|e| e.owner_id == OWNER));
}

#[actix_rt::test]
async fn pause_stops_new_sends_and_resume_finishes_once_each() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    let phones: Vec<String> = (1..=8).map(|n| format!("1555000{n}")).collect();
    for (n, phone) in phones.iter().enumerate() {
        add_contact(&pool, "list-1", &format!("c-{n}"), phone).await;
    }
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(4.0));

    wait_until(WITHIN, || provider.total_calls() >= 2).await;
    let paused = harness.control.pause(&campaign.id).await.unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);

    // los envíos en vuelo terminan; después no sale ninguno más
    tokio::time::sleep(Duration::from_millis(300)).await;
    let during_pause = provider.total_calls();
    assert!(during_pause < phones.len());
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(provider.total_calls(), during_pause);
    let still = harness.services.campaigns.get_campaign(&campaign.id).await.unwrap();
    assert_eq!(still.status, CampaignStatus::Paused);
    // la rutina detenida suelta su propio lease
    assert_eq!(still.lease_owner, None);

    harness.control.resume(&campaign.id).await.unwrap();
    harness
        .wait_for_status(&campaign.id, CampaignStatus::Completed, WITHIN)
        .await;

    for phone in &phones {
        assert_eq!(provider.calls_for(phone), 1, "{phone}");
    }
    harness.stop().await;
}

#[actix_rt::test]
async fn cancel_is_final() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    for n in 1..=6 {
        add_contact(&pool, "list-1", &format!("c-{n}"), &format!("1555000{n}")).await;
    }
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(4.0));

    wait_until(WITHIN, || provider.total_calls() >= 1).await;
    let cancelled = harness.control.cancel(&campaign.id).await.unwrap();
    assert_eq!(cancelled.status, CampaignStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let after_cancel = provider.total_calls();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(provider.total_calls(), after_cancel);
    assert!(after_cancel < 6);

    let again = harness.control.cancel(&campaign.id).await;
    assert!(matches!(again, Err(DispatchError::InvalidTransition { .. })));
    let resume = harness.control.resume(&campaign.id).await;
    assert!(matches!(resume, Err(DispatchError::InvalidTransition { .. })));

    let campaign = harness.services.campaigns.get_campaign(&campaign.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Cancelled);
    assert_eq!(campaign.lease_owner, None);
    harness.stop().await;
}

#[actix_rt::test]
async fn transient_failures_are_capped_at_max_attempts() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    add_contact(&pool, "list-1", "c-1", "15550001").await;
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.fail_with("15550001", (0..5).map(|_| scripted(ErrorKind::ServerError)).collect());

    let harness = Harness::start(pool.clone(), provider.clone(), test_config(20.0));
    harness
        .wait_for_status(&campaign.id, CampaignStatus::Completed, WITHIN)
        .await;

    let job = harness.services.tracker.get_job(&campaign.id, "c-1").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.last_error_kind, Some(ErrorKind::ServerError));
    assert_eq!(provider.calls_for("15550001"), 3);
    harness.stop().await;
}

#[actix_rt::test]
async fn unusable_targets_fail_the_campaign() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "empty").await;
    let no_lists = create_campaign(&pool, new_campaign(&[], CampaignStatus::Scheduled)).await;
    let empty = create_campaign(&pool, new_campaign(&["empty"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(20.0));

    let failed = harness
        .wait_for_status(&no_lists.id, CampaignStatus::Failed, WITHIN)
        .await;
    assert!(failed.failure_reason.unwrap().contains("no contact lists"));

    let failed = harness
        .wait_for_status(&empty.id, CampaignStatus::Failed, WITHIN)
        .await;
    assert!(failed.failure_reason.unwrap().contains("no recipients"));
    assert_eq!(provider.total_calls(), 0);

    let (_, statuses) = harness.stop().await;
    let failures = statuses
        .iter()
        .filter(|e| e.status == CampaignStatus::Failed)
        .count();
    assert_eq!(failures, 2);
}

#[actix_rt::test]
async fn rejected_template_fails_before_sending() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    add_contact(&pool, "list-1", "c-1", "15550001").await;
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.set_template_state(TemplateState::Rejected("INVALID_FORMAT".to_string()));
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(20.0));

    let failed = harness
        .wait_for_status(&campaign.id, CampaignStatus::Failed, WITHIN)
        .await;
    assert!(failed.failure_reason.unwrap().contains("INVALID_FORMAT"));
    assert_eq!(provider.total_calls(), 0);
    harness.stop().await;
}

#[actix_rt::test]
async fn expired_lease_is_resumed_without_resending() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    add_contact(&pool, "list-1", "c-a", "15550001").await;
    add_contact(&pool, "list-1", "c-b", "15550002").await;
    add_contact(&pool, "list-1", "c-c", "15550003").await;
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Running)).await;

    // proceso anterior caído: lease vencido y A ya enviado
    sqlx::query("UPDATE campaigns SET lease_owner = 'dead:1', lease_expires_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1")
        .bind(&campaign.id)
        .execute(&pool)
        .await
        .unwrap();
    let now = now_timestamp();
    sqlx::query(
        r#"
        INSERT INTO recipient_jobs (campaign_id, contact_id, phone, status, attempt_count, provider_message_id, created_at, updated_at)
        VALUES (?1, 'c-a', '15550001', 'sent', 1, 'wamid.old', ?2, ?2)
        "#,
    )
    .bind(&campaign.id)
    .bind(&now)
    .execute(&pool)
    .await
    .unwrap();

    let provider = Arc::new(ScriptedProvider::default());
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(20.0));
    let done = harness
        .wait_for_status(&campaign.id, CampaignStatus::Completed, WITHIN)
        .await;
    assert_eq!(done.lease_owner, None);

    assert_eq!(provider.calls_for("15550001"), 0);
    assert_eq!(provider.calls_for("15550002"), 1);
    assert_eq!(provider.calls_for("15550003"), 1);

    let (_, counters) = harness.services.tracker.counters(&campaign.id).await.unwrap();
    assert_eq!((counters.total, counters.sent, counters.pending), (3, 3, 0));
    harness.stop().await;
}

#[actix_rt::test]
async fn shutdown_releases_the_lease() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    for n in 1..=4 {
        add_contact(&pool, "list-1", &format!("c-{n}"), &format!("1555000{n}")).await;
    }
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(1.0));
    wait_until(WITHIN, || provider.total_calls() >= 1).await;
    harness.stop().await;

    let campaign = CampaignService::new(pool.clone()).get_campaign(&campaign.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Running);
    assert_eq!(campaign.lease_owner, None);
}

#[actix_rt::test]
async fn panicking_send_fails_only_that_recipient() {
    let pool = memory_pool().await;
    add_list(&pool, OWNER, "list-1").await;
    add_contact(&pool, "list-1", "c-a", "15550001").await;
    add_contact(&pool, "list-1", "c-b", "15550002").await;
    add_contact(&pool, "list-1", "c-c", "15550003").await;
    let campaign = create_campaign(&pool, new_campaign(&["list-1"], CampaignStatus::Scheduled)).await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.panic_for("15550002");
    let harness = Harness::start(pool.clone(), provider.clone(), test_config(20.0));
    harness
        .wait_for_status(&campaign.id, CampaignStatus::Completed, WITHIN)
        .await;

    let tracker = &harness.services.tracker;
    let a = tracker.get_job(&campaign.id, "c-a").await.unwrap();
    let b = tracker.get_job(&campaign.id, "c-b").await.unwrap();
    let c = tracker.get_job(&campaign.id, "c-c").await.unwrap();
    assert_eq!((a.status, a.attempt_count), (JobStatus::Sent, 1));
    assert_eq!((c.status, c.attempt_count), (JobStatus::Sent, 1));
    assert_eq!((b.status, b.attempt_count), (JobStatus::Failed, 1));
    assert_eq!(b.last_error_kind, Some(ErrorKind::Internal));
    assert!(b.last_error.unwrap().contains("15550002"));
    assert_eq!(provider.calls_for("15550002"), 1);

    let (_, counters) = tracker.counters(&campaign.id).await.unwrap();
    assert_eq!((counters.total, counters.sent, counters.failed), (3, 2, 1));
    harness.stop().await;
}

#[actix_rt::test]
async fn database_setup_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("data").join("dispatch.db");

    let pool = crate::setup_database(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    sqlx::query("SELECT 1").execute(&pool).await.unwrap();
    assert!(path.exists());
}
