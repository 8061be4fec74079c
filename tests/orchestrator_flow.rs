//! Orchestrator pipeline integration tests: version discipline, timer
//! self-cancellation, auto-deal idempotency, identity enforcement and
//! view redaction, over the in-memory backends.

mod common;

use common::Harness;
use potline::config::TableConfig;
use potline::engine::{Action, Street};
use potline::error::CoreError;
use potline::orchestrator::{Actor, NextHandOutcome, TimeoutOutcome};
use potline::persistence::ColdStore;
use potline::queue::queues;

#[tokio::test]
async fn test_create_table_starts_at_version_zero() {
    let h = Harness::bare();
    let table_id = h
        .orchestrator
        .create_table(TableConfig::cash(5, 10, 6))
        .await
        .unwrap();

    assert_eq!(h.version(&table_id).await, 0);
    assert_eq!(h.status(&table_id).await.street, Street::Waiting);
    // The table row was recorded
    let record = h.cold.load_table(&table_id).await.unwrap().unwrap();
    assert_eq!(record.config.big_blind, 10);
}

#[tokio::test]
async fn test_actions_bump_versions_without_gaps() {
    let h = Harness::bare();
    let table_id = h
        .orchestrator
        .create_table(TableConfig::cash(5, 10, 6))
        .await
        .unwrap();

    for (i, user) in (1..=4u64).enumerate() {
        let view = h
            .orchestrator
            .process_action(
                &table_id,
                Action::sit(user, i as u8, 500),
                Actor::User(user),
            )
            .await
            .unwrap();
        assert_eq!(view.version, i as u64 + 1);
    }
    assert_eq!(h.version(&table_id).await, 4);
}

// I1 + I2: concurrent workload, versions strictly increasing, each
// transition produced by exactly one action.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sits_serialize() {
    let h = std::sync::Arc::new(Harness::bare());
    let table_id = h
        .orchestrator
        .create_table(TableConfig::cash(5, 10, 6))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for seat in 0..6u8 {
        let h = h.clone();
        let table_id = table_id.clone();
        let user = seat as u64 + 1;
        handles.push(tokio::spawn(async move {
            h.orchestrator
                .process_action(
                    &table_id,
                    Action::sit(user, seat, 500),
                    Actor::User(user),
                )
                .await
                .unwrap()
                .version
        }));
    }

    let mut versions: Vec<u64> = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(h.version(&table_id).await, 6);
}

// Scenario 2: a fold that ends the hand fans out settlement, archival
// and a version-bound next-hand job.
#[tokio::test]
async fn test_fold_ends_hand_and_fans_out() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;

    let (actor, _) = h.next_actor(&table_id).await;
    h.orchestrator
        .process_action(&table_id, Action::fold(actor), Actor::User(actor))
        .await
        .unwrap();

    let status = h.status(&table_id).await;
    assert!(status.winners.is_some());
    let version = h.version(&table_id).await;

    assert_eq!(h.queue.pending_jobs(queues::SETTLE_HAND).len(), 1);
    assert_eq!(h.queue.pending_jobs(queues::ARCHIVE_HAND).len(), 1);

    let next_hand = h.queue.pending_jobs(queues::NEXT_HAND);
    assert_eq!(next_hand.len(), 1);
    let delay = next_hand[0].delay_remaining.expect("next-hand is delayed");
    assert!(delay >= std::time::Duration::from_millis(4_000));
    let unique_id = next_hand[0].unique_id.as_deref().unwrap();
    assert_eq!(unique_id, format!("nexthand:{}:{}", table_id, version));
}

// A player standing mid-hand leaves their committed blind in the pot;
// the hand still settles, and only players still seated are settled.
#[tokio::test]
async fn test_mid_hand_stand_settles_without_departed_player() {
    let h = Harness::bare();
    let table_id = h
        .orchestrator
        .create_table(TableConfig::cash(5, 10, 6))
        .await
        .unwrap();
    for (user, seat) in [(1u64, 0u8), (2, 1), (3, 2)] {
        h.sit(&table_id, user, seat, 1_000).await;
    }
    h.deal(&table_id).await;

    // The small blind walks away mid-hand.
    h.orchestrator
        .process_action(&table_id, Action::stand(3), Actor::User(3))
        .await
        .unwrap();
    assert!(h.status(&table_id).await.winners.is_none());

    h.play_hand_to_showdown(&table_id).await;

    let settle = h.queue.pending_jobs(queues::SETTLE_HAND);
    assert_eq!(settle.len(), 1);
    let deltas = settle[0].payload["deltas"].as_array().unwrap();
    // The departed player is not settled; the winner's delta carries the
    // whole pot including the dead blind (5 + 10 bb + 10 call).
    assert!(deltas.iter().all(|d| d["user_id"] != 3));
    let winner_delta = deltas
        .iter()
        .find(|d| d["user_id"] == 1)
        .unwrap()["delta"]
        .as_i64()
        .unwrap();
    assert_eq!(winner_delta, 25);
}

// Scenario 3 / I5: a timeout whose expected version no longer matches
// produces no mutation.
#[tokio::test]
async fn test_stale_timeout_self_cancels() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;

    let stale_version = h.version(&table_id).await;
    let (first_actor, first_seat) = h.next_actor(&table_id).await;

    // A timeout was scheduled for the actor at this version
    let timers = h.queue.pending_jobs(queues::PLAYER_TIMEOUT);
    assert_eq!(timers.len(), 1);
    assert_eq!(
        timers[0].unique_id.as_deref().unwrap(),
        format!("timeout:{}:{}:{}", table_id, first_seat, stale_version)
    );

    // The player acts in time; the version moves on and a new timer is
    // scheduled for the next actor.
    h.check_or_call(&table_id).await;
    let current_version = h.version(&table_id).await;
    assert_eq!(current_version, stale_version + 1);
    assert_eq!(h.queue.pending_jobs(queues::PLAYER_TIMEOUT).len(), 2);

    // The original timer fires and observes the mismatch.
    let before = h.status(&table_id).await;
    let outcome = h
        .orchestrator
        .process_timeout(&table_id, first_actor, stale_version)
        .await
        .unwrap();
    assert_eq!(outcome, TimeoutOutcome::Superseded);
    assert_eq!(h.version(&table_id).await, current_version);
    assert_eq!(h.status(&table_id).await, before);
}

#[tokio::test]
async fn test_current_timeout_folds_player() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;

    let version = h.version(&table_id).await;
    let (actor, _) = h.next_actor(&table_id).await;
    let outcome = h
        .orchestrator
        .process_timeout(&table_id, actor, version)
        .await
        .unwrap();

    assert_eq!(outcome, TimeoutOutcome::Applied(version + 1));
    let status = h.status(&table_id).await;
    // Heads-up: the fold ends the hand
    assert!(status.winners.is_some());
    assert_ne!(status.winners.unwrap()[0].user_id, actor);
}

// I6: next-hand is idempotent against a manual deal.
#[tokio::test]
async fn test_auto_deal_yields_to_manual_deal() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;
    let (actor, _) = h.next_actor(&table_id).await;
    h.orchestrator
        .process_action(&table_id, Action::fold(actor), Actor::User(actor))
        .await
        .unwrap();

    // A manual deal advances the table before the next-hand job fires.
    h.deal(&table_id).await;
    let version = h.version(&table_id).await;
    assert_eq!(h.status(&table_id).await.street, Street::Preflop);

    let outcome = h.orchestrator.auto_deal(&table_id).await.unwrap();
    assert_eq!(outcome, NextHandOutcome::HandNotComplete);
    assert_eq!(h.version(&table_id).await, version);
}

#[tokio::test]
async fn test_auto_deal_after_completed_hand() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;
    let (actor, _) = h.next_actor(&table_id).await;
    h.orchestrator
        .process_action(&table_id, Action::fold(actor), Actor::User(actor))
        .await
        .unwrap();

    let outcome = h.orchestrator.auto_deal(&table_id).await.unwrap();
    match outcome {
        NextHandOutcome::Dealt(version) => assert_eq!(version, h.version(&table_id).await),
        other => panic!("expected Dealt, got {:?}", other),
    }
    assert_eq!(h.status(&table_id).await.street, Street::Preflop);
}

#[tokio::test]
async fn test_auto_deal_with_one_stack_reports_not_enough() {
    let h = Harness::bare();
    let table_id = h
        .orchestrator
        .create_table(TableConfig::cash(5, 10, 6))
        .await
        .unwrap();
    h.sit(&table_id, 1, 0, 1_000).await;
    h.sit(&table_id, 2, 1, 10).await; // short stack: all-in on the big blind
    h.deal(&table_id).await;
    h.check_or_call(&table_id).await; // calling runs the all-in out

    let status = h.status(&table_id).await;
    assert!(status.winners.is_some());
    assert_eq!(status.players_with_chips(), 1);

    let outcome = h.orchestrator.auto_deal(&table_id).await.unwrap();
    assert_eq!(outcome, NextHandOutcome::NotEnoughPlayers);
}

#[tokio::test]
async fn test_next_hand_worker_marks_table_waiting() {
    use potline::persistence::TableStatus;
    use potline::queue::{Job, JobHandler};
    use potline::workers::{NextHandJob, NextHandWorker};

    let h = Harness::bare();
    let table_id = h
        .orchestrator
        .create_table(TableConfig::cash(5, 10, 6))
        .await
        .unwrap();
    h.sit(&table_id, 1, 0, 1_000).await;
    h.sit(&table_id, 2, 1, 10).await;
    h.deal(&table_id).await;
    h.check_or_call(&table_id).await;
    h.cold
        .set_table_status(&table_id, TableStatus::Active)
        .await
        .unwrap();

    let worker = NextHandWorker::new(h.orchestrator.clone(), h.cold.clone());
    let job = Job {
        id: 1,
        queue: "next-hand".into(),
        name: "next-hand".into(),
        payload: serde_json::to_value(NextHandJob {
            table_id: table_id.clone(),
        })
        .unwrap(),
        unique_id: None,
        repeat_every: None,
        attempt: 1,
    };
    worker.handle(&job).await.unwrap();

    let record = h.cold.load_table(&table_id).await.unwrap().unwrap();
    assert_eq!(record.status, TableStatus::Waiting);
}

// End to end: the delayed next-hand job auto-deals through the workers.
#[tokio::test(start_paused = true)]
async fn test_next_hand_worker_auto_deals() {
    let h = Harness::full();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;
    let (actor, _) = h.next_actor(&table_id).await;
    h.orchestrator
        .process_action(&table_id, Action::fold(actor), Actor::User(actor))
        .await
        .unwrap();
    assert!(h.status(&table_id).await.winners.is_some());

    // Past the 5 s grace delay the worker re-deals.
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;
    let status = h.status(&table_id).await;
    assert_eq!(status.street, Street::Preflop);
    assert!(status.winners.is_none());

    h.service.as_ref().unwrap().shutdown().await;
}

// I7: identity enforcement.
#[tokio::test]
async fn test_identity_mismatch_is_rejected() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;

    let err = h
        .orchestrator
        .process_action(&table_id, Action::fold(2), Actor::User(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IdentityMismatch));
    assert_eq!(err.http_status(), 403);

    // TIMEOUT is system-only
    let err = h
        .orchestrator
        .process_action(&table_id, Action::timeout(1), Actor::User(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden));
}

// I8: view redaction.
#[tokio::test]
async fn test_masked_view_hides_other_hole_cards() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;

    let view = h
        .orchestrator
        .get_state(&table_id, Some(1))
        .await
        .unwrap();
    let rendered = view.state.to_string();
    assert!(rendered.contains("c1-0a"), "own cards visible");
    assert!(
        !rendered.contains("c1-1"),
        "opponent cards must be redacted"
    );

    // Observers see nothing
    let observer = h.orchestrator.get_state(&table_id, None).await.unwrap();
    let rendered = observer.state.to_string();
    assert!(!rendered.contains("c1-0"));
    assert!(!rendered.contains("c1-1"));
}

#[tokio::test]
async fn test_engine_rejection_is_forwarded_with_code() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;

    // Folding with no hand running
    let err = h
        .orchestrator
        .process_action(&table_id, Action::fold(1), Actor::User(1))
        .await
        .unwrap_err();
    match err {
        CoreError::EngineInvalid { ref code, .. } => {
            assert_eq!(code, "NO_HAND_IN_PROGRESS");
            assert_eq!(err.http_status(), 400);
        }
        other => panic!("expected EngineInvalid, got {:?}", other),
    }
    // A rejected action does not advance the version
    assert_eq!(h.version(&table_id).await, 2);
}

#[tokio::test]
async fn test_missing_table_is_not_found() {
    let h = Harness::bare();
    let err = h
        .orchestrator
        .process_action("t-missing", Action::deal(), Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TableNotFound(_)));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn test_persist_jobs_follow_every_action() {
    let h = Harness::bare();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;

    // create_table does not enqueue persists (it writes the row itself);
    // each of the three actions since does.
    assert_eq!(h.queue.pending_jobs(queues::PERSIST_SNAPSHOT).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_archive_worker_records_hand_history() {
    let h = Harness::full();
    let table_id = h.heads_up_table().await;
    h.deal(&table_id).await;
    let (actor, _) = h.next_actor(&table_id).await;
    h.orchestrator
        .process_action(&table_id, Action::fold(actor), Actor::User(actor))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(h.cold.hand_history_count(&table_id).await.unwrap(), 1);

    h.service.as_ref().unwrap().shutdown().await;
}

#[tokio::test]
async fn test_tournament_table_schedules_blind_levels() {
    let h = Harness::bare();
    let mut config = TableConfig::cash(25, 50, 9);
    config.mode = potline::config::TableMode::Tournament;
    let table_id = h.orchestrator.create_table(config).await.unwrap();

    let jobs = h.queue.pending_jobs(queues::BLIND_LEVEL);
    assert_eq!(jobs.len(), 1);
    assert_eq!(
        jobs[0].unique_id.as_deref().unwrap(),
        format!("blindlevel:{}", table_id)
    );
    assert!(jobs[0].delay_remaining.is_some());

    // The persisted config carries the expanded default ladder
    let record = h.cold.load_table(&table_id).await.unwrap().unwrap();
    assert_eq!(record.config.blind_levels.unwrap().len(), 12);
}
