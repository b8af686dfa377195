mod common;

use common::setup::{seeded, spec, TestCluster, SOURCE, TARGET};
use common::{fast_config, statuses};
use partition_migrator::engine::memory::{CopyFault, EngineEvent};
use partition_migrator::{
    JobSpec, JobStatus, MigrationError, MigratorConfig, RunOutcome, UnitId, UnitState,
};
use std::time::Duration;

#[tokio::test]
async fn test_full_migration_with_cutover() {
    let cluster = TestCluster::new(5, 20, fast_config());
    let original: Vec<_> = (1..=5)
        .map(|i| cluster.engine.rows(SOURCE, &format!("p{}", i)))
        .collect();

    let job_id = cluster.service.start(spec()).await.unwrap();
    let outcome = cluster.service.wait(&job_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::CutoverDone(_)));

    let report = cluster.service.status(&job_id).unwrap();
    assert_eq!(report.job.status, JobStatus::CutoverDone);
    assert_eq!(report.counts.done, 5);
    assert!(report.units.iter().all(|u| u.attempts == 1));
    assert_eq!(
        statuses(&report.history),
        vec![
            JobStatus::Planning,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::CuttingOver,
            JobStatus::CutoverDone
        ]
    );

    // the source name now serves the copy, the old data is retained under the target name
    for (i, rows) in original.iter().enumerate() {
        let p = format!("p{}", i + 1);
        assert_eq!(&cluster.engine.rows(SOURCE, &p), rows);
        assert_eq!(&cluster.engine.rows(TARGET, &p), rows);
    }
    assert_eq!(cluster.service.ledger().target_holder(TARGET).unwrap(), None);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let config = MigratorConfig {
        auto_cutover: false,
        ..fast_config()
    };
    let cluster = TestCluster::new(5, 10, config);
    cluster
        .engine
        .inject_copy_fault("p3", CopyFault::PartialThenTransient, 2);

    let job_id = cluster.service.start(spec()).await.unwrap();
    let outcome = cluster.service.wait(&job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let report = cluster.service.status(&job_id).unwrap();
    assert_eq!(report.job.status, JobStatus::Completed);
    assert_eq!(report.counts.done, 5);

    let p3 = cluster
        .service
        .ledger()
        .unit(&job_id, &UnitId::new("p3"))
        .unwrap();
    assert_eq!(p3.state, UnitState::Done);
    assert_eq!(p3.attempts, 3);
    assert_eq!(cluster.engine.copy_calls("p3"), 3);
    assert_eq!(cluster.engine.copy_calls("p1"), 1);
    // partial copies were cleared before each retry
    assert_eq!(cluster.engine.rows(TARGET, "p3").len(), 10);
}

#[tokio::test]
async fn test_health_gate_holds_dispatch() {
    let cluster = TestCluster::new(3, 5, fast_config());
    cluster.engine.script_outstanding_mutations([1, 1, 1]);

    let job_id = cluster.service.start(spec()).await.unwrap();
    let outcome = cluster.service.wait(&job_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::CutoverDone(_)));

    let events = cluster.engine.events();
    let last_denied = events
        .iter()
        .rposition(|e| matches!(e, EngineEvent::MutationPoll { outstanding: 1 }))
        .unwrap();
    let first_copy = events
        .iter()
        .position(|e| matches!(e, EngineEvent::Copy { .. }))
        .unwrap();
    assert!(last_denied < first_copy);

    let history = cluster.service.ledger().status_history(&job_id).unwrap();
    assert_eq!(
        statuses(&history),
        vec![
            JobStatus::Planning,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::CuttingOver,
            JobStatus::CutoverDone
        ]
    );
    let paused = &history[2];
    assert!(paused
        .reason
        .as_deref()
        .unwrap()
        .contains("1 outstanding mutations"));
}

#[tokio::test]
async fn test_low_disk_pauses_until_space_returns() {
    let cluster = TestCluster::new(2, 5, fast_config());
    cluster.engine.set_volume("default", 10, 100);

    let job_id = cluster.service.start(spec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = cluster.service.status(&job_id).unwrap();
    assert_eq!(report.job.status, JobStatus::Paused);
    assert!(report.job.status_reason.unwrap().contains("volume default"));
    assert_eq!(cluster.engine.total_copy_calls(), 0);

    cluster.engine.set_volume("default", 50, 100);
    let outcome = cluster.service.wait(&job_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::CutoverDone(_)));
}

#[tokio::test]
async fn test_retry_ceiling_fails_job() {
    let cluster = TestCluster::new(3, 5, fast_config());
    cluster.engine.inject_copy_fault("p2", CopyFault::Transient, 10);

    let job_id = cluster.service.start(spec()).await.unwrap();
    let outcome = cluster.service.wait(&job_id).await.unwrap();
    match outcome {
        RunOutcome::Failed { reason } => assert!(reason.contains("p2"), "{}", reason),
        other => panic!("unexpected outcome {:?}", other),
    }

    let report = cluster.service.status(&job_id).unwrap();
    assert_eq!(report.job.status, JobStatus::Failed);
    assert_eq!(report.failed_units.len(), 1);
    assert_eq!(report.failed_units[0].unit_id, UnitId::new("p2"));
    assert_eq!(report.failed_units[0].attempts, 3);
    assert!(report.failed_units[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("timeout"));

    assert!(!cluster
        .engine
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Exchange { .. })));
    assert_eq!(cluster.service.ledger().target_holder(TARGET).unwrap(), None);
}

#[tokio::test]
async fn test_integrity_mismatch_is_retried() {
    let cluster = TestCluster::new(2, 8, fast_config());
    cluster.engine.inject_copy_fault("p1", CopyFault::DropRow, 1);

    let job_id = cluster.service.start(spec()).await.unwrap();
    assert!(matches!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::CutoverDone(_)
    ));
    let p1 = cluster
        .service
        .ledger()
        .unit(&job_id, &UnitId::new("p1"))
        .unwrap();
    assert_eq!(p1.attempts, 2);
    assert!(p1.last_error.unwrap().contains("row count mismatch"));
}

#[tokio::test]
async fn test_cutover_failure_leaves_source_intact() {
    let cluster = TestCluster::new(3, 4, fast_config());
    let message = "Code: 48. DB::Exception: EXCHANGE TABLES is not supported";
    cluster.engine.fail_next_exchange(message);

    let job_id = cluster.service.start(spec()).await.unwrap();
    let outcome = cluster.service.wait(&job_id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Failed {
            reason: message.to_string()
        }
    );

    let job = cluster.service.ledger().job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.status_reason.as_deref(), Some(message));
    assert_eq!(cluster.engine.row_count(SOURCE), 12);
    assert_eq!(cluster.engine.row_count(TARGET), 12);
    assert!(cluster.engine.has_dataset(TARGET));
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let config = MigratorConfig {
        parallelism: 3,
        ..fast_config()
    };
    let cluster = TestCluster::with_latency(8, 2, Duration::from_millis(15), config);

    let job_id = cluster.service.start(spec()).await.unwrap();
    cluster.service.wait(&job_id).await.unwrap();

    let peak = cluster.engine.peak_concurrent_copies();
    assert!(peak <= 3, "peak {}", peak);
    assert!(peak >= 2, "peak {}", peak);
    assert_eq!(cluster.engine.total_copy_calls(), 8);
}

#[tokio::test]
async fn test_operator_pause_and_resume() {
    let config = MigratorConfig {
        parallelism: 1,
        ..fast_config()
    };
    let cluster = TestCluster::with_latency(6, 2, Duration::from_millis(20), config);

    let job_id = cluster.service.start(spec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    cluster.service.pause(&job_id).unwrap();
    assert_eq!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::Paused
    );

    let report = cluster.service.status(&job_id).unwrap();
    assert_eq!(report.job.status, JobStatus::Paused);
    assert_eq!(report.counts.in_flight, 0);
    assert!(report.counts.done < 6);

    cluster.service.resume(&job_id).unwrap();
    assert!(matches!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::CutoverDone(_)
    ));
    for i in 1..=6 {
        assert_eq!(cluster.engine.copy_calls(&format!("p{}", i)), 1);
    }
}

#[tokio::test]
async fn test_cancel_fails_job_and_frees_target() {
    let cluster = TestCluster::with_latency(4, 2, Duration::from_millis(10), fast_config());

    let job_id = cluster.service.start(spec()).await.unwrap();
    cluster.service.cancel(&job_id).unwrap();
    assert_eq!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::Cancelled
    );

    let job = cluster.service.ledger().job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.status_reason.as_deref(), Some("cancelled by operator"));
    assert_eq!(cluster.service.ledger().target_holder(TARGET).unwrap(), None);
    assert!(cluster.service.resume(&job_id).is_err());

    let retry = cluster.service.start(spec()).await.unwrap();
    assert!(matches!(
        cluster.service.wait(&retry).await.unwrap(),
        RunOutcome::CutoverDone(_)
    ));
}

#[tokio::test]
async fn test_second_job_on_same_target_is_refused() {
    let config = MigratorConfig {
        auto_cutover: false,
        parallelism: 1,
        ..fast_config()
    };
    let cluster = TestCluster::with_latency(4, 2, Duration::from_millis(10), config);
    cluster
        .engine
        .insert_rows("other", "p1", vec![(1, "x".to_string())]);

    let first = cluster.service.start(spec()).await.unwrap();
    let err = cluster
        .service
        .start(JobSpec::new("other", TARGET, "_partition_id"))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::TargetLocked { .. }));
    assert_eq!(cluster.service.list().unwrap().len(), 1);

    assert_eq!(
        cluster.service.wait(&first).await.unwrap(),
        RunOutcome::Completed
    );
    assert_eq!(
        cluster.service.ledger().target_holder(TARGET).unwrap(),
        Some(first.clone())
    );

    let record = cluster.service.cutover(&first).await.unwrap();
    assert!(record.rollback_available);
    assert_eq!(cluster.service.ledger().target_holder(TARGET).unwrap(), None);
}

#[tokio::test]
async fn test_manual_cutover_requires_completion() {
    let config = MigratorConfig {
        auto_cutover: false,
        parallelism: 1,
        ..fast_config()
    };
    let cluster = TestCluster::with_latency(3, 2, Duration::from_millis(10), config);

    let job_id = cluster.service.start(spec()).await.unwrap();
    assert!(matches!(
        cluster.service.cutover(&job_id).await,
        Err(MigrationError::JobActive(_))
    ));
    cluster.service.pause(&job_id).unwrap();
    assert_eq!(cluster.service.wait(&job_id).await.unwrap(), RunOutcome::Paused);
    assert!(matches!(
        cluster.service.cutover(&job_id).await,
        Err(MigrationError::Precondition(_))
    ));

    cluster.service.resume(&job_id).unwrap();
    assert_eq!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::Completed
    );
    cluster.service.cutover(&job_id).await.unwrap();
    assert_eq!(
        cluster.service.ledger().job(&job_id).unwrap().status,
        JobStatus::CutoverDone
    );
}

#[tokio::test]
async fn test_concurrent_manual_cutovers_exchange_once() {
    let config = MigratorConfig {
        auto_cutover: false,
        ..fast_config()
    };
    let engine = seeded(
        partition_migrator::InMemoryEngine::new().with_exchange_latency(Duration::from_millis(50)),
        3,
        4,
    );
    let cluster = TestCluster::with_engine(engine, config);
    let job_id = cluster.service.start(spec()).await.unwrap();
    assert_eq!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::Completed
    );

    let (first, second) = tokio::join!(
        cluster.service.cutover(&job_id),
        cluster.service.cutover(&job_id)
    );
    assert!(first.is_ok() != second.is_ok());
    let exchanges = cluster
        .engine
        .events()
        .iter()
        .filter(|e| matches!(e, EngineEvent::Exchange { .. }))
        .count();
    assert_eq!(exchanges, 1);
    assert_eq!(
        cluster.service.ledger().job(&job_id).unwrap().status,
        JobStatus::CutoverDone
    );
}

#[tokio::test]
async fn test_enumeration_failure_never_runs() {
    let cluster = TestCluster::new(2, 2, fast_config());
    cluster
        .engine
        .fail_partition_listing("Code: 60. DB::Exception: Table system.parts is unavailable");

    let err = cluster
        .service
        .start(spec().with_job_id("listing-fails"))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Enumeration(_)));

    let jobs = cluster.service.list().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    let history = statuses(&cluster.service.ledger().status_history(&jobs[0].id).unwrap());
    assert!(!history.contains(&JobStatus::Running));
    assert_eq!(cluster.engine.total_copy_calls(), 0);
    assert_eq!(cluster.service.ledger().target_holder(TARGET).unwrap(), None);
}

#[tokio::test]
async fn test_empty_source_completes() {
    let engine = std::sync::Arc::new(partition_migrator::InMemoryEngine::new());
    engine.create_dataset(SOURCE);
    engine.create_dataset(TARGET);
    let cluster = TestCluster::with_engine(engine, fast_config());

    let job_id = cluster.service.start(spec()).await.unwrap();
    assert!(matches!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::CutoverDone(_)
    ));
    assert_eq!(cluster.service.status(&job_id).unwrap().counts.total(), 0);
}

#[tokio::test]
async fn test_rollback_and_finalize() {
    let cluster = TestCluster::new(2, 3, fast_config());
    let original = cluster.engine.rows(SOURCE, "p1");

    let job_id = cluster.service.start(spec()).await.unwrap();
    cluster.service.wait(&job_id).await.unwrap();
    assert!(matches!(
        cluster.service.finalize(&job_id).await,
        Err(MigrationError::Precondition(_))
    ));

    cluster.service.rollback(&job_id).await.unwrap();
    assert_eq!(
        cluster.service.ledger().job(&job_id).unwrap().status,
        JobStatus::RolledBack
    );
    assert_eq!(cluster.engine.rows(SOURCE, "p1"), original);

    cluster.service.finalize(&job_id).await.unwrap();
    assert!(cluster.service.list().unwrap().is_empty());
    assert!(cluster.engine.has_dataset(TARGET));
}

#[tokio::test]
async fn test_plan_only_creates_no_job() {
    let cluster = TestCluster::new(4, 3, fast_config());
    let preview = cluster.service.plan_only(&spec()).await.unwrap();
    assert_eq!(preview.units.len(), 4);
    assert_eq!(preview.total_rows, 12);
    assert!(cluster.service.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_job_id_is_rejected() {
    let cluster = TestCluster::new(1, 1, fast_config());
    let err = cluster
        .service
        .start(spec().with_job_id("../escape"))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Config(_)));
}
