mod common;

use common::setup::{seeded, spec, TestCluster, SOURCE, TARGET};
use common::{fast_config, statuses};
use partition_migrator::engine::memory::CopyFault;
use partition_migrator::executor::UnitOutcome;
use partition_migrator::{
    InMemoryEngine, JobStatus, MigrationController, MigrationService, MigratorConfig,
    ProgressLedger, RunOutcome, StorageEngine, UnitExecutor, UnitId, UnitState,
};
use partition_migrator::engine::memory::EngineEvent;
use partition_migrator::MigrationError;
use proptest::prelude::*;
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::tempdir;

#[tokio::test]
async fn test_resume_after_crash_skips_done_units() {
    let dir = tempdir().unwrap();
    let config = MigratorConfig {
        ledger_dir: dir.path().to_path_buf(),
        ..fast_config()
    };
    let engine = seeded(InMemoryEngine::new(), 4, 10);

    let job_id = {
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        let job = MigrationController::plan(
            &spec().with_job_id("crash-test"),
            engine.clone(),
            &ledger,
            &config,
        )
        .await
        .unwrap();
        ledger
            .set_job_status(&job.id, JobStatus::Running, None)
            .unwrap();

        let executor = UnitExecutor::new(engine.clone(), SOURCE, TARGET, "_partition_id");
        for p in ["p1", "p2"] {
            let unit = ledger
                .transition(&job.id, &UnitId::new(p), UnitState::InFlight, None)
                .unwrap();
            assert!(matches!(executor.execute(&unit).await, UnitOutcome::Done(_)));
            ledger
                .transition(&job.id, &UnitId::new(p), UnitState::Done, None)
                .unwrap();
        }
        // p3 dies halfway through its copy
        ledger
            .transition(&job.id, &UnitId::new("p3"), UnitState::InFlight, None)
            .unwrap();
        engine.insert_rows(TARGET, "p3", vec![(0, "p3:0".to_string()), (1, "p3:1".to_string())]);
        job.id
    };

    let service = MigrationService::open(engine.clone(), config).unwrap();
    assert_eq!(
        service.ledger().job(&job_id).unwrap().status,
        JobStatus::Running
    );
    service.resume(&job_id).unwrap();
    let outcome = service.wait(&job_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::CutoverDone(_)));

    for p in ["p1", "p2", "p3", "p4"] {
        assert_eq!(engine.copy_calls(p), 1, "partition {}", p);
    }
    let p3 = service.ledger().unit(&job_id, &UnitId::new("p3")).unwrap();
    assert_eq!(p3.attempts, 2);
    assert_eq!(
        p3.last_error.as_deref(),
        Some("interrupted before completion")
    );
    assert_eq!(engine.rows(SOURCE, "p3").len(), 10);
}

#[tokio::test]
async fn test_status_survives_restart() {
    let config = MigratorConfig {
        auto_cutover: false,
        ..fast_config()
    };
    let cluster = TestCluster::durable(3, 4, config);
    cluster.engine.inject_copy_fault("p2", CopyFault::Transient, 1);

    let job_id = cluster.service.start(spec()).await.unwrap();
    assert_eq!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::Completed
    );
    let ledger_dir = cluster.service.config().ledger_dir.clone();

    let reopened = ProgressLedger::open(&ledger_dir).unwrap();
    let job = reopened.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(reopened.all_done(&job_id).unwrap());
    assert_eq!(reopened.unit(&job_id, &UnitId::new("p2")).unwrap().attempts, 2);
    assert_eq!(
        statuses(&reopened.status_history(&job_id).unwrap()),
        vec![JobStatus::Planning, JobStatus::Running, JobStatus::Completed]
    );
    assert_eq!(reopened.target_holder(TARGET).unwrap(), Some(job_id.clone()));
    assert_eq!(reopened.list_jobs().unwrap().len(), 1);
}

#[tokio::test]
async fn test_torn_journal_tail_is_ignored() {
    let config = MigratorConfig {
        auto_cutover: false,
        ..fast_config()
    };
    let cluster = TestCluster::durable(2, 2, config);
    let job_id = cluster
        .service
        .start(spec().with_job_id("torn"))
        .await
        .unwrap();
    cluster.service.wait(&job_id).await.unwrap();

    let journal = cluster
        .service
        .config()
        .ledger_dir
        .join("jobs")
        .join("torn")
        .join("ledger.log");
    {
        let mut f = OpenOptions::new().append(true).open(&journal).unwrap();
        f.write_all(&[200, 0, 0, 0, 9, 9, 9]).unwrap();
    }

    let reopened = ProgressLedger::open(&cluster.service.config().ledger_dir).unwrap();
    assert_eq!(reopened.job(&job_id).unwrap().status, JobStatus::Completed);
    assert!(reopened.all_done(&job_id).unwrap());
}

#[tokio::test]
async fn test_stale_lock_is_reclaimed() {
    let cluster = TestCluster::durable(2, 2, fast_config());
    let lock = cluster
        .service
        .config()
        .ledger_dir
        .join("locks")
        .join(format!("{}.lock", TARGET));
    std::fs::write(&lock, "ghost-job").unwrap();

    let job_id = cluster.service.start(spec()).await.unwrap();
    assert!(matches!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::CutoverDone(_)
    ));
    assert!(!lock.exists());
}

#[tokio::test]
async fn test_finalize_archives_durable_job() {
    let cluster = TestCluster::durable(1, 2, fast_config());
    let job_id = cluster
        .service
        .start(spec().with_job_id("to-archive"))
        .await
        .unwrap();
    cluster.service.wait(&job_id).await.unwrap();
    cluster.service.rollback(&job_id).await.unwrap();
    cluster.service.finalize(&job_id).await.unwrap();

    let root = &cluster.service.config().ledger_dir;
    assert!(!root.join("jobs").join("to-archive").exists());
    assert!(root
        .join("archive")
        .join("to-archive")
        .join("ledger.log")
        .exists());
    assert!(cluster.service.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_crash_during_cutover_is_not_exchanged_twice() {
    let config = MigratorConfig {
        auto_cutover: false,
        ..fast_config()
    };
    let cluster = TestCluster::durable(2, 3, config.clone());
    let job_id = cluster.service.start(spec()).await.unwrap();
    assert_eq!(
        cluster.service.wait(&job_id).await.unwrap(),
        RunOutcome::Completed
    );
    let ledger_dir = cluster.service.config().ledger_dir.clone();

    // cutover claimed and exchanged, then the process died before recording it
    cluster
        .service
        .ledger()
        .claim_status(&job_id, JobStatus::Completed, JobStatus::CuttingOver, None)
        .unwrap();
    cluster.engine.exchange(SOURCE, TARGET).await.unwrap();

    let restarted = MigrationService::open(
        cluster.engine.clone(),
        MigratorConfig {
            ledger_dir: ledger_dir.clone(),
            ..config
        },
    )
    .unwrap();
    assert_eq!(
        restarted.ledger().job(&job_id).unwrap().status,
        JobStatus::CuttingOver
    );
    assert!(matches!(
        restarted.resume(&job_id),
        Err(MigrationError::Precondition(_))
    ));
    assert!(matches!(
        restarted.cutover(&job_id).await,
        Err(MigrationError::Precondition(_))
    ));
    let exchanges = || {
        cluster
            .engine
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::Exchange { .. }))
            .count()
    };
    assert_eq!(exchanges(), 1);

    assert_eq!(
        restarted.resolve_cutover(&job_id, true).unwrap(),
        JobStatus::CutoverDone
    );
    assert_eq!(exchanges(), 1);

    let reopened = ProgressLedger::open(&ledger_dir).unwrap();
    assert!(reopened.cutover_record(&job_id).unwrap().is_some());
    assert_eq!(
        statuses(&reopened.status_history(&job_id).unwrap()),
        vec![
            JobStatus::Planning,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::CuttingOver,
            JobStatus::CutoverDone
        ]
    );
    assert_eq!(reopened.target_holder(TARGET).unwrap(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_transient_faults_below_ceiling_always_complete(
        faults in proptest::collection::vec(0usize..3, 1..6)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let cluster = TestCluster::new(faults.len(), 3, fast_config());
            for (i, count) in faults.iter().enumerate() {
                cluster
                    .engine
                    .inject_copy_fault(&format!("p{}", i + 1), CopyFault::Transient, *count);
            }

            let job_id = cluster.service.start(spec()).await.unwrap();
            let outcome = cluster.service.wait(&job_id).await.unwrap();
            prop_assert!(matches!(outcome, RunOutcome::CutoverDone(_)));

            for (i, count) in faults.iter().enumerate() {
                let unit = cluster
                    .service
                    .ledger()
                    .unit(&job_id, &UnitId::new(format!("p{}", i + 1)))
                    .unwrap();
                prop_assert_eq!(unit.attempts as usize, count + 1);
            }
            Ok(())
        })?;
    }
}
