//! End-to-end integration tests: seed masters and detail rows, run
//! processing cycles, and check the produced files and final master states.

use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use common::Config;
use master_db::{
    claim,
    details::{self, NewDetailRow},
    masters,
    test_utils::connect_with_retry,
    MasterDb, MasterId, MasterStatus, WorkerId,
};
use pgtemp::PgTempDB;
use rust_decimal::Decimal;
use spooler::{Outcome, Processor, Worker};
use tokio_util::sync::CancellationToken;

const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

async fn connect(temp_db: &PgTempDB) -> MasterDb {
    connect_with_retry(&temp_db.connection_uri(), MasterDb::default_pool_size())
        .await
        .expect("Failed to connect to master db")
}

fn test_config(temp_db: &PgTempDB, output_dir: &Path) -> Arc<Config> {
    Arc::new(Config {
        database_url: temp_db.connection_uri(),
        pool_size: MasterDb::default_pool_size(),
        business_center_priorities: BTreeMap::new(),
        batch_size: 2,
        lock_timeout: LOCK_TIMEOUT,
        poll_interval: Duration::from_secs(1),
        error_backoff: Duration::from_secs(5),
        max_concurrent_masters: 2,
        output_directory: output_dir.to_path_buf(),
    })
}

fn processor(db: &MasterDb, config: &Arc<Config>, worker: &str) -> Processor {
    Processor::new(
        db.clone(),
        config.clone(),
        WorkerId::from_owned(worker.to_string()),
    )
}

fn output_files(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.expect("readable dir entry").path())
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => panic!("failed to read output dir: {err}"),
    }
}

fn read_single_file(dir: &Path) -> Vec<String> {
    let files = output_files(dir);
    assert_eq!(files.len(), 1, "expected exactly one output file: {files:?}");
    std::fs::read_to_string(&files[0])
        .expect("output file should be readable")
        .lines()
        .map(str::to_string)
        .collect()
}

async fn master_status(db: &MasterDb, master_id: MasterId) -> MasterStatus {
    masters::get_by_id(db.pool(), master_id)
        .await
        .expect("Failed to load master")
        .expect("Master not found")
        .status
}

#[tokio::test]
async fn single_master_without_documents_produces_framed_file() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let master_id = masters::insert(db.pool(), "NYC", 100, now())
        .await
        .expect("Failed to seed master");
    for (detail_id, cents) in [(1, 1000), (2, 2000), (3, 3050)] {
        details::insert(
            db.pool(),
            master_id,
            NewDetailRow {
                detail_id,
                account_number: Some(format!("ACC-{detail_id}")),
                amount: Some(Decimal::new(cents, 2)),
                currency: Some("USD".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to seed detail row");
    }

    //* When
    let outcome = processor(&db, &config, "worker-a")
        .run_one(&CancellationToken::new())
        .await;

    //* Then
    assert!(
        matches!(outcome, Outcome::Processed(id) if id == master_id),
        "unexpected outcome: {outcome:?}"
    );

    let lines = read_single_file(out.path());
    assert_eq!(lines.len(), 5);
    assert!(
        lines[0].starts_with(&format!("HEADER|{master_id}|NYC|")),
        "unexpected header: {}",
        lines[0]
    );
    assert!(lines[0].ends_with("|0|2.0"), "unexpected header: {}", lines[0]);
    assert!(lines[1].starts_with("DETAIL|1|ACC-1|"));
    assert!(lines[2].starts_with("DETAIL|2|ACC-2|"));
    assert!(lines[3].starts_with("DETAIL|3|ACC-3|"));
    assert_eq!(lines[4], "TRAILER|3|60.50|0.00|0");

    assert_eq!(master_status(&db, master_id).await, MasterStatus::Completed);
}

#[tokio::test]
async fn full_document_row_projects_into_the_detail_line() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let master_id = masters::insert(db.pool(), "NYC", 100, now())
        .await
        .expect("Failed to seed master");
    details::insert(
        db.pool(),
        master_id,
        NewDetailRow {
            detail_id: 1,
            amount: Some(Decimal::new(10000, 2)),
            transaction_data: Some(serde_json::json!({
                "transaction_id": "T1",
                "customer": { "customer_id": "C1", "email": "a@b" },
                "merchant": { "name": "M" },
                "payment_method": { "type": "CREDIT_CARD" },
                "items": [{}, {}],
                "risk_score": 42.5,
                "status": "COMPLETED",
            })),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to seed detail row");

    //* When
    let outcome = processor(&db, &config, "worker-a")
        .run_one(&CancellationToken::new())
        .await;

    //* Then
    assert!(matches!(outcome, Outcome::Processed(_)));

    let lines = read_single_file(out.path());
    assert_eq!(lines.len(), 3);

    let fields: Vec<&str> = lines[1].split('|').collect();
    assert_eq!(fields[0], "DETAIL");
    assert_eq!(fields[8], "T1", "transaction_id");
    assert_eq!(fields[10], "C1", "customer_id");
    assert_eq!(fields[11], "a@b", "customer_email");
    assert_eq!(fields[17], "M", "merchant_name");
    assert_eq!(fields[19], "CREDIT_CARD", "payment_type");
    assert_eq!(fields[22], "42.5", "risk_score");
    assert_eq!(fields[23], "COMPLETED", "status");
    assert_eq!(fields[24], "2", "item_count");

    assert_eq!(lines[2], "TRAILER|1|100.00|42.50|1");
}

#[tokio::test]
async fn unparseable_document_row_is_written_with_empty_fields() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let master_id = masters::insert(db.pool(), "NYC", 100, now())
        .await
        .expect("Failed to seed master");
    // A document that is valid JSON but not a transaction object; the
    // projector cannot deserialize it and must degrade, not fail.
    details::insert(
        db.pool(),
        master_id,
        NewDetailRow {
            detail_id: 1,
            account_number: Some("ACC-1".to_string()),
            amount: Some(Decimal::new(999, 2)),
            transaction_data: Some(serde_json::json!("not a transaction object")),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to seed detail row");

    //* When
    let outcome = processor(&db, &config, "worker-a")
        .run_one(&CancellationToken::new())
        .await;

    //* Then
    assert!(matches!(outcome, Outcome::Processed(_)));

    let lines = read_single_file(out.path());
    assert_eq!(lines.len(), 3);

    let fields: Vec<&str> = lines[1].split('|').collect();
    assert_eq!(fields[1], "1", "detail_id survives");
    assert_eq!(fields[2], "ACC-1", "scalar columns survive");
    assert_eq!(fields[4], "9.99", "amount survives");
    assert_eq!(fields[8], "", "transaction_id is empty");
    assert_eq!(fields[22], "", "risk_score is empty");

    // The row still counts in the trailer.
    assert_eq!(lines[2], "TRAILER|1|9.99|0.00|0");
    assert_eq!(master_status(&db, master_id).await, MasterStatus::Completed);
}

#[tokio::test]
async fn two_workers_one_master_exactly_one_file() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    masters::insert(db.pool(), "NYC", 100, now())
        .await
        .expect("Failed to seed master");

    let worker_a = processor(&db, &config, "worker-a");
    let worker_b = processor(&db, &config, "worker-b");
    let cancel = CancellationToken::new();

    //* When
    let (outcome_a, outcome_b) =
        tokio::join!(worker_a.run_one(&cancel), worker_b.run_one(&cancel));

    //* Then
    let processed = [&outcome_a, &outcome_b]
        .iter()
        .filter(|outcome| matches!(outcome, Outcome::Processed(_)))
        .count();
    let idle = [&outcome_a, &outcome_b]
        .iter()
        .filter(|outcome| matches!(outcome, Outcome::Idle))
        .count();
    assert_eq!(
        (processed, idle),
        (1, 1),
        "outcomes: {outcome_a:?} / {outcome_b:?}"
    );

    assert_eq!(output_files(out.path()).len(), 1);
}

#[tokio::test]
async fn abandoned_master_is_recovered_by_another_worker() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let master_id = masters::insert(db.pool(), "NYC", 100, now())
        .await
        .expect("Failed to seed master");
    details::insert(
        db.pool(),
        master_id,
        NewDetailRow {
            detail_id: 1,
            amount: Some(Decimal::new(100, 2)),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to seed detail row");

    // Worker A claims the master and "crashes" without finalizing.
    let worker_a = WorkerId::from_owned("worker-a".to_string());
    let claimed = claim::try_claim(&db, &worker_a, now(), LOCK_TIMEOUT)
        .await
        .expect("claim should not fail");
    assert_eq!(claimed, Some(master_id));

    let stale = now() - chrono::TimeDelta::seconds(LOCK_TIMEOUT.as_secs() as i64 + 1);
    sqlx::query("UPDATE master_records SET locked_at = $1 WHERE master_id = $2")
        .bind(stale)
        .bind(master_id)
        .execute(db.pool())
        .await
        .expect("Failed to age the lock");

    //* When
    // Worker B picks up the abandoned master and completes it.
    let outcome = processor(&db, &config, "worker-b")
        .run_one(&CancellationToken::new())
        .await;

    //* Then
    assert!(matches!(outcome, Outcome::Processed(id) if id == master_id));
    assert_eq!(master_status(&db, master_id).await, MasterStatus::Completed);

    // Worker A restarts and attempts its finalize; no state regression.
    let completed_by_a = masters::complete(db.pool(), master_id, (&worker_a).into(), now())
        .await
        .expect("complete should not fail");
    assert!(!completed_by_a);
    assert_eq!(master_status(&db, master_id).await, MasterStatus::Completed);

    assert_eq!(output_files(out.path()).len(), 1);
}

#[tokio::test]
async fn cancelled_cycle_fails_the_master_and_leaves_no_file() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let master_id = masters::insert(db.pool(), "NYC", 100, now())
        .await
        .expect("Failed to seed master");
    details::insert(
        db.pool(),
        master_id,
        NewDetailRow {
            detail_id: 1,
            amount: Some(Decimal::new(100, 2)),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to seed detail row");

    let cancel = CancellationToken::new();
    cancel.cancel();

    //* When
    let outcome = processor(&db, &config, "worker-a").run_one(&cancel).await;

    //* Then
    assert!(
        matches!(outcome, Outcome::Errored(ref err) if err.to_string().contains("cancelled")),
        "unexpected outcome: {outcome:?}"
    );

    let master = masters::get_by_id(db.pool(), master_id)
        .await
        .expect("Failed to load master")
        .expect("Master not found");
    assert_eq!(master.status, MasterStatus::Failed);
    assert!(master
        .error_message
        .expect("error message should be recorded")
        .contains("cancelled"));

    assert!(output_files(out.path()).is_empty(), "partial file must be deleted");
}

#[tokio::test]
async fn worker_loop_drains_the_queue_and_stops_on_shutdown() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let mut master_ids = Vec::new();
    for (business_center, priority) in [("NYC", 100), ("LON", 50), ("TKO", 10)] {
        let master_id = masters::insert(db.pool(), business_center, priority, now())
            .await
            .expect("Failed to seed master");
        details::insert(
            db.pool(),
            master_id,
            NewDetailRow {
                detail_id: 1,
                amount: Some(Decimal::new(100, 2)),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to seed detail row");
        master_ids.push(master_id);
    }

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        processor(&db, &config, "worker-a"),
        config.clone(),
        shutdown.clone(),
    );

    //* When
    let handle = tokio::spawn(worker.run());

    // Every master must reach a terminal state within a bounded time.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let mut done = true;
        for &master_id in &master_ids {
            if master_status(&db, master_id).await != MasterStatus::Completed {
                done = false;
                break;
            }
        }
        if done {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "workers did not drain the queue in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    //* Then
    shutdown.cancel();
    handle.await.expect("worker loop should exit cleanly");

    assert_eq!(output_files(out.path()).len(), 3);
}

#[tokio::test]
async fn empty_master_produces_header_and_trailer_only() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = connect(&temp_db).await;
    let out = tempfile::tempdir().unwrap();
    let config = test_config(&temp_db, out.path());

    let master_id = masters::insert(db.pool(), "LON", 1, now())
        .await
        .expect("Failed to seed master");

    //* When
    let outcome = processor(&db, &config, "worker-a")
        .run_one(&CancellationToken::new())
        .await;

    //* Then
    assert!(matches!(outcome, Outcome::Processed(_)));

    let lines = read_single_file(out.path());
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with(&format!("HEADER|{master_id}|LON|")));
    assert_eq!(lines[1], "TRAILER|0|0.00|0.00|0");
}
