//! Tests for the retention sweep
//!

use core::time::Duration;
use std::sync::Arc;

use chrono::Utc;
use label_backup::{
    gc::{GcError, GcRunner},
    writer::BackupWriter,
};
use tokio_util::sync::CancellationToken;

mod common;

use common::{object, test_spec, MockWriter};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn days(count: i64) -> chrono::Duration {
    chrono::Duration::days(count)
}

#[tokio::test]
async fn deletes_objects_past_retention() {
    let now = Utc::now();
    let writer = Arc::new(MockWriter::with_objects(vec![
        object("pg/old1.dump.gz", now - days(10), 100),
        object("pg/old2.dump.gz", now - days(8), 200),
        object("pg/recent.dump.gz", now - days(1), 300),
    ]));

    let runner = GcRunner::new(test_spec(), Arc::clone(&writer) as Arc<dyn BackupWriter>, 7 * DAY, false);
    let summary = runner.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.considered, 3);
    assert_eq!(summary.affected, 2);
    assert_eq!(summary.bytes_affected, 300);
    assert_eq!(writer.object_count(), 1);

    let mut deleted = writer.deleted_keys();
    deleted.sort();
    assert_eq!(deleted, ["pg/old1.dump.gz", "pg/old2.dump.gz"]);
}

#[tokio::test]
async fn dry_run_never_deletes() {
    let now = Utc::now();
    let writer = Arc::new(MockWriter::with_objects(vec![
        object("pg/hourly.dump.gz", now - chrono::Duration::hours(1), 10),
        object("pg/old.dump.gz", now - days(8), 20),
        object("pg/older.dump.gz", now - days(30), 30),
    ]));

    let runner = GcRunner::new(test_spec(), Arc::clone(&writer) as Arc<dyn BackupWriter>, 7 * DAY, true);
    let summary = runner.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.affected, 2);
    assert_eq!(summary.bytes_affected, 50);
    assert!(writer.deleted_keys().is_empty());
    assert_eq!(writer.object_count(), 3);
}

#[tokio::test]
async fn objects_within_retention_are_never_deleted() {
    let now = Utc::now();
    // Just inside the boundary.
    let writer = Arc::new(MockWriter::with_objects(vec![object(
        "pg/boundary.dump.gz",
        now - days(7) + chrono::Duration::minutes(5),
        10,
    )]));

    let runner = GcRunner::new(test_spec(), Arc::clone(&writer) as Arc<dyn BackupWriter>, 7 * DAY, false);
    let summary = runner.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.affected, 0);
    assert_eq!(writer.object_count(), 1);
}

#[tokio::test]
async fn spec_retention_overrides_global() {
    let now = Utc::now();
    let writer = Arc::new(MockWriter::with_objects(vec![object(
        "pg/two-days.dump.gz",
        now - days(2),
        10,
    )]));

    // Spec says one day even though the global default is a week.
    let mut spec = test_spec();
    spec.retention = DAY;

    let runner = GcRunner::new(spec, Arc::clone(&writer) as Arc<dyn BackupWriter>, 7 * DAY, false);
    let summary = runner.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.affected, 1);
    assert_eq!(writer.object_count(), 0);
}

#[tokio::test]
async fn zero_retention_skips_the_sweep() {
    let now = Utc::now();
    let writer = Arc::new(MockWriter::with_objects(vec![object(
        "pg/ancient.dump.gz",
        now - days(1000),
        10,
    )]));

    let runner = GcRunner::new(test_spec(), Arc::clone(&writer) as Arc<dyn BackupWriter>, Duration::ZERO, false);
    let summary = runner.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.considered, 0);
    assert_eq!(writer.object_count(), 1);
}

#[tokio::test]
async fn failed_deletes_are_counted_not_fatal() {
    let now = Utc::now();
    let mut writer = MockWriter::with_objects(vec![
        object("pg/old1.dump.gz", now - days(10), 10),
        object("pg/old2.dump.gz", now - days(10), 10),
    ]);
    writer.fail_deletes = true;
    let writer = Arc::new(writer);

    let runner = GcRunner::new(test_spec(), Arc::clone(&writer) as Arc<dyn BackupWriter>, 7 * DAY, false);
    let error = runner.run(&CancellationToken::new()).await.unwrap_err();

    match error {
        GcError::DeletesFailed { failed, summary } => {
            assert_eq!(failed, 2);
            assert_eq!(summary.considered, 2);
            assert_eq!(summary.affected, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}
