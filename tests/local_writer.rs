//! Tests for the local writer and the object key layout
//!

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use label_backup::{
    pipeline::{self, BackupStream},
    writer::{self, object_name, BackupWriter, LocalWriter, WriteError},
};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

mod common;

use common::{test_spec, MockDumper};

#[test]
fn object_name_layout() {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();

    let spec = test_spec();
    assert_eq!(
        object_name(&spec, at),
        "pg/postgres-app-20240501123045.dump.gz"
    );

    // No prefix means no leading path.
    let mut bare = test_spec();
    bare.prefix = String::new();
    assert_eq!(object_name(&bare, at), "postgres-app-20240501123045.dump.gz");
}

#[test]
fn object_name_falls_back_to_the_uri_tail() {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

    let mut spec = test_spec();
    spec.database = None;
    spec.conn = "postgresql://u:p@h:5432/orders?sslmode=disable".to_owned();
    spec.prefix = String::new();
    assert_eq!(object_name(&spec, at), "postgres-orders-20240501000000.dump.gz");

    // Redis with neither database nor a path segment.
    let mut redis = test_spec();
    redis.kind = label_backup::spec::DbKind::Redis;
    redis.database = None;
    redis.conn = "redis-host:6379".to_owned();
    redis.prefix = String::new();
    assert_eq!(object_name(&redis, at), "redis-default-20240501000000.dump.gz");
}

#[test]
fn object_name_sanitizes_the_database_component() {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

    let mut spec = test_spec();
    spec.database = Some("my db/v2.1!".to_owned());
    spec.prefix = String::new();
    assert_eq!(
        object_name(&spec, at),
        "postgres-my_db_v2.1_-20240501000000.dump.gz"
    );
}

#[tokio::test]
async fn write_stores_bytes_and_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LocalWriter::new(dir.path()).unwrap();

    let payload = b"backup contents".to_vec();
    let mut stream = BackupStream::from_bytes(payload.clone());

    let receipt = writer.write("pg/test.dump.gz", &mut stream).await.unwrap();

    assert_eq!(receipt.bytes_written, payload.len() as u64);
    assert_eq!(receipt.checksum, hex::encode(Sha256::digest(&payload)));

    let stored = std::fs::read(dir.path().join("pg/test.dump.gz")).unwrap();
    assert_eq!(stored, payload);
}

#[tokio::test]
async fn write_refuses_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LocalWriter::new(dir.path()).unwrap();

    for key in ["../escape.gz", "a/../../escape.gz", "/etc/passwd"] {
        let mut stream = BackupStream::from_bytes(b"x".to_vec());
        let result = writer.write(key, &mut stream).await;
        assert!(
            matches!(result, Err(WriteError::PathTraversal(_))),
            "key {key} should be refused"
        );
    }
}

#[tokio::test]
async fn delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LocalWriter::new(dir.path()).unwrap();

    writer.delete_object("does/not/exist.dump.gz").await.unwrap();

    let mut stream = BackupStream::from_bytes(b"x".to_vec());
    writer.write("a/one.dump.gz", &mut stream).await.unwrap();
    writer.delete_object("a/one.dump.gz").await.unwrap();
    writer.delete_object("a/one.dump.gz").await.unwrap();
}

#[tokio::test]
async fn list_is_prefix_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LocalWriter::new(dir.path()).unwrap();

    for key in ["pg/one.dump.gz", "pg/two.dump.gz", "mysql/other.dump.gz"] {
        let mut stream = BackupStream::from_bytes(b"data".to_vec());
        writer.write(key, &mut stream).await.unwrap();
    }

    let mut keys: Vec<String> = writer
        .list_objects("pg")
        .await
        .unwrap()
        .into_iter()
        .map(|object| object.key)
        .collect();
    keys.sort();

    assert_eq!(keys, ["pg/one.dump.gz", "pg/two.dump.gz"]);

    let all = writer.list_objects("").await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn successful_run_leaves_object_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let backup_writer: Arc<dyn BackupWriter> = Arc::new(LocalWriter::new(dir.path()).unwrap());

    let payload = b"CREATE TABLE t (id int);\n".repeat(64);
    let dumper = Arc::new(MockDumper::with_payload(&payload));
    let spec = test_spec();
    let key = object_name(&spec, Utc::now());
    let cancel = CancellationToken::new();

    let report = pipeline::run(
        &cancel,
        dumper,
        Arc::clone(&backup_writer),
        &spec,
        &key,
    )
    .await;

    assert!(report.success());
    let receipt = report.receipt.unwrap();

    let metadata = writer::BackupMetadata {
        timestamp: Utc::now(),
        container_id: spec.container_id.clone(),
        container_name: spec.container_name.clone(),
        database_type: spec.kind.to_string(),
        database_name: spec.database.clone(),
        backup_size_bytes: receipt.bytes_written,
        checksum: receipt.checksum.clone(),
        compression_type: "gzip".to_owned(),
        version: "1.0".to_owned(),
        destination: receipt.destination.clone(),
        duration_seconds: 0.1,
        success: true,
        error: None,
    };
    writer::write_metadata(backup_writer.as_ref(), &metadata, &key)
        .await
        .unwrap();

    // The sidecar sits next to the object and matches the receipt.
    let read_back = writer::read_metadata(backup_writer.as_ref(), &key).await.unwrap();
    assert_eq!(read_back.backup_size_bytes, receipt.bytes_written);
    assert_eq!(read_back.checksum, receipt.checksum);
    assert!(read_back.success);

    assert!(dir.path().join(&key).exists());
    assert!(dir
        .path()
        .join(writer::metadata_key(&key))
        .exists());
}
