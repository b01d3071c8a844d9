//! Tests for the dumper-to-writer bridge
//!

use std::{io::Read, sync::Arc};

use flate2::read::GzDecoder;
use label_backup::{
    pipeline::{self, bridge, BackupStream},
    writer::BackupWriter,
};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

mod common;

use common::{test_spec, MockDumper, MockWriter};

async fn collect(stream: &mut BackupStream) -> Vec<u8> {
    let mut contents = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        contents.extend_from_slice(&chunk);
    }
    contents
}

#[tokio::test]
async fn bridge_round_trips_through_gzip() {
    let payload = b"-- dump\nINSERT INTO t VALUES (1);\n".repeat(500);

    let (mut sink, mut stream) = bridge();
    let producer = tokio::spawn({
        let payload = payload.clone();
        async move {
            sink.write_all(&payload).await.unwrap();
            sink.finish().await.unwrap();
        }
    });

    let compressed = collect(&mut stream).await;
    producer.await.unwrap();

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();

    assert_eq!(decompressed, payload);
}

#[tokio::test]
async fn abort_surfaces_on_the_read_end() {
    let (mut sink, mut stream) = bridge();

    let producer = tokio::spawn(async move {
        sink.write_all(b"partial").await.unwrap();
        sink.abort("dump exploded".to_owned()).await;
    });

    // Keep reading until the error arrives.
    let error = loop {
        match stream.next_chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("expected an error, got clean end-of-stream"),
            Err(error) => break error,
        }
    };
    producer.await.unwrap();

    assert!(error.to_string().contains("dump exploded"));
}

#[tokio::test]
async fn dropped_reader_unblocks_the_producer() {
    let (mut sink, stream) = bridge();
    drop(stream);

    // Keep writing until the compressed output crosses the chunk threshold
    // and a send against the dropped read end is attempted.
    let payload = vec![b'x'; 64 * 1024];
    let mut result = Ok(());
    for _ in 0..10_000 {
        result = sink.write_all(&payload).await;
        if result.is_err() {
            break;
        }
    }

    assert!(result.is_err());
}

#[tokio::test]
async fn run_reports_success_with_matching_checksum() {
    let payload = b"SELECT 1;\n".repeat(100);
    let dumper = Arc::new(MockDumper::with_payload(&payload));
    let writer = Arc::new(MockWriter::default());
    let cancel = CancellationToken::new();

    let report = pipeline::run(
        &cancel,
        dumper,
        Arc::clone(&writer) as Arc<dyn BackupWriter>,
        &test_spec(),
        "pg/postgres-app-20240501120000.dump.gz",
    )
    .await;

    assert!(report.success(), "report: {report:?}");
    let receipt = report.receipt.unwrap();
    assert!(receipt.bytes_written > 0);

    // The checksum covers exactly the bytes the writer consumed.
    let written = writer.written();
    assert_eq!(written.len(), 1);
    let stored = &written[0].1;
    assert_eq!(stored.len() as u64, receipt.bytes_written);
    assert_eq!(hex::encode(Sha256::digest(stored)), receipt.checksum);

    // And the stored bytes decompress back to the dump.
    let mut decoder = GzDecoder::new(stored.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();
    assert_eq!(decompressed, payload);
}

#[tokio::test]
async fn run_reports_dump_failure_to_both_sides() {
    let dumper = Arc::new(MockDumper {
        payload: Vec::new(),
        fail_dump: true,
        fail_connection: false,
    });
    let writer = Arc::new(MockWriter::default());
    let cancel = CancellationToken::new();

    let report = pipeline::run(
        &cancel,
        dumper,
        Arc::clone(&writer) as Arc<dyn BackupWriter>,
        &test_spec(),
        "pg/broken.dump.gz",
    )
    .await;

    assert!(!report.success());
    assert!(report.dump_error.is_some());
    assert!(report.write_error.is_some());
    assert!(report.receipt.is_none());
    assert!(report.error_message().contains("dump error"));
}

#[tokio::test]
async fn cancelled_run_does_not_succeed() {
    let dumper = Arc::new(MockDumper::with_payload(b"data"));
    let writer = Arc::new(MockWriter::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline::run(
        &cancel,
        dumper,
        Arc::clone(&writer) as Arc<dyn BackupWriter>,
        &test_spec(),
        "pg/cancelled.dump.gz",
    )
    .await;

    assert!(!report.success());
}

#[tokio::test]
async fn buffered_stream_yields_payload_once() {
    let mut stream = BackupStream::from_bytes(b"sidecar json".to_vec());
    assert_eq!(collect(&mut stream).await, b"sidecar json");
    assert!(stream.next_chunk().await.unwrap().is_none());
}
