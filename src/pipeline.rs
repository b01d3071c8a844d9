//! The in-memory byte bridge between a dumper and a writer.
//!
//! The producer side compresses raw dump bytes and feeds them into a bounded
//! channel of buffers; the consumer side drains the channel. Closing either
//! end surfaces as an error on the other, so a failed dump unblocks the
//! writer and a failed write unblocks the dumper.

use std::{collections::VecDeque, io, io::Write, sync::Arc};

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    dumper::{DumpError, Dumper},
    spec::BackupSpec,
    writer::{BackupWriter, WriteError, WriteReceipt},
};

/// Compressed chunks in flight between the dumper and the writer.
const BRIDGE_CAPACITY: usize = 8;

/// Target compressed chunk size.
const CHUNK_BYTES: usize = 64 * 1024;

/// Create a connected sink/stream pair.
pub fn bridge() -> (DumpSink, BackupStream) {
    let (tx, rx) = mpsc::channel(BRIDGE_CAPACITY);

    let sink = DumpSink {
        encoder: GzEncoder::new(Vec::with_capacity(CHUNK_BYTES * 2), Compression::default()),
        tx,
    };
    let stream = BackupStream {
        inner: StreamInner::Bridge(rx),
    };

    (sink, stream)
}

/// The error carried across the bridge when the producer fails.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BridgeError(pub String);

/// The write end of the bridge. Raw dump bytes written here are gzipped and
/// handed to the consumer.
pub struct DumpSink {
    encoder: GzEncoder<Vec<u8>>,
    tx: mpsc::Sender<Result<Bytes, BridgeError>>,
}

impl DumpSink {
    /// Compress and forward raw dump bytes.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.encoder.write_all(data).map_err(SinkError::Compress)?;

        if self.encoder.get_ref().len() >= CHUNK_BYTES {
            self.drain().await?;
        }

        Ok(())
    }

    /// Flush the compressor and close the bridge cleanly.
    pub async fn finish(self) -> Result<(), SinkError> {
        let remaining = self.encoder.finish().map_err(SinkError::Compress)?;

        if !remaining.is_empty() {
            self.tx
                .send(Ok(Bytes::from(remaining)))
                .await
                .map_err(|_| SinkError::Closed)?;
        }

        Ok(())
    }

    /// Close the bridge with an error, unblocking the consumer.
    pub async fn abort(self, error: String) {
        // Best effort. The consumer may already be gone.
        let _ = self.tx.send(Err(BridgeError(error))).await;
    }

    async fn drain(&mut self) -> Result<(), SinkError> {
        let chunk = std::mem::take(self.encoder.get_mut());
        self.tx
            .send(Ok(Bytes::from(chunk)))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to compress dump output:\n{0}")]
    Compress(#[source] io::Error),

    #[error("The bridge was closed by the writer")]
    Closed,
}

enum StreamInner {
    Bridge(mpsc::Receiver<Result<Bytes, BridgeError>>),
    Buffered(VecDeque<Bytes>),
}

/// The read end of the bridge.
pub struct BackupStream {
    inner: StreamInner,
}

impl BackupStream {
    /// A stream over an in-memory payload, for small objects such as the
    /// metadata sidecar.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut chunks = VecDeque::new();
        if !data.is_empty() {
            chunks.push_back(Bytes::from(data));
        }

        Self {
            inner: StreamInner::Buffered(chunks),
        }
    }

    /// The next chunk, `None` at clean end-of-stream, or the producer's error.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BridgeError> {
        match &mut self.inner {
            StreamInner::Bridge(rx) => match rx.recv().await {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(error)) => Err(error),
                None => Ok(None),
            },
            StreamInner::Buffered(chunks) => Ok(chunks.pop_front()),
        }
    }
}

/// The joined outcome of one pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// The write receipt, when the writer completed.
    pub receipt: Option<WriteReceipt>,
    /// The producer's error, if any.
    pub dump_error: Option<DumpError>,
    /// The consumer's error, if any.
    pub write_error: Option<WriteError>,
}

impl PipelineReport {
    /// A run succeeded when both workers finished cleanly and at least one
    /// byte was stored.
    pub fn success(&self) -> bool {
        self.dump_error.is_none()
            && self.write_error.is_none()
            && self
                .receipt
                .as_ref()
                .is_some_and(|receipt| receipt.bytes_written > 0)
    }

    /// Combined error text for logs and the notification payload.
    pub fn error_message(&self) -> String {
        let mut message = String::new();

        if let Some(error) = &self.dump_error {
            message.push_str(&format!("dump error: {error}"));
        }
        if let Some(error) = &self.write_error {
            if !message.is_empty() {
                message.push_str("; ");
            }
            message.push_str(&format!("write error: {error}"));
        }
        if message.is_empty() && self.receipt.as_ref().is_some_and(|r| r.bytes_written == 0) {
            message.push_str("dump produced no bytes");
        }

        message
    }
}

/// Run one backup through the bridge: the dumper feeds the compressing sink
/// while the writer drains the stream, and both honor the cancellation token.
pub async fn run(
    cancel: &CancellationToken,
    dumper: Arc<dyn Dumper>,
    writer: Arc<dyn BackupWriter>,
    spec: &BackupSpec,
    object_name: &str,
) -> PipelineReport {
    let (sink, stream) = bridge();

    let producer = tokio::spawn({
        let spec = spec.clone();
        let cancel = cancel.clone();
        async move {
            let mut sink = sink;
            match dumper.dump(&spec, &mut sink, &cancel).await {
                Ok(()) => match sink.finish().await {
                    Ok(()) => None,
                    Err(SinkError::Closed) => Some(DumpError::SinkClosed),
                    Err(SinkError::Compress(source)) => Some(DumpError::Compress(source)),
                },
                Err(dump_error) => {
                    sink.abort(dump_error.to_string()).await;
                    Some(dump_error)
                }
            }
        }
    });

    let consumer = tokio::spawn({
        let object_name = object_name.to_owned();
        let cancel = cancel.clone();
        async move {
            let mut stream = stream;
            tokio::select! {
                receipt = writer.write(&object_name, &mut stream) => receipt,
                _ = cancel.cancelled() => Err(WriteError::Cancelled),
            }
        }
    });

    let (dump_result, write_result) = tokio::join!(producer, consumer);

    let dump_error = match dump_result {
        Ok(dump_error) => dump_error,
        Err(join_error) => {
            error!("Dump worker failed: {join_error}");
            Some(DumpError::Worker(join_error.to_string()))
        }
    };

    let (receipt, write_error) = match write_result {
        Ok(Ok(receipt)) => (Some(receipt), None),
        Ok(Err(write_error)) => (None, Some(write_error)),
        Err(join_error) => {
            error!("Write worker failed: {join_error}");
            (None, Some(WriteError::Worker(join_error.to_string())))
        }
    };

    PipelineReport {
        receipt,
        dump_error,
        write_error,
    }
}
