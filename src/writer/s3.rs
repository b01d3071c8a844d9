use core::time::Duration;
use std::pin::Pin;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::{config::S3Config, pipeline::BackupStream};

use super::{BackupObjectMeta, BackupWriter, WriteError, WriteReceipt};

/// Multipart part size. S3 requires at least 5 MiB for all but the last part.
const PART_BYTES: usize = 8 * 1024 * 1024;

const HEAD_BUCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes backups to an S3-compatible bucket using multipart uploads.
pub struct S3Writer {
    client: Client,
    bucket: String,
}

impl S3Writer {
    /// Create a writer for the configured bucket.
    ///
    /// Uses static credentials when both keys are provided, otherwise the
    /// ambient credential chain. A custom endpoint switches the client to
    /// path-style addressing. The bucket is verified to be reachable; failure
    /// aborts writer creation.
    pub async fn new(config: &S3Config) -> Result<Self, WriteError> {
        let Some(bucket) = config.bucket.clone() else {
            return Err(WriteError::MissingBucket);
        };

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = config.region.clone() {
            loader = loader.region(Region::new(region));
        }

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                info!("Using static S3 credentials from the environment");
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "label-backup-static",
                ));
            }
            _ => {
                info!("Static S3 credentials not fully provided, using the default credential chain");
            }
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            info!("Custom S3 endpoint {endpoint} configured, using path-style addressing");
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        let head = tokio::time::timeout(
            HEAD_BUCKET_TIMEOUT,
            client.head_bucket().bucket(&bucket).send(),
        )
        .await
        .map_err(|_| WriteError::Timeout(HEAD_BUCKET_TIMEOUT))?;

        if let Err(error) = head {
            return Err(WriteError::BucketUnreachable {
                bucket,
                error: DisplayErrorContext(&error).to_string(),
            });
        }

        info!("S3 bucket {bucket} verified as accessible");

        Ok(Self { client, bucket })
    }

    async fn upload_part(
        &self,
        object_name: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, WriteError> {
        let part = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(object_name)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|error| WriteError::S3(DisplayErrorContext(&error).to_string()))?;

        Ok(CompletedPart::builder()
            .set_e_tag(part.e_tag().map(str::to_owned))
            .part_number(part_number)
            .build())
    }

    async fn abort_upload(&self, object_name: &str, upload_id: &str) {
        let abort = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(object_name)
            .upload_id(upload_id)
            .send()
            .await;

        if let Err(error) = abort {
            warn!(
                "Failed to abort multipart upload for {object_name}: {}",
                DisplayErrorContext(&error)
            );
        }
    }
}

#[async_trait]
impl BackupWriter for S3Writer {
    async fn write(
        &self,
        object_name: &str,
        stream: &mut BackupStream,
    ) -> Result<WriteReceipt, WriteError> {
        info!("Uploading backup to s3://{}/{object_name}", self.bucket);

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_name)
            .send()
            .await
            .map_err(|error| WriteError::S3(DisplayErrorContext(&error).to_string()))?;

        let upload_id = create.upload_id().unwrap_or_default().to_owned();

        let mut hasher = Sha256::new();
        let mut bytes_written = 0u64;
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut buffer = BytesMut::with_capacity(PART_BYTES);

        loop {
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(error) => {
                    self.abort_upload(object_name, &upload_id).await;
                    return Err(WriteError::Source(error.to_string()));
                }
            };

            hasher.update(&chunk);
            bytes_written += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            if buffer.len() >= PART_BYTES {
                let body = buffer.split().freeze();
                match self
                    .upload_part(object_name, &upload_id, part_number, body)
                    .await
                {
                    Ok(part) => parts.push(part),
                    Err(error) => {
                        self.abort_upload(object_name, &upload_id).await;
                        return Err(error);
                    }
                }
                part_number += 1;
            }
        }

        if !buffer.is_empty() || parts.is_empty() {
            let body = buffer.split().freeze();
            match self
                .upload_part(object_name, &upload_id, part_number, body)
                .await
            {
                Ok(part) => parts.push(part),
                Err(error) => {
                    self.abort_upload(object_name, &upload_id).await;
                    return Err(error);
                }
            }
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        let complete = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object_name)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await;

        if let Err(error) = complete {
            self.abort_upload(object_name, &upload_id).await;
            return Err(WriteError::S3(DisplayErrorContext(&error).to_string()));
        }

        let checksum = hex::encode(hasher.finalize());
        let destination = format!("s3://{}/{object_name}", self.bucket);

        info!("Uploaded {destination} ({bytes_written} bytes, sha256 {checksum})");

        Ok(WriteReceipt {
            destination,
            bytes_written,
            checksum,
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObjectMeta>, WriteError> {
        debug!("Listing s3://{}/{prefix}", self.bucket);

        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|error| {
                WriteError::List(DisplayErrorContext(&error).to_string())
            })?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };

                let last_modified = object
                    .last_modified()
                    .and_then(|timestamp| {
                        DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
                    })
                    .unwrap_or_else(Utc::now);

                objects.push(BackupObjectMeta {
                    key: key.to_owned(),
                    last_modified,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    checksum: object.e_tag().map(|tag| tag.trim_matches('"').to_owned()),
                });
            }
        }

        debug!("Found {} objects under s3://{}/{prefix}", objects.len(), self.bucket);
        Ok(objects)
    }

    async fn read_object(
        &self,
        object_name: &str,
    ) -> Result<Pin<Box<dyn AsyncRead + Send>>, WriteError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_name)
            .send()
            .await
            .map_err(|error| WriteError::S3(DisplayErrorContext(&error).to_string()))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|error| WriteError::S3(error.to_string()))?
            .into_bytes();

        Ok(Box::pin(std::io::Cursor::new(body)))
    }

    async fn delete_object(&self, key: &str) -> Result<(), WriteError> {
        // S3 treats deletion of an absent key as a success already.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| WriteError::S3(DisplayErrorContext(&error).to_string()))?;

        info!("Deleted s3://{}/{key}", self.bucket);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "s3"
    }
}
