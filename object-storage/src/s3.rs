// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::download::StreamingDownload;
use crate::errors::{ObjectStorageError, Result};
use aws_auth::{sha256_hex, AwsCredentials, RequestSigner, UNSIGNED_PAYLOAD};
use bytes::Bytes;
use futures::stream::Stream;
use reqwest::{Client, StatusCode, Url};
use std::io;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

/// S3-compatible endpoint client with path-style addressing.
#[derive(Clone)]
pub struct S3Storage {
    http: Client,
    endpoint: Url,
    signer: RequestSigner,
}

impl S3Storage {
    pub fn new(endpoint: Url, region: impl Into<String>, credentials: AwsCredentials) -> Self {
        Self {
            http: Client::new(),
            endpoint,
            signer: RequestSigner::new(credentials, region, "s3"),
        }
    }

    /// Verifies credentials and that `buckets` exist before the service
    /// starts consuming.
    pub async fn verify_access(&self, buckets: &[&str]) -> Result<()> {
        log::info!("initializing object storage");

        let mut request = self
            .http
            .get(self.endpoint.clone())
            .build()
            .map_err(ObjectStorageError::Transport)?;
        self.signer.sign(&mut request, &sha256_hex(b""))?;
        let response = self.http.execute(request).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        for bucket in buckets {
            log::info!("checking bucket {}", bucket);
            let url = self.object_url(bucket, "")?;
            let mut request = self
                .http
                .head(url)
                .build()
                .map_err(ObjectStorageError::Transport)?;
            self.signer.sign(&mut request, &sha256_hex(b""))?;
            let response = self.http.execute(request).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(ObjectStorageError::Api {
                    status: 404,
                    message: format!("bucket {bucket} does not exist"),
                });
            }
            if !response.status().is_success() {
                return Err(api_error(response).await);
            }
        }

        log::info!("initializing object storage: done");
        Ok(())
    }

    pub async fn download(&self, bucket: &str, key: &str) -> Result<StreamingDownload> {
        let url = self.object_url(bucket, key)?;
        let mut request = self
            .http
            .get(url)
            .build()
            .map_err(ObjectStorageError::Transport)?;
        self.signer.sign(&mut request, &sha256_hex(b""))?;

        let response = self.http.execute(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStorageError::NotFound {
                bucket: bucket.into(),
                key: key.into(),
            });
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(StreamingDownload::from_response(response))
    }

    pub async fn upload_bytes(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let payload_hash = sha256_hex(&data);
        let mut request = self
            .http
            .put(url)
            .header("content-length", data.len())
            .body(data)
            .build()
            .map_err(ObjectStorageError::Transport)?;
        self.signer.sign(&mut request, &payload_hash)?;

        let response = self.http.execute(request).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    /// Streams `data` into the object, failing with `UploadLimit` once more
    /// than `upload_limit` bytes have passed through. A cancellation
    /// observed after the tracker tripped also reports `UploadLimit`.
    pub async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        data: impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
        upload_limit: u64,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        assert!(upload_limit > 0);

        let (tracked, tripped) = crate::track_limit(data, upload_limit);

        let url = self.object_url(bucket, key)?;
        let mut request = self
            .http
            .put(url)
            .body(reqwest::Body::wrap_stream(tracked))
            .build()
            .map_err(ObjectStorageError::Transport)?;
        self.signer.sign(&mut request, UNSIGNED_PAYLOAD)?;

        let send = self.http.execute(request);
        tokio::pin!(send);

        let result = tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                if tripped.load(Ordering::SeqCst) {
                    return Err(ObjectStorageError::UploadLimit);
                }
                return Err(ObjectStorageError::Cancelled);
            }
            result = &mut send => result,
        };

        let response = result.map_err(|err| {
            if tripped.load(Ordering::SeqCst) {
                ObjectStorageError::UploadLimit
            } else {
                ObjectStorageError::Transport(err)
            }
        })?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        let path = if key.is_empty() {
            format!("{base}/{bucket}")
        } else {
            format!("{base}/{bucket}/{key}")
        };
        url.set_path(&path);
        Ok(url)
    }
}

async fn api_error(response: reqwest::Response) -> ObjectStorageError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ObjectStorageError::Api { status, message }
}
