// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod download;
mod errors;
mod local;
mod paths;
mod s3;

pub use download::StreamingDownload;
pub use errors::{ObjectStorageError, Result};
pub use local::LocalStorage;
pub use paths::{BucketData, BucketFuzzers};
pub use s3::S3Storage;

#[derive(Clone)]
enum StorageBackend {
    S3(S3Storage),
    Local(LocalStorage),
}

/// Object storage facade over the `fuzzers` and `data` buckets.
#[derive(Clone)]
pub struct ObjectStorage {
    backend: StorageBackend,
    bucket_fuzzers: BucketFuzzers,
    bucket_data: BucketData,
}

impl ObjectStorage {
    pub fn with_s3(
        s3: S3Storage,
        fuzzers_bucket: impl Into<String>,
        data_bucket: impl Into<String>,
    ) -> Self {
        Self {
            backend: StorageBackend::S3(s3),
            bucket_fuzzers: BucketFuzzers::new(fuzzers_bucket),
            bucket_data: BucketData::new(data_bucket),
        }
    }

    pub fn with_local(
        local: LocalStorage,
        fuzzers_bucket: impl Into<String>,
        data_bucket: impl Into<String>,
    ) -> Self {
        Self {
            backend: StorageBackend::Local(local),
            bucket_fuzzers: BucketFuzzers::new(fuzzers_bucket),
            bucket_data: BucketData::new(data_bucket),
        }
    }

    /// Connectivity and permission checks, run once at service start.
    pub async fn verify_access(&self) -> Result<()> {
        match &self.backend {
            StorageBackend::S3(s3) => {
                s3.verify_access(&[self.bucket_fuzzers.name(), self.bucket_data.name()])
                    .await
            }
            StorageBackend::Local(_) => Ok(()),
        }
    }

    pub async fn download_crash(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        input_id: &str,
    ) -> Result<StreamingDownload> {
        let (bucket, key) = self.bucket_data.crash(fuzzer_id, fuzzer_rev, input_id);
        self.download(&bucket, &key).await
    }

    pub async fn upload_fuzzer_config(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        config: Bytes,
    ) -> Result<()> {
        let (bucket, key) = self.bucket_fuzzers.config(fuzzer_id, fuzzer_rev);
        match &self.backend {
            StorageBackend::S3(s3) => s3.upload_bytes(&bucket, &key, config).await,
            StorageBackend::Local(local) => local.upload_bytes(&bucket, &key, config).await,
        }
    }

    pub async fn download_fuzzer_config(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
    ) -> Result<Vec<u8>> {
        let (bucket, key) = self.bucket_fuzzers.config(fuzzer_id, fuzzer_rev);
        self.download(&bucket, &key).await?.collect().await
    }

    pub async fn upload_fuzzer_binaries(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        data: impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
        upload_limit: u64,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let (bucket, key) = self.bucket_fuzzers.binaries(fuzzer_id, fuzzer_rev);
        self.upload_stream(&bucket, &key, data, upload_limit, cancellation)
            .await
    }

    pub async fn download_fuzzer_binaries(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
    ) -> Result<StreamingDownload> {
        let (bucket, key) = self.bucket_fuzzers.binaries(fuzzer_id, fuzzer_rev);
        self.download(&bucket, &key).await
    }

    pub async fn upload_fuzzer_seeds(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        data: impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
        upload_limit: u64,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let (bucket, key) = self.bucket_fuzzers.seeds(fuzzer_id, fuzzer_rev);
        self.upload_stream(&bucket, &key, data, upload_limit, cancellation)
            .await
    }

    pub async fn download_fuzzer_seeds(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
    ) -> Result<StreamingDownload> {
        let (bucket, key) = self.bucket_fuzzers.seeds(fuzzer_id, fuzzer_rev);
        self.download(&bucket, &key).await
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<StreamingDownload> {
        match &self.backend {
            StorageBackend::S3(s3) => s3.download(bucket, key).await,
            StorageBackend::Local(local) => local.download(bucket, key).await,
        }
    }

    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        data: impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
        upload_limit: u64,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        match &self.backend {
            StorageBackend::S3(s3) => {
                s3.upload_stream(bucket, key, data, upload_limit, cancellation)
                    .await
            }
            StorageBackend::Local(local) => {
                assert!(upload_limit > 0);
                let (tracked, tripped) = track_limit(data, upload_limit);
                tokio::pin!(tracked);

                let mut buffer = Vec::new();
                loop {
                    let chunk = tokio::select! {
                        biased;
                        () = cancellation.cancelled() => {
                            if tripped.load(Ordering::SeqCst) {
                                return Err(ObjectStorageError::UploadLimit);
                            }
                            return Err(ObjectStorageError::Cancelled);
                        }
                        chunk = tracked.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(err)) => {
                            if tripped.load(Ordering::SeqCst) {
                                return Err(ObjectStorageError::UploadLimit);
                            }
                            return Err(ObjectStorageError::Io(err));
                        }
                        None => break,
                    }
                }

                local.insert(bucket, key, Bytes::from(buffer));
                Ok(())
            }
        }
    }
}

/// Wraps an upload stream with a byte counter; the stream errors and the
/// returned flag trips once more than `limit` bytes have passed through.
fn track_limit(
    data: impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
    limit: u64,
) -> (
    impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
    Arc<AtomicBool>,
) {
    let tripped = Arc::new(AtomicBool::new(false));
    let flag = tripped.clone();
    let mut total: u64 = 0;

    let tracked = data.map(move |chunk| {
        let chunk = chunk?;
        total += chunk.len() as u64;
        if total > limit {
            flag.store(true, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "upload limit exceeded"));
        }
        Ok(chunk)
    });

    (tracked, tripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part)))
                .collect::<Vec<_>>(),
        )
    }

    fn local_storage() -> (ObjectStorage, LocalStorage) {
        let local = LocalStorage::new();
        let storage = ObjectStorage::with_local(local.clone(), "fuzzers", "data");
        (storage, local)
    }

    #[tokio::test]
    async fn test_download_crash_streams_stored_object() {
        let (storage, local) = local_storage();
        local.insert("data", "f/r/crashes/i", &b"crash-bytes"[..]);

        let data = storage
            .download_crash("f", "r", "i")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(data, b"crash-bytes");
    }

    #[tokio::test]
    async fn test_download_missing_crash_is_not_found() {
        let (storage, _) = local_storage();

        let result = storage.download_crash("f", "r", "missing").await;
        assert!(matches!(
            result,
            Err(ObjectStorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_within_limit_succeeds() {
        let (storage, _) = local_storage();
        let cancellation = CancellationToken::new();

        storage
            .upload_fuzzer_binaries("f", "r", chunks(&[b"abc", b"def"]), 16, &cancellation)
            .await
            .unwrap();

        let data = storage
            .download_fuzzer_binaries("f", "r")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn test_fuzzer_config_round_trip() {
        let (storage, _) = local_storage();

        storage
            .upload_fuzzer_config("f", "r", Bytes::from_static(b"{\"options\":[]}"))
            .await
            .unwrap();

        let config = storage.download_fuzzer_config("f", "r").await.unwrap();
        assert_eq!(config, b"{\"options\":[]}");
    }

    #[tokio::test]
    async fn test_fuzzer_seeds_round_trip() {
        let (storage, _) = local_storage();
        let cancellation = CancellationToken::new();

        storage
            .upload_fuzzer_seeds("f", "r", chunks(&[b"seed"]), 16, &cancellation)
            .await
            .unwrap();

        let seeds = storage
            .download_fuzzer_seeds("f", "r")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(seeds, b"seed");
    }

    #[tokio::test]
    async fn test_upload_over_limit_fails() {
        let (storage, _) = local_storage();
        let cancellation = CancellationToken::new();

        let result = storage
            .upload_fuzzer_seeds("f", "r", chunks(&[b"abcd", b"efgh"]), 5, &cancellation)
            .await;
        assert!(matches!(result, Err(ObjectStorageError::UploadLimit)));
    }

    #[tokio::test]
    async fn test_cancelled_upload_reports_cancellation() {
        let (storage, _) = local_storage();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = storage
            .upload_fuzzer_binaries("f", "r", chunks(&[b"abc"]), 16, &cancellation)
            .await;
        assert!(matches!(result, Err(ObjectStorageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_limit_tracker_trips_flag() {
        let (tracked, tripped) = track_limit(chunks(&[b"0123456789", b"abcdef"]), 12);
        tokio::pin!(tracked);

        assert!(tracked.next().await.unwrap().is_ok());
        assert!(!tripped.load(Ordering::SeqCst));
        assert!(tracked.next().await.unwrap().is_err());
        assert!(tripped.load(Ordering::SeqCst));
    }
}
