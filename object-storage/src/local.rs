// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::download::StreamingDownload;
use crate::errors::{ObjectStorageError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-process object store used by tests and local runs.
#[derive(Clone, Default)]
pub struct LocalStorage {
    objects: Arc<Mutex<HashMap<(String, String), Bytes>>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.into(), key.into()), data.into());
    }

    pub async fn download(&self, bucket: &str, key: &str) -> Result<StreamingDownload> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&(bucket.to_string(), key.to_string())) {
            Some(data) => Ok(StreamingDownload::from_bytes(data.clone())),
            None => Err(ObjectStorageError::NotFound {
                bucket: bucket.into(),
                key: key.into(),
            }),
        }
    }

    pub async fn upload_bytes(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        self.insert(bucket, key, data);
        Ok(())
    }
}
