// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::errors::{ObjectStorageError, Result};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Lazy, finite sequence of downloaded byte chunks. The underlying HTTP
/// body lives exactly as long as the stream: it is dropped on exhaustion,
/// on the first error, and on drop.
pub struct StreamingDownload {
    inner: Option<ChunkStream>,
}

impl StreamingDownload {
    pub(crate) fn from_response(response: reqwest::Response) -> Self {
        let stream = response
            .bytes_stream()
            .map_err(ObjectStorageError::Transport);
        Self {
            inner: Some(Box::pin(stream)),
        }
    }

    pub(crate) fn from_bytes(data: Bytes) -> Self {
        let chunks = if data.is_empty() {
            vec![]
        } else {
            vec![Ok(data)]
        };
        Self {
            inner: Some(Box::pin(futures::stream::iter(chunks))),
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(stream) = self.inner.as_mut() else {
            return Ok(None);
        };

        match stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => {
                self.inner = None;
                Err(err)
            }
            None => {
                self.inner = None;
                Ok(None)
            }
        }
    }

    /// Concatenates the remaining chunks into a single buffer.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

impl Stream for StreamingDownload {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(stream) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Err(err))) => {
                self.inner = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
