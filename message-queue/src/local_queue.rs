// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct LocalQueueMessage {
    pub data: Vec<u8>,
}

/// In-process queue used by tests and local runs.
#[derive(Clone)]
pub struct LocalQueueClient {
    sender: flume::Sender<Vec<u8>>,
    receiver: flume::Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl LocalQueueClient {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Further enqueues fail once closed; pending messages stay poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn enqueue(&self, data: impl Serialize) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("local queue is closed");
        }
        let body = serde_json::to_vec(&data)?;
        self.sender.send_async(body).await?;
        Ok(())
    }

    pub async fn pop(&self) -> Result<Option<LocalQueueMessage>> {
        match self.receiver.try_recv() {
            Ok(data) => Ok(Some(LocalQueueMessage { data })),
            Err(flume::TryRecvError::Empty) | Err(flume::TryRecvError::Disconnected) => Ok(None),
        }
    }
}

impl Default for LocalQueueClient {
    fn default() -> Self {
        Self::new()
    }
}
