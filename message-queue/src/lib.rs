// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

pub const EMPTY_QUEUE_DELAY: Duration = Duration::from_secs(10);

pub mod local_queue;
pub mod sqs_queue;

use local_queue::{LocalQueueClient, LocalQueueMessage};
use sqs_queue::{SqsQueueClient, SqsQueueMessage};

#[derive(Clone)]
pub enum QueueClient {
    Sqs(SqsQueueClient),
    Local(LocalQueueClient),
}

impl QueueClient {
    pub async fn enqueue(&self, data: impl Serialize) -> Result<()> {
        match self {
            QueueClient::Sqs(queue_client) => queue_client.enqueue(data).await,
            QueueClient::Local(queue_client) => queue_client.enqueue(data).await,
        }
    }

    pub async fn pop(&self) -> Result<Option<Message>> {
        match self {
            QueueClient::Sqs(queue_client) => {
                let message = queue_client.pop().await?;
                Ok(message.map(Message::Sqs))
            }
            QueueClient::Local(queue_client) => {
                let message = queue_client.pop().await?;
                Ok(message.map(Message::Local))
            }
        }
    }
}

pub enum Message {
    Sqs(SqsQueueMessage),
    Local(LocalQueueMessage),
}

impl Message {
    pub fn get<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.data())?)
    }

    pub fn parse<T>(&self, parser: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        parser(self.data())
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Message::Sqs(message) => &message.data,
            Message::Local(message) => &message.data,
        }
    }

    /// Acknowledges the message so the broker will not redeliver it.
    pub async fn delete(self) -> Result<()> {
        match self {
            Message::Sqs(message) => message.delete().await,
            Message::Local(_) => Ok(()),
        }
    }
}

/// Routed message body: queues are shared, the `name` selects the handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, data: impl Serialize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            data: serde_json::to_value(data)?,
        })
    }
}

/// Publishes named messages onto one queue. Messages that cannot be
/// delivered are parked and can be exported for persistence at shutdown.
pub struct Producer {
    name: String,
    queue: QueueClient,
    unsent: Mutex<Vec<Envelope>>,
}

impl Producer {
    pub fn new(queue: QueueClient, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue,
            unsent: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn produce(&self, data: impl Serialize) -> Result<()> {
        let envelope = Envelope::new(&self.name, data)?;
        if let Err(err) = self.queue.enqueue(&envelope).await {
            self.unsent.lock().await.push(envelope);
            return Err(err);
        }
        Ok(())
    }

    pub async fn export_unsent(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.unsent.lock().await)
    }

    /// Re-enqueues envelopes persisted by a previous run.
    pub async fn requeue(&self, envelopes: Vec<Envelope>) -> Result<()> {
        for envelope in envelopes {
            self.queue.enqueue(&envelope).await?;
        }
        Ok(())
    }
}
