// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::coordinator::{CrashCoordinator, CrashOutcome, Disposition, HandleError};
use crate::events::{self, NewCrash};
use anyhow::Result;
use message_queue::{Envelope, Message, QueueClient, EMPTY_QUEUE_DELAY};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const MAX_CONCURRENT_MESSAGES: usize = 16;

/// Pops new-crash messages and dispatches them as independent tasks until
/// cancelled, then drains in-flight tasks within `drain_timeout`.
pub async fn run_consumer(
    queue: QueueClient,
    dlq: QueueClient,
    coordinator: Arc<CrashCoordinator>,
    cancellation: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    let mut tasks = JoinSet::new();

    while !cancellation.is_cancelled() {
        while tasks.len() >= MAX_CONCURRENT_MESSAGES {
            if let Some(Err(err)) = tasks.join_next().await {
                log::error!("crash task panicked: {}", err);
            }
        }

        let popped = tokio::select! {
            biased;
            () = cancellation.cancelled() => break,
            popped = queue.pop() => popped,
        };

        let message = match popped {
            Ok(Some(message)) => message,
            Ok(None) => {
                idle(&cancellation).await;
                continue;
            }
            Err(err) => {
                log::error!("queue receive failed: {:#}", err);
                idle(&cancellation).await;
                continue;
            }
        };

        let coordinator = coordinator.clone();
        let dlq = dlq.clone();
        tasks.spawn(async move {
            process_message(&coordinator, &dlq, message).await;
        });
    }

    log::info!("draining in-flight crash tasks");
    let drain = async {
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                log::error!("crash task panicked: {}", err);
            }
        }
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        log::warn!("shutdown drain timed out, abandoning in-flight tasks");
    }

    Ok(())
}

async fn idle(cancellation: &CancellationToken) {
    tokio::select! {
        () = cancellation.cancelled() => {}
        () = tokio::time::sleep(EMPTY_QUEUE_DELAY) => {}
    }
}

/// One message end to end. Publish precedes ack: a message is deleted only
/// after its outgoing event (or dead-letter copy) was accepted by the broker.
async fn process_message(coordinator: &CrashCoordinator, dlq: &QueueClient, message: Message) {
    match dispatch(coordinator, &message).await {
        Ok(outcome) => {
            log::debug!("crash processed: {:?}", outcome);
            if let Err(err) = message.delete().await {
                log::error!("failed to ack processed message: {:#}", err);
            }
        }
        Err(err) => match err.disposition() {
            Disposition::DeadLetter => {
                log::error!("dead-lettering message: {}", err);

                let body: serde_json::Value = serde_json::from_slice(message.data())
                    .unwrap_or_else(|_| {
                        json!(String::from_utf8_lossy(message.data()).into_owned())
                    });
                let dead_letter = json!({ "error": err.to_string(), "message": body });

                if let Err(send_err) = dlq.enqueue(&dead_letter).await {
                    // leave unacked; the broker will redeliver
                    log::error!("failed to dead-letter message: {:#}", send_err);
                    return;
                }
                if let Err(ack_err) = message.delete().await {
                    log::error!("failed to ack dead-lettered message: {:#}", ack_err);
                }
            }
            Disposition::Retry => {
                log::warn!("message failed, leaving for redelivery: {}", err);
            }
        },
    }
}

async fn dispatch(
    coordinator: &CrashCoordinator,
    message: &Message,
) -> Result<CrashOutcome, HandleError> {
    let envelope: Envelope = message
        .get()
        .map_err(|err| HandleError::Invalid(format!("undecodable message body: {err}")))?;

    if envelope.name != events::NEW_CRASH {
        return Err(HandleError::Invalid(format!(
            "unexpected message: {}",
            envelope.name
        )));
    }

    let new_crash: NewCrash = serde_json::from_value(envelope.data)
        .map_err(|err| HandleError::Invalid(format!("undecodable new-crash message: {err}")))?;

    coordinator.handle_new_crash(&new_crash).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UNIQUE_CRASH_FOUND;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use crash_parser::sha256;
    use database::{Database, MemoryDb};
    use message_queue::local_queue::LocalQueueClient;
    use message_queue::Producer;
    use object_storage::{LocalStorage, ObjectStorage};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Queues {
        input: LocalQueueClient,
        gateway: LocalQueueClient,
        dlq: LocalQueueClient,
    }

    fn coordinator(gateway: &LocalQueueClient) -> Arc<CrashCoordinator> {
        Arc::new(CrashCoordinator::new(
            4096,
            ObjectStorage::with_local(LocalStorage::new(), "fuzzers", "data"),
            Database::Local(MemoryDb::new()).crashes(),
            Producer::new(QueueClient::Local(gateway.clone()), UNIQUE_CRASH_FOUND),
            Producer::new(
                QueueClient::Local(gateway.clone()),
                crate::events::DUPLICATE_CRASH_FOUND,
            ),
        ))
    }

    fn new_crash_envelope() -> serde_json::Value {
        json!({
            "name": events::NEW_CRASH,
            "data": {
                "user_id": "u",
                "project_id": "p",
                "pool_id": "pool",
                "fuzzer_id": "f",
                "fuzzer_rev": "r",
                "fuzzer_engine": "cargo-fuzz",
                "fuzzer_lang": "rust",
                "crash": {
                    "type": "crash",
                    "input": BASE64.encode(b"input"),
                    "output": "thread 'x' panicked at 'boom', src/main.rs:1:1\n",
                    "reproduced": true,
                },
                "created": "2023-05-01T12:00:00Z",
            },
        })
    }

    async fn pop_json(queue: &LocalQueueClient) -> Option<serde_json::Value> {
        let message = QueueClient::Local(queue.clone()).pop().await.unwrap()?;
        Some(message.get().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_processes_and_acks() {
        let queues = Queues {
            input: LocalQueueClient::new(),
            gateway: LocalQueueClient::new(),
            dlq: LocalQueueClient::new(),
        };
        let coordinator = coordinator(&queues.gateway);

        QueueClient::Local(queues.input.clone())
            .enqueue(new_crash_envelope())
            .await
            .unwrap();

        let cancellation = CancellationToken::new();
        let consumer = tokio::spawn(run_consumer(
            QueueClient::Local(queues.input.clone()),
            QueueClient::Local(queues.dlq.clone()),
            coordinator,
            cancellation.clone(),
            Duration::from_secs(30),
        ));

        let event = loop {
            if let Some(event) = pop_json(&queues.gateway).await {
                break event;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        cancellation.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(event["name"], json!(UNIQUE_CRASH_FOUND));
        assert_eq!(event["data"]["brief"], json!("boom"));
        assert_eq!(
            event["data"]["input_hash"],
            json!(sha256::digest(b"input"))
        );
        assert!(pop_json(&queues.dlq).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_message_is_dead_lettered() {
        let queues = Queues {
            input: LocalQueueClient::new(),
            gateway: LocalQueueClient::new(),
            dlq: LocalQueueClient::new(),
        };
        let coordinator = coordinator(&queues.gateway);

        QueueClient::Local(queues.input.clone())
            .enqueue(json!({"name": "some.other.message", "data": {}}))
            .await
            .unwrap();

        let cancellation = CancellationToken::new();
        let consumer = tokio::spawn(run_consumer(
            QueueClient::Local(queues.input.clone()),
            QueueClient::Local(queues.dlq.clone()),
            coordinator,
            cancellation.clone(),
            Duration::from_secs(30),
        ));

        let dead_letter = loop {
            if let Some(message) = pop_json(&queues.dlq).await {
                break message;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        cancellation.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(
            dead_letter["message"],
            json!({"name": "some.other.message", "data": {}})
        );
        assert!(dead_letter["error"].as_str().unwrap().contains("unexpected message"));
        assert!(pop_json(&queues.gateway).await.is_none());
    }
}
