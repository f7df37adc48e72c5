// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use aws_auth::AwsCredentials;
use crash_analyzer_lib::config::AppSettings;
use crash_analyzer_lib::coordinator::CrashCoordinator;
use crash_analyzer_lib::events::{DUPLICATE_CRASH_FOUND, UNIQUE_CRASH_FOUND};
use crash_analyzer_lib::service;
use database::{ArangoDb, CollectionNames, Database};
use message_queue::sqs_queue::SqsQueueClient;
use message_queue::{Producer, QueueClient};
use object_storage::{ObjectStorage, S3Storage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    env_logger::init();

    let settings = AppSettings::load().context("loading configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(settings))
}

async fn run(settings: AppSettings) -> Result<()> {
    log::info!("configuring message queue");
    let mq = &settings.message_queue;
    let mq_credentials = AwsCredentials::new(mq.username.as_str(), mq.password.as_str());
    let input_queue = QueueClient::Sqs(SqsQueueClient::new(
        mq.queue_url(&mq.queues.crash_analyzer),
        mq.region.as_str(),
        mq_credentials.clone(),
    ));
    let gateway_queue = QueueClient::Sqs(SqsQueueClient::new(
        mq.queue_url(&mq.queues.api_gateway),
        mq.region.as_str(),
        mq_credentials.clone(),
    ));
    let dlq = QueueClient::Sqs(SqsQueueClient::new(
        mq.queue_url(&mq.queues.dlq),
        mq.region.as_str(),
        mq_credentials,
    ));

    log::info!("configuring database");
    let db = &settings.database;
    let database = Database::Arango(
        ArangoDb::create(
            db.url.clone(),
            &db.name,
            db.username.as_str(),
            db.password.as_str(),
            CollectionNames {
                crashes: db.collections.crashes.clone(),
                unsent_messages: db.collections.unsent_messages.clone(),
            },
        )
        .await
        .context("configuring database")?,
    );

    log::info!("configuring object storage");
    let s3 = &settings.object_storage;
    let storage = ObjectStorage::with_s3(
        S3Storage::new(
            s3.url.clone(),
            s3.region.as_str(),
            AwsCredentials::new(s3.access_key.as_str(), s3.secret_key.as_str()),
        ),
        s3.buckets.fuzzers.as_str(),
        s3.buckets.data.as_str(),
    );
    storage
        .verify_access()
        .await
        .context("configuring object storage")?;

    let coordinator = Arc::new(CrashCoordinator::new(
        settings.crash_analyzer.preview_max_size,
        storage,
        database.crashes(),
        Producer::new(gateway_queue.clone(), UNIQUE_CRASH_FOUND),
        Producer::new(gateway_queue, DUPLICATE_CRASH_FOUND),
    ));

    let unsent_store = database.unsent_messages();
    let unsent = unsent_store
        .load()
        .await
        .context("loading unsent messages")?;
    if !unsent.is_empty() {
        log::info!("re-enqueueing unsent messages of a previous run");
        coordinator.requeue_unsent_messages(unsent).await?;
        unsent_store.clear().await?;
    }

    let cancellation = CancellationToken::new();
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    log::info!("consuming new-crash messages");
    service::run_consumer(
        input_queue,
        dlq,
        coordinator.clone(),
        cancellation,
        settings.environment.shutdown_timeout,
    )
    .await?;

    log::info!("saving unsent messages");
    let unsent = coordinator.export_unsent_messages().await;
    if !unsent.is_empty() {
        unsent_store
            .save(unsent)
            .await
            .context("saving unsent messages")?;
    }

    log::info!("shutdown complete");
    Ok(())
}
