// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::events::{DuplicateCrashFound, NewCrash, UniqueCrashFound};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crash_parser::{parse_crash, sha256, CrashBase};
use database::{CrashRecord, Crashes, DbError};
use message_queue::Producer;
use object_storage::{ObjectStorage, ObjectStorageError};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrashOutcome {
    Unique,
    Duplicate,
}

/// What the consumer should do with the message after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The message can never succeed; forward it to the dead-letter queue.
    DeadLetter,
    /// Leave the message unacknowledged so the broker redelivers it.
    Retry,
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("invalid message: {0}")]
    Invalid(String),

    #[error(transparent)]
    Storage(#[from] ObjectStorageError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("publish failed: {0}")]
    Publish(anyhow::Error),
}

impl HandleError {
    pub fn disposition(&self) -> Disposition {
        match self {
            HandleError::Invalid(_) => Disposition::DeadLetter,
            HandleError::Storage(ObjectStorageError::NotFound { .. }) => Disposition::DeadLetter,
            HandleError::Storage(_) | HandleError::Db(_) | HandleError::Publish(_) => {
                Disposition::Retry
            }
        }
    }
}

/// Per-message orchestration: fetch the crash input, fingerprint, check the
/// dedup store, publish exactly one outgoing event.
pub struct CrashCoordinator {
    preview_max_size: usize,
    storage: ObjectStorage,
    crashes: Crashes,
    unique_crash: Producer,
    duplicate_crash: Producer,
}

impl CrashCoordinator {
    pub fn new(
        preview_max_size: usize,
        storage: ObjectStorage,
        crashes: Crashes,
        unique_crash: Producer,
        duplicate_crash: Producer,
    ) -> Self {
        Self {
            preview_max_size,
            storage,
            crashes,
            unique_crash,
            duplicate_crash,
        }
    }

    pub async fn handle_new_crash(&self, message: &NewCrash) -> Result<CrashOutcome, HandleError> {
        message
            .validate()
            .map_err(|err| HandleError::Invalid(err.to_string()))?;
        let crash_base = CrashBase::from_value(&message.crash)
            .map_err(|err| HandleError::Invalid(err.to_string()))?;

        let input_data = self.get_input_data(message, &crash_base).await?;
        let input_hash = sha256::digest(&input_data);

        let mut brief = None;
        let mut duplicate_of = None;
        let mut unique_hash = None;

        if crash_base.reproduced {
            let fingerprint =
                parse_crash(message.fuzzer_engine, message.fuzzer_lang, &message.crash)
                    .map_err(|err| HandleError::Invalid(err.to_string()))?;

            duplicate_of = self
                .deduplicate(message, &input_hash, &fingerprint.unique_hash)
                .await?;
            brief = fingerprint.brief;
            unique_hash = Some(fingerprint.unique_hash);
        }

        let brief = brief.unwrap_or_else(|| format!("{}: UNKNOWN", crash_base.crash_type));

        match duplicate_of {
            None => {
                log::info!(
                    "found unique crash brief: {}, unique_hash: {:?}",
                    brief,
                    unique_hash
                );

                let preview_len = input_data.len().min(self.preview_max_size);
                let event = UniqueCrashFound {
                    created: message.created.clone(),
                    fuzzer_id: message.fuzzer_id.clone(),
                    fuzzer_rev: message.fuzzer_rev.clone(),
                    preview: BASE64.encode(&input_data[..preview_len]),
                    input_id: crash_base.input_id.clone(),
                    input_hash,
                    output: crash_base.output.clone(),
                    brief,
                    reproduced: crash_base.reproduced,
                    crash_type: crash_base.crash_type.clone(),
                };
                self.unique_crash
                    .produce(event)
                    .await
                    .map_err(HandleError::Publish)?;
                Ok(CrashOutcome::Unique)
            }
            Some(original) => {
                log::info!(
                    "found duplicate crash brief: {}, unique_hash: {:?}",
                    brief,
                    unique_hash
                );

                let event = DuplicateCrashFound {
                    fuzzer_id: message.fuzzer_id.clone(),
                    fuzzer_rev: message.fuzzer_rev.clone(),
                    input_hash: original.input_hash,
                };
                self.duplicate_crash
                    .produce(event)
                    .await
                    .map_err(HandleError::Publish)?;
                Ok(CrashOutcome::Duplicate)
            }
        }
    }

    /// Get-then-insert with the race folded in: two concurrent messages with
    /// the same fingerprint may both see "absent"; the loser's insert fails
    /// with `AlreadyExists` and the winner's record becomes the duplicate
    /// target.
    async fn deduplicate(
        &self,
        message: &NewCrash,
        input_hash: &str,
        unique_hash: &str,
    ) -> Result<Option<CrashRecord>, HandleError> {
        let existing = self
            .crashes
            .get_by_hash(&message.fuzzer_id, &message.fuzzer_rev, unique_hash)
            .await?;
        if existing.is_some() {
            return Ok(existing);
        }

        let mut record = CrashRecord {
            key: None,
            fuzzer_id: message.fuzzer_id.clone(),
            fuzzer_rev: message.fuzzer_rev.clone(),
            input_hash: input_hash.to_string(),
            unique_hash: unique_hash.to_string(),
        };

        match self.crashes.insert(&mut record).await {
            Ok(()) => Ok(None),
            Err(DbError::AlreadyExists) => {
                log::info!(
                    "lost crash insert race for {}, re-reading winning record",
                    unique_hash
                );
                let winner = self
                    .crashes
                    .get_by_hash(&message.fuzzer_id, &message.fuzzer_rev, unique_hash)
                    .await?;
                Ok(winner)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_input_data(
        &self,
        message: &NewCrash,
        crash_base: &CrashBase,
    ) -> Result<Vec<u8>, HandleError> {
        if let Some(input) = &crash_base.input {
            return BASE64
                .decode(input)
                .map_err(|err| HandleError::Invalid(format!("invalid base64 crash input: {err}")));
        }

        let Some(input_id) = crash_base.input_id.as_deref() else {
            return Err(HandleError::Invalid("input_id or input must be set".into()));
        };

        let download = self
            .storage
            .download_crash(&message.fuzzer_id, &message.fuzzer_rev, input_id)
            .await?;
        Ok(download.collect().await?)
    }

    /// Parked messages of both producers, keyed by message name, for the
    /// shutdown persistence path.
    pub async fn export_unsent_messages(&self) -> HashMap<String, Vec<serde_json::Value>> {
        let mut unsent = HashMap::new();
        for producer in [&self.unique_crash, &self.duplicate_crash] {
            let envelopes = producer.export_unsent().await;
            if !envelopes.is_empty() {
                let messages = envelopes
                    .iter()
                    .filter_map(|envelope| serde_json::to_value(envelope).ok())
                    .collect();
                unsent.insert(producer.name().to_string(), messages);
            }
        }
        unsent
    }

    /// Re-enqueues messages persisted by a previous run.
    pub async fn requeue_unsent_messages(
        &self,
        unsent: HashMap<String, Vec<serde_json::Value>>,
    ) -> anyhow::Result<()> {
        for (name, messages) in unsent {
            let producer = if name == self.unique_crash.name() {
                &self.unique_crash
            } else if name == self.duplicate_crash.name() {
                &self.duplicate_crash
            } else {
                log::warn!("dropping unsent messages of unknown producer: {}", name);
                continue;
            };

            let envelopes = messages
                .into_iter()
                .filter_map(|message| serde_json::from_value(message).ok())
                .collect();
            producer.requeue(envelopes).await?;
        }
        Ok(())
    }
}
