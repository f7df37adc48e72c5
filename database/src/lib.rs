// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use thiserror::Error;

mod arango;
mod memory;
pub mod orm;

pub use arango::{ArangoCursor, ArangoDb, CollectionNames};
pub use memory::MemoryDb;
pub use orm::CrashRecord;

#[derive(Debug, Error)]
pub enum DbError {
    /// Insert collided with the unique `(fuzzer_id, fuzzer_rev, unique_hash)`
    /// index. A first-class outcome: the caller lost a dedup race and should
    /// re-read the winning record.
    #[error("document already exists")]
    AlreadyExists,

    #[error("database request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("database error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("database response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Clone)]
pub enum Database {
    Arango(ArangoDb),
    Local(MemoryDb),
}

impl Database {
    pub fn crashes(&self) -> Crashes {
        Crashes { db: self.clone() }
    }

    pub fn unsent_messages(&self) -> UnsentMessages {
        UnsentMessages { db: self.clone() }
    }

    /// Testing only.
    pub async fn truncate_all_collections(&self) -> Result<()> {
        log::warn!("clearing all collections");
        match self {
            Database::Arango(db) => db.truncate_all().await,
            Database::Local(db) => {
                db.truncate_all();
                Ok(())
            }
        }
    }
}

/// The dedup store: crash records keyed by fingerprint.
#[derive(Clone)]
pub struct Crashes {
    db: Database,
}

impl Crashes {
    pub async fn get(&self, key: &str) -> Result<Option<CrashRecord>> {
        match &self.db {
            Database::Arango(db) => db.get_crash(key).await,
            Database::Local(db) => db.get(key),
        }
    }

    pub async fn get_by_hash(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        unique_hash: &str,
    ) -> Result<Option<CrashRecord>> {
        match &self.db {
            Database::Arango(db) => db.get_crash_by_hash(fuzzer_id, fuzzer_rev, unique_hash).await,
            Database::Local(db) => db.get_by_hash(fuzzer_id, fuzzer_rev, unique_hash),
        }
    }

    /// Persists a record, assigning its key. Fails with
    /// [`DbError::AlreadyExists`] on a fingerprint conflict.
    pub async fn insert(&self, record: &mut CrashRecord) -> Result<()> {
        match &self.db {
            Database::Arango(db) => db.insert_crash(record).await,
            Database::Local(db) => db.insert(record),
        }
    }

    pub async fn update(&self, record: &CrashRecord) -> Result<()> {
        match &self.db {
            Database::Arango(db) => db.update_crash(record).await,
            Database::Local(db) => db.update(record),
        }
    }

    pub async fn revision_crashes(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
    ) -> Result<CrashCursor> {
        match &self.db {
            Database::Arango(db) => {
                let cursor = db.revision_crashes(fuzzer_id, fuzzer_rev).await?;
                Ok(CrashCursor {
                    inner: CursorInner::Arango(cursor),
                })
            }
            Database::Local(db) => {
                let records = db.revision_crashes(fuzzer_id, fuzzer_rev)?;
                Ok(CrashCursor {
                    inner: CursorInner::Local(records.into_iter()),
                })
            }
        }
    }
}

/// Async iterator over stored crash records.
pub struct CrashCursor {
    inner: CursorInner,
}

enum CursorInner {
    Arango(ArangoCursor),
    Local(std::vec::IntoIter<CrashRecord>),
}

impl CrashCursor {
    pub async fn next(&mut self) -> Result<Option<CrashRecord>> {
        match &mut self.inner {
            CursorInner::Arango(cursor) => cursor.next().await,
            CursorInner::Local(records) => Ok(records.next()),
        }
    }
}

/// Persists messages the producers could not deliver before shutdown.
#[derive(Clone)]
pub struct UnsentMessages {
    db: Database,
}

impl UnsentMessages {
    pub async fn save(&self, messages: HashMap<String, Vec<serde_json::Value>>) -> Result<()> {
        match &self.db {
            Database::Arango(db) => db.save_unsent(messages).await,
            Database::Local(db) => {
                db.save_unsent(messages);
                Ok(())
            }
        }
    }

    pub async fn load(&self) -> Result<HashMap<String, Vec<serde_json::Value>>> {
        match &self.db {
            Database::Arango(db) => db.load_unsent().await,
            Database::Local(db) => Ok(db.load_unsent()),
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match &self.db {
            Database::Arango(db) => db.clear_unsent().await,
            Database::Local(db) => {
                db.clear_unsent();
                Ok(())
            }
        }
    }
}
