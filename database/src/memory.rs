// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::orm::CrashRecord;
use crate::{DbError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryState {
    crashes: Vec<CrashRecord>,
    unsent: HashMap<String, Vec<serde_json::Value>>,
    next_key: u64,
    lookup_skew: usize,
}

/// In-process store with the same uniqueness semantics as the ArangoDB
/// backend. Used by tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` hash lookups miss even when a record exists.
    /// Testing seam for the get-then-insert race: the caller sees "absent",
    /// inserts, and collides with the already-stored record.
    pub fn skew_lookups(&self, n: usize) {
        self.state.lock().unwrap().lookup_skew = n;
    }

    pub(crate) fn get(&self, key: &str) -> Result<Option<CrashRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .crashes
            .iter()
            .find(|record| record.key.as_deref() == Some(key))
            .cloned())
    }

    pub(crate) fn get_by_hash(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        unique_hash: &str,
    ) -> Result<Option<CrashRecord>> {
        let mut state = self.state.lock().unwrap();
        if state.lookup_skew > 0 {
            state.lookup_skew -= 1;
            return Ok(None);
        }
        Ok(state
            .crashes
            .iter()
            .find(|record| {
                record.fuzzer_id == fuzzer_id
                    && record.fuzzer_rev == fuzzer_rev
                    && record.unique_hash == unique_hash
            })
            .cloned())
    }

    pub(crate) fn insert(&self, record: &mut CrashRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let conflict = state.crashes.iter().any(|existing| {
            existing.fuzzer_id == record.fuzzer_id
                && existing.fuzzer_rev == record.fuzzer_rev
                && existing.unique_hash == record.unique_hash
        });
        if conflict {
            return Err(DbError::AlreadyExists);
        }

        state.next_key += 1;
        record.key = Some(state.next_key.to_string());
        state.crashes.push(record.clone());
        Ok(())
    }

    pub(crate) fn update(&self, record: &CrashRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = record.key.as_deref();
        if let Some(stored) = state
            .crashes
            .iter_mut()
            .find(|stored| stored.key.as_deref() == key)
        {
            *stored = record.clone();
        }
        Ok(())
    }

    pub(crate) fn revision_crashes(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
    ) -> Result<Vec<CrashRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .crashes
            .iter()
            .filter(|record| record.fuzzer_id == fuzzer_id && record.fuzzer_rev == fuzzer_rev)
            .cloned()
            .collect())
    }

    pub(crate) fn save_unsent(&self, messages: HashMap<String, Vec<serde_json::Value>>) {
        self.state.lock().unwrap().unsent = messages;
    }

    pub(crate) fn load_unsent(&self) -> HashMap<String, Vec<serde_json::Value>> {
        self.state.lock().unwrap().unsent.clone()
    }

    pub(crate) fn clear_unsent(&self) {
        self.state.lock().unwrap().unsent.clear();
    }

    pub(crate) fn truncate_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.crashes.clear();
        state.unsent.clear();
    }
}
