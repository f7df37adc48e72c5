// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};

/// First sighting of a unique crash. Created once, never mutated by the
/// analyzer; `(fuzzer_id, fuzzer_rev, unique_hash)` is unique in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    /// Store-assigned document key, absent until inserted.
    #[serde(rename = "_key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub fuzzer_id: String,
    pub fuzzer_rev: String,

    /// SHA-256 of the raw crash input bytes.
    pub input_hash: String,

    /// Stable crash fingerprint: canonical stacktrace hash, or the
    /// engine-supplied showmap hash for the afl family.
    pub unique_hash: String,
}
