// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{bail, Result};
use crash_parser::{EngineId, LangId};
use serde::{Deserialize, Serialize};

/// Consumed from the agents.
pub const NEW_CRASH: &str = "agent.crash.new";

/// Produced for the api-gateway.
pub const UNIQUE_CRASH_FOUND: &str = "crash-analyzer.crashes.unique";
pub const DUPLICATE_CRASH_FOUND: &str = "crash-analyzer.crashes.duplicate";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewCrash {
    /// Id of the user owning the pool and project the fuzzer ran in.
    pub user_id: String,

    pub project_id: String,
    pub pool_id: String,

    /// Fuzzer and revision the crash belongs to.
    pub fuzzer_id: String,
    pub fuzzer_rev: String,

    pub fuzzer_engine: EngineId,
    pub fuzzer_lang: LangId,

    /// Engine-specific crash payload; re-parsed per engine family.
    pub crash: serde_json::Value,

    /// Time the crash was found (rfc3339).
    pub created: String,
}

impl NewCrash {
    pub fn validate(&self) -> Result<()> {
        if !self.created.ends_with('Z') {
            bail!("not a valid rfc3339 time: {}", self.created);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UniqueCrashFound {
    pub created: String,

    pub fuzzer_id: String,
    pub fuzzer_rev: String,

    /// Size-bounded chunk of the crash input (base64-encoded).
    pub preview: String,

    /// Key of the full input in object storage, when not inlined.
    pub input_id: Option<String>,

    /// SHA-256 of the crash input bytes.
    pub input_hash: String,

    /// Raw crash output.
    pub output: String,

    /// Short human-readable crash summary.
    pub brief: String,

    pub reproduced: bool,

    #[serde(rename = "type")]
    pub crash_type: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DuplicateCrashFound {
    pub fuzzer_id: String,
    pub fuzzer_rev: String,

    /// Input hash of the record the crash duplicates, not of the incoming
    /// input.
    pub input_hash: String,
}
