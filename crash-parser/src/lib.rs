// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod afl;
mod libfuzzer;
pub mod sha256;

/// Fuzzing engine that produced a crash. The wire tags are a closed set;
/// anything else fails deserialization at the message boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineId {
    #[serde(rename = "afl")]
    Afl,
    #[serde(rename = "afl.rs")]
    AflRs,
    #[serde(rename = "sharpfuzz-afl")]
    SharpfuzzAfl,
    #[serde(rename = "libfuzzer")]
    Libfuzzer,
    #[serde(rename = "jazzer")]
    Jazzer,
    #[serde(rename = "atheris")]
    Atheris,
    #[serde(rename = "cargo-fuzz")]
    CargoFuzz,
    #[serde(rename = "go-fuzz-libfuzzer")]
    GoFuzzLibfuzzer,
    #[serde(rename = "sharpfuzz-libfuzzer")]
    SharpfuzzLibfuzzer,
}

impl EngineId {
    pub fn is_afl_family(self) -> bool {
        matches!(self, Self::Afl | Self::AflRs | Self::SharpfuzzAfl)
    }

    pub fn is_libfuzzer_family(self) -> bool {
        !self.is_afl_family()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Afl => "afl",
            Self::AflRs => "afl.rs",
            Self::SharpfuzzAfl => "sharpfuzz-afl",
            Self::Libfuzzer => "libfuzzer",
            Self::Jazzer => "jazzer",
            Self::Atheris => "atheris",
            Self::CargoFuzz => "cargo-fuzz",
            Self::GoFuzzLibfuzzer => "go-fuzz-libfuzzer",
            Self::SharpfuzzLibfuzzer => "sharpfuzz-libfuzzer",
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language the fuzz target is written in. Carried through events but does
/// not alter parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LangId {
    Go,
    Cpp,
    Rust,
    Java,
    Swift,
    Python,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported fuzzer engine: {0}")]
    EngineUnsupported(EngineId),

    #[error("invalid crash payload: {0}")]
    InvalidCrash(String),
}

/// Common part of the `crash` sub-object of a new-crash message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrashBase {
    /// Type of crash: crash, oom, timeout, etc.
    #[serde(rename = "type")]
    pub crash_type: String,

    /// Key of the crash input uploaded to object storage.
    #[serde(default)]
    pub input_id: Option<String>,

    /// Inline crash input (base64-encoded), used when the file is small.
    #[serde(default)]
    pub input: Option<String>,

    /// Raw crash output (long multiline text).
    pub output: String,

    /// True if the crash was reproduced by the agent.
    pub reproduced: bool,
}

impl CrashBase {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ParseError> {
        let crash: CrashBase = serde_json::from_value(value.clone())
            .map_err(|err| ParseError::InvalidCrash(err.to_string()))?;
        crash.validate()?;
        Ok(crash)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if matches!(&self.input_id, Some(input_id) if !input_id.is_empty()) {
            return Ok(());
        }
        if self.input.is_some() {
            return Ok(());
        }
        Err(ParseError::InvalidCrash(
            "input_id or input must be set".into(),
        ))
    }
}

/// Crash payload of the afl bindings; carries the coverage hash computed by
/// afl-showmap on the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AflCrash {
    #[serde(flatten)]
    pub base: CrashBase,

    pub showmap_hash: String,
}

impl AflCrash {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ParseError> {
        let crash: AflCrash = serde_json::from_value(value.clone())
            .map_err(|err| ParseError::InvalidCrash(err.to_string()))?;
        crash.base.validate()?;
        Ok(crash)
    }
}

/// Result of fingerprinting one crash: an optional human-readable summary
/// line and the stable hash used for de-duplication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub brief: Option<String>,
    pub unique_hash: String,
}

/// Extracts a fingerprint from the raw `crash` sub-object.
///
/// Pure: identical inputs produce byte-identical results across runs and
/// processes. The canonical forms feeding `unique_hash` are pinned by the
/// tests in `libfuzzer.rs`; changing them invalidates every stored record.
pub fn parse_crash(
    engine: EngineId,
    lang: LangId,
    crash: &serde_json::Value,
) -> Result<Fingerprint, ParseError> {
    if engine.is_afl_family() {
        afl::parse_crash(engine, lang, crash)
    } else {
        libfuzzer::parse_crash(engine, lang, crash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_engine_families_partition() {
        let afl = [EngineId::Afl, EngineId::AflRs, EngineId::SharpfuzzAfl];
        let libfuzzer = [
            EngineId::Libfuzzer,
            EngineId::Jazzer,
            EngineId::Atheris,
            EngineId::CargoFuzz,
            EngineId::GoFuzzLibfuzzer,
            EngineId::SharpfuzzLibfuzzer,
        ];
        for engine in afl {
            assert!(engine.is_afl_family() && !engine.is_libfuzzer_family());
        }
        for engine in libfuzzer {
            assert!(engine.is_libfuzzer_family() && !engine.is_afl_family());
        }
    }

    #[test]
    fn test_engine_id_round_trip() {
        for tag in [
            "afl",
            "afl.rs",
            "sharpfuzz-afl",
            "libfuzzer",
            "jazzer",
            "atheris",
            "cargo-fuzz",
            "go-fuzz-libfuzzer",
            "sharpfuzz-libfuzzer",
        ] {
            let engine: EngineId = serde_json::from_value(json!(tag)).unwrap();
            assert_eq!(engine.as_str(), tag);
            assert_eq!(serde_json::to_value(engine).unwrap(), json!(tag));
        }
        assert!(serde_json::from_value::<EngineId>(json!("honggfuzz")).is_err());
    }

    #[test]
    fn test_crash_base_requires_input_or_input_id() {
        let missing = json!({
            "type": "crash",
            "output": "",
            "reproduced": true,
        });
        assert!(matches!(
            CrashBase::from_value(&missing),
            Err(ParseError::InvalidCrash(_))
        ));

        let empty_input_id = json!({
            "type": "crash",
            "input_id": "",
            "output": "",
            "reproduced": true,
        });
        assert!(CrashBase::from_value(&empty_input_id).is_err());

        let inline_input = json!({
            "type": "crash",
            "input_id": "",
            "input": "AA==",
            "output": "",
            "reproduced": true,
        });
        assert!(CrashBase::from_value(&inline_input).is_ok());

        let stored_input = json!({
            "type": "oom",
            "input_id": "report-1",
            "output": "",
            "reproduced": false,
        });
        let crash = CrashBase::from_value(&stored_input).unwrap();
        assert_eq!(crash.crash_type, "oom");
        assert!(!crash.reproduced);
    }
}
