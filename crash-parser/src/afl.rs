// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{AflCrash, EngineId, Fingerprint, LangId, ParseError};

/// The afl bindings fingerprint crashes on the agent with afl-showmap; the
/// hash passes through verbatim and no brief is derived from the output.
pub(crate) fn parse_crash(
    _engine: EngineId,
    _lang: LangId,
    crash: &serde_json::Value,
) -> Result<Fingerprint, ParseError> {
    let crash = AflCrash::from_value(crash)?;
    Ok(Fingerprint {
        brief: None,
        unique_hash: crash.showmap_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_showmap_hash_passthrough() {
        let crash = json!({
            "type": "crash",
            "input": "AA==",
            "output": "",
            "reproduced": true,
            "showmap_hash": "abc123",
        });

        let fingerprint = parse_crash(EngineId::Afl, LangId::Cpp, &crash).unwrap();
        assert_eq!(fingerprint.brief, None);
        assert_eq!(fingerprint.unique_hash, "abc123");
    }

    #[test]
    fn test_showmap_hash_required() {
        let crash = json!({
            "type": "crash",
            "input": "AA==",
            "output": "",
            "reproduced": true,
        });

        assert!(matches!(
            parse_crash(EngineId::AflRs, LangId::Rust, &crash),
            Err(ParseError::InvalidCrash(_))
        ));
    }
}
