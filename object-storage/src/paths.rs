// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Key layout of the `fuzzers` bucket: per-revision artifacts uploaded when
/// a fuzzer is registered.
#[derive(Clone, Debug)]
pub struct BucketFuzzers {
    name: String,
}

impl BucketFuzzers {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self, fuzzer_id: &str, fuzzer_rev: &str) -> (String, String) {
        (
            self.name.clone(),
            format!("{fuzzer_id}/{fuzzer_rev}/options.json"),
        )
    }

    pub fn binaries(&self, fuzzer_id: &str, fuzzer_rev: &str) -> (String, String) {
        (
            self.name.clone(),
            format!("{fuzzer_id}/{fuzzer_rev}/binaries.tar.gz"),
        )
    }

    pub fn seeds(&self, fuzzer_id: &str, fuzzer_rev: &str) -> (String, String) {
        (
            self.name.clone(),
            format!("{fuzzer_id}/{fuzzer_rev}/seeds.tar.gz"),
        )
    }
}

/// Key layout of the `data` bucket: artifacts produced while fuzzing.
#[derive(Clone, Debug)]
pub struct BucketData {
    name: String,
}

impl BucketData {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crash(&self, fuzzer_id: &str, fuzzer_rev: &str, input_id: &str) -> (String, String) {
        (
            self.name.clone(),
            format!("{fuzzer_id}/{fuzzer_rev}/crashes/{input_id}"),
        )
    }
}
