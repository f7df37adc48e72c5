// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
    Test,
}

#[derive(Clone, Debug)]
pub struct EnvironmentSettings {
    pub name: Environment,
    pub shutdown_timeout: Duration,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub commit_id: Option<String>,
    pub build_date: Option<String>,
    pub commit_date: Option<String>,
    pub git_branch: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CollectionSettings {
    pub crashes: String,
    pub unsent_messages: String,
}

#[derive(Clone, Debug)]
pub struct DatabaseSettings {
    pub url: Url,
    pub username: String,
    pub password: String,
    pub name: String,
    pub collections: CollectionSettings,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub crash_analyzer: String,
    pub api_gateway: String,
    pub dlq: String,
}

#[derive(Clone, Debug)]
pub struct MessageQueueSettings {
    pub url: Url,
    pub region: String,
    pub username: String,
    pub password: String,
    pub queues: QueueSettings,
}

impl MessageQueueSettings {
    pub fn queue_url(&self, queue: &str) -> Url {
        let mut url = self.url.clone();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), queue);
        url.set_path(&path);
        url
    }
}

#[derive(Clone, Debug)]
pub struct BucketSettings {
    pub fuzzers: String,
    pub data: String,
}

#[derive(Clone, Debug)]
pub struct ObjectStorageSettings {
    pub url: Url,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub buckets: BucketSettings,
}

#[derive(Clone, Debug)]
pub struct CrashAnalyzerSettings {
    pub preview_max_size: usize,
}

#[derive(Clone, Debug)]
pub struct AppSettings {
    pub environment: EnvironmentSettings,
    pub database: DatabaseSettings,
    pub message_queue: MessageQueueSettings,
    pub object_storage: ObjectStorageSettings,
    pub crash_analyzer: CrashAnalyzerSettings,
}

impl AppSettings {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// The lookup indirection keeps loading testable; `load` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let environment = {
            let name = match required(&lookup, "ENVIRONMENT")?.as_str() {
                "dev" => Environment::Dev,
                "prod" => Environment::Prod,
                "test" => Environment::Test,
                other => bail!("ENVIRONMENT must be one of dev|prod|test, got '{other}'"),
            };
            let shutdown_timeout = required(&lookup, "SHUTDOWN_TIMEOUT")?
                .parse::<u64>()
                .context("SHUTDOWN_TIMEOUT must be an integer number of seconds")?;

            let settings = EnvironmentSettings {
                name,
                shutdown_timeout: Duration::from_secs(shutdown_timeout),
                service_name: optional(&lookup, "SERVICE_NAME")?,
                service_version: optional(&lookup, "SERVICE_VERSION")?,
                commit_id: optional(&lookup, "COMMIT_ID")?,
                build_date: optional(&lookup, "BUILD_DATE")?,
                commit_date: optional(&lookup, "COMMIT_DATE")?,
                git_branch: optional(&lookup, "GIT_BRANCH")?,
            };

            if name == Environment::Prod {
                let mut missing = Vec::new();
                for (variable, value) in [
                    ("SERVICE_NAME", &settings.service_name),
                    ("SERVICE_VERSION", &settings.service_version),
                    ("COMMIT_ID", &settings.commit_id),
                    ("BUILD_DATE", &settings.build_date),
                    ("COMMIT_DATE", &settings.commit_date),
                    ("GIT_BRANCH", &settings.git_branch),
                ] {
                    if value.is_none() {
                        missing.push(variable);
                    }
                }
                if !missing.is_empty() {
                    bail!("variables must be set in production mode: {missing:?}");
                }
            }

            settings
        };

        let database = {
            let engine = required(&lookup, "DB_ENGINE")?;
            if engine != "arangodb" {
                bail!("unsupported database engine: {engine}");
            }
            DatabaseSettings {
                url: parse_url(&required(&lookup, "DB_URL")?).context("DB_URL")?,
                username: required(&lookup, "DB_USERNAME")?,
                password: required(&lookup, "DB_PASSWORD")?,
                name: required(&lookup, "DB_NAME")?,
                collections: CollectionSettings {
                    crashes: optional(&lookup, "DB_COLLECTION_CRASHES")?
                        .unwrap_or_else(|| "Crashes".to_string()),
                    unsent_messages: optional(&lookup, "DB_COLLECTION_UNSENT_MESSAGES")?
                        .unwrap_or_else(|| "UnsentMessages".to_string()),
                },
            }
        };

        let message_queue = {
            let broker = required(&lookup, "MQ_BROKER")?;
            if broker.to_lowercase() != "sqs" {
                bail!("unsupported message broker: {broker}");
            }
            MessageQueueSettings {
                url: parse_url(&required(&lookup, "MQ_URL")?).context("MQ_URL")?,
                region: required(&lookup, "MQ_REGION")?,
                username: required(&lookup, "MQ_USERNAME")?,
                password: required(&lookup, "MQ_PASSWORD")?,
                queues: QueueSettings {
                    crash_analyzer: required(&lookup, "MQ_QUEUE_CRASH_ANALYZER")?,
                    api_gateway: required(&lookup, "MQ_QUEUE_API_GATEWAY")?,
                    dlq: required(&lookup, "MQ_QUEUE_DLQ")?,
                },
            }
        };

        let object_storage = ObjectStorageSettings {
            url: parse_url(&required(&lookup, "S3_URL")?).context("S3_URL")?,
            region: optional(&lookup, "S3_REGION")?.unwrap_or_else(|| "us-east-1".to_string()),
            access_key: required(&lookup, "S3_ACCESS_KEY")?,
            secret_key: required(&lookup, "S3_SECRET_KEY")?,
            buckets: BucketSettings {
                fuzzers: required(&lookup, "S3_BUCKET_FUZZERS")?,
                data: required(&lookup, "S3_BUCKET_DATA")?,
            },
        };

        let crash_analyzer = {
            let preview_max_size = required(&lookup, "CRASH_ANALYZER_PREVIEW_MAX_SIZE")?
                .parse::<usize>()
                .context("CRASH_ANALYZER_PREVIEW_MAX_SIZE must be an integer")?;
            if preview_max_size == 0 {
                bail!("CRASH_ANALYZER_PREVIEW_MAX_SIZE must be positive");
            }
            CrashAnalyzerSettings { preview_max_size }
        };

        Ok(Self {
            environment,
            database,
            message_queue,
            object_storage,
            crash_analyzer,
        })
    }
}

fn required(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    match lookup(name) {
        Some(value) if value.is_empty() => {
            bail!("variable '{name}': empty string not allowed")
        }
        Some(value) => Ok(value),
        None => bail!("variable '{name}' must be set"),
    }
}

fn optional(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<String>> {
    match lookup(name) {
        Some(value) if value.is_empty() => {
            bail!("variable '{name}': empty string not allowed")
        }
        other => Ok(other),
    }
}

fn parse_url(value: &str) -> Result<Url> {
    Ok(Url::parse(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("ENVIRONMENT", "dev"),
            ("SHUTDOWN_TIMEOUT", "30"),
            ("DB_ENGINE", "arangodb"),
            ("DB_URL", "http://127.0.0.1:8529"),
            ("DB_USERNAME", "crash-analyzer"),
            ("DB_PASSWORD", "secret"),
            ("DB_NAME", "bondi"),
            ("MQ_BROKER", "sqs"),
            ("MQ_URL", "http://127.0.0.1:9324"),
            ("MQ_REGION", "us-east-1"),
            ("MQ_USERNAME", "key"),
            ("MQ_PASSWORD", "secret"),
            ("MQ_QUEUE_CRASH_ANALYZER", "crash-analyzer"),
            ("MQ_QUEUE_API_GATEWAY", "api-gateway"),
            ("MQ_QUEUE_DLQ", "dlq"),
            ("S3_URL", "http://127.0.0.1:9000"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "secret"),
            ("S3_BUCKET_FUZZERS", "fuzzers"),
            ("S3_BUCKET_DATA", "data"),
            ("CRASH_ANALYZER_PREVIEW_MAX_SIZE", "4096"),
        ])
    }

    fn load(vars: &HashMap<&str, &str>) -> Result<AppSettings> {
        AppSettings::from_lookup(|name| vars.get(name).map(|value| value.to_string()))
    }

    #[test]
    fn test_load_complete_settings() {
        let settings = load(&base_vars()).unwrap();
        assert_eq!(settings.environment.name, Environment::Dev);
        assert_eq!(settings.environment.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(settings.crash_analyzer.preview_max_size, 4096);
        assert_eq!(settings.database.collections.crashes, "Crashes");
        assert_eq!(
            settings.message_queue.queue_url("crash-analyzer").as_str(),
            "http://127.0.0.1:9324/crash-analyzer"
        );
    }

    #[test]
    fn test_missing_variable_is_rejected() {
        let mut vars = base_vars();
        vars.remove("DB_PASSWORD");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_empty_string_is_rejected() {
        let mut vars = base_vars();
        vars.insert("MQ_REGION", "");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_unknown_environment_is_rejected() {
        let mut vars = base_vars();
        vars.insert("ENVIRONMENT", "staging");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_prod_requires_service_identity() {
        let mut vars = base_vars();
        vars.insert("ENVIRONMENT", "prod");
        assert!(load(&vars).is_err());

        vars.insert("SERVICE_NAME", "crash-analyzer");
        vars.insert("SERVICE_VERSION", "0.2.0");
        vars.insert("COMMIT_ID", "deadbeef");
        vars.insert("BUILD_DATE", "2023-05-01");
        vars.insert("COMMIT_DATE", "2023-05-01");
        vars.insert("GIT_BRANCH", "main");
        assert!(load(&vars).is_ok());
    }

    #[test]
    fn test_zero_preview_size_is_rejected() {
        let mut vars = base_vars();
        vars.insert("CRASH_ANALYZER_PREVIEW_MAX_SIZE", "0");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_unsupported_broker_is_rejected() {
        let mut vars = base_vars();
        vars.insert("MQ_BROKER", "rabbitmq");
        assert!(load(&vars).is_err());
    }
}
