// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::orm::CrashRecord;
use crate::{DbError, Result};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};

// https://docs.arangodb.com/3.11/develop/error-codes-and-meanings/
const ERROR_ARANGO_UNIQUE_CONSTRAINT_VIOLATED: i64 = 1210;

const CURSOR_BATCH_SIZE: u32 = 100;

#[derive(Clone, Debug)]
pub struct CollectionNames {
    pub crashes: String,
    pub unsent_messages: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            crashes: "Crashes".into(),
            unsent_messages: "UnsentMessages".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ArangoErrorBody {
    #[serde(default, rename = "errorNum")]
    error_num: i64,
    #[serde(default, rename = "errorMessage")]
    error_message: String,
}

#[derive(Debug, Default, Deserialize)]
struct CursorResponse {
    #[serde(default)]
    result: Vec<serde_json::Value>,
    #[serde(default, rename = "hasMore")]
    has_more: bool,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertedDocument {
    #[serde(rename = "_key")]
    key: String,
}

#[derive(Debug, Deserialize)]
struct UnsentDocument {
    queue: String,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

/// ArangoDB HTTP API client scoped to one database.
#[derive(Clone)]
pub struct ArangoDb {
    http: Client,
    base: Url,
    username: String,
    password: String,
    pub(crate) collections: CollectionNames,
}

impl ArangoDb {
    pub async fn create(
        url: Url,
        database: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        collections: CollectionNames,
    ) -> Result<Self> {
        let base = {
            let mut base = url.clone();
            let path = format!("{}/_db/{}", base.path().trim_end_matches('/'), database);
            base.set_path(&path);
            base
        };

        let db = Self {
            http: Client::new(),
            base,
            username: username.into(),
            password: password.into(),
            collections,
        };
        db.ensure_ready().await?;
        Ok(db)
    }

    /// Verifies connectivity, then makes sure the collections and the unique
    /// index behind the dedup invariant exist.
    async fn ensure_ready(&self) -> Result<()> {
        log::info!("initializing database");

        let response = self.get(&self.endpoint("_api/version")).send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        self.ensure_collection(&self.collections.crashes).await?;
        self.ensure_collection(&self.collections.unsent_messages)
            .await?;
        self.ensure_unique_crash_index().await?;

        log::info!("initializing database: done");
        Ok(())
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        let response = self
            .post(&self.endpoint("_api/collection"))
            .json(&json!({ "name": name }))
            .send()
            .await?;

        // 409: the collection is already there
        if response.status() == StatusCode::CONFLICT || response.status().is_success() {
            return Ok(());
        }
        Err(api_error(response).await)
    }

    async fn ensure_unique_crash_index(&self) -> Result<()> {
        let response = self
            .post(&self.endpoint("_api/index"))
            .query(&[("collection", &self.collections.crashes)])
            .json(&json!({
                "type": "persistent",
                "unique": true,
                "fields": ["fuzzer_id", "fuzzer_rev", "unique_hash"],
            }))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(api_error(response).await)
    }

    pub(crate) async fn get_crash(&self, key: &str) -> Result<Option<CrashRecord>> {
        let url = self.endpoint(&format!("_api/document/{}/{}", self.collections.crashes, key));
        let response = self.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    pub(crate) async fn get_crash_by_hash(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
        unique_hash: &str,
    ) -> Result<Option<CrashRecord>> {
        let cursor = self
            .query(
                "FOR crash IN @@collection \
                 FILTER crash.fuzzer_id == @fuzzer_id \
                 AND crash.fuzzer_rev == @fuzzer_rev \
                 AND crash.unique_hash == @unique_hash \
                 LIMIT 1 RETURN crash",
                json!({
                    "@collection": self.collections.crashes,
                    "fuzzer_id": fuzzer_id,
                    "fuzzer_rev": fuzzer_rev,
                    "unique_hash": unique_hash,
                }),
                None,
            )
            .await?;

        match cursor.result.into_iter().next() {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn insert_crash(&self, record: &mut CrashRecord) -> Result<()> {
        let url = self.endpoint(&format!("_api/document/{}", self.collections.crashes));
        let response = self.post(&url).json(record).send().await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let inserted: InsertedDocument = response.json().await?;
        record.key = Some(inserted.key);
        Ok(())
    }

    pub(crate) async fn update_crash(&self, record: &CrashRecord) -> Result<()> {
        let Some(key) = record.key.as_deref() else {
            return Err(DbError::Api {
                code: 400,
                message: "cannot update a record that has no key".into(),
            });
        };

        let url = self.endpoint(&format!("_api/document/{}/{}", self.collections.crashes, key));
        let response = self.http
            .patch(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(record)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    pub(crate) async fn revision_crashes(
        &self,
        fuzzer_id: &str,
        fuzzer_rev: &str,
    ) -> Result<ArangoCursor> {
        let cursor = self
            .query(
                "FOR crash IN @@collection \
                 FILTER crash.fuzzer_id == @fuzzer_id \
                 AND crash.fuzzer_rev == @fuzzer_rev \
                 RETURN crash",
                json!({
                    "@collection": self.collections.crashes,
                    "fuzzer_id": fuzzer_id,
                    "fuzzer_rev": fuzzer_rev,
                }),
                Some(CURSOR_BATCH_SIZE),
            )
            .await?;

        Ok(ArangoCursor {
            db: self.clone(),
            id: cursor.id,
            batch: cursor.result.into(),
            has_more: cursor.has_more,
        })
    }

    pub(crate) async fn save_unsent(
        &self,
        messages: HashMap<String, Vec<serde_json::Value>>,
    ) -> Result<()> {
        self.truncate(&self.collections.unsent_messages).await?;

        let url = self.endpoint(&format!(
            "_api/document/{}",
            self.collections.unsent_messages
        ));
        for (queue, messages) in messages {
            let response = self
                .post(&url)
                .json(&json!({ "queue": queue, "messages": messages }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(api_error(response).await);
            }
        }
        Ok(())
    }

    pub(crate) async fn load_unsent(&self) -> Result<HashMap<String, Vec<serde_json::Value>>> {
        let cursor = self
            .query(
                "FOR doc IN @@collection RETURN doc",
                json!({ "@collection": self.collections.unsent_messages }),
                Some(1000),
            )
            .await?;

        let mut unsent = HashMap::new();
        for doc in cursor.result {
            let doc: UnsentDocument = serde_json::from_value(doc)?;
            unsent.insert(doc.queue, doc.messages);
        }
        Ok(unsent)
    }

    pub(crate) async fn clear_unsent(&self) -> Result<()> {
        self.truncate(&self.collections.unsent_messages).await
    }

    pub(crate) async fn truncate_all(&self) -> Result<()> {
        self.truncate(&self.collections.crashes).await?;
        self.truncate(&self.collections.unsent_messages).await
    }

    async fn truncate(&self, collection: &str) -> Result<()> {
        let url = self.endpoint(&format!("_api/collection/{collection}/truncate"));
        let response = self
            .http
            .put(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    async fn query(
        &self,
        query: &str,
        bind_vars: serde_json::Value,
        batch_size: Option<u32>,
    ) -> Result<CursorResponse> {
        let response = self
            .post(&self.endpoint("_api/cursor"))
            .json(&json!({
                "query": query,
                "bindVars": bind_vars,
                "batchSize": batch_size,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    fn get(&self, url: &Url) -> RequestBuilder {
        self.http
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
    }

    fn post(&self, url: &Url) -> RequestBuilder {
        self.http
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let full = format!("{}/{}", url.path().trim_end_matches('/'), path);
        url.set_path(&full);
        url
    }
}

/// Batched cursor over stored crash records.
pub struct ArangoCursor {
    db: ArangoDb,
    id: Option<String>,
    batch: VecDeque<serde_json::Value>,
    has_more: bool,
}

impl ArangoCursor {
    pub(crate) async fn next(&mut self) -> Result<Option<CrashRecord>> {
        if self.batch.is_empty() && self.has_more {
            if let Some(id) = self.id.clone() {
                let url = self.db.endpoint(&format!("_api/cursor/{id}"));
                let response = self
                    .db
                    .http
                    .put(url)
                    .basic_auth(&self.db.username, Some(&self.db.password))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(api_error(response).await);
                }
                let refill: CursorResponse = response.json().await?;
                self.batch = refill.result.into();
                self.has_more = refill.has_more;
            }
        }

        match self.batch.pop_front() {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }
}

async fn api_error(response: reqwest::Response) -> DbError {
    let code = response.status().as_u16();
    let body: ArangoErrorBody = response.json().await.unwrap_or_default();

    if body.error_num == ERROR_ARANGO_UNIQUE_CONSTRAINT_VIOLATED {
        return DbError::AlreadyExists;
    }
    DbError::Api {
        code,
        message: body.error_message,
    }
}
