//! Trail client trait and its HTTP implementation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use qcc_core::{ContextDigest, Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::similarity;
use crate::types::{AssemblyRecord, ConfigurationHint, RecordUpdate, TrailRecord};

/// Read/write access to the quantum trail ledger.
#[async_trait]
pub trait TrailClient: Send + Sync {
    /// Configurations at or above `min_similarity`, best first.
    async fn find_similar(
        &self,
        capabilities: &BTreeSet<String>,
        context: &ContextDigest,
        min_similarity: f64,
    ) -> Result<Vec<ConfigurationHint>>;

    /// Append an assembly record; returns its record id.
    async fn record_assembly(&self, record: AssemblyRecord) -> Result<String>;

    /// Append an outcome update. Repeating the same signature and timestamp is a no-op.
    async fn update_record(&self, update: RecordUpdate) -> Result<()>;

    /// Every record under a signature, oldest first.
    async fn history(&self, signature: &str) -> Result<Vec<TrailRecord>>;
}

#[derive(Serialize)]
struct SimilarRequest<'a> {
    capabilities: &'a BTreeSet<String>,
    context: &'a ContextDigest,
    min_similarity: f64,
}

#[derive(Deserialize)]
struct SimilarResponse {
    #[serde(default)]
    configurations: Vec<ConfigurationHint>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordBody<'a> {
    Assembly(&'a AssemblyRecord),
    Update(&'a RecordUpdate),
}

#[derive(Deserialize)]
struct RecordResponse {
    record_id: String,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    records: Vec<TrailRecord>,
}

/// Remote ledger: `POST similar`, `POST record/{signature}`, `GET history/{signature}`.
pub struct HttpTrailClient {
    base_url: String,
    client: Client,
}

impl HttpTrailClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Send and fail on transport errors or a non-success status.
    async fn dispatch(&self, req: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Ledger(format!("{}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Ledger(format!("{} returned {}: {}", url, status, body)));
        }
        Ok(resp)
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder, url: &str) -> Result<T> {
        self.dispatch(req, url)
            .await?
            .json::<T>()
            .await
            .map_err(|e| Error::Ledger(format!("{}: malformed response: {}", url, e)))
    }
}

#[async_trait]
impl TrailClient for HttpTrailClient {
    async fn find_similar(
        &self,
        capabilities: &BTreeSet<String>,
        context: &ContextDigest,
        min_similarity: f64,
    ) -> Result<Vec<ConfigurationHint>> {
        let url = format!("{}/similar", self.base_url);
        let body = SimilarRequest {
            capabilities,
            context,
            min_similarity,
        };
        let resp: SimilarResponse = self.send(self.client.post(&url).json(&body), &url).await?;
        debug!("Trail returned {} similar configurations", resp.configurations.len());
        // Servers rank loosely; enforce the threshold and tie-break order here.
        Ok(similarity::rank(resp.configurations, min_similarity))
    }

    async fn record_assembly(&self, record: AssemblyRecord) -> Result<String> {
        let url = format!("{}/record/{}", self.base_url, record.signature);
        let resp: RecordResponse = self
            .send(self.client.post(&url).json(&RecordBody::Assembly(&record)), &url)
            .await?;
        Ok(resp.record_id)
    }

    async fn update_record(&self, update: RecordUpdate) -> Result<()> {
        let url = format!("{}/record/{}", self.base_url, update.signature);
        // Any success status will do; the body is not read.
        self.dispatch(self.client.post(&url).json(&RecordBody::Update(&update)), &url)
            .await?;
        Ok(())
    }

    async fn history(&self, signature: &str) -> Result<Vec<TrailRecord>> {
        let url = format!("{}/history/{}", self.base_url, signature);
        let mut resp: HistoryResponse = self.send(self.client.get(&url), &url).await?;
        resp.records.sort_by_key(|r| r.timestamp);
        Ok(resp.records)
    }
}
