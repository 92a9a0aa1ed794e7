use crate::{check_status, ProviderError};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

#[derive(Clone)]
pub struct QdrantClient {
    client: Client,
    cfg: QdrantConfig,
}

impl QdrantClient {
    pub fn new(cfg: QdrantConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.cfg.url.trim_end_matches('/'),
            self.cfg.collection,
            suffix
        )
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.cfg.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        check_status(resp).await
    }

    /// Sends and decodes; a missing collection yields `None`.
    async fn send_json_if_exists<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<Option<T>, ProviderError> {
        let resp = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        check_status(resp)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    /// Creates the collection with cosine distance unless it already exists.
    pub async fn ensure_collection(&self, dimensions: usize) -> Result<(), ProviderError> {
        let resp = self
            .authed(self.client.get(self.collection_url("")))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(());
        }
        let body = serde_json::json!({
            "vectors": { "size": dimensions, "distance": "Cosine" }
        });
        self.send(self.client.put(self.collection_url("")).json(&body))
            .await?;
        Ok(())
    }

    pub async fn delete_collection(&self) -> Result<(), ProviderError> {
        let resp = self
            .authed(self.client.delete(self.collection_url("")))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        check_status(resp).await?;
        Ok(())
    }

    pub async fn upsert(&self, points: Vec<QdrantPoint>) -> Result<(), ProviderError> {
        let req = QdrantUpsert { points };
        self.send(
            self.client
                .put(self.collection_url("/points?wait=true"))
                .json(&req),
        )
        .await?;
        Ok(())
    }

    pub async fn search(
        &self,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<serde_json::Value>,
    ) -> Result<QdrantSearchResponse, ProviderError> {
        #[derive(Serialize)]
        struct SearchRequest {
            vector: Vec<f32>,
            limit: u64,
            with_payload: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            filter: Option<serde_json::Value>,
        }
        let body = SearchRequest {
            vector,
            limit,
            with_payload: true,
            filter,
        };
        let resp = self
            .send_json_if_exists(
                self.client
                    .post(self.collection_url("/points/search"))
                    .json(&body),
            )
            .await?;
        Ok(resp.unwrap_or_default())
    }

    pub async fn count(&self) -> Result<u64, ProviderError> {
        #[derive(Deserialize)]
        struct CountResult {
            count: u64,
        }
        #[derive(Deserialize)]
        struct CountResponse {
            result: CountResult,
        }
        let resp: Option<CountResponse> = self
            .send_json_if_exists(
                self.client
                    .post(self.collection_url("/points/count"))
                    .json(&serde_json::json!({ "exact": true })),
            )
            .await?;
        Ok(resp.map_or(0, |r| r.result.count))
    }

    /// One page of points, payload only. Pass the returned offset back in to
    /// continue; `None` means the scroll is exhausted. A missing collection
    /// scrolls as empty.
    pub async fn scroll(
        &self,
        limit: u64,
        offset: Option<serde_json::Value>,
    ) -> Result<QdrantScrollPage, ProviderError> {
        #[derive(Serialize)]
        struct ScrollRequest {
            limit: u64,
            with_payload: bool,
            with_vector: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            offset: Option<serde_json::Value>,
        }
        #[derive(Deserialize)]
        struct ScrollResponse {
            result: QdrantScrollPage,
        }
        let body = ScrollRequest {
            limit,
            with_payload: true,
            with_vector: false,
            offset,
        };
        let resp: Option<ScrollResponse> = self
            .send_json_if_exists(
                self.client
                    .post(self.collection_url("/points/scroll"))
                    .json(&body),
            )
            .await?;
        Ok(resp.map(|r| r.result).unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
pub struct QdrantUpsert {
    pub points: Vec<QdrantPoint>,
}

#[derive(Debug, Serialize)]
pub struct QdrantPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QdrantSearchResponse {
    pub result: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResult {
    pub id: serde_json::Value,
    pub score: f32,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QdrantScrollPage {
    pub points: Vec<ScrolledPoint>,
    pub next_page_offset: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ScrolledPoint {
    pub id: serde_json::Value,
    pub payload: Option<serde_json::Value>,
}
