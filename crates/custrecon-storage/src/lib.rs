//! Document store seam + Elasticsearch REST client for the reconciliation job.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use custrecon_core::{RawDocument, ScrollPage, ScrollRequest};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding store response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Capabilities the extraction job consumes from a search-engine backed document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a match-all query and open a scroll cursor over the result set.
    async fn search(&self, request: &ScrollRequest) -> Result<ScrollPage, StoreError>;

    /// Fetch the page after `cursor`, extending the cursor lifetime by `ttl`.
    async fn scroll_next(&self, cursor: &str, ttl: Duration) -> Result<ScrollPage, StoreError>;

    async fn release_cursor(&self, cursor: &str) -> Result<(), StoreError>;

    /// Insert or replace the document stored under `id`.
    async fn upsert(&self, index: &str, id: &str, document: &JsonValue) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub keep_alive: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:9200".to_string(),
            username: None,
            password: None,
            ca_cert_path: None,
            accept_invalid_certs: false,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(120),
            pool_max_idle_per_host: 100,
            keep_alive: Duration::from_secs(120),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ca_cert_path", &self.ca_cert_path)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Render a scroll lifetime the way Elasticsearch expects it (`1m`, `90s`).
pub fn format_keep_alive(ttl: Duration) -> String {
    let secs = ttl.as_secs().max(1);
    if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Debug, Deserialize)]
struct ScrollResponseBody {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    #[serde(default)]
    hits: Option<HitsEnvelope>,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Option<Vec<HitBody>>,
}

#[derive(Debug, Deserialize)]
struct HitBody {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, JsonValue>>,
}

impl From<ScrollResponseBody> for ScrollPage {
    fn from(body: ScrollResponseBody) -> Self {
        let documents = body
            .hits
            .and_then(|envelope| envelope.hits)
            .unwrap_or_default()
            .into_iter()
            .map(|hit| RawDocument {
                id: hit.id,
                source: hit.source,
            })
            .collect();
        ScrollPage {
            cursor: body.scroll_id,
            documents,
        }
    }
}

#[derive(Clone)]
pub struct ElasticsearchStore {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.keep_alive)
            .tcp_keepalive(config.keep_alive);

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading CA certificate {}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parsing CA certificate {}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self.authorize(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(status_error(response).await)
    }

    async fn decode_page(response: Response) -> Result<ScrollPage, StoreError> {
        let bytes = response.bytes().await?;
        let body: ScrollResponseBody = serde_json::from_slice(&bytes)?;
        Ok(body.into())
    }
}

async fn status_error(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    StoreError::HttpStatus { status, url, body }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn search(&self, request: &ScrollRequest) -> Result<ScrollPage, StoreError> {
        let keep_alive = format_keep_alive(request.ttl);
        let http_request = self
            .client
            .post(self.url(&format!("{}/_search", request.index)))
            .query(&[("scroll", keep_alive.as_str())])
            .json(&json!({
                "size": request.page_size,
                "query": { "match_all": {} },
            }));

        let page = Self::decode_page(self.send(http_request).await?).await?;
        debug!(index = %request.index, hits = page.documents.len(), "opened scroll");
        Ok(page)
    }

    async fn scroll_next(&self, cursor: &str, ttl: Duration) -> Result<ScrollPage, StoreError> {
        let http_request = self
            .client
            .post(self.url("_search/scroll"))
            .json(&json!({
                "scroll": format_keep_alive(ttl),
                "scroll_id": cursor,
            }));

        let page = Self::decode_page(self.send(http_request).await?).await?;
        debug!(hits = page.documents.len(), "fetched scroll page");
        Ok(page)
    }

    async fn release_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        let http_request = self
            .client
            .delete(self.url("_search/scroll"))
            .json(&json!({ "scroll_id": [cursor] }));

        let response = self.authorize(http_request).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("scroll context already expired");
                Ok(())
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn upsert(&self, index: &str, id: &str, document: &JsonValue) -> Result<(), StoreError> {
        let http_request = self
            .client
            .put(self.url(&format!("{index}/_doc/{id}")))
            .json(document);
        self.send(http_request).await?;
        Ok(())
    }
}
