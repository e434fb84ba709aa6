//! Customer extraction pipeline: scroll the order index, dedup customers, upsert them.

pub mod dedup;
pub mod normalize;
pub mod scroll;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use custrecon_core::{RawDocument, ScrollRequest, DEFAULT_PAGE_SIZE, DEFAULT_SCROLL_TTL};
use custrecon_storage::{DocumentStore, ElasticsearchStore, StoreConfig, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use dedup::DedupRegister;
pub use normalize::{normalize, RejectReason};
pub use scroll::ScrollCursor;

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub store: StoreConfig,
    pub source_index: String,
    pub destination_index: String,
    pub page_size: usize,
    pub scroll_ttl: Duration,
    pub progress_every: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            source_index: "kibana_sample_data_ecommerce".to_string(),
            destination_index: "customer".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            scroll_ttl: DEFAULT_SCROLL_TTL,
            progress_every: 500,
        }
    }
}

impl ExtractConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let store_defaults = defaults.store;
        Self {
            store: StoreConfig {
                base_url: std::env::var("ES_URL").unwrap_or(store_defaults.base_url),
                username: std::env::var("ES_USERNAME")
                    .ok()
                    .or_else(|| Some("elastic".to_string())),
                password: std::env::var("ES_PASSWORD").ok(),
                ca_cert_path: std::env::var("ES_CA_CERT").ok().map(PathBuf::from),
                accept_invalid_certs: env_flag("ES_ACCEPT_INVALID_CERTS")
                    .unwrap_or(store_defaults.accept_invalid_certs),
                connect_timeout: env_parse("ES_CONNECT_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(store_defaults.connect_timeout),
                read_timeout: env_parse("ES_READ_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(store_defaults.read_timeout),
                pool_max_idle_per_host: env_parse("ES_POOL_MAX_IDLE")
                    .unwrap_or(store_defaults.pool_max_idle_per_host),
                keep_alive: env_parse("ES_KEEPALIVE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(store_defaults.keep_alive),
            },
            source_index: std::env::var("CUSTRECON_SOURCE_INDEX").unwrap_or(defaults.source_index),
            destination_index: std::env::var("CUSTRECON_DEST_INDEX")
                .unwrap_or(defaults.destination_index),
            page_size: env_parse("CUSTRECON_PAGE_SIZE").unwrap_or(defaults.page_size),
            scroll_ttl: env_parse("CUSTRECON_SCROLL_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.scroll_ttl),
            progress_every: env_parse("CUSTRECON_PROGRESS_EVERY").unwrap_or(defaults.progress_every),
        }
    }

    pub fn scroll_request(&self) -> ScrollRequest {
        ScrollRequest {
            index: self.source_index.clone(),
            page_size: self.page_size,
            ttl: self.scroll_ttl,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("opening scroll over {index}")]
    Open {
        index: String,
        #[source]
        source: StoreError,
    },
    #[error("fetching scroll page {page}")]
    Page {
        page: usize,
        #[source]
        source: StoreError,
    },
    #[error("encoding customer {customer_id}")]
    Encode {
        customer_id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing customer {customer_id} to {index}")]
    Write {
        customer_id: i64,
        index: String,
        #[source]
        source: StoreError,
    },
    #[error("releasing scroll cursor")]
    Release(#[source] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Unique customers written to the destination index.
    pub processed: usize,
    pub pages: usize,
    pub documents_scanned: usize,
    pub rejected: usize,
    pub duplicates: usize,
}

#[derive(Debug, Default)]
struct RunTally {
    processed: usize,
    pages: usize,
    documents_scanned: usize,
    rejected: usize,
    duplicates: usize,
}

pub struct ExtractionPipeline {
    config: ExtractConfig,
    store: Arc<dyn DocumentStore>,
}

impl ExtractionPipeline {
    pub fn new(config: ExtractConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self { config, store }
    }

    pub fn from_config(config: ExtractConfig) -> anyhow::Result<Self> {
        let store = ElasticsearchStore::new(config.store.clone())?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    /// Run one full extraction with a fresh dedup register.
    pub async fn run_once(&self) -> Result<ExtractRunSummary, ExtractError> {
        let mut register = DedupRegister::new();
        self.run_with_register(&mut register).await
    }

    /// Run one full extraction against a caller-owned register.
    ///
    /// The scroll cursor is released at a single point after the page loop,
    /// whether the loop drained the index or stopped on the first fatal error.
    pub async fn run_with_register(
        &self,
        register: &mut DedupRegister,
    ) -> Result<ExtractRunSummary, ExtractError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "extract_run",
            %run_id,
            source = %self.config.source_index,
            destination = %self.config.destination_index
        );

        self.run_inner(run_id, register).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        register: &mut DedupRegister,
    ) -> Result<ExtractRunSummary, ExtractError> {
        let started_at = Utc::now();
        info!("starting customer extraction");

        let request = self.config.scroll_request();
        let (mut cursor, first_page) = ScrollCursor::open(self.store.as_ref(), &request)
            .await
            .map_err(|source| ExtractError::Open {
                index: request.index.clone(),
                source,
            })?;

        let mut tally = RunTally::default();
        let drained = self
            .drain(&mut cursor, first_page, register, &mut tally)
            .await;
        let released = cursor.release().await;

        match (drained, released) {
            (Ok(()), Ok(())) => {
                let summary = ExtractRunSummary {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    processed: tally.processed,
                    pages: tally.pages,
                    documents_scanned: tally.documents_scanned,
                    rejected: tally.rejected,
                    duplicates: tally.duplicates,
                };
                info!(
                    processed = summary.processed,
                    pages = summary.pages,
                    rejected = summary.rejected,
                    duplicates = summary.duplicates,
                    "customer extraction finished"
                );
                Ok(summary)
            }
            (Ok(()), Err(source)) => Err(ExtractError::Release(source)),
            (Err(err), released) => {
                if let Err(release_err) = released {
                    error!(error = %release_err, "failed to release scroll cursor after aborted run");
                }
                error!(processed = tally.processed, error = %err, "customer extraction aborted");
                Err(err)
            }
        }
    }

    async fn drain(
        &self,
        cursor: &mut ScrollCursor<'_>,
        mut documents: Vec<RawDocument>,
        register: &mut DedupRegister,
        tally: &mut RunTally,
    ) -> Result<(), ExtractError> {
        while !documents.is_empty() {
            tally.pages += 1;
            for raw in &documents {
                self.process_document(raw, register, tally).await?;
            }
            documents = cursor
                .next_page()
                .await
                .map_err(|source| ExtractError::Page {
                    page: tally.pages + 1,
                    source,
                })?;
        }
        Ok(())
    }

    async fn process_document(
        &self,
        raw: &RawDocument,
        register: &mut DedupRegister,
        tally: &mut RunTally,
    ) -> Result<(), ExtractError> {
        tally.documents_scanned += 1;

        let customer = match normalize(raw) {
            Ok(customer) => customer,
            Err(reason) => {
                tally.rejected += 1;
                warn!(doc_id = %raw.id, reason = %reason, "skipping document");
                return Ok(());
            }
        };

        if register.seen(customer.customer_id) {
            tally.duplicates += 1;
            return Ok(());
        }
        register.record(customer.customer_id, customer.email.clone());

        let body = serde_json::to_value(&customer).map_err(|source| ExtractError::Encode {
            customer_id: customer.customer_id,
            source,
        })?;
        self.store
            .upsert(&self.config.destination_index, &customer.document_id(), &body)
            .await
            .map_err(|source| ExtractError::Write {
                customer_id: customer.customer_id,
                index: self.config.destination_index.clone(),
                source,
            })?;

        tally.processed += 1;
        if self.config.progress_every > 0 && tally.processed % self.config.progress_every == 0 {
            info!(processed = tally.processed, "indexed unique customers");
        }
        Ok(())
    }
}
