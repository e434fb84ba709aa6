//! Core domain model for the customer reconciliation job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Default number of hits requested per scroll page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default server-side lifetime of a scroll context between page fetches.
pub const DEFAULT_SCROLL_TTL: Duration = Duration::from_secs(60);

/// One source hit as stored: the store's own document id plus its untyped body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub source: Option<Map<String, JsonValue>>,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, source: Map<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            source: Some(source),
        }
    }

    pub fn without_source(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.source.as_ref().and_then(|source| source.get(name))
    }
}

/// Deduplicated customer written to the destination collection, keyed by `customer_id`.
///
/// Descriptive fields are carried through untouched from the first source
/// document seen for the customer, so absent values serialize as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCustomer {
    pub customer_id: i64,
    pub email: String,
    pub customer_full_name: JsonValue,
    pub customer_first_name: JsonValue,
    pub customer_last_name: JsonValue,
    pub customer_gender: JsonValue,
    pub customer_phone: JsonValue,
    pub user: JsonValue,
}

impl CanonicalCustomer {
    /// Destination document id.
    pub fn document_id(&self) -> String {
        self.customer_id.to_string()
    }
}

/// Full-collection scan request that opens a scroll cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollRequest {
    pub index: String,
    pub page_size: usize,
    pub ttl: Duration,
}

impl ScrollRequest {
    pub fn match_all(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            page_size: DEFAULT_PAGE_SIZE,
            ttl: DEFAULT_SCROLL_TTL,
        }
    }
}

/// One page of a scroll together with the cursor handle to use for the next fetch.
///
/// The store may rotate the handle on every call, so callers must always
/// continue from the handle of the most recent page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub cursor: Option<String>,
    pub documents: Vec<RawDocument>,
}

impl ScrollPage {
    pub fn is_exhausted(&self) -> bool {
        self.documents.is_empty()
    }
}
