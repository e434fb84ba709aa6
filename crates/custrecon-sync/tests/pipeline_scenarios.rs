use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use custrecon_core::{RawDocument, ScrollPage, ScrollRequest};
use custrecon_storage::{DocumentStore, StoreError};
use custrecon_sync::{DedupRegister, ExtractConfig, ExtractError, ExtractionPipeline, ScrollCursor};
use serde_json::{json, Value as JsonValue};

/// In-memory store that serves scripted pages and records every call.
#[derive(Default)]
struct ScriptedStore {
    pages: Vec<Vec<RawDocument>>,
    fail_search: bool,
    fail_scroll_call: Option<usize>,
    fail_write_for: Option<String>,
    fail_release: bool,
    issue_cursor: bool,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    position: usize,
    cursor_seq: usize,
    scroll_calls: usize,
    cursors_used: Vec<String>,
    released: Vec<String>,
    destination: BTreeMap<String, JsonValue>,
    writes: Vec<String>,
}

fn unavailable() -> StoreError {
    StoreError::HttpStatus {
        status: 503,
        url: "http://localhost:9200".into(),
        body: "unavailable".into(),
    }
}

impl ScriptedStore {
    fn new(pages: Vec<Vec<RawDocument>>) -> Self {
        Self {
            pages,
            issue_cursor: true,
            ..Default::default()
        }
    }

    fn next_cursor(&self, state: &mut StoreState) -> Option<String> {
        if !self.issue_cursor {
            return None;
        }
        let cursor = format!("cursor-{}", state.cursor_seq);
        state.cursor_seq += 1;
        Some(cursor)
    }

    fn current_page(&self, state: &StoreState) -> Vec<RawDocument> {
        self.pages.get(state.position).cloned().unwrap_or_default()
    }

    fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    fn destination(&self) -> BTreeMap<String, JsonValue> {
        self.state.lock().unwrap().destination.clone()
    }

    fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes.len()
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn search(&self, request: &ScrollRequest) -> Result<ScrollPage, StoreError> {
        assert_eq!(request.page_size, 1000);
        assert_eq!(request.ttl, Duration::from_secs(60));
        if self.fail_search {
            return Err(unavailable());
        }
        let mut state = self.state.lock().unwrap();
        state.position = 0;
        let documents = self.current_page(&state);
        let cursor = self.next_cursor(&mut state);
        Ok(ScrollPage { cursor, documents })
    }

    async fn scroll_next(&self, cursor: &str, _ttl: Duration) -> Result<ScrollPage, StoreError> {
        let mut state = self.state.lock().unwrap();
        let latest = format!("cursor-{}", state.cursor_seq - 1);
        assert_eq!(cursor, latest, "driver must continue from the latest cursor");
        state.cursors_used.push(cursor.to_string());
        state.scroll_calls += 1;
        if self.fail_scroll_call == Some(state.scroll_calls) {
            return Err(unavailable());
        }
        state.position += 1;
        let documents = self.current_page(&state);
        let cursor = self.next_cursor(&mut state);
        Ok(ScrollPage { cursor, documents })
    }

    async fn release_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        self.state.lock().unwrap().released.push(cursor.to_string());
        if self.fail_release {
            return Err(unavailable());
        }
        Ok(())
    }

    async fn upsert(&self, index: &str, id: &str, document: &JsonValue) -> Result<(), StoreError> {
        assert_eq!(index, "customer");
        if self.fail_write_for.as_deref() == Some(id) {
            return Err(unavailable());
        }
        let mut state = self.state.lock().unwrap();
        state.writes.push(id.to_string());
        state.destination.insert(id.to_string(), document.clone());
        Ok(())
    }
}

fn order(hit_id: &str, body: JsonValue) -> RawDocument {
    let JsonValue::Object(map) = body else {
        panic!("order body must be an object");
    };
    RawDocument::new(hit_id, map)
}

fn customer_order(hit_id: &str, customer_id: i64, email: &str, name: &str) -> RawDocument {
    order(
        hit_id,
        json!({
            "customer_id": customer_id,
            "email": email,
            "customer_full_name": name,
            "customer_first_name": name.split(' ').next().unwrap_or_default(),
            "customer_last_name": name.split(' ').nth(1).unwrap_or_default(),
            "customer_gender": "FEMALE",
            "user": name.to_lowercase(),
        }),
    )
}

fn pipeline(store: &Arc<ScriptedStore>) -> ExtractionPipeline {
    ExtractionPipeline::new(ExtractConfig::default(), store.clone())
}

#[tokio::test]
async fn first_occurrence_wins_across_pages() {
    let store = Arc::new(ScriptedStore::new(vec![
        vec![customer_order("h1", 7, "a@x.com", "Ada Lovelace")],
        vec![customer_order("h2", 7, "b@x.com", "Grace Hopper")],
    ]));

    let summary = pipeline(&store).run_once().await.expect("run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.pages, 2);
    let destination = store.destination();
    assert_eq!(destination.len(), 1);
    assert_eq!(destination["7"]["email"], json!("a@x.com"));
    assert_eq!(destination["7"]["customer_full_name"], json!("Ada Lovelace"));
    assert_eq!(destination["7"]["customer_phone"], json!(""));
}

#[tokio::test]
async fn blank_email_is_rejected_without_write() {
    let store = Arc::new(ScriptedStore::new(vec![vec![
        order("h1", json!({ "customer_id": 12, "email": "" })),
        customer_order("h2", 13, "c@x.com", "Carol Shaw"),
    ]]));

    let summary = pipeline(&store).run_once().await.expect("run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.rejected, 1);
    assert!(!store.destination().contains_key("12"));
}

#[tokio::test]
async fn missing_customer_id_is_rejected_without_write() {
    let store = Arc::new(ScriptedStore::new(vec![vec![
        order("h1", json!({ "email": "nobody@x.com" })),
        RawDocument::without_source("h2"),
    ]]));

    let summary = pipeline(&store).run_once().await.expect("run");

    assert_eq!(summary.processed, 0);
    assert_eq!(summary.rejected, 2);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn empty_first_page_completes_and_releases_cursor() {
    let store = Arc::new(ScriptedStore::new(Vec::new()));

    let summary = pipeline(&store).run_once().await.expect("run");

    assert_eq!(summary.processed, 0);
    assert_eq!(summary.pages, 0);
    assert_eq!(store.released(), vec!["cursor-0".to_string()]);
    assert!(store.state.lock().unwrap().cursors_used.is_empty());
}

#[tokio::test]
async fn page_failure_after_300_writes_releases_cursor_and_keeps_writes() {
    let first_page = (0..300)
        .map(|i| customer_order(&format!("h{i}"), i, &format!("c{i}@x.com"), "Some One"))
        .collect();
    let store = Arc::new(ScriptedStore {
        fail_scroll_call: Some(1),
        ..ScriptedStore::new(vec![first_page, vec![customer_order("late", 999, "z@x.com", "Zed Z")]])
    });

    let err = pipeline(&store).run_once().await.expect_err("page fetch should fail");

    assert!(matches!(err, ExtractError::Page { page: 2, .. }));
    assert_eq!(store.released(), vec!["cursor-0".to_string()]);
    assert_eq!(store.destination().len(), 300);
    assert!(!store.destination().contains_key("999"));
}

#[tokio::test]
async fn write_failure_is_fatal_and_still_releases_cursor() {
    let store = Arc::new(ScriptedStore {
        fail_write_for: Some("2".into()),
        ..ScriptedStore::new(vec![vec![
            customer_order("h1", 1, "a@x.com", "Ada Lovelace"),
            customer_order("h2", 2, "b@x.com", "Bob Bemer"),
            customer_order("h3", 3, "c@x.com", "Carol Shaw"),
        ]])
    });

    let err = pipeline(&store).run_once().await.expect_err("write should fail");

    assert!(matches!(err, ExtractError::Write { customer_id: 2, .. }));
    assert_eq!(store.released(), vec!["cursor-0".to_string()]);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn writes_match_distinct_valid_ids() {
    let store = Arc::new(ScriptedStore::new(vec![
        vec![
            customer_order("h1", 1, "a@x.com", "Ada Lovelace"),
            customer_order("h2", 2, "b@x.com", "Bob Bemer"),
            order("h3", json!({ "customer_id": 3, "email": "   " })),
            customer_order("h4", 1, "a2@x.com", "Ada King"),
        ],
        vec![
            order("h5", json!({ "customer_id": 2.6, "email": "b2@x.com" })),
            order("h6", json!({ "customer_id": 4, "email": 99 })),
            customer_order("h7", 5, "e@x.com", "Eve Online"),
        ],
        vec![customer_order("h8", 3, "c@x.com", "Carol Shaw")],
    ]));

    let summary = pipeline(&store).run_once().await.expect("run");

    let destination = store.destination();
    let ids: Vec<_> = destination.keys().cloned().collect();
    assert_eq!(ids, vec!["1", "2", "3", "5"]);
    assert_eq!(summary.processed, 4);
    assert_eq!(store.write_count(), 4);
    assert_eq!(summary.documents_scanned, 8);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.duplicates, 2);
}

#[tokio::test]
async fn rerun_over_unchanged_source_yields_same_destination() {
    let store = Arc::new(ScriptedStore::new(vec![
        vec![
            customer_order("h1", 1, "a@x.com", "Ada Lovelace"),
            customer_order("h2", 2, "b@x.com", "Bob Bemer"),
        ],
        vec![customer_order("h3", 1, "other@x.com", "Ada King")],
    ]));
    let pipeline = pipeline(&store);

    pipeline.run_once().await.expect("first run");
    let after_first = store.destination();
    let second = pipeline.run_once().await.expect("second run");

    assert_eq!(second.processed, 2);
    assert_eq!(store.destination(), after_first);
    assert_eq!(store.released().len(), 2);
}

#[tokio::test]
async fn driver_follows_rotated_cursor_and_releases_the_latest() {
    let store = Arc::new(ScriptedStore::new(vec![
        vec![customer_order("h1", 1, "a@x.com", "Ada Lovelace")],
        vec![customer_order("h2", 2, "b@x.com", "Bob Bemer")],
    ]));

    pipeline(&store).run_once().await.expect("run");

    let state = store.state.lock().unwrap();
    assert_eq!(state.cursors_used, vec!["cursor-0", "cursor-1"]);
    assert_eq!(state.released, vec!["cursor-2"]);
}

#[tokio::test]
async fn failed_search_never_releases() {
    let store = Arc::new(ScriptedStore {
        fail_search: true,
        ..ScriptedStore::new(Vec::new())
    });

    let err = pipeline(&store).run_once().await.expect_err("search should fail");

    assert!(matches!(err, ExtractError::Open { .. }));
    assert!(store.released().is_empty());
}

#[tokio::test]
async fn missing_cursor_ends_after_first_page_without_release() {
    let store = Arc::new(ScriptedStore {
        issue_cursor: false,
        ..ScriptedStore::new(vec![
            vec![customer_order("h1", 1, "a@x.com", "Ada Lovelace")],
            vec![customer_order("h2", 2, "b@x.com", "Bob Bemer")],
        ])
    });

    let summary = pipeline(&store).run_once().await.expect("run");

    assert_eq!(summary.processed, 1);
    assert!(store.released().is_empty());
}

#[tokio::test]
async fn release_failure_fails_an_otherwise_clean_run() {
    let store = Arc::new(ScriptedStore {
        fail_release: true,
        ..ScriptedStore::new(vec![vec![customer_order("h1", 1, "a@x.com", "Ada Lovelace")]])
    });

    let err = pipeline(&store).run_once().await.expect_err("release should fail");

    assert!(matches!(err, ExtractError::Release(_)));
    assert_eq!(store.released().len(), 1);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn release_failure_does_not_mask_the_original_error() {
    let store = Arc::new(ScriptedStore {
        fail_release: true,
        fail_scroll_call: Some(1),
        ..ScriptedStore::new(vec![vec![customer_order("h1", 1, "a@x.com", "Ada Lovelace")]])
    });

    let err = pipeline(&store).run_once().await.expect_err("run should fail");

    assert!(matches!(err, ExtractError::Page { .. }));
    assert_eq!(store.released().len(), 1);
}

#[tokio::test]
async fn caller_owned_register_is_respected_and_filled() {
    let store = Arc::new(ScriptedStore::new(vec![vec![
        customer_order("h1", 1, "a@x.com", "Ada Lovelace"),
        customer_order("h2", 2, "b@x.com", "Bob Bemer"),
    ]]));
    let mut register = DedupRegister::new();
    register.record(1, "seeded@x.com");

    let summary = pipeline(&store)
        .run_with_register(&mut register)
        .await
        .expect("run");

    assert_eq!(summary.processed, 1);
    assert_eq!(register.len(), 2);
    assert_eq!(register.email_for(1), Some("seeded@x.com"));
    assert_eq!(register.email_for(2), Some("b@x.com"));
}

#[tokio::test]
async fn cursor_release_is_a_noop_without_handle() {
    let store = ScriptedStore {
        issue_cursor: false,
        ..ScriptedStore::new(Vec::new())
    };

    let (cursor, documents) = ScrollCursor::open(&store, &ScrollRequest::match_all("orders"))
        .await
        .expect("open");
    assert!(documents.is_empty());
    assert!(cursor.handle().is_none());

    cursor.release().await.expect("release");
    assert!(store.released().is_empty());
}
