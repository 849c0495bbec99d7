use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use crate::error::{Code, Error, Result};
use crate::types::PropertyAddress;

pub const BACKPRESSURE: &str = "SEARCH_BACKPRESSURE";

fn backpressure(index: &str) -> Error {
    Error::new("fcf1daa0-c0c2-492e-abb7-c2bd6f2d5f5f", Code::ResourceExhausted, "Search cluster is overloaded.")
        .with_label(BACKPRESSURE)
        .with_meta("index", index)
}

/// Document store the address index lives in. Calls block.
pub trait SearchCluster: Send + Sync {
    /// Registry key, also part of the index loader's directory path.
    fn name(&self) -> &str;
    fn index_exists(&self, index: &str) -> Result<bool>;
    fn create_index(&self, index: &str, body: &Value) -> Result<()>;
    /// Bulk upsert keyed by address id. Backpressure is `resource_exhausted`.
    fn put_documents(&self, index: &str, docs: &[PropertyAddress]) -> Result<()>;
}

/// Strict mapping for the address index.
#[must_use]
pub fn address_index_body() -> Value {
    let text = json!({ "type": "text" });
    let keyword = json!({ "type": "keyword" });

    json!({
        "settings": {
            "index": { "number_of_shards": 1, "number_of_replicas": 1 }
        },
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "aupid": keyword,
                "city": text,
                "county": text,
                "fips": keyword,
                "fullStreetAddress": text,
                "houseNumber": text,
                "id": keyword,
                "state": text,
                "stateFullName": text,
                "streetName": text,
                "streetPostDirection": text,
                "streetPreDirection": text,
                "streetSuffix": text,
                "unitNumber": text,
                "unitType": text,
                "updatedAt": { "type": "date" },
                "zip5": keyword,
            }
        }
    })
}

/// In-process cluster for tests and single-node runs.
#[derive(Default)]
pub struct MemorySearch {
    name: String,
    indexes: Mutex<HashMap<String, MemoryIndex>>,
    fail_next: AtomicU32,
}

#[derive(Default)]
struct MemoryIndex {
    body: Value,
    docs: HashMap<String, Value>,
}

impl MemorySearch {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Makes the next `n` bulk writes fail with backpressure.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn document_count(&self, index: &str) -> usize {
        self.lock().get(index).map_or(0, |i| i.docs.len())
    }

    #[must_use]
    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.lock().get(index).and_then(|i| i.docs.get(id).cloned())
    }

    #[must_use]
    pub fn index_body(&self, index: &str) -> Option<Value> {
        self.lock().get(index).map(|i| i.body.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryIndex>> {
        self.indexes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SearchCluster for MemorySearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.lock().contains_key(index))
    }

    fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let mut indexes = self.lock();
        if indexes.contains_key(index) {
            return Err(Error::new("016ea79e-4afe-4dfd-b286-fc7bb4c13f9f", Code::AlreadyExists, "Index already exists.")
                .with_meta("index", index));
        }
        indexes.insert(
            index.to_string(),
            MemoryIndex {
                body: body.clone(),
                docs: HashMap::new(),
            },
        );
        Ok(())
    }

    fn put_documents(&self, index: &str, docs: &[PropertyAddress]) -> Result<()> {
        let pending = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(backpressure(index));
        }

        let mut indexes = self.lock();
        let target = indexes.get_mut(index).ok_or_else(|| {
            Error::new("21aa9531-57f9-4c3f-b29f-f26ad67fcb47", Code::NotFound, "Index not found.").with_meta("index", index)
        })?;

        for doc in docs {
            let body = serde_json::to_value(doc).map_err(|e| {
                Error::new("1635c9ba-8093-4029-857a-47f94b0f7e82", Code::Internal, "Failed to encode document.").with_cause(e)
            })?;
            target.docs.insert(doc.document_id(), body);
        }
        Ok(())
    }
}

/// OpenSearch-compatible cluster reached over HTTP.
pub struct HttpSearch {
    name: String,
    base_url: String,
    timeout: Duration,
}

impl HttpSearch {
    pub fn new(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    // Built per call: a blocking client must not be dropped on a runtime thread.
    fn client(&self) -> Result<Client> {
        Client::builder().timeout(self.timeout).build().map_err(|e| {
            Error::new("b13fb2c4-3fda-4bf7-865e-8b209d478852", Code::Internal, "Failed to build http client.").with_cause(e)
        })
    }

    fn request_failed(&self, index: &str, e: reqwest::Error) -> Error {
        Error::new("25d9ebc2-5136-41f2-af14-16a71cb2a1da", Code::Unavailable, "Search request failed.")
            .with_cause(e)
            .with_meta("index", index)
            .with_meta("cluster", self.name.as_str())
    }
}

fn check_status(index: &str, status: StatusCode, body: &str) -> Result<()> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(backpressure(index));
    }
    if !status.is_success() {
        return Err(Error::new("5c762c82-cee4-4bd5-a8b0-efff4bbf2ee2", Code::Unknown, "Search cluster rejected request.")
            .with_meta("index", index)
            .with_meta("status", status.as_u16())
            .with_meta("body", body));
    }
    Ok(())
}

/// Bulk responses report per-item failures with a 200.
fn check_bulk_items(index: &str, response: &Value) -> Result<()> {
    if response.get("errors").and_then(Value::as_bool) != Some(true) {
        return Ok(());
    }

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let statuses: Vec<u64> = items
        .iter()
        .filter_map(|item| item.get("index").and_then(|i| i.get("status")))
        .filter_map(Value::as_u64)
        .filter(|s| *s >= 300)
        .collect();

    if statuses.contains(&429) {
        return Err(backpressure(index));
    }
    Err(Error::new("fcf9dbbd-ac85-458b-82be-2937e550095b", Code::Unknown, "Bulk write had failed items.")
        .with_meta("index", index)
        .with_meta("failed", statuses.len()))
}

impl SearchCluster for HttpSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        let resp = self
            .client()?
            .head(format!("{}/{index}", self.base_url))
            .send()
            .map_err(|e| self.request_failed(index, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status => check_status(index, status, "").map(|()| true),
        }
    }

    fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let resp = self
            .client()?
            .put(format!("{}/{index}", self.base_url))
            .json(body)
            .send()
            .map_err(|e| self.request_failed(index, e))?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        check_status(index, status, &text)
    }

    fn put_documents(&self, index: &str, docs: &[PropertyAddress]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for doc in docs {
            let action = json!({ "index": { "_index": index, "_id": doc.document_id() } });
            let source = serde_json::to_string(doc).map_err(|e| {
                Error::new("5bd89000-ea6e-4383-99d9-e09015ee80da", Code::Internal, "Failed to encode document.").with_cause(e)
            })?;
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&source);
            body.push('\n');
        }

        let resp = self
            .client()?
            .post(format!("{}/_bulk", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .map_err(|e| self.request_failed(index, e))?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        check_status(index, status, &text)?;

        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        check_bulk_items(index, &parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn address(id: Uuid) -> PropertyAddress {
        PropertyAddress {
            id: Some(id),
            zip5: Some("94103".to_string()),
            full_street_address: Some("1 Main St".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_memory_search_backpressure() {
        let search = MemorySearch::new("memory");
        assert!(!search.index_exists("addresses").unwrap());
        search.create_index("addresses", &address_index_body()).unwrap();
        assert!(search.index_exists("addresses").unwrap());

        search.fail_next(2);
        let docs = [address(Uuid::now_v7())];
        for _ in 0..2 {
            let err = search.put_documents("addresses", &docs).unwrap_err();
            assert_eq!(err.code(), Code::ResourceExhausted);
            assert_eq!(err.label(), Some(BACKPRESSURE));
        }
        search.put_documents("addresses", &docs).unwrap();
        search.put_documents("addresses", &docs).unwrap();
        assert_eq!(search.document_count("addresses"), 1);

        let doc = search
            .document("addresses", &docs[0].document_id())
            .unwrap();
        assert_eq!(doc["fullStreetAddress"], "1 Main St");
        assert_eq!(doc["zip5"], "94103");
    }

    #[test]
    fn test_memory_search_requires_index() {
        let search = MemorySearch::new("memory");
        let err = search
            .put_documents("missing", &[address(Uuid::now_v7())])
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_bulk_item_failures() {
        let ok = json!({ "errors": false, "items": [] });
        assert!(check_bulk_items("a", &ok).is_ok());

        let throttled = json!({
            "errors": true,
            "items": [
                { "index": { "status": 201 } },
                { "index": { "status": 429 } }
            ]
        });
        let err = check_bulk_items("a", &throttled).unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);

        let rejected = json!({ "errors": true, "items": [{ "index": { "status": 400 } }] });
        assert_eq!(check_bulk_items("a", &rejected).unwrap_err().code(), Code::Unknown);

        assert_eq!(
            check_status("a", StatusCode::TOO_MANY_REQUESTS, "").unwrap_err().code(),
            Code::ResourceExhausted
        );
    }

    #[test]
    fn test_index_body_is_strict() {
        let body = address_index_body();
        assert_eq!(body["mappings"]["dynamic"], "strict");
        assert_eq!(body["mappings"]["properties"]["updatedAt"]["type"], "date");
        assert_eq!(body["mappings"]["properties"]["fips"]["type"], "keyword");
    }
}
