//! Embedding platform: document storage, indexing and semantic search.
//!
//! The platform lives at a fixed object path and needs no session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::require_text;
use crate::bus::{Bus, BusValue, EMBEDDING_PLATFORM_PATH};
use crate::config::ClientConfig;
use crate::error::{AiError, LastError, Result};
use crate::model::{Chunk, DocumentInfo, SearchResult};
use crate::reply::{parse_object, string_field, unpack_results};
use crate::state::ClientState;

#[derive(Debug)]
pub struct EmbeddingClient {
    bus: Arc<dyn Bus>,
    state: ClientState,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            bus,
            state: ClientState::new(),
            timeout: config.timeout_for(crate::session::Capability::Embedding),
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    fn call(&self, method: &str, args: Vec<BusValue>) -> Result<BusValue> {
        debug!(method, "calling embedding platform");
        self.bus
            .call(EMBEDDING_PLATFORM_PATH, method, args, self.timeout)
            .map_err(|e| {
                warn!(method, error = %e, "embedding platform call failed");
                AiError::from(e)
            })
    }

    fn call_json(&self, method: &str, args: Vec<BusValue>) -> Result<String> {
        Ok(self.call(method, args)?.into_string()?)
    }

    /// Embedding models the platform can use, as the daemon's JSON.
    pub fn embedding_models(&self) -> Result<String> {
        let result = self.call_json("embeddingModels", Vec::new());
        self.state.record(result)
    }

    /// Store `files` for `app_id`. Returns the id assigned to each file.
    pub fn upload_documents(
        &self,
        app_id: &str,
        files: &[String],
        extension_params: &str,
    ) -> Result<Vec<DocumentInfo>> {
        let result = self.upload_inner(app_id, files, extension_params);
        self.state.record(result)
    }

    fn upload_inner(
        &self,
        app_id: &str,
        files: &[String],
        extension_params: &str,
    ) -> Result<Vec<DocumentInfo>> {
        require_text(app_id, "app id")?;
        if files.is_empty() {
            return Err(AiError::invalid("no files to upload"));
        }
        let reply = self.call_json(
            "uploadDocuments",
            vec![
                BusValue::from(app_id),
                BusValue::from(files.to_vec()),
                BusValue::from(extension_params),
            ],
        )?;
        Ok(objects(unpack_results(&reply)?)
            .map(|item| DocumentInfo {
                id: string_field(&item, "documentID"),
                file_path: string_field(&item, "file"),
                ..DocumentInfo::default()
            })
            .collect())
    }

    pub fn delete_documents(&self, app_id: &str, document_ids: &[String]) -> Result<()> {
        let result = require_text(app_id, "app id").and_then(|()| {
            let reply = self.call_json(
                "deleteDocuments",
                vec![BusValue::from(app_id), BusValue::from(document_ids.to_vec())],
            )?;
            parse_object(&reply).map(|_| ())
        });
        self.state.record(result)
    }

    /// Semantic search over the documents of `app_id`.
    pub fn search(&self, app_id: &str, query: &str, extension_params: &str) -> Result<Vec<SearchResult>> {
        let result = require_text(app_id, "app id")
            .and_then(|()| require_text(query, "query"))
            .and_then(|()| {
                let reply = self.call_json(
                    "search",
                    vec![
                        BusValue::from(app_id),
                        BusValue::from(query),
                        BusValue::from(extension_params),
                    ],
                )?;
                Ok(objects(unpack_results(&reply)?).map(|item| search_result(&item)).collect())
            });
        self.state.record(result)
    }

    /// Cancel a running platform task. `Ok(false)` if the daemon refused.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let result = require_text(task_id, "task id")
            .and_then(|()| Ok(self.call("cancelTask", vec![BusValue::from(task_id)])?.as_bool()?));
        self.state.record(result)
    }

    /// Details of `document_ids`, or of every document of `app_id` when empty.
    pub fn documents_info(&self, app_id: &str, document_ids: &[String]) -> Result<Vec<DocumentInfo>> {
        let result = require_text(app_id, "app id").and_then(|()| {
            let reply = self.call_json(
                "documentsInfo",
                vec![BusValue::from(app_id), BusValue::from(document_ids.to_vec())],
            )?;
            Ok(objects(unpack_results(&reply)?).map(|item| document_info(&item)).collect())
        });
        self.state.record(result)
    }

    pub fn build_index(&self, app_id: &str, doc_id: &str, extension_params: &str) -> Result<bool> {
        let result = require_text(app_id, "app id").and_then(|()| {
            let reply = self.call_json(
                "buildIndex",
                vec![
                    BusValue::from(app_id),
                    BusValue::from(doc_id),
                    BusValue::from(extension_params),
                ],
            )?;
            let obj = parse_object(&reply)?;
            Ok(obj.get("success").and_then(Value::as_bool).unwrap_or(true))
        });
        self.state.record(result)
    }

    /// Drop the index of `app_id` (`all_index` drops every index it owns).
    pub fn destroy_index(&self, app_id: &str, all_index: bool, extension_params: &str) -> Result<bool> {
        let result = require_text(app_id, "app id").and_then(|()| {
            let reply = self.call_json(
                "destroyIndex",
                vec![
                    BusValue::from(app_id),
                    BusValue::from(all_index),
                    BusValue::from(extension_params),
                ],
            )?;
            parse_object(&reply)?
                .get("success")
                .and_then(Value::as_bool)
                .ok_or_else(|| AiError::parse("missing or invalid 'success' field"))
        });
        self.state.record(result)
    }

    pub fn last_error(&self) -> LastError {
        self.state.last_error()
    }
}

/// Object entries of a `results` array; anything else is skipped.
fn objects(items: Vec<Value>) -> impl Iterator<Item = Map<String, Value>> {
    items.into_iter().filter_map(|item| match item {
        Value::Object(obj) => Some(obj),
        _ => None,
    })
}

fn int_field(obj: &Map<String, Value>, key: &str) -> i64 {
    obj.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn search_result(item: &Map<String, Value>) -> SearchResult {
    let chunk = item
        .get("chunk")
        .and_then(Value::as_object)
        .map(|c| Chunk {
            chunk_index: int_field(c, "chunk_index"),
            content: string_field(c, "content"),
            tokens: int_field(c, "tokens"),
            timestamp: c
                .get("timestamp")
                .and_then(Value::as_array)
                .map(|ts| ts.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
        })
        .unwrap_or_default();
    SearchResult {
        id: string_field(item, "id"),
        model: string_field(item, "model"),
        distance: item.get("distance").and_then(Value::as_f64).unwrap_or_default(),
        chunk,
    }
}

fn document_info(item: &Map<String, Value>) -> DocumentInfo {
    DocumentInfo {
        id: string_field(item, "id"),
        file_path: string_field(item, "file_path"),
        created_at: item
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        metadata: item
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

/// ISO-8601 timestamp; values without an offset are taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::error::ErrorCode;
    use chrono::TimeZone;

    fn client(bus: &Arc<MemoryBus>) -> EmbeddingClient {
        EmbeddingClient::new(bus.clone(), &ClientConfig::default())
    }

    #[test]
    fn test_upload_maps_document_ids() {
        let bus = Arc::new(MemoryBus::new());
        bus.reply_json(
            "uploadDocuments",
            r#"{"results": [{"documentID": "d1", "file": "/docs/a.md"}, 3]}"#,
        );
        let rag = client(&bus);

        let docs = rag
            .upload_documents("notes", &["/docs/a.md".to_string()], "")
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "d1");
        assert_eq!(docs[0].file_path, "/docs/a.md");

        let call = &bus.calls_to("uploadDocuments")[0];
        assert_eq!(call.path, EMBEDDING_PLATFORM_PATH);
        assert_eq!(call.args[1], BusValue::StrList(vec!["/docs/a.md".into()]));
        assert!(bus.calls_to("CreateSession").is_empty());
    }

    #[test]
    fn test_search_results() {
        let bus = Arc::new(MemoryBus::new());
        bus.reply_json(
            "search",
            r#"{"results": [{"id": "d1", "model": "bge", "distance": 0.25,
                "chunk": {"chunk_index": 2, "content": "Rust is fast", "tokens": 3,
                          "timestamp": ["00:01", 5]}}]}"#,
        );
        let rag = client(&bus);

        let hits = rag.search("notes", "what is fast?", "").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].distance, 0.25);
        assert_eq!(hits[0].chunk.chunk_index, 2);
        assert_eq!(hits[0].chunk.content, "Rust is fast");
        assert_eq!(hits[0].chunk.timestamp, vec!["00:01"]);
    }

    #[test]
    fn test_missing_results_is_parse_error() {
        let bus = Arc::new(MemoryBus::new());
        bus.reply_json("search", r#"{"hits": []}"#);
        let rag = client(&bus);
        let err = rag.search("notes", "q", "").unwrap_err();
        assert!(matches!(err, AiError::Parse(_)));
        assert_eq!(rag.last_error().code, ErrorCode::ParseError.as_i32());
    }

    #[test]
    fn test_documents_info_timestamps() {
        let bus = Arc::new(MemoryBus::new());
        bus.reply_json(
            "documentsInfo",
            r#"{"results": [
                {"id": "d1", "file_path": "/a", "created_at": "2025-03-01T10:00:00",
                 "metadata": {"lang": "en"}},
                {"id": "d2", "file_path": "/b", "created_at": "2025-03-01T10:00:00+02:00"},
                {"id": "d3", "file_path": "/c", "created_at": "yesterday"}
            ]}"#,
        );
        let rag = client(&bus);

        let docs = rag.documents_info("notes", &[]).unwrap();
        assert_eq!(
            docs[0].created_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(docs[0].metadata["lang"], "en");
        assert_eq!(
            docs[1].created_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(docs[2].created_at, None);
    }

    #[test]
    fn test_destroy_index_requires_success_flag() {
        let bus = Arc::new(MemoryBus::new());
        bus.reply_json("destroyIndex", r#"{"success": true}"#);
        let rag = client(&bus);
        assert!(rag.destroy_index("notes", true, "").unwrap());
        assert_eq!(bus.calls_to("destroyIndex")[0].args[1], BusValue::Bool(true));

        bus.reply_json("destroyIndex", "{}");
        assert!(matches!(
            rag.destroy_index("notes", false, ""),
            Err(AiError::Parse(_))
        ));
    }

    #[test]
    fn test_daemon_absent() {
        let bus = Arc::new(MemoryBus::new());
        let rag = client(&bus);
        assert!(matches!(
            rag.cancel_task("t1"),
            Err(AiError::DaemonUnavailable(_))
        ));
        assert!(matches!(
            rag.embedding_models(),
            Err(AiError::DaemonUnavailable(_))
        ));
    }

    #[test]
    fn test_cancel_and_build() {
        let bus = Arc::new(MemoryBus::new());
        bus.reply("cancelTask", BusValue::Bool(true));
        bus.reply_json("buildIndex", r#"{"success": false}"#);
        bus.reply_json("deleteDocuments", "{}");
        let rag = client(&bus);
        assert!(rag.cancel_task("t1").unwrap());
        assert!(!rag.build_index("notes", "d1", "").unwrap());
        rag.delete_documents("notes", &["d1".to_string()]).unwrap();

        bus.reply_json("deleteDocuments", "gone");
        assert!(rag.delete_documents("notes", &[]).is_err());
    }
}
