//! Shared fixtures: an in-process adapter that records every call it sees.

use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use poly_client::{AdapterSpec, ClientOptions, DocumentSyncEvent, Operation, PolyClient};
use serde_json::{json, Value};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn client() -> PolyClient {
    PolyClient::new(ClientOptions::default()).unwrap()
}

/// An adapter that logs document-sync deliveries and answers hover and raw
/// requests.
pub fn recording_adapter(language_id: &str, log: &CallLog) -> AdapterSpec {
    AdapterSpec::new(language_id)
        .with_display_name(format!("{language_id} (test)"))
        .with_document_sync({
            let log = log.clone();
            move |event, _context| {
                let entry = match &event {
                    DocumentSyncEvent::Open { document } => {
                        format!("open {} v{}", document.uri, document.version)
                    }
                    DocumentSyncEvent::Update { document, changes } => format!(
                        "update {} v{} changes={} text={}",
                        document.uri,
                        document.version,
                        changes.len(),
                        document.text
                    ),
                    DocumentSyncEvent::Close { document } => format!("close {}", document.uri),
                    DocumentSyncEvent::Save { document } => format!("save {}", document.uri),
                };
                log.lock().push(entry);
                async { Ok(()) }.boxed()
            }
        })
        .with_handler(Operation::Hover, {
            let log = log.clone();
            move |_params, _context| {
                log.lock().push("hover".to_string());
                async { Ok::<_, anyhow::Error>(json!({ "contents": "hovered" })) }.boxed()
            }
        })
        .with_handler(Operation::RawRequest, {
            let log = log.clone();
            move |envelope, _context| {
                log.lock().push(format!(
                    "request {}",
                    envelope.get("method").and_then(Value::as_str).unwrap_or("?")
                ));
                async move { Ok(envelope) }.boxed()
            }
        })
}
