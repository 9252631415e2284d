//! Resolving a host call to exactly one adapter and dispatching it.

use std::sync::Arc;

use serde_json::Value;

use crate::adapter::Operation;
use crate::document::normalize_uri;
use crate::events::AdapterErrorEvent;
use crate::registry::AdapterRecord;
use crate::{ClientInner, Error, Result};

/// The param paths a `languageId` hint may live at, most specific last.
fn extract_language_id(params: &Value) -> Option<&str> {
    params
        .get("languageId")
        .and_then(Value::as_str)
        .or_else(|| params.get("language").and_then(Value::as_str))
        .or_else(|| params.pointer("/textDocument/languageId").and_then(Value::as_str))
        .or_else(|| params.pointer("/document/languageId").and_then(Value::as_str))
}

fn extract_uri(params: &Value) -> Option<&str> {
    params
        .get("uri")
        .and_then(Value::as_str)
        .or_else(|| params.pointer("/textDocument/uri").and_then(Value::as_str))
        .or_else(|| params.pointer("/document/uri").and_then(Value::as_str))
        .or_else(|| params.pointer("/left/textDocument/uri").and_then(Value::as_str))
}

impl ClientInner {
    /// Resolves the target adapter for a host call:
    ///
    /// 1. non-object params with a single registered adapter → that adapter;
    /// 2. an explicit language id (unknown ids are an error);
    /// 3. a document URI, through its open document's owning adapter;
    /// 4. the sole registered adapter;
    /// 5. otherwise the call is ambiguous.
    pub(crate) fn resolve_adapter(&self, params: &Value) -> Result<Arc<AdapterRecord>> {
        if !params.is_object() {
            if let Some(sole) = self.registry.sole() {
                return Ok(sole);
            }
        }

        if let Some(language_id) = extract_language_id(params) {
            return self
                .registry
                .get(language_id)
                .ok_or_else(|| Error::UnknownLanguage(language_id.to_string()));
        }

        if let Some(raw_uri) = extract_uri(params) {
            let uri = normalize_uri(raw_uri)?;
            let language_id = self
                .store
                .lock()
                .get(&uri)
                .map(|document| document.language_id.clone())
                .ok_or_else(|| Error::DocumentNotOpen(uri.to_string()))?;
            return self
                .registry
                .get(&language_id)
                .ok_or(Error::UnknownLanguage(language_id));
        }

        if let Some(sole) = self.registry.sole() {
            return Ok(sole);
        }

        Err(Error::LanguageNotResolved)
    }

    fn handler_for(
        &self,
        record: &Arc<AdapterRecord>,
        operation: Operation,
    ) -> Result<crate::adapter::RequestHandler> {
        record.gate()?;
        record
            .handlers
            .get(&operation)
            .cloned()
            .ok_or_else(|| Error::FeatureUnsupported {
                language_id: record.language_id.clone(),
                operation: operation.as_str(),
            })
    }

    /// Routes a feature request and awaits the adapter's answer. Handler
    /// failures are reported on the error channel and returned to the
    /// caller.
    pub(crate) async fn routed_request(&self, operation: Operation, params: Value) -> Result<Value> {
        self.ensure_live()?;
        let record = self.resolve_adapter(&params)?;
        self.dispatch_request(record, operation, params).await
    }

    /// The raw-request escape hatch. Routing runs against the caller's
    /// params; the adapter's handler receives them wrapped together with the
    /// method name.
    pub(crate) async fn raw_request(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_live()?;
        let record = self.resolve_adapter(&params)?;
        let envelope = serde_json::json!({ "method": method, "params": params });
        self.dispatch_request(record, Operation::RawRequest, envelope).await
    }

    /// The raw-notification escape hatch. Routing errors are raised
    /// synchronously; the handler itself runs detached and only the error
    /// channel hears about its failures.
    pub(crate) fn raw_notification(&self, method: &str, params: Value) -> Result<()> {
        self.ensure_live()?;
        let record = self.resolve_adapter(&params)?;
        let handler = self.handler_for(&record, Operation::RawNotification)?;
        let context = self.request_context(&record.language_id);
        let envelope = serde_json::json!({ "method": method, "params": params });

        let future = handler(envelope, context);
        let events = self.events.clone();
        let language_id = record.language_id.clone();
        tokio::spawn(async move {
            if let Err(err) = future.await {
                events.emit_adapter_error(AdapterErrorEvent {
                    language_id,
                    operation: Operation::RawNotification.to_string(),
                    error: Arc::new(err),
                });
            }
        });
        Ok(())
    }

    async fn dispatch_request(
        &self,
        record: Arc<AdapterRecord>,
        operation: Operation,
        params: Value,
    ) -> Result<Value> {
        let handler = self.handler_for(&record, operation)?;
        let context = self.request_context(&record.language_id);

        match handler(params, context).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = Arc::new(err);
                self.events.emit_adapter_error(AdapterErrorEvent {
                    language_id: record.language_id.clone(),
                    operation: operation.to_string(),
                    error: err.clone(),
                });
                Err(Error::Adapter(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn language_id_paths_probe_in_order() {
        let params = json!({
            "textDocument": { "languageId": "go" },
            "languageId": "rust",
        });
        assert_eq!(extract_language_id(&params), Some("rust"));

        let params = json!({ "document": { "languageId": "go" } });
        assert_eq!(extract_language_id(&params), Some("go"));

        assert_eq!(extract_language_id(&json!({})), None);
        assert_eq!(extract_language_id(&json!(17)), None);
    }

    #[test]
    fn uri_paths_probe_in_order() {
        let params = json!({
            "textDocument": { "uri": "file:///b.ts" },
            "uri": "file:///a.ts",
        });
        assert_eq!(extract_uri(&params), Some("file:///a.ts"));

        let params = json!({ "left": { "textDocument": { "uri": "file:///diff.ts" } } });
        assert_eq!(extract_uri(&params), Some("file:///diff.ts"));
    }
}
