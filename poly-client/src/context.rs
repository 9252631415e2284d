//! Capability handles given to adapters: one per adapter at initialization,
//! one per routed call.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use lsp_types as lsp;
use serde_json::Value;

use crate::document::{normalize_uri, Document};
use crate::events::{DiagnosticsEvent, WorkspaceEvent};
use crate::workspace_edit::EditOutcome;
use crate::{ClientInner, Error, Result};

/// Handed to an adapter once, at initialization. Everything an adapter may
/// do to the hub goes through here; the live stores are never exposed.
#[derive(Clone)]
pub struct AdapterContext {
    inner: Weak<ClientInner>,
    language_id: String,
}

impl AdapterContext {
    pub(crate) fn new(inner: Weak<ClientInner>, language_id: String) -> Self {
        Self { inner, language_id }
    }

    fn inner(&self) -> Result<Arc<ClientInner>> {
        self.inner.upgrade().ok_or(Error::ClientDisposed)
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn publish_diagnostics(&self, uri: &str, diagnostics: Vec<lsp::Diagnostic>) -> Result<()> {
        let inner = self.inner()?;
        let uri = normalize_uri(uri)?;
        inner.events.emit_diagnostics(DiagnosticsEvent {
            uri,
            language_id: self.language_id.clone(),
            diagnostics,
        });
        Ok(())
    }

    pub fn emit_workspace_event(&self, kind: &str, payload: Value) -> Result<()> {
        let inner = self.inner()?;
        inner.events.emit_workspace_event(WorkspaceEvent {
            kind: kind.to_string(),
            language_id: self.language_id.clone(),
            payload,
        });
        Ok(())
    }

    /// An owned copy of the document at `uri`, if it is open and belongs to
    /// this adapter's language.
    pub fn get_document(&self, uri: &str) -> Result<Option<Document>> {
        let inner = self.inner()?;
        let uri = normalize_uri(uri)?;
        let document = inner
            .store
            .lock()
            .get(&uri)
            .filter(|document| document.language_id == self.language_id)
            .cloned();
        Ok(document)
    }

    pub fn list_documents(&self) -> Result<Vec<Document>> {
        let inner = self.inner()?;
        let store = inner.store.lock();
        Ok(store
            .documents_for_language(&self.language_id)
            .cloned()
            .collect())
    }

    /// Fans a server-originated notification (anything but diagnostics) out
    /// to the host's method subscribers.
    pub fn notify_client(&self, method: &str, payload: Value) -> Result<()> {
        let inner = self.inner()?;
        inner
            .events
            .emit_notification(method, &payload, &self.language_id);
        Ok(())
    }

    /// Answers a server-initiated request. The built-in table covers the
    /// workspace and window requests the hub understands; anything else is
    /// offered to the host's notification subscribers and the first answer
    /// wins, null otherwise.
    pub fn handle_server_request(&self, method: &str, params: Value) -> Result<Value> {
        let inner = self.inner()?;
        match method {
            "workspace/applyEdit" => {
                let params: lsp::ApplyWorkspaceEditParams = serde_json::from_value(params)?;
                let outcome = inner.apply_workspace_edit(&params.edit);
                let response = lsp::ApplyWorkspaceEditResponse {
                    applied: outcome.applied,
                    failure_reason: outcome.failure_reason,
                    failed_change: outcome.failed_change.map(|index| index as u32),
                };
                Ok(serde_json::to_value(response)?)
            }
            "workspace/configuration" => {
                let params: lsp::ConfigurationParams = serde_json::from_value(params)?;
                Ok(Value::Array(
                    params
                        .items
                        .iter()
                        .map(|_| Value::Object(serde_json::Map::new()))
                        .collect(),
                ))
            }
            "workspace/workspaceFolders" => {
                Ok(serde_json::to_value(inner.lsp_workspace_folders())?)
            }
            "window/showMessageRequest" => {
                let params: lsp::ShowMessageRequestParams = serde_json::from_value(params)?;
                match params.actions.and_then(|actions| actions.into_iter().next()) {
                    Some(action) => Ok(serde_json::to_value(action)?),
                    None => Ok(Value::Null),
                }
            }
            // Everything else (including capability registration) is offered
            // to the host's notification subscribers; the first answer wins
            // and null acknowledges the rest.
            _ => Ok(inner
                .events
                .offer_notification(method, &params, &self.language_id)
                .unwrap_or(Value::Null)),
        }
    }

    pub fn apply_workspace_edit(&self, edit: &lsp::WorkspaceEdit) -> Result<EditOutcome> {
        let inner = self.inner()?;
        Ok(inner.apply_workspace_edit(edit))
    }

    /// Attaches a cleanup that runs when the adapter is unregistered or the
    /// client disposed.
    pub fn register_disposable(&self, disposable: impl FnOnce() + Send + 'static) -> Result<()> {
        let inner = self.inner()?;
        let record = inner
            .registry
            .get(&self.language_id)
            .ok_or_else(|| Error::UnknownLanguage(self.language_id.clone()))?;
        record.push_disposable(Box::new(disposable));
        Ok(())
    }

    pub fn workspace_folders(&self) -> Result<Vec<PathBuf>> {
        let inner = self.inner()?;
        Ok(inner.options.workspace_folders.clone())
    }
}

/// The per-call snapshot handed to operation handlers.
#[derive(Clone)]
pub struct RequestContext {
    inner: Weak<ClientInner>,
    language_id: String,
    metadata: serde_json::Map<String, Value>,
    workspace_folders: Vec<PathBuf>,
}

impl RequestContext {
    pub(crate) fn new(
        inner: Weak<ClientInner>,
        language_id: String,
        metadata: serde_json::Map<String, Value>,
        workspace_folders: Vec<PathBuf>,
    ) -> Self {
        Self {
            inner,
            language_id,
            metadata,
            workspace_folders,
        }
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn metadata(&self) -> &serde_json::Map<String, Value> {
        &self.metadata
    }

    pub fn workspace_folders(&self) -> &[PathBuf] {
        &self.workspace_folders
    }

    /// An owned copy of the document at `uri`, if open.
    pub fn get_document(&self, uri: &str) -> Result<Option<Document>> {
        let inner = self.inner.upgrade().ok_or(Error::ClientDisposed)?;
        let uri = normalize_uri(uri)?;
        let document = inner.store.lock().get(&uri).cloned();
        Ok(document)
    }
}
