//! A multiplexing language client hub: one uniform request surface in
//! front of a set of per-language adapters, each optionally driving an
//! external language server over stdio.
//!
//! The hub owns the open documents, routes host calls to exactly one
//! adapter by language id or document URI, applies workspace edits, and
//! fans server-originated traffic back out to host subscribers.

mod adapter;
mod backend;
mod context;
mod document;
mod events;
mod registry;
mod router;
mod workspace_edit;

pub use poly_lsp::{lsp, BackendConfig};

pub use adapter::{AdapterSpec, DocumentSyncEvent, HandlerFuture, Operation};
pub use backend::register_backend;
pub use context::{AdapterContext, RequestContext};
pub use document::{normalize_uri, Document};
pub use events::{
    AdapterErrorEvent, DiagnosticsEvent, Subscription, WorkspaceEvent,
};
pub use registry::AdapterState;
pub use workspace_edit::{EditFailure, EditOutcome};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::DocumentStore;
use crate::events::EventBus;
use crate::registry::Registry;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid client options: {0}")]
    InvalidOptions(String),
    #[error("invalid adapter: {0}")]
    InvalidAdapter(String),
    #[error("language '{0}' is already registered")]
    LanguageExists(String),
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("version for '{uri}' must increase: stored {current}, supplied {supplied}")]
    InvalidVersion {
        uri: String,
        current: i32,
        supplied: i32,
    },
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
    #[error("document not open: {0}")]
    DocumentNotOpen(String),
    #[error("cannot resolve a language for this call; pass a languageId or an open document's URI")]
    LanguageNotResolved,
    #[error("language '{0}' is still initializing")]
    LanguageNotReady(String),
    #[error("language '{0}' failed to initialize")]
    LanguageFailed(String),
    #[error("language '{language_id}' does not support '{operation}'")]
    FeatureUnsupported {
        language_id: String,
        operation: &'static str,
    },
    #[error("client has been disposed")]
    ClientDisposed,
    #[error("failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("adapter failed: {0}")]
    Adapter(Arc<anyhow::Error>),
}

/// How the hub reaches external language servers. Only child-process stdio
/// is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    pub transport: TransportKind,
    pub workspace_folders: Vec<PathBuf>,
    /// Opaque host data, surfaced to adapters through the request context.
    pub metadata: serde_json::Map<String, Value>,
}

impl ClientOptions {
    /// Parses options from raw JSON, e.g. a host-side settings blob.
    pub fn from_value(value: Value) -> Result<Self> {
        let options: Self =
            serde_json::from_value(value).map_err(|err| Error::InvalidOptions(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        for folder in &self.workspace_folders {
            if !folder.is_absolute() {
                return Err(Error::InvalidOptions(format!(
                    "workspace folder '{}' must be an absolute path",
                    folder.display()
                )));
            }
        }
        Ok(())
    }
}

/// A registered adapter as the host sees it.
#[derive(Debug, Clone)]
pub struct LanguageInfo {
    pub language_id: String,
    pub display_name: Option<String>,
    pub state: AdapterState,
    pub registered_at: SystemTime,
}

pub(crate) struct ClientInner {
    pub(crate) options: ClientOptions,
    pub(crate) store: Mutex<DocumentStore>,
    pub(crate) registry: Registry,
    pub(crate) events: EventBus,
    pub(crate) disposed: AtomicBool,
    pub(crate) weak_self: Weak<ClientInner>,
    next_server_id: AtomicUsize,
}

impl ClientInner {
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::ClientDisposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn request_context(&self, language_id: &str) -> RequestContext {
        RequestContext::new(
            self.weak_self.clone(),
            language_id.to_string(),
            self.options.metadata.clone(),
            self.options.workspace_folders.clone(),
        )
    }

    pub(crate) fn lsp_workspace_folders(&self) -> Vec<lsp::WorkspaceFolder> {
        self.options
            .workspace_folders
            .iter()
            .filter_map(|path| {
                let uri = lsp::Url::from_file_path(path).ok()?;
                Some(lsp::WorkspaceFolder {
                    name: path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    uri,
                })
            })
            .collect()
    }

    pub(crate) fn next_server_id(&self) -> usize {
        self.next_server_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// The multiplexer. Cheap to clone handles are not provided; share it with
/// `Arc` if the host needs to.
pub struct PolyClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl PolyClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let inner = Arc::new_cyclic(|weak| ClientInner {
            options,
            store: Mutex::new(DocumentStore::default()),
            registry: Registry::default(),
            events: EventBus::default(),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
            next_server_id: AtomicUsize::new(0),
        });
        Ok(Self { inner })
    }

    // ---------------------------------------------------------------------
    // Adapters
    // ---------------------------------------------------------------------

    /// Registers an adapter and drives its initialization to completion.
    /// Document-sync calls issued while initialization runs are queued and
    /// replayed, in order, once the adapter is ready.
    pub async fn register_language(&self, spec: AdapterSpec) -> Result<()> {
        self.inner.register_language(spec).await
    }

    pub async fn unregister_language(&self, language_id: &str) -> Result<()> {
        self.inner.unregister_language(language_id).await
    }

    pub fn languages(&self) -> Vec<LanguageInfo> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|record| LanguageInfo {
                language_id: record.language_id.clone(),
                display_name: record.display_name.clone(),
                state: record.state(),
                registered_at: record.registered_at,
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Documents
    // ---------------------------------------------------------------------

    pub fn open_document(
        &self,
        uri: &str,
        language_id: &str,
        text: impl Into<String>,
        version: i32,
    ) -> Result<()> {
        self.inner.open_document(uri, language_id, text.into(), version)
    }

    pub fn update_document(
        &self,
        uri: &str,
        version: i32,
        changes: Vec<lsp::TextDocumentContentChangeEvent>,
    ) -> Result<()> {
        self.inner.update_document(uri, version, changes)
    }

    pub fn close_document(&self, uri: &str) -> Result<()> {
        self.inner.close_document(uri)
    }

    pub fn save_document(&self, uri: &str) -> Result<()> {
        self.inner.save_document(uri)
    }

    /// An owned copy of the document at `uri`, if open.
    pub fn get_document(&self, uri: &str) -> Result<Option<Document>> {
        self.inner.ensure_live()?;
        let uri = normalize_uri(uri)?;
        Ok(self.inner.store.lock().get(&uri).cloned())
    }

    // ---------------------------------------------------------------------
    // Feature requests
    // ---------------------------------------------------------------------

    pub async fn completions(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::Completion, params).await
    }

    pub async fn hover(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::Hover, params).await
    }

    pub async fn definition(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::Definition, params).await
    }

    pub async fn references(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::References, params).await
    }

    pub async fn code_actions(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::CodeActions, params).await
    }

    pub async fn document_highlights(&self, params: Value) -> Result<Value> {
        self.inner
            .routed_request(Operation::DocumentHighlights, params)
            .await
    }

    pub async fn document_symbols(&self, params: Value) -> Result<Value> {
        self.inner
            .routed_request(Operation::DocumentSymbols, params)
            .await
    }

    pub async fn rename_symbol(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::Rename, params).await
    }

    pub async fn format_document(&self, params: Value) -> Result<Value> {
        self.inner
            .routed_request(Operation::FormatDocument, params)
            .await
    }

    pub async fn format_range(&self, params: Value) -> Result<Value> {
        self.inner.routed_request(Operation::FormatRange, params).await
    }

    /// Escape hatch: forward an arbitrary request to an adapter. With more
    /// than one adapter registered, `params` must carry a `languageId` or
    /// the URI of an open document.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        self.inner.raw_request(method, params).await
    }

    /// Escape hatch: forward an arbitrary notification. Never blocks on the
    /// adapter; routing errors are still raised synchronously.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        self.inner.raw_notification(method, params)
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn on_diagnostics(
        &self,
        uri: &str,
        listener: impl Fn(&DiagnosticsEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.inner.ensure_live()?;
        let uri = normalize_uri(uri)?;
        Ok(self.inner.events.on_diagnostics(uri, listener))
    }

    pub fn on_workspace_event(
        &self,
        kind: &str,
        listener: impl Fn(&WorkspaceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.inner.ensure_live()?;
        Ok(self.inner.events.on_workspace_event(kind.to_string(), listener))
    }

    /// Subscribes to server notifications by method name. The listener may
    /// return a value; for unknown server-initiated *requests* the first
    /// such value is used as the reply.
    pub fn on_notification(
        &self,
        method: &str,
        listener: impl Fn(&Value, &str) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.inner.ensure_live()?;
        Ok(self.inner.events.on_notification(method.to_string(), listener))
    }

    pub fn on_error(
        &self,
        listener: impl Fn(&AdapterErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.inner.ensure_live()?;
        Ok(self.inner.events.on_error(listener))
    }

    // ---------------------------------------------------------------------
    // Workspace edits and teardown
    // ---------------------------------------------------------------------

    pub fn apply_workspace_edit(&self, edit: &lsp::WorkspaceEdit) -> Result<EditOutcome> {
        self.inner.ensure_live()?;
        Ok(self.inner.apply_workspace_edit(edit))
    }

    /// Tears down every adapter (queue, graceful backend shutdown,
    /// disposables) and drops all listeners. Idempotent; every *other*
    /// operation afterwards fails with [`Error::ClientDisposed`].
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for record in self.inner.drain_registry() {
            self.inner.teardown_record(&record).await;
        }
        self.inner.events.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}
