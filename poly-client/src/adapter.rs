//! The contract between the hub and a language adapter: a closed set of
//! operations, a handler table, and the document-sync payloads.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use lsp_types as lsp;
use serde_json::Value;

use crate::context::{AdapterContext, RequestContext};
use crate::document::Document;

/// Every operation the hub can route to an adapter. Adapters implement a
/// subset; routing a missing one fails with `FeatureUnsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Completion,
    Hover,
    Definition,
    References,
    CodeActions,
    DocumentHighlights,
    DocumentSymbols,
    Rename,
    FormatDocument,
    FormatRange,
    RawRequest,
    RawNotification,
    OpenDocument,
    UpdateDocument,
    CloseDocument,
    SaveDocument,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Completion => "getCompletions",
            Operation::Hover => "getHover",
            Operation::Definition => "getDefinition",
            Operation::References => "getReferences",
            Operation::CodeActions => "getCodeActions",
            Operation::DocumentHighlights => "getDocumentHighlights",
            Operation::DocumentSymbols => "getDocumentSymbols",
            Operation::Rename => "renameSymbol",
            Operation::FormatDocument => "formatDocument",
            Operation::FormatRange => "formatRange",
            Operation::RawRequest => "sendRequest",
            Operation::RawNotification => "sendNotification",
            Operation::OpenDocument => "openDocument",
            Operation::UpdateDocument => "updateDocument",
            Operation::CloseDocument => "closeDocument",
            Operation::SaveDocument => "saveDocument",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document-sync delivery to the owning adapter. These are
/// notification-shaped: the host is never blocked on them, and they are
/// queued while the adapter initializes.
#[derive(Debug, Clone)]
pub enum DocumentSyncEvent {
    Open {
        document: Document,
    },
    /// Carries the document with its post-edit text and version, plus the
    /// changes that produced it (a single full-text change when the caller
    /// supplied none).
    Update {
        document: Document,
        changes: Vec<lsp::TextDocumentContentChangeEvent>,
    },
    Close {
        document: Document,
    },
    Save {
        document: Document,
    },
}

impl DocumentSyncEvent {
    pub fn operation(&self) -> Operation {
        match self {
            DocumentSyncEvent::Open { .. } => Operation::OpenDocument,
            DocumentSyncEvent::Update { .. } => Operation::UpdateDocument,
            DocumentSyncEvent::Close { .. } => Operation::CloseDocument,
            DocumentSyncEvent::Save { .. } => Operation::SaveDocument,
        }
    }

    pub fn document(&self) -> &Document {
        match self {
            DocumentSyncEvent::Open { document }
            | DocumentSyncEvent::Update { document, .. }
            | DocumentSyncEvent::Close { document }
            | DocumentSyncEvent::Save { document } => document,
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A routed-operation handler. Invoked on the caller's task; the returned
/// future is awaited for requests and spawned for notifications.
pub type RequestHandler = Arc<dyn Fn(Value, RequestContext) -> HandlerFuture + Send + Sync>;

/// Handles document-sync deliveries. Failures are reported on the adapter
/// error channel, never to the host.
pub type SyncHandler =
    Arc<dyn Fn(DocumentSyncEvent, RequestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type InitializeHandler =
    Box<dyn FnOnce(AdapterContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub type DisposeHandler = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Everything an adapter registers with the hub. Built with the `with_*`
/// methods and consumed by `PolyClient::register_language`.
pub struct AdapterSpec {
    pub language_id: String,
    pub display_name: Option<String>,
    pub capabilities: serde_json::Map<String, Value>,
    pub(crate) handlers: IndexMap<Operation, RequestHandler>,
    pub(crate) sync: Option<SyncHandler>,
    pub(crate) initialize: Option<InitializeHandler>,
    pub(crate) dispose: Option<DisposeHandler>,
}

impl AdapterSpec {
    pub fn new(language_id: impl Into<String>) -> Self {
        Self {
            language_id: language_id.into(),
            display_name: None,
            capabilities: serde_json::Map::new(),
            handlers: IndexMap::new(),
            sync: None,
            initialize: None,
            dispose: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_capability(mut self, key: impl Into<String>, value: Value) -> Self {
        self.capabilities.insert(key.into(), value);
        self
    }

    pub fn with_handler<F>(mut self, operation: Operation, handler: F) -> Self
    where
        F: Fn(Value, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(operation, Arc::new(handler));
        self
    }

    pub fn with_document_sync<F>(mut self, handler: F) -> Self
    where
        F: Fn(DocumentSyncEvent, RequestContext) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.sync = Some(Arc::new(handler));
        self
    }

    pub fn with_initialize<F>(mut self, initialize: F) -> Self
    where
        F: FnOnce(AdapterContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.initialize = Some(Box::new(initialize));
        self
    }

    pub fn with_dispose<F>(mut self, dispose: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.dispose = Some(Box::new(dispose));
        self
    }
}

impl fmt::Debug for AdapterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSpec")
            .field("language_id", &self.language_id)
            .field("display_name", &self.display_name)
            .field("operations", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
