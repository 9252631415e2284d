//! Registers an adapter that drives an external language server: the
//! feature handlers become LSP requests, document sync becomes `did*`
//! notifications shaped by the negotiated policy, and server-originated
//! traffic is pumped back into the hub.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use log::{error, warn};
use lsp_types::notification::Notification as _;
use poly_lsp::{jsonrpc, lsp, BackendConfig, ServerId};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::adapter::{AdapterSpec, DocumentSyncEvent, Operation};
use crate::context::AdapterContext;
use crate::{PolyClient, Result};

const FEATURE_METHODS: &[(Operation, &str)] = &[
    (Operation::Completion, "textDocument/completion"),
    (Operation::Hover, "textDocument/hover"),
    (Operation::Definition, "textDocument/definition"),
    (Operation::References, "textDocument/references"),
    (Operation::CodeActions, "textDocument/codeAction"),
    (Operation::DocumentHighlights, "textDocument/documentHighlight"),
    (Operation::DocumentSymbols, "textDocument/documentSymbol"),
    (Operation::Rename, "textDocument/rename"),
    (Operation::FormatDocument, "textDocument/formatting"),
    (Operation::FormatRange, "textDocument/rangeFormatting"),
];

fn split_envelope(envelope: &Value) -> (String, Value) {
    let method = envelope
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = envelope.get("params").cloned().unwrap_or(Value::Null);
    (method, params)
}

/// Builds and registers an adapter for `language_id` backed by the given
/// server. Registration completes once the `initialize`/`initialized`
/// handshake does; document syncs issued before then are queued by the
/// registry and replayed in order.
pub async fn register_backend(
    client: &PolyClient,
    language_id: impl Into<String>,
    config: BackendConfig,
) -> Result<()> {
    let language_id = language_id.into();
    client.inner.ensure_live()?;

    let root_path = client
        .inner
        .options
        .workspace_folders
        .first()
        .cloned()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    let timeout = config.request_timeout;
    let backend = Arc::new(poly_lsp::Client::new(
        config,
        root_path,
        client.inner.next_server_id(),
        language_id.clone(),
    ));

    let mut spec = AdapterSpec::new(language_id.clone()).with_display_name(language_id.clone());

    for (operation, method) in FEATURE_METHODS {
        let backend = backend.clone();
        spec = spec.with_handler(*operation, move |params, _context| {
            let request = backend.request_value(method, params, timeout);
            async move { request.await.map_err(anyhow::Error::from) }.boxed()
        });
    }

    let raw_backend = backend.clone();
    spec = spec.with_handler(Operation::RawRequest, move |envelope, _context| {
        let (method, params) = split_envelope(&envelope);
        let request = raw_backend.request_value(&method, params, timeout);
        async move { request.await.map_err(anyhow::Error::from) }.boxed()
    });

    let notify_backend = backend.clone();
    spec = spec.with_handler(Operation::RawNotification, move |envelope, _context| {
        let (method, params) = split_envelope(&envelope);
        notify_backend.notify_value(&method, params);
        async { Ok(Value::Null) }.boxed()
    });

    let sync_backend = backend.clone();
    spec = spec.with_document_sync(move |event, _context| {
        match event {
            DocumentSyncEvent::Open { document } => {
                sync_backend.text_document_did_open(
                    document.uri.clone(),
                    document.language_id.clone(),
                    document.version,
                    document.text.clone(),
                );
            }
            DocumentSyncEvent::Update { document, changes } => {
                sync_backend.text_document_did_change(
                    lsp::VersionedTextDocumentIdentifier {
                        uri: document.uri.clone(),
                        version: document.version,
                    },
                    &document.text,
                    &changes,
                );
            }
            DocumentSyncEvent::Close { document } => {
                sync_backend.text_document_did_close(lsp::TextDocumentIdentifier {
                    uri: document.uri.clone(),
                });
            }
            DocumentSyncEvent::Save { document } => {
                sync_backend.text_document_did_save(
                    lsp::TextDocumentIdentifier {
                        uri: document.uri.clone(),
                    },
                    &document.text,
                );
            }
        }
        async { Ok(()) }.boxed()
    });

    let init_backend = backend.clone();
    spec = spec.with_initialize(move |context| {
        async move {
            let server_rx = init_backend.spawn()?;
            let pump = tokio::spawn(pump_server_calls(
                server_rx,
                init_backend.clone(),
                context.clone(),
            ));
            context.register_disposable(move || pump.abort())?;
            init_backend.initialize().await?;
            Ok(())
        }
        .boxed()
    });

    let dispose_backend = backend.clone();
    spec = spec.with_dispose(move || {
        async move {
            dispose_backend
                .shutdown_and_exit()
                .await
                .map_err(anyhow::Error::from)
        }
        .boxed()
    });

    client.register_language(spec).await
}

/// Drives everything the server sends on its own: requests are answered
/// through the context's server-request table, `publishDiagnostics` goes to
/// the diagnostics channel, and other notifications fan out to method
/// subscribers.
async fn pump_server_calls(
    mut server_rx: UnboundedReceiver<(ServerId, jsonrpc::Call)>,
    backend: Arc<poly_lsp::Client>,
    context: AdapterContext,
) {
    while let Some((_, call)) = server_rx.recv().await {
        match call {
            jsonrpc::Call::MethodCall(request) => {
                let params = Value::from(request.params);
                let response = match context.handle_server_request(&request.method, params) {
                    Ok(value) => Ok(value),
                    Err(err) => Err(jsonrpc::Error {
                        code: jsonrpc::ErrorCode::InternalError,
                        message: err.to_string(),
                        data: None,
                    }),
                };
                if let Err(err) = backend.reply(request.id, response) {
                    error!(
                        "{}: failed to reply to server request '{}': {err}",
                        context.language_id(),
                        request.method
                    );
                }
            }
            jsonrpc::Call::Notification(notification) => {
                if notification.method == poly_lsp::CLOSED_METHOD {
                    break;
                }
                let params = Value::from(notification.params);
                if notification.method == lsp::notification::PublishDiagnostics::METHOD {
                    match serde_json::from_value::<lsp::PublishDiagnosticsParams>(params) {
                        Ok(diagnostics) => {
                            if let Err(err) = context.publish_diagnostics(
                                diagnostics.uri.as_str(),
                                diagnostics.diagnostics,
                            ) {
                                error!(
                                    "{}: failed to publish diagnostics: {err}",
                                    context.language_id()
                                );
                            }
                        }
                        Err(err) => error!(
                            "{}: failed to parse publishDiagnostics params: {err}",
                            context.language_id()
                        ),
                    }
                } else if context
                    .notify_client(&notification.method, params)
                    .is_err()
                {
                    // The client is gone; stop pumping.
                    break;
                }
            }
            jsonrpc::Call::Invalid { id } => {
                warn!(
                    "{}: dropping invalid server call (id {id:?})",
                    context.language_id()
                );
            }
        }
    }
}
