//! Child-process language server client: spawn, handshake, document sync,
//! shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::anyhow;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    process::{Child, Command},
    sync::mpsc::{channel, UnboundedReceiver, UnboundedSender},
    sync::OnceCell,
    time::timeout,
};

use crate::lsp::{self, notification::Notification as _, Url};
use crate::transport::{Payload, ServerId, Transport};
use crate::{jsonrpc, Error, Result};

const SHUTDOWN_GRACE_SECS: u64 = 2;

fn default_request_timeout() -> u64 {
    15
}

/// How to launch and talk to one external language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// The name or path of the language server binary. Must resolve on `$PATH`.
    pub command: String,
    /// Arguments passed to the binary.
    pub args: Vec<String>,
    /// Extra environment variables for the server process.
    pub environment: HashMap<String, String>,
    /// Name of an environment variable that, when set, overrides `command`.
    pub command_override_var: Option<String>,
    /// LSP initialization options.
    pub initialization_options: Option<Value>,
    /// Per-request timeout in seconds.
    pub request_timeout: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            environment: HashMap::new(),
            command_override_var: None,
            initialization_options: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// The document-sync behavior negotiated with the server during the
/// `initialize` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub open_close: bool,
    pub change: lsp::TextDocumentSyncKind,
    /// `None` means the server does not want `didSave` at all.
    pub include_text_on_save: Option<bool>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            open_close: true,
            change: lsp::TextDocumentSyncKind::INCREMENTAL,
            include_text_on_save: None,
        }
    }
}

impl SyncPolicy {
    pub fn from_capabilities(capabilities: &lsp::ServerCapabilities) -> Self {
        match &capabilities.text_document_sync {
            Some(lsp::TextDocumentSyncCapability::Kind(kind)) => Self {
                open_close: true,
                change: *kind,
                include_text_on_save: Some(false),
            },
            Some(lsp::TextDocumentSyncCapability::Options(options)) => Self {
                open_close: options.open_close.unwrap_or(false),
                change: options.change.unwrap_or(lsp::TextDocumentSyncKind::NONE),
                include_text_on_save: match &options.save {
                    Some(lsp::TextDocumentSyncSaveOptions::Supported(true)) => Some(false),
                    Some(lsp::TextDocumentSyncSaveOptions::SaveOptions(save)) => {
                        Some(save.include_text.unwrap_or(false))
                    }
                    Some(lsp::TextDocumentSyncSaveOptions::Supported(false)) | None => None,
                },
            },
            None => Self::default(),
        }
    }
}

fn workspace_for_uri(uri: Url) -> lsp::WorkspaceFolder {
    lsp::WorkspaceFolder {
        name: uri
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(|basename| basename.to_string())
            .unwrap_or_default(),
        uri,
    }
}

struct Running {
    process: Child,
    server_tx: UnboundedSender<Payload>,
}

/// One connection to an external language server over stdio.
pub struct Client {
    id: ServerId,
    name: String,
    config: BackendConfig,
    root_path: PathBuf,
    root_uri: Option<Url>,
    workspace_folders: Vec<lsp::WorkspaceFolder>,
    running: Mutex<Option<Running>>,
    request_counter: AtomicU64,
    capabilities: OnceCell<lsp::ServerCapabilities>,
    sync_policy: OnceLock<SyncPolicy>,
    initialized: AtomicBool,
    /// Notifications issued before the `initialized` handshake completes.
    buffered_notifications: Mutex<Vec<jsonrpc::Notification>>,
}

impl Client {
    pub fn new(config: BackendConfig, root_path: PathBuf, id: ServerId, name: String) -> Self {
        let root_uri = Url::from_file_path(&root_path).ok();
        let workspace_folders = root_uri
            .clone()
            .map(|root| vec![workspace_for_uri(root)])
            .unwrap_or_default();

        Self {
            id,
            name,
            config,
            root_path,
            root_uri,
            workspace_folders,
            running: Mutex::new(None),
            request_counter: AtomicU64::new(0),
            capabilities: OnceCell::new(),
            sync_policy: OnceLock::new(),
            initialized: AtomicBool::new(false),
            buffered_notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn capabilities(&self) -> Option<&lsp::ServerCapabilities> {
        self.capabilities.get()
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync_policy.get().copied().unwrap_or_default()
    }

    pub fn workspace_folders(&self) -> &[lsp::WorkspaceFolder] {
        &self.workspace_folders
    }

    pub fn request_timeout(&self) -> u64 {
        self.config.request_timeout
    }

    /// Spawns the server process and wires up the transport. The returned
    /// receiver yields every server-originated call (requests and
    /// notifications) plus a final synthetic close notification.
    pub fn spawn(&self) -> Result<UnboundedReceiver<(ServerId, jsonrpc::Call)>> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::Other(anyhow!(
                "language server '{}' is already running",
                self.name
            )));
        }

        let command = self
            .config
            .command_override_var
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_else(|| self.config.command.clone());
        let command = which::which(&command)
            .map_err(|err| anyhow!("failed to locate language server '{command}': {err}"))?;

        let mut process = Command::new(command)
            .args(&self.config.args)
            .envs(&self.config.environment)
            .current_dir(&self.root_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // make sure the process is reaped on drop
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Other(err.into()))?;

        let stdout = process.stdout.take().expect("Failed to open stdout");
        let stdin = process.stdin.take().expect("Failed to open stdin");
        let stderr = process.stderr.take().expect("Failed to open stderr");

        let (server_rx, server_tx) =
            Transport::start(stdout, stdin, stderr, self.id, self.name.clone());

        *running = Some(Running { process, server_tx });
        Ok(server_rx)
    }

    /// Drops the connection and terminates the process. Safe to call in any
    /// state; does not wait for the server to acknowledge anything.
    pub fn stop(&self) {
        self.buffered_notifications.lock().clear();
        if let Some(mut running) = self.running.lock().take() {
            drop(running.server_tx);
            if let Err(err) = running.process.start_kill() {
                warn!("{}: failed to signal language server process: {err}", self.name);
            }
        }
    }

    fn next_request_id(&self) -> jsonrpc::Id {
        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        jsonrpc::Id::Num(id)
    }

    fn value_into_params(value: Value) -> jsonrpc::Params {
        use jsonrpc::Params;

        match value {
            Value::Null => Params::None,
            Value::Bool(_) | Value::Number(_) | Value::String(_) => Params::Array(vec![value]),
            Value::Array(vec) => Params::Array(vec),
            Value::Object(map) => Params::Map(map),
        }
    }

    /// Executes an RPC request on the language server with raw JSON params.
    ///
    /// The request is enqueued before this returns, so issuing two calls
    /// back-to-back preserves their wire order even if the returned futures
    /// are awaited later.
    pub fn request_value(
        &self,
        method: &str,
        params: Value,
        timeout_secs: u64,
    ) -> impl Future<Output = Result<Value>> {
        let id = self.next_request_id();
        let method_name = method.to_string();

        let rx = match self.running.lock().as_ref() {
            Some(running) => {
                let request = jsonrpc::MethodCall {
                    jsonrpc: Some(jsonrpc::Version::V2),
                    id: id.clone(),
                    method: method_name.clone(),
                    params: Self::value_into_params(params),
                };
                let (tx, rx) = channel::<Result<Value>>(1);
                running
                    .server_tx
                    .send(Payload::Request {
                        chan: tx,
                        value: request,
                    })
                    .map(|()| rx)
                    .map_err(|_| Error::StreamClosed)
            }
            None => Err(Error::StreamClosed),
        };

        async move {
            match timeout(Duration::from_secs(timeout_secs), rx?.recv()).await {
                Ok(Some(result)) => result,
                Ok(None) => Err(Error::StreamClosed),
                // The response channel is dropped here, so a late response
                // finds no receiver and the transport discards it.
                Err(_) => Err(Error::Timeout(method_name)),
            }
        }
    }

    /// Executes a typed LSP request with the backend's default timeout.
    pub fn request<R: lsp::request::Request>(
        &self,
        params: R::Params,
    ) -> impl Future<Output = Result<R::Result>>
    where
        R::Params: serde::Serialize,
    {
        let timeout_secs = self.config.request_timeout;
        let fut = serde_json::to_value(params)
            .map_err(Error::Parse)
            .map(|params| self.request_value(R::METHOD, params, timeout_secs));

        async move {
            let value = fut?.await?;
            serde_json::from_value(value).map_err(Into::into)
        }
    }

    /// Sends an RPC notification with raw JSON params. Buffered until the
    /// `initialize`/`initialized` handshake has completed.
    pub fn notify_value(&self, method: &str, params: Value) {
        let notification = jsonrpc::Notification {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: method.to_string(),
            params: Self::value_into_params(params),
        };

        if self.is_initialized() {
            self.send_notification_now(notification);
            return;
        }

        let mut buffered = self.buffered_notifications.lock();
        // Re-check under the lock: the flush may have just happened.
        if self.is_initialized() {
            drop(buffered);
            self.send_notification_now(notification);
        } else {
            buffered.push(notification);
        }
    }

    /// Sends a typed LSP notification, subject to the same buffering.
    pub fn notify<N: lsp::notification::Notification>(&self, params: N::Params)
    where
        N::Params: serde::Serialize,
    {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(err) => {
                log::error!(
                    "Failed to serialize params for notification '{}' for server '{}': {err}",
                    N::METHOD,
                    self.name,
                );
                return;
            }
        };
        self.notify_value(N::METHOD, params);
    }

    fn send_notification_now(&self, notification: jsonrpc::Notification) {
        let Some(server_tx) = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.server_tx.clone())
        else {
            warn!(
                "{}: dropping notification '{}', server not running",
                self.name, notification.method
            );
            return;
        };
        if let Err(err) = server_tx.send(Payload::Notification(notification)) {
            log::error!("Failed to send notification to server '{}': {err}", self.name);
        }
    }

    /// Replies to a server-initiated RPC call.
    pub fn reply(
        &self,
        id: jsonrpc::Id,
        result: core::result::Result<Value, jsonrpc::Error>,
    ) -> Result<()> {
        use jsonrpc::{Failure, Output, Success, Version};

        let output = match result {
            Ok(result) => Output::Success(Success {
                jsonrpc: Some(Version::V2),
                id,
                result,
            }),
            Err(error) => Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                id,
                error,
            }),
        };

        let server_tx = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.server_tx.clone())
            .ok_or(Error::StreamClosed)?;
        server_tx
            .send(Payload::Response(output))
            .map_err(|_| Error::StreamClosed)
    }

    // -------------------------------------------------------------------------------------------
    // General messages
    // -------------------------------------------------------------------------------------------

    /// Runs the `initialize`/`initialized` handshake, negotiates document
    /// sync, and flushes notifications buffered in the meantime. A failure
    /// anywhere in the sequence tears the connection down.
    pub async fn initialize(&self) -> Result<lsp::InitializeResult> {
        if self.capabilities.get().is_some() {
            return Err(Error::Other(anyhow!(
                "language server '{}' is already initialized",
                self.name
            )));
        }

        let result = match self
            .request::<lsp::request::Initialize>(self.initialize_params())
            .await
        {
            Ok(result) => result,
            Err(err) => {
                self.stop();
                return Err(err);
            }
        };

        let _ = self
            .sync_policy
            .set(SyncPolicy::from_capabilities(&result.capabilities));
        let _ = self.capabilities.set(result.capabilities.clone());

        {
            let mut buffered = self.buffered_notifications.lock();
            self.send_notification_now(jsonrpc::Notification {
                jsonrpc: Some(jsonrpc::Version::V2),
                method: lsp::notification::Initialized::METHOD.to_string(),
                params: jsonrpc::Params::Map(serde_json::Map::new()),
            });
            for notification in buffered.drain(..) {
                self.send_notification_now(notification);
            }
            self.initialized.store(true, Ordering::Release);
        }

        Ok(result)
    }

    #[allow(deprecated)]
    fn initialize_params(&self) -> lsp::InitializeParams {
        lsp::InitializeParams {
            process_id: Some(std::process::id()),
            workspace_folders: Some(self.workspace_folders.clone()),
            // root_path is obsolete, but some servers still prefer it over
            // workspace folders, so both are supplied.
            root_path: self.root_path.to_str().map(|path| path.to_owned()),
            root_uri: self.root_uri.clone(),
            initialization_options: self.config.initialization_options.clone(),
            capabilities: Self::client_capabilities(),
            trace: None,
            client_info: Some(lsp::ClientInfo {
                name: String::from("polylsp"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
            locale: None,
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
        }
    }

    fn client_capabilities() -> lsp::ClientCapabilities {
        lsp::ClientCapabilities {
            workspace: Some(lsp::WorkspaceClientCapabilities {
                configuration: Some(true),
                workspace_folders: Some(true),
                apply_edit: Some(true),
                workspace_edit: Some(lsp::WorkspaceEditClientCapabilities {
                    document_changes: Some(true),
                    resource_operations: Some(vec![lsp::ResourceOperationKind::Rename]),
                    failure_handling: Some(lsp::FailureHandlingKind::Abort),
                    normalizes_line_endings: Some(false),
                    change_annotation_support: None,
                }),
                ..Default::default()
            }),
            text_document: Some(lsp::TextDocumentClientCapabilities {
                hover: Some(lsp::HoverClientCapabilities {
                    content_format: Some(vec![lsp::MarkupKind::Markdown]),
                    ..Default::default()
                }),
                rename: Some(lsp::RenameClientCapabilities {
                    dynamic_registration: Some(false),
                    prepare_support: Some(false),
                    ..Default::default()
                }),
                publish_diagnostics: Some(lsp::PublishDiagnosticsClientCapabilities {
                    version_support: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            window: Some(lsp::WindowClientCapabilities {
                work_done_progress: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Graceful teardown: `shutdown` bounded by a short grace period, then
    /// `exit`, then terminate the process.
    pub async fn shutdown_and_exit(&self) -> Result<()> {
        if self.is_running() {
            match timeout(
                Duration::from_secs(SHUTDOWN_GRACE_SECS),
                self.request::<lsp::request::Shutdown>(()),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("{}: language server failed to shut down gracefully: {err}", self.name)
                }
                Err(_) => warn!("{}: language server did not answer shutdown in time", self.name),
            }
            self.send_notification_now(jsonrpc::Notification {
                jsonrpc: Some(jsonrpc::Version::V2),
                method: lsp::notification::Exit::METHOD.to_string(),
                params: jsonrpc::Params::None,
            });
        }
        self.stop();
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Text document
    // -------------------------------------------------------------------------------------------

    pub fn text_document_did_open(
        &self,
        uri: Url,
        language_id: String,
        version: i32,
        text: String,
    ) -> Option<()> {
        if !self.sync_policy().open_close {
            return None;
        }
        self.notify::<lsp::notification::DidOpenTextDocument>(lsp::DidOpenTextDocumentParams {
            text_document: lsp::TextDocumentItem {
                uri,
                language_id,
                version,
                text,
            },
        });
        Some(())
    }

    /// Sends `didChange` shaped for the negotiated sync kind: suppressed for
    /// none, one full-text change for full, the provided range edits for
    /// incremental (falling back to a full-text change when the caller has
    /// none).
    pub fn text_document_did_change(
        &self,
        text_document: lsp::VersionedTextDocumentIdentifier,
        full_text: &str,
        changes: &[lsp::TextDocumentContentChangeEvent],
    ) -> Option<()> {
        let full_text_change = || lsp::TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: full_text.to_string(),
        };

        let content_changes = match self.sync_policy().change {
            lsp::TextDocumentSyncKind::FULL => vec![full_text_change()],
            lsp::TextDocumentSyncKind::INCREMENTAL => {
                if changes.is_empty() {
                    vec![full_text_change()]
                } else {
                    changes.to_vec()
                }
            }
            lsp::TextDocumentSyncKind::NONE => return None,
            kind => {
                warn!("{}: unsupported text document sync kind {kind:?}", self.name);
                return None;
            }
        };

        self.notify::<lsp::notification::DidChangeTextDocument>(lsp::DidChangeTextDocumentParams {
            text_document,
            content_changes,
        });
        Some(())
    }

    pub fn text_document_did_close(&self, text_document: lsp::TextDocumentIdentifier) -> Option<()> {
        if !self.sync_policy().open_close {
            return None;
        }
        self.notify::<lsp::notification::DidCloseTextDocument>(lsp::DidCloseTextDocumentParams {
            text_document,
        });
        Some(())
    }

    pub fn text_document_did_save(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        text: &str,
    ) -> Option<()> {
        let include_text = self.sync_policy().include_text_on_save?;
        self.notify::<lsp::notification::DidSaveTextDocument>(lsp::DidSaveTextDocumentParams {
            text_document,
            text: include_text.then(|| text.to_string()),
        });
        Some(())
    }
}
