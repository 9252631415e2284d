//! Tasks driving one language server's stdio streams: framed reads,
//! request/response correlation, and write serialization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    process::{ChildStderr, ChildStdin, ChildStdout},
    sync::{
        mpsc::{unbounded_channel, Sender, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
};
use tokio_util::codec::FramedRead;

use crate::codec::MessageCodec;
use crate::{jsonrpc, Error, Result};

/// Identifies one backend connection within a client.
pub type ServerId = usize;

/// Synthetic notification emitted to the owner exactly once when the
/// connection shuts down. Carries no params.
pub const CLOSED_METHOD: &str = "transport/closed";

#[derive(Debug)]
pub enum Payload {
    Request {
        chan: Sender<Result<Value>>,
        value: jsonrpc::MethodCall,
    },
    Notification(jsonrpc::Notification),
    Response(jsonrpc::Output),
}

/// A type representing all possible values sent from the server to the client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum ServerMessage {
    /// A regular JSON-RPC request output (single response).
    Output(jsonrpc::Output),
    /// A JSON-RPC request or notification.
    Call(jsonrpc::Call),
}

#[derive(Debug)]
pub struct Transport {
    id: ServerId,
    name: String,
    closed: AtomicBool,
    pending_requests: Mutex<HashMap<jsonrpc::Id, Sender<Result<Value>>>>,
    client_tx: UnboundedSender<(ServerId, jsonrpc::Call)>,
}

impl Transport {
    pub fn start(
        server_stdout: ChildStdout,
        server_stdin: ChildStdin,
        server_stderr: ChildStderr,
        id: ServerId,
        name: String,
    ) -> (
        UnboundedReceiver<(ServerId, jsonrpc::Call)>,
        UnboundedSender<Payload>,
    ) {
        let (client_tx, rx) = unbounded_channel();
        let (tx, client_rx) = unbounded_channel();

        let transport = Arc::new(Self {
            id,
            name,
            closed: AtomicBool::new(false),
            pending_requests: Mutex::new(HashMap::default()),
            client_tx,
        });

        tokio::spawn(Self::recv(transport.clone(), server_stdout));
        tokio::spawn(Self::err(transport.clone(), server_stderr));
        tokio::spawn(Self::send(transport, server_stdin, client_rx));

        (rx, tx)
    }

    async fn recv(transport: Arc<Self>, server_stdout: ChildStdout) {
        let mut frames = FramedRead::new(server_stdout, MessageCodec::default());
        while let Some(frame) = frames.next().await {
            let text = match frame {
                Ok(text) => text,
                Err(err) => {
                    error!("{} err: <- {err}", transport.name);
                    break;
                }
            };
            info!("{} <- {text}", transport.name);

            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Output(output)) => {
                    transport.process_request_response(output).await;
                }
                Ok(ServerMessage::Call(call)) => {
                    if transport.client_tx.send((transport.id, call)).is_err() {
                        // Owner hung up; no point reading further.
                        break;
                    }
                }
                // Unparseable traffic fails whatever is in flight but does
                // not tear the streams down.
                Err(err) => {
                    error!("{} received malformed message: {err}", transport.name);
                    transport
                        .fail_pending(|| Error::Protocol(err.to_string()))
                        .await;
                }
            }
        }
        transport.close().await;
    }

    async fn process_request_response(&self, output: jsonrpc::Output) {
        let (id, result) = match output {
            jsonrpc::Output::Success(jsonrpc::Success { id, result, .. }) => (id, Ok(result)),
            jsonrpc::Output::Failure(jsonrpc::Failure { id, error, .. }) => {
                error!("{} <- {error}", self.name);
                (id, Err(error.into()))
            }
        };

        // An unknown id belongs to a request whose caller already gave up
        // (timed out); the response is dropped on the floor.
        let Some(tx) = self.pending_requests.lock().await.remove(&id) else {
            warn!("{} discarding response for unknown request {id:?}", self.name);
            return;
        };

        if tx.send(result).await.is_err() {
            warn!(
                "{} discarding response for request {id:?}, original caller timed out",
                self.name
            );
        }
    }

    async fn send(
        transport: Arc<Self>,
        server_stdin: ChildStdin,
        mut client_rx: UnboundedReceiver<Payload>,
    ) {
        let mut server_stdin = BufWriter::new(server_stdin);
        while let Some(payload) = client_rx.recv().await {
            if let Err(err) = transport
                .send_payload_to_server(&mut server_stdin, payload)
                .await
            {
                error!("{} err: -> {err}", transport.name);
                break;
            }
        }
        transport.close().await;
    }

    async fn send_payload_to_server(
        &self,
        server_stdin: &mut BufWriter<ChildStdin>,
        payload: Payload,
    ) -> Result<()> {
        let json = match payload {
            Payload::Request { chan, value } => {
                self.pending_requests
                    .lock()
                    .await
                    .insert(value.id.clone(), chan);
                serde_json::to_string(&value)?
            }
            Payload::Notification(value) => serde_json::to_string(&value)?,
            Payload::Response(output) => serde_json::to_string(&output)?,
        };

        info!("{} -> {json}", self.name);
        server_stdin
            .write_all(format!("Content-Length: {}\r\n\r\n", json.len()).as_bytes())
            .await
            .map_err(|err| Error::Other(err.into()))?;
        server_stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|err| Error::Other(err.into()))?;
        server_stdin
            .flush()
            .await
            .map_err(|err| Error::Other(err.into()))?;
        Ok(())
    }

    async fn err(transport: Arc<Self>, server_stderr: ChildStderr) {
        let mut reader = BufReader::new(server_stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => error!("{} err <- {}", transport.name, line.trim_end()),
            }
        }
    }

    async fn fail_pending(&self, make_error: impl Fn() -> Error) {
        let pending: Vec<_> = self.pending_requests.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(make_error())).await;
        }
    }

    /// Fails all pending requests and tells the owner the connection is gone.
    /// Safe to reach from both the read and the write task; only the first
    /// call observes any state.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fail_pending(|| Error::StreamClosed).await;
        let _ = self.client_tx.send((
            self.id,
            jsonrpc::Call::Notification(jsonrpc::Notification {
                jsonrpc: Some(jsonrpc::Version::V2),
                method: CLOSED_METHOD.to_string(),
                params: jsonrpc::Params::None,
            }),
        ));
    }
}
