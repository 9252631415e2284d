mod client;
mod codec;
mod transport;

pub use jsonrpc_core as jsonrpc;
pub use lsp_types as lsp;

pub use client::{BackendConfig, Client, SyncPolicy};
pub use codec::MessageCodec;
pub use transport::{Payload, ServerId, Transport, CLOSED_METHOD};

pub use lsp::Url;

pub type Result<T> = core::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Rpc(#[from] jsonrpc::Error),
    #[error("failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("malformed server traffic: {0}")]
    Protocol(String),
    #[error("request '{0}' timed out")]
    Timeout(String),
    #[error("connection closed")]
    StreamClosed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
