//! Streaming codec for `Content-Length` framed JSON-RPC messages.

use std::io;
use std::str;

use bytes::{BufMut, BytesMut};
use memchr::memmem;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &[u8] = b"Content-Length:";

/// Encodes and decodes the base-protocol framing used by language servers:
/// a header block terminated by `\r\n\r\n` followed by `Content-Length`
/// bytes of UTF-8 payload. The decoder is resumable and tolerates arbitrary
/// fragment boundaries in the input stream.
#[derive(Clone, Debug, Default)]
pub struct MessageCodec {
    /// Payload length of the frame whose header block has been consumed.
    pending_len: Option<usize>,
}

impl Encoder<String> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        if item.is_empty() {
            return Ok(());
        }
        dst.reserve(item.len() + 30);
        dst.put_slice(format!("Content-Length: {}\r\n\r\n", item.len()).as_bytes());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let len = match self.pending_len {
                Some(len) => len,
                None => {
                    let Some(terminator) = memmem::find(src, HEADER_TERMINATOR) else {
                        return Ok(None);
                    };
                    let header = src.split_to(terminator + HEADER_TERMINATOR.len());
                    match content_length(&header) {
                        Some(Ok(len)) => {
                            self.pending_len = Some(len);
                            len
                        }
                        Some(Err(())) => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "invalid content length",
                            ));
                        }
                        // A header block without Content-Length is skipped and
                        // decoding resumes at the next block.
                        None => {
                            log::warn!("discarding header block without Content-Length");
                            continue;
                        }
                    }
                }
            };

            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }

            let payload = src.split_to(len);
            self.pending_len = None;
            return match str::from_utf8(&payload) {
                Ok(text) => Ok(Some(text.to_owned())),
                Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            };
        }
    }
}

/// Scans a header block for `Content-Length`. Unknown header fields are
/// ignored. Returns `None` if the field is absent, `Some(Err(()))` if its
/// value is not a length.
fn content_length(header: &[u8]) -> Option<Result<usize, ()>> {
    for line in header.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(value) = line.strip_prefix(CONTENT_LENGTH) else {
            continue;
        };
        let Ok(value) = str::from_utf8(value) else {
            return Some(Err(()));
        };
        return Some(value.trim().parse::<usize>().map_err(|_| ()));
    }
    None
}
