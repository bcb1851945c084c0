//! Doing HTTP on a pipe (as opposed to a server socket).
//!
//! fleetctl reaches fleetd by running a forward command over an SSH exec
//! channel and speaking HTTP/1.1 on the channel's stdio. This module drives
//! ordinary request/response handler code over such a duplex byte stream:
//! requests are parsed incrementally off the read side, the handler runs once
//! per request, and each response drains to the write side before the next
//! request is even looked at.

use std::future::Future;

use bytes::{Buf, BytesMut};
use http::{Request, Response, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Why a bridge instance stopped.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The peer sent bytes that do not frame a valid HTTP/1.1 request.
    #[error("malformed HTTP request: {0}")]
    Parse(String),

    /// Reading from or writing to the underlying stream failed.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const MAX_HEADERS: usize = 32;

/// Upper bound on un-parsed request bytes held in memory.
const MAX_BUFFER: usize = 1024 * 1024;

/// Serve HTTP requests arriving on `reader`, writing responses to `writer`.
///
/// The returned future resolves exactly once: `Ok(())` when `reader` reaches
/// end-of-stream with every response fully drained, or the first parse or I/O
/// error otherwise. Pipelined requests are handled strictly in order; the
/// handler for request N+1 is not invoked until response N has been written
/// out and flushed.
pub async fn serve<R, W, H, Fut>(
    mut reader: R,
    mut writer: W,
    mut handler: H,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: FnMut(Request<Vec<u8>>) -> Fut,
    Fut: Future<Output = Response<Vec<u8>>>,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut eof = false;

    loop {
        if let Some(request) = parse_request(&mut buf)? {
            debug!(method = %request.method(), path = %request.uri(), "incoming request");
            let response = handler(request).await;
            write_response(&mut writer, response).await?;
            continue;
        }

        if eof {
            return if buf.is_empty() {
                trace!("bridge closing down cleanly");
                Ok(())
            } else {
                Err(BridgeError::Parse(
                    "truncated request at end of stream".into(),
                ))
            };
        }
        if buf.len() >= MAX_BUFFER {
            return Err(BridgeError::Parse("request exceeds buffer limit".into()));
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            eof = true;
        }
    }
}

/// Try to parse one complete request off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; consumes the request's
/// bytes from `buf` on success.
fn parse_request(buf: &mut BytesMut) -> Result<Option<Request<Vec<u8>>>, BridgeError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let header_len = match parsed
        .parse(&buf[..])
        .map_err(|e| BridgeError::Parse(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let method = parsed.method.unwrap_or("GET").to_string();
    let path = parsed.path.unwrap_or("/").to_string();
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut content_length: usize = 0;
    let mut chunked = false;
    let mut header_pairs: Vec<(String, Vec<u8>)> = Vec::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| BridgeError::Parse("invalid Content-Length".into()))?;
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = std::str::from_utf8(header.value)
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
        }
        header_pairs.push((header.name.to_string(), header.value.to_vec()));
    }

    // Body framing per Content-Length or chunked rules. A body of exactly
    // Content-Length bytes with no trailing CRLF is a complete request.
    let (body, consumed) = if chunked {
        match parse_chunked_body(&buf[header_len..])? {
            Some((body, body_len)) => (body, header_len + body_len),
            None => return Ok(None),
        }
    } else {
        if buf.len() < header_len + content_length {
            return Ok(None);
        }
        (
            buf[header_len..header_len + content_length].to_vec(),
            header_len + content_length,
        )
    };

    let mut builder = Request::builder()
        .method(method.as_str())
        .uri(path.as_str())
        .version(version);
    for (name, value) in header_pairs {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(body)
        .map_err(|e| BridgeError::Parse(e.to_string()))?;

    buf.advance(consumed);
    Ok(Some(request))
}

/// Parse a complete chunked body from `data`.
///
/// Returns the de-chunked body and the number of bytes consumed, or `None`
/// if the final chunk has not arrived yet. Trailers are not supported.
pub(crate) fn parse_chunked_body(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, BridgeError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let (chunk_start, size) = match httparse::parse_chunk_size(&data[pos..]) {
            Ok(httparse::Status::Complete((idx, size))) => (pos + idx, size as usize),
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(BridgeError::Parse("invalid chunk size".into())),
        };

        if size == 0 {
            if data.len() < chunk_start + 2 {
                return Ok(None);
            }
            if &data[chunk_start..chunk_start + 2] != b"\r\n" {
                return Err(BridgeError::Parse("missing CRLF after last chunk".into()));
            }
            return Ok(Some((body, chunk_start + 2)));
        }

        if data.len() < chunk_start + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&data[chunk_start..chunk_start + size]);
        if &data[chunk_start + size..chunk_start + size + 2] != b"\r\n" {
            return Err(BridgeError::Parse("missing CRLF after chunk data".into()));
        }
        pos = chunk_start + size + 2;
    }
}

/// Serialize one response and drain it to `writer`.
///
/// The head and body are assembled in memory first (the response stays
/// corked until it is complete), then written with awaited writes and a
/// final flush, so a slow peer backpressures the bridge instead of growing
/// a queue.
async fn write_response<W>(writer: &mut W, response: Response<Vec<u8>>) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let (parts, body) = response.into_parts();

    let mut head = Vec::with_capacity(256);
    let reason = parts.status.canonical_reason().unwrap_or("Unknown");
    head.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", parts.status.as_u16(), reason).as_bytes());

    let mut has_length = false;
    for (name, value) in parts.headers.iter() {
        if name == http::header::CONTENT_LENGTH {
            has_length = true;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if !has_length {
        head.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    if !body.is_empty() {
        writer.write_all(&body).await?;
    }
    writer.flush().await?;

    trace!(bytes = head.len() + body.len(), "response drained");
    Ok(())
}
