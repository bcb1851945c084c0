//! HTTP client for fleetd's Unix control socket.
//!
//! Each proxied call is one self-contained request/response round-trip on a
//! fresh connection; fleetd's JSON payloads are passed through untouched.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bytes::BytesMut;
use http::{Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::bridge::{BridgeError, parse_chunked_body};

const MAX_HEADERS: usize = 32;

pub struct FleetClient {
    socket_path: PathBuf,
}

impl FleetClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// GET `path` from fleetd, returning the full parsed response.
    pub async fn get(&self, path: &str) -> Result<Response<Vec<u8>>> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to fleetd at {}",
                    self.socket_path.display()
                )
            })?;

        let request = format!("GET {} HTTP/1.1\r\nHost: fleetd\r\nConnection: close\r\n\r\n", path);
        stream
            .write_all(request.as_bytes())
            .await
            .context("failed to send request to fleetd")?;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut eof = false;
        loop {
            if let Some(response) = parse_response(&buf[..], eof)? {
                debug!(
                    status = response.status().as_u16(),
                    bytes = response.body().len(),
                    "response from fleetd"
                );
                return Ok(response);
            }
            if eof {
                return Err(anyhow!("fleetd closed the connection mid-response"));
            }
            let n = stream
                .read_buf(&mut buf)
                .await
                .context("failed to read response from fleetd")?;
            if n == 0 {
                eof = true;
            }
        }
    }
}

/// Try to parse one complete response from `buf`.
///
/// With neither Content-Length nor chunked framing, the body extends to the
/// end of the stream, so completion depends on `eof`.
fn parse_response(buf: &[u8], eof: bool) -> Result<Option<Response<Vec<u8>>>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let header_len = match parsed
        .parse(buf)
        .map_err(|e| anyhow!("bad response from fleetd: {e}"))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let status = StatusCode::from_u16(parsed.code.unwrap_or(502))
        .map_err(|e| anyhow!("bad status from fleetd: {e}"))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    let mut header_pairs: Vec<(String, Vec<u8>)> = Vec::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| anyhow!("invalid Content-Length from fleetd"))?;
            content_length = Some(value);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = std::str::from_utf8(header.value)
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
            // The body is re-framed before relaying; a chunked marker on a
            // de-chunked body would mislead the next parser.
            continue;
        }
        header_pairs.push((header.name.to_string(), header.value.to_vec()));
    }
    if chunked {
        header_pairs.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
    }

    let body = if chunked {
        match parse_chunked_body(&buf[header_len..]) {
            Ok(Some((body, _consumed))) => body,
            Ok(None) => {
                if eof {
                    return Err(anyhow!("truncated chunked response from fleetd"));
                }
                return Ok(None);
            }
            Err(BridgeError::Parse(msg)) => return Err(anyhow!("bad chunking from fleetd: {msg}")),
            Err(BridgeError::Io(e)) => return Err(e.into()),
        }
    } else if let Some(length) = content_length {
        if buf.len() < header_len + length {
            return Ok(None);
        }
        buf[header_len..header_len + length].to_vec()
    } else {
        if !eof {
            return Ok(None);
        }
        buf[header_len..].to_vec()
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in header_pairs {
        builder = builder.header(name, value);
    }
    Ok(Some(
        builder
            .body(body)
            .map_err(|e| anyhow!("failed to assemble fleetd response: {e}"))?,
    ))
}
