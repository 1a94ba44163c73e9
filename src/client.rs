use std::collections::HashMap;

use base64::engine::{Engine, general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    config::Target,
    error::{Error, Result},
};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// An upgraded connection.
///
/// `leftover` holds any frame bytes that arrived in the same reads as the
/// response head; they must be decoded before anything read from `stream`.
#[derive(Debug)]
pub struct Upgraded {
    pub stream: TcpStream,
    pub leftover: Bytes,
}

/// Random 16-byte nonce, base64 encoded.
#[must_use]
pub fn generate_key() -> String {
    let mut key_bytes = [0u8; 16];
    rand::fill(&mut key_bytes);
    BASE64.encode(key_bytes)
}

/// Value the server is expected to echo in `Sec-WebSocket-Accept`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(ACCEPT_GUID);
    BASE64.encode(hasher.finalize())
}

#[must_use]
pub fn upgrade_request(target: &Target, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
        Host: {host}\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: {key}\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n",
        path = target.path,
        host = target.authority(),
    )
}

/// Opens a TCP connection to `target` and performs the opening handshake.
pub async fn connect(target: &Target) -> Result<Upgraded> {
    let authority = target.authority();
    let stream = TcpStream::connect(&authority)
        .await
        .map_err(|e| Error::connect(&authority, e))?;
    let _ = stream.set_nodelay(true);
    upgrade(stream, target).await
}

/// Performs the client side of the HTTP Upgrade exchange on `stream`.
pub async fn upgrade(mut stream: TcpStream, target: &Target) -> Result<Upgraded> {
    let key = generate_key();
    stream
        .write_all(upgrade_request(target, &key).as_bytes())
        .await
        .map_err(|e| Error::Handshake(format!("failed to send upgrade request: {e}")))?;

    let (head, leftover) = read_response_head(&mut stream).await?;
    let response = parse_response(&head)?;

    let expected = accept_key(&key);
    match response.headers.get("sec-websocket-accept") {
        Some(got) if *got == expected => {}
        got => tracing::warn!(
            expected = %expected,
            got = ?got,
            "Sec-WebSocket-Accept mismatch, continuing"
        ),
    }

    tracing::info!(
        url = %target,
        status = response.status,
        leftover = leftover.len(),
        "successfully connected to peer"
    );
    Ok(Upgraded { stream, leftover })
}

/// Reads until the blank line ending the response head. Returns the head
/// and whatever followed it in the last read.
async fn read_response_head(stream: &mut TcpStream) -> Result<(Bytes, Bytes)> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut scanned: usize = 0;
    loop {
        // resume a few bytes back so a terminator split across reads is found
        let from = scanned.saturating_sub(3);
        if let Some(pos) = find_head_end(&buf[from..]) {
            let end = from + pos + 4;
            let head = buf.split_to(end).freeze();
            return Ok((head, buf.freeze()));
        }
        scanned = buf.len();

        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Handshake(format!(
                "response head exceeds {MAX_RESPONSE_HEAD} bytes"
            )));
        }

        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| Error::Handshake(format!("failed to read response: {e}")))?;
        if n == 0 {
            return Err(Error::Handshake(format!(
                "connection closed during handshake: {:?}",
                String::from_utf8_lossy(&buf)
            )));
        }
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> { bytes.windows(4).position(|w| w == b"\r\n\r\n") }

#[derive(Debug)]
struct Response {
    status: u16,
    headers: HashMap<String, String>,
}

fn parse_response(head: &[u8]) -> Result<Response> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code.parse::<u16>().ok(),
        _ => None,
    };
    if status != Some(101) {
        return Err(Error::Handshake(format!(
            "unexpected status line {status_line:?}"
        )));
    }

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    Ok(Response {
        status: 101,
        headers,
    })
}
