#![allow(dead_code)]

use base64::engine::{Engine, general_purpose::STANDARD as BASE64};
use bytes::BytesMut;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use stream_probe::{
    Target,
    frames::{Frame, FrameDecoder},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Binds an ephemeral local port.
pub async fn listen() -> (TcpListener, Target) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Target::new("127.0.0.1", port))
}

/// Reads the upgrade request and answers with `status_line`, followed in the
/// same write by `extra`.
pub async fn respond(stream: &mut TcpStream, status_line: &str, extra: &[u8]) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }

    let request = String::from_utf8(buf).unwrap();
    let client_key = request
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap()
        .trim();

    // compute Sec-WebSocket-Accept
    let mut hasher = Sha1::new();
    hasher.update(client_key);
    hasher.update("258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    let accept = BASE64.encode(hasher.finalize());

    let mut resp = format!(
        "{status_line}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes();
    resp.extend_from_slice(extra);
    stream.write_all(&resp).await.unwrap();
}

/// Accepts one connection and completes the upgrade.
pub async fn accept(listener: &TcpListener, extra: &[u8]) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    respond(&mut stream, "HTTP/1.1 101 Switching Protocols", extra).await;
    stream
}

pub fn encode(frames: &[Frame]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for frame in frames {
        frame.encode_into(&mut buf);
    }
    buf.to_vec()
}

pub fn text(value: &Value) -> Vec<u8> { encode(&[Frame::text(value.to_string())]) }

/// Reads one frame sent by the client. `decoder` carries bytes left over
/// from earlier reads.
pub async fn read_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Frame {
    let mut chunk = [0u8; 256];
    loop {
        if let Some(frame) = decoder.next_frame().unwrap() {
            return frame;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up");
        decoder.push_bytes(&chunk[..n]);
    }
}

pub fn snapshot() -> Value {
    json!({
        "type": "snapshot",
        "capacity": 4096,
        "blocks": [{"offset": 0, "size": 64, "free": false, "tag": "boot"}]
    })
}

pub fn event(id: u64) -> Value {
    json!({
        "type": "allocate",
        "event_id": id,
        "offset": id * 64,
        "size": 64,
        "alignment": 16,
        "actual_size": 64,
        "tag": "req",
        "total_allocated": (id + 1) * 64,
        "total_free": 4096 - (id + 1) * 64,
        "fragmentation_pct": 0,
        "free_block_count": 1
    })
}

pub fn batch(first_id: u64, len: u64) -> Value { Value::Array((first_id..first_id + len).map(event).collect()) }
