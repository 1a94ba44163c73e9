use std::{net::SocketAddr, time::Duration};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    client::{self, Upgraded},
    config::{RetryPolicy, SessionConfig, Target},
    error::{CloseReason, Error, ErrorKind, Result},
    frames::{Frame, FrameDecoder},
    protocol::{Assembled, Message, MessageAssembler},
    schema::Payload,
};

/// One upgraded connection plus its decoding state.
///
/// [`Session::receive_next_message`] is cancel safe: dropping the future at
/// an await point (for example when racing it against a timeout) loses no
/// bytes and leaves the session usable.
pub struct Session {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    read_buf: Vec<u8>,
    /// Control frames waiting to be written.
    outbound: BytesMut,
    config: SessionConfig,
}

impl Session {
    /// Connects and upgrades once, bounded by the handshake timeout.
    pub async fn connect(target: &Target, config: SessionConfig) -> Result<Self> {
        let timeout = config.handshake_timeout;
        let upgraded = tokio::time::timeout(timeout, client::connect(target))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        Ok(Self::from_upgraded(upgraded, config))
    }

    /// Connects, retrying refused or timed out attempts while the server may
    /// still be starting. Handshake failures are not retried.
    pub async fn connect_with_retry(
        target: &Target,
        config: SessionConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(target, config.clone()).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    tracing::debug!(attempt, attempts, error = %e, "connect failed, retrying");
                    tokio::time::sleep(retry.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[must_use]
    pub fn from_upgraded(upgraded: Upgraded, config: SessionConfig) -> Self {
        let mut decoder = FrameDecoder::new(config.max_frame_size);
        decoder.push_bytes(&upgraded.leftover);
        Self {
            peer: upgraded.stream.peer_addr().ok(),
            stream: Some(upgraded.stream),
            decoder,
            assembler: MessageAssembler::new(config.max_message_size),
            read_buf: vec![0; config.read_buffer_size.max(1)],
            outbound: BytesMut::new(),
            config,
        }
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.stream.is_none() }

    /// Waits for the next complete message. `Ok(None)` means the connection
    /// closed cleanly, either by a Close frame or by EOF between frames.
    ///
    /// Any error releases the connection; later calls return `Ok(None)`.
    pub async fn receive_next_message(&mut self) -> Result<Option<Message>> {
        if self.stream.is_none() {
            return Ok(None);
        }
        match self.next_message().await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => {
                self.close().await;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "session failed");
                let reason = match e.kind() {
                    ErrorKind::ProtocolViolation | ErrorKind::TruncatedFrame => {
                        CloseReason::ProtoError
                    }
                    ErrorKind::DecodeFailure => CloseReason::DataError,
                    _ => CloseReason::GoingAway,
                };
                self.close_with(reason).await;
                Err(e)
            }
        }
    }

    /// Like [`Session::receive_next_message`] but gives up after `timeout`.
    /// The session stays usable after a timeout.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        tokio::time::timeout(timeout, self.receive_next_message())
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Next text message parsed as JSON. Binary messages are skipped.
    pub async fn receive_next_payload(&mut self) -> Result<Option<Payload>> {
        loop {
            match self.receive_next_message().await? {
                Some(Message::Text(text)) => return Payload::parse(&text).map(Some),
                Some(Message::Binary(b)) => {
                    tracing::debug!(len = b.len(), "ignoring binary message");
                }
                None => return Ok(None),
            }
        }
    }

    /// Sends Close (best effort) and releases the socket. Calling it again
    /// does nothing.
    pub async fn close(&mut self) { self.close_with(CloseReason::Normal).await; }

    async fn close_with(&mut self, reason: CloseReason) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        let frame = Frame::close(reason, "").client_masked();
        self.outbound.clear();
        frame.encode_into(&mut self.outbound);
        if let Err(e) = stream.write_all(&self.outbound).await {
            tracing::debug!(error = %e, "failed to send close frame");
        }
        self.outbound.clear();
        let _ = stream.shutdown().await;
        tracing::info!(peer = ?self.peer, reason = ?reason, "session closed");
    }

    async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            self.flush_outbound().await?;

            while let Some(frame) = self.decoder.next_frame()? {
                match self.assembler.push(frame)? {
                    None => {}
                    Some(Assembled::Message(msg)) => return Ok(Some(msg)),
                    Some(Assembled::Ping(payload)) => {
                        tracing::debug!(len = payload.len(), "received PING");
                        if self.config.reply_to_pings {
                            Frame::pong(payload)
                                .client_masked()
                                .encode_into(&mut self.outbound);
                            break;
                        }
                    }
                    Some(Assembled::Pong(_)) => tracing::debug!("received PONG"),
                    Some(Assembled::Close(reason)) => {
                        tracing::info!(reason = ?reason, "received Close frame");
                        return Ok(None);
                    }
                }
            }
            if !self.outbound.is_empty() {
                continue;
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            let n = stream.read(&mut self.read_buf).await?;
            if n == 0 {
                if !self.decoder.at_boundary() {
                    return Err(Error::TruncatedFrame {
                        buffered: self.decoder.buffered(),
                    });
                }
                if self.assembler.is_accumulating() {
                    tracing::debug!("EOF inside a fragmented message, discarding it");
                    self.assembler.reset();
                }
                tracing::info!("TCP FIN");
                return Ok(None);
            }
            tracing::trace!(bytes = n, "read socket");
            self.decoder.push_bytes(&self.read_buf[..n]);
        }
    }

    async fn flush_outbound(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            self.outbound.clear();
            return Ok(());
        };
        while !self.outbound.is_empty() {
            let n = stream.write(&self.outbound).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            self.outbound.advance(n);
        }
        Ok(())
    }
}

fn is_retryable(e: &Error) -> bool { matches!(e, Error::Connect { .. } | Error::Timeout(_)) }
