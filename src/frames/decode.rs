use bytes::{Buf, BytesMut};

use super::{Frame, Opcode};
use crate::{
    error::{Error, Result},
    protocol::mask,
};

/// Incremental frame parser.
///
/// Bytes from the socket are pushed in as they arrive and whole frames are
/// pulled out. Partially parsed headers are kept across calls, and a frame is
/// only returned once its whole payload is buffered; bytes after it stay in
/// the buffer for the next call.
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
    ctx: DecodeContext,
    max_frame_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    ExtendedLen,
    Mask,
    Payload,
}

#[derive(Debug)]
struct DecodeContext {
    fin: bool,
    opcode: Opcode,
    masked: bool,
    len_marker: u8,
    payload_len: usize,
    mask_key: Option<[u8; 4]>,
}

impl DecodeContext {
    fn empty() -> Self {
        Self {
            fin: false,
            opcode: Opcode::Cont,
            masked: false,
            len_marker: 0,
            payload_len: 0,
            mask_key: None,
        }
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::Header,
            ctx: DecodeContext::empty(),
            max_frame_size,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }

    /// Bytes received but not yet returned as part of a frame.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buf.len() }

    /// True when the decoder sits exactly on a frame boundary with nothing
    /// pending, which is the only point where end of stream is a clean close.
    #[must_use]
    pub fn at_boundary(&self) -> bool { self.state == DecodeState::Header && self.buf.is_empty() }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let next_state = match self.state {
                DecodeState::Header => {
                    let Some(header) = self.pop_n::<2>() else {
                        return Ok(None);
                    };
                    self.parse_header(header)?
                }
                DecodeState::ExtendedLen => {
                    let Some(len) = self.parse_extended_len()? else {
                        return Ok(None);
                    };
                    self.ctx.payload_len = len;
                    self.after_len()
                }
                DecodeState::Mask => {
                    let Some(key) = self.pop_n::<4>() else {
                        return Ok(None);
                    };
                    self.ctx.mask_key = Some(key);
                    DecodeState::Payload
                }
                DecodeState::Payload => {
                    if self.buf.len() < self.ctx.payload_len {
                        return Ok(None);
                    }
                    let mut payload = self.buf.split_to(self.ctx.payload_len);
                    if let Some(key) = self.ctx.mask_key {
                        mask(&mut payload, key);
                    }
                    self.state = DecodeState::Header;

                    tracing::trace!(
                        opcode = ?self.ctx.opcode,
                        fin = self.ctx.fin,
                        payload_len = payload.len(),
                        masked = self.ctx.masked,
                        "frame decoded"
                    );
                    return Ok(Some(Frame {
                        fin: self.ctx.fin,
                        opcode: self.ctx.opcode,
                        mask_key: self.ctx.mask_key,
                        payload: payload.freeze(),
                    }));
                }
            };
            tracing::trace!(from = ?self.state, to = ?next_state, "state transition");
            self.state = next_state;
        }
    }

    fn parse_header(&mut self, [b1, b2]: [u8; 2]) -> Result<DecodeState> {
        // 0   | 1 2 3 | 4 5 6 7
        // Fin | Rsv   | Opcode
        let opcode = Opcode::try_from(b1 & 0x0F).map_err(|op| {
            tracing::trace!(opcode = op, "invalid opcode");
            Error::ReservedOpcode(op)
        })?;

        // 0    | 1 2 3 4 5 6 7
        // Mask | Payload len
        let masked = b2 & 0x80 != 0;
        let len_marker = b2 & 0x7F;

        self.ctx = DecodeContext {
            fin: b1 & 0x80 != 0,
            opcode,
            masked,
            len_marker,
            payload_len: usize::from(len_marker),
            mask_key: None,
        };

        if opcode.is_control() {
            if !self.ctx.fin {
                return Err(Error::Protocol("fragmented control frame"));
            }
            if len_marker > 125 {
                return Err(Error::Protocol("control frame payload over 125 bytes"));
            }
        }

        if len_marker > 125 {
            Ok(DecodeState::ExtendedLen)
        } else {
            Ok(self.after_len())
        }
    }

    fn parse_extended_len(&mut self) -> Result<Option<usize>> {
        let len = if self.ctx.len_marker == 126 {
            // 126 => 2 bytes extended (u16)
            let Some(bytes) = self.pop_n::<2>() else {
                return Ok(None);
            };
            u64::from(u16::from_be_bytes(bytes))
        } else {
            // 127 => 8 bytes extended (u64)
            let Some(bytes) = self.pop_n::<8>() else {
                return Ok(None);
            };
            u64::from_be_bytes(bytes)
        };

        match usize::try_from(len) {
            Ok(len) if len <= self.max_frame_size => Ok(Some(len)),
            _ => {
                tracing::trace!(len, "frame exceeded maximum size");
                Err(Error::FrameTooLarge {
                    size: len,
                    max: self.max_frame_size,
                })
            }
        }
    }

    fn after_len(&self) -> DecodeState {
        if self.ctx.masked {
            DecodeState::Mask
        } else {
            DecodeState::Payload
        }
    }

    fn pop_n<const N: usize>(&mut self) -> Option<[u8; N]> {
        if N > self.buf.len() {
            return None;
        }
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Some(out)
    }
}
