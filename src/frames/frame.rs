use bytes::{BufMut, Bytes, BytesMut};

use super::Opcode;
use crate::{error::CloseReason, protocol::mask};

/// One WebSocket frame. Payloads held here are always unmasked; `mask_key`
/// records the key that was (or will be) applied on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self { Self::new(true, Opcode::Text, payload) }

    pub fn binary(payload: impl Into<Bytes>) -> Self { Self::new(true, Opcode::Bin, payload) }

    pub fn ping(payload: impl Into<Bytes>) -> Self { Self::new(true, Opcode::Ping, payload) }

    pub fn pong(payload: impl Into<Bytes>) -> Self { Self::new(true, Opcode::Pong, payload) }

    /// Close frame carrying a status code and optional reason text
    /// (truncated to fit the 125 byte control frame limit).
    #[must_use]
    pub fn close(reason: CloseReason, text: &str) -> Self {
        let mut len = text.len().min(123);
        while !text.is_char_boundary(len) {
            len -= 1;
        }
        let mut buf = BytesMut::with_capacity(2 + len);
        buf.extend_from_slice(&Into::<[u8; 2]>::into(reason));
        buf.extend_from_slice(&text.as_bytes()[..len]);
        Self::new(true, Opcode::Close, buf.freeze())
    }

    #[must_use]
    pub fn masked(mut self, mask_key: [u8; 4]) -> Self {
        self.mask_key = Some(mask_key);
        self
    }

    /// Masks with a fresh random key, as every client-to-server frame must be.
    #[must_use]
    pub fn client_masked(self) -> Self {
        let mut mask_key = [0u8; 4];
        rand::fill(&mut mask_key);
        self.masked(mask_key)
    }

    #[must_use]
    pub fn is_masked(&self) -> bool { self.mask_key.is_some() }

    /// Bytes this frame occupies on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        let len = self.payload.len();
        let ext = match len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        2 + ext + if self.is_masked() { 4 } else { 0 } + len
    }

    /// Serializes the frame, choosing the shortest length encoding and
    /// masking the payload if a key is set.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        tracing::trace!(
            opcode = ?self.opcode,
            fin = self.fin,
            len = self.payload.len(),
            masked = self.is_masked(),
            "encoding frame"
        );

        buf.put_u8(if self.fin { 0x80 } else { 0 } | self.opcode as u8);

        let mask_bit = if self.is_masked() { 0x80 } else { 0 };
        #[allow(clippy::cast_possible_truncation)]
        match self.payload.len() {
            len @ 0..=125 => buf.put_u8(mask_bit | len as u8),
            len @ 126..=65535 => {
                buf.put_u8(mask_bit | 126);
                buf.put_u16(len as u16);
            }
            len => {
                buf.put_u8(mask_bit | 127);
                buf.put_u64(len as u64);
            }
        }

        if let Some(mask_key) = self.mask_key {
            buf.extend_from_slice(&mask_key);
            let start = buf.len();
            buf.extend_from_slice(&self.payload);
            mask(&mut buf[start..], mask_key);
        } else {
            buf.extend_from_slice(&self.payload);
        }
    }
}

/// Splits `payload` into `count` frames: the first carries `opcode`, the rest
/// are continuations, and only the last has FIN set.
#[must_use]
pub fn fragment(opcode: Opcode, payload: &[u8], count: usize) -> Vec<Frame> {
    let count = count.max(1);
    let chunk = payload.len().div_ceil(count).max(1);
    let mut pieces: Vec<&[u8]> = payload.chunks(chunk).collect();
    pieces.resize(count, &[]);

    let last = count - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let op = if i == 0 { opcode } else { Opcode::Cont };
            Frame::new(i == last, op, Bytes::copy_from_slice(piece))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_length_encoding() {
        assert_eq!(Frame::binary(vec![0; 125]).encode()[1], 125);
        assert_eq!(&Frame::binary(vec![0; 126]).encode()[1..4], &[126, 0, 126]);
        assert_eq!(
            &Frame::binary(vec![0; 65535]).encode()[1..4],
            &[126, 0xFF, 0xFF]
        );
        assert_eq!(
            &Frame::binary(vec![0; 65536]).encode()[1..10],
            &[127, 0, 0, 0, 0, 0, 1, 0, 0]
        );
    }

    #[test]
    fn masked_encoding_sets_bit_and_key() {
        let bytes = Frame::text("Hello").masked([0x37, 0xfa, 0x21, 0x3d]).encode();
        assert_eq!(
            &bytes[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn close_frame_truncates_reason() {
        let frame = Frame::close(CloseReason::Normal, &"x".repeat(300));
        assert_eq!(frame.payload.len(), 125);
        assert_eq!(&frame.payload[..2], &[0x03, 0xE8]);
    }

    #[test]
    fn fragment_marks_only_last_fin() {
        let frames = fragment(Opcode::Text, b"abcdefg", 3);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert!(frames[1..].iter().all(|f| f.opcode == Opcode::Cont));
        assert_eq!(
            frames.iter().map(|f| f.fin).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, b"abcdefg");
    }
}
