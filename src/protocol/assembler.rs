use bytes::{Bytes, BytesMut};

use super::Message;
use crate::{
    error::{CloseReason, Error, Result},
    frames::{Frame, Opcode},
};

/// What a single frame amounted to once fed through the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    /// Peer sent Close. Any partially assembled message has been dropped.
    Close(Option<CloseReason>),
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating { opcode: Opcode, buf: BytesMut },
}

/// Turns a stream of frames into messages.
///
/// Control frames pass straight through without touching a message in
/// progress, except Close, which always discards it.
pub struct MessageAssembler {
    state: State,
    max_message_size: usize,
}

impl MessageAssembler {
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: State::Idle,
            max_message_size,
        }
    }

    #[must_use]
    pub fn is_accumulating(&self) -> bool { matches!(self.state, State::Accumulating { .. }) }

    /// Feeds one frame. Returns `None` while a fragmented message is still
    /// incomplete.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Assembled>> {
        tracing::trace!(
            accumulating = self.is_accumulating(),
            opcode = ?frame.opcode,
            fin = frame.fin,
            "handling frame"
        );

        match frame.opcode {
            Opcode::Ping => return Ok(Some(Assembled::Ping(frame.payload))),
            Opcode::Pong => return Ok(Some(Assembled::Pong(frame.payload))),
            Opcode::Close => {
                if let State::Accumulating { buf, .. } = &self.state {
                    tracing::debug!(discarded = buf.len(), "close during fragmented message");
                }
                self.state = State::Idle;
                return Ok(Some(Assembled::Close(CloseReason::from_payload(
                    &frame.payload,
                ))));
            }
            Opcode::Text | Opcode::Bin | Opcode::Cont => {}
        }

        match (&mut self.state, frame.opcode) {
            (State::Idle, Opcode::Text | Opcode::Bin) if frame.fin => {
                self.check_size(frame.payload.len())?;
                finish(frame.opcode, frame.payload).map(Some)
            }
            (State::Idle, opcode @ (Opcode::Text | Opcode::Bin)) => {
                self.check_size(frame.payload.len())?;
                self.state = State::Accumulating {
                    opcode,
                    buf: BytesMut::from(&frame.payload[..]),
                };
                Ok(None)
            }
            (State::Idle, _) => {
                Err(Error::Protocol("continuation frame without a message in progress"))
            }
            (State::Accumulating { buf, .. }, Opcode::Cont) => {
                let total = buf.len() + frame.payload.len();
                if total > self.max_message_size {
                    return Err(Error::MessageTooLarge {
                        size: total,
                        max: self.max_message_size,
                    });
                }
                buf.extend_from_slice(&frame.payload);
                tracing::trace!(
                    current_len = buf.len(),
                    added = frame.payload.len(),
                    "message fragment appended"
                );
                if !frame.fin {
                    return Ok(None);
                }
                let State::Accumulating { opcode, buf } =
                    std::mem::replace(&mut self.state, State::Idle)
                else {
                    unreachable!("state matched Accumulating above");
                };
                finish(opcode, buf.freeze()).map(Some)
            }
            (State::Accumulating { .. }, _) => {
                Err(Error::Protocol("new data frame while a fragmented message is in progress"))
            }
        }
    }

    /// Drops any message in progress.
    pub fn reset(&mut self) { self.state = State::Idle; }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn finish(opcode: Opcode, payload: Bytes) -> Result<Assembled> {
    let msg = if opcode == Opcode::Text {
        let text = String::from_utf8(payload.into()).map_err(|_| Error::InvalidUtf8)?;
        Message::Text(text)
    } else {
        Message::Binary(payload)
    };
    tracing::debug!(opcode = ?opcode, total_len = msg.len(), "message assembly complete");
    Ok(Assembled::Message(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::fragment;

    const MAX: usize = 1 << 20;

    fn text(s: &str) -> Assembled { Assembled::Message(Message::Text(s.to_string())) }

    #[test]
    fn single_frame_message() {
        let mut asm = MessageAssembler::new(MAX);
        assert_eq!(asm.push(Frame::text("hello")).unwrap(), Some(text("hello")));
        assert!(!asm.is_accumulating());
    }

    #[test]
    fn reassembles_k_fragments() {
        for k in 2..=6 {
            let body = "0123456789abcdefghij";
            let mut asm = MessageAssembler::new(MAX);
            let frames = fragment(Opcode::Text, body.as_bytes(), k);
            let (last, init) = frames.split_last().unwrap();
            for f in init {
                assert_eq!(asm.push(f.clone()).unwrap(), None);
                assert!(asm.is_accumulating());
            }
            assert_eq!(asm.push(last.clone()).unwrap(), Some(text(body)), "k = {k}");
            assert!(!asm.is_accumulating());
        }
    }

    #[test]
    fn binary_fragments_keep_opcode() {
        let mut asm = MessageAssembler::new(MAX);
        assert_eq!(asm.push(Frame::new(false, Opcode::Bin, vec![1, 2])).unwrap(), None);
        let out = asm.push(Frame::new(true, Opcode::Cont, vec![3])).unwrap();
        assert_eq!(
            out,
            Some(Assembled::Message(Message::Binary(Bytes::from_static(&[1, 2, 3]))))
        );
    }

    #[test]
    fn control_frames_interleave() {
        let mut asm = MessageAssembler::new(MAX);
        asm.push(Frame::new(false, Opcode::Text, "hel")).unwrap();
        assert_eq!(
            asm.push(Frame::ping("p")).unwrap(),
            Some(Assembled::Ping(Bytes::from_static(b"p")))
        );
        assert_eq!(
            asm.push(Frame::pong("q")).unwrap(),
            Some(Assembled::Pong(Bytes::from_static(b"q")))
        );
        assert!(asm.is_accumulating());
        assert_eq!(
            asm.push(Frame::new(true, Opcode::Cont, "lo")).unwrap(),
            Some(text("hello"))
        );
    }

    #[test]
    fn overlapping_fragmented_messages_are_rejected() {
        let mut asm = MessageAssembler::new(MAX);
        asm.push(Frame::new(false, Opcode::Text, "first")).unwrap();
        assert!(matches!(
            asm.push(Frame::new(false, Opcode::Text, "second")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn unfragmented_frame_mid_message_is_rejected() {
        let mut asm = MessageAssembler::new(MAX);
        asm.push(Frame::new(false, Opcode::Bin, "first")).unwrap();
        assert!(matches!(
            asm.push(Frame::text("second")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn stray_continuation_is_rejected() {
        let mut asm = MessageAssembler::new(MAX);
        assert!(matches!(
            asm.push(Frame::new(true, Opcode::Cont, "x")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn close_discards_partial_message() {
        let mut asm = MessageAssembler::new(MAX);
        asm.push(Frame::new(false, Opcode::Text, "partial")).unwrap();
        let out = asm.push(Frame::close(CloseReason::GoingAway, "bye")).unwrap();
        assert_eq!(out, Some(Assembled::Close(Some(CloseReason::GoingAway))));
        assert!(!asm.is_accumulating());
    }

    #[test]
    fn close_without_code() {
        let mut asm = MessageAssembler::new(MAX);
        assert_eq!(
            asm.push(Frame::new(true, Opcode::Close, Bytes::new())).unwrap(),
            Some(Assembled::Close(None))
        );
    }

    #[test]
    fn invalid_utf8_is_a_decode_failure() {
        let mut asm = MessageAssembler::new(MAX);
        asm.push(Frame::new(false, Opcode::Text, vec![0xE2, 0x82])).unwrap();
        assert!(matches!(
            asm.push(Frame::new(true, Opcode::Cont, vec![0x28])),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn utf8_split_across_fragments() {
        let mut asm = MessageAssembler::new(MAX);
        asm.push(Frame::new(false, Opcode::Text, vec![0xE2, 0x82])).unwrap();
        assert_eq!(
            asm.push(Frame::new(true, Opcode::Cont, vec![0xAC])).unwrap(),
            Some(text("\u{20AC}"))
        );
    }

    #[test]
    fn message_limit_applies_across_fragments() {
        let mut asm = MessageAssembler::new(4);
        asm.push(Frame::new(false, Opcode::Bin, vec![0; 3])).unwrap();
        assert!(matches!(
            asm.push(Frame::new(true, Opcode::Cont, vec![0; 2])),
            Err(Error::MessageTooLarge { size: 5, max: 4 })
        ));
    }
}
