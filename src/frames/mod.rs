mod decode;
mod frame;
mod opcode;

pub use decode::FrameDecoder;
pub use frame::{Frame, fragment};
pub use opcode::Opcode;
