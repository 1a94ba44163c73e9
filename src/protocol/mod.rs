mod assembler;
mod mask;
mod message;

pub use assembler::{Assembled, MessageAssembler};
pub use mask::mask;
pub use message::Message;
