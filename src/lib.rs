#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod client;
pub mod config;
pub mod error;
pub mod frames;
pub mod load;
pub mod protocol;
pub mod report;
pub mod schema;
pub mod session;
pub mod validate;

pub use config::{LoadConfig, RetryPolicy, SessionConfig, Target, ValidateConfig};
pub use error::{CloseReason, Error, ErrorKind, Result};
pub use protocol::Message;
pub use report::{LatencyStats, LoadReport};
pub use schema::Payload;
pub use session::Session;
pub use validate::ValidationSummary;

pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
