//! Messages, persisted envelopes and the delivery state machine.

mod envelope;
mod message;
mod options;

pub use envelope::{Envelope, MessageStatus, UnknownStatus};
pub use message::{headers, Message};
pub use options::{OutboxOptions, DEFAULT_VERSION};
