//! Messages exchanged between the master, archives and workers.
//!
//! Every message is a single [`Message`] value. The [`codec`] module holds the
//! byte formats for the opaque parts of a message: larval jobs, job results
//! paired with their job, and payload lists such as job summaries.

pub mod codec;
pub mod message;

pub use codec::ResultCodec;
pub use message::{Message, Opcode};
